//! Core payload types shared between trials, plugins and the scheduler.
//!
//! # Main Types
//!
//! - [`ResourceData`] - The value held by a resource slot
//! - [`Matrix`] - Row-major 2-D numeric array (rows are the leading axis)
//! - [`Settings`] - Keyword settings handed to plugins
//!
//! Voltage traces are stored as a [`Matrix`] with one row per channel and
//! one column per sample.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Keyword settings for a plugin run, keyed by setting name.
pub type Settings = BTreeMap<String, serde_json::Value>;

/// Row-major 2-D array of `f64`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    values: Vec<f64>,
}

impl Matrix {
    /// Build a matrix from a flat row-major buffer.
    ///
    /// Returns `None` when `values.len() != rows * cols`.
    pub fn new(rows: usize, cols: usize, values: Vec<f64>) -> Option<Self> {
        if rows.checked_mul(cols)? != values.len() {
            return None;
        }
        Some(Self { rows, cols, values })
    }

    /// Build a matrix from nested rows. All rows must have the same length.
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Option<Self> {
        let cols = rows.first().map(|r| r.len()).unwrap_or(0);
        if rows.iter().any(|r| r.len() != cols) {
            return None;
        }
        let nrows = rows.len();
        let values = rows.into_iter().flatten().collect();
        Some(Self {
            rows: nrows,
            cols,
            values,
        })
    }

    /// An empty matrix with a fixed column count.
    pub fn empty(cols: usize) -> Self {
        Self {
            rows: 0,
            cols,
            values: Vec::new(),
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Borrow one row.
    pub fn row(&self, index: usize) -> Option<&[f64]> {
        if index >= self.rows {
            return None;
        }
        let start = index * self.cols;
        Some(&self.values[start..start + self.cols])
    }

    /// Copy the rows `start..end` into a new matrix.
    pub fn slice_rows(&self, start: usize, end: usize) -> Option<Matrix> {
        if start > end || end > self.rows {
            return None;
        }
        Some(Matrix {
            rows: end - start,
            cols: self.cols,
            values: self.values[start * self.cols..end * self.cols].to_vec(),
        })
    }

    /// Append the rows of `other`. Column counts must match.
    pub fn append_rows(&mut self, other: &Matrix) -> bool {
        if self.cols != other.cols {
            return false;
        }
        self.values.extend_from_slice(&other.values);
        self.rows += other.rows;
        true
    }

    /// Subtract each row's mean from that row.
    pub fn center_rows(&mut self) {
        if self.cols == 0 {
            return;
        }
        for chunk in self.values.chunks_mut(self.cols) {
            let mean = chunk.iter().sum::<f64>() / chunk.len() as f64;
            for v in chunk.iter_mut() {
                *v -= mean;
            }
        }
    }
}

/// The value held by a resource.
///
/// Numeric variants carry a dimensionality (0, 1 or 2) that pooling
/// relies on; the structured variants are passed through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ResourceData {
    Scalar(f64),
    Vector(Vec<f64>),
    Matrix(Matrix),
    List(Vec<ResourceData>),
    Map(BTreeMap<String, ResourceData>),
    Text(String),
}

impl ResourceData {
    /// Number of array dimensions, or `None` for non-numeric payloads.
    pub fn dimensionality(&self) -> Option<usize> {
        match self {
            ResourceData::Scalar(_) => Some(0),
            ResourceData::Vector(_) => Some(1),
            ResourceData::Matrix(_) => Some(2),
            _ => None,
        }
    }

    /// Length along the leading axis (1 for scalars).
    pub fn leading_len(&self) -> Option<usize> {
        match self {
            ResourceData::Scalar(_) => Some(1),
            ResourceData::Vector(v) => Some(v.len()),
            ResourceData::Matrix(m) => Some(m.rows()),
            ResourceData::List(items) => Some(items.len()),
            _ => None,
        }
    }

    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            ResourceData::Scalar(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> Option<&[f64]> {
        match self {
            ResourceData::Vector(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_matrix(&self) -> Option<&Matrix> {
        match self {
            ResourceData::Matrix(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[ResourceData]> {
        match self {
            ResourceData::List(items) => Some(items),
            _ => None,
        }
    }

    /// Short name of the variant, used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            ResourceData::Scalar(_) => "scalar",
            ResourceData::Vector(_) => "vector",
            ResourceData::Matrix(_) => "matrix",
            ResourceData::List(_) => "list",
            ResourceData::Map(_) => "map",
            ResourceData::Text(_) => "text",
        }
    }
}

impl From<f64> for ResourceData {
    fn from(value: f64) -> Self {
        ResourceData::Scalar(value)
    }
}

impl From<Vec<f64>> for ResourceData {
    fn from(value: Vec<f64>) -> Self {
        ResourceData::Vector(value)
    }
}

impl From<Matrix> for ResourceData {
    fn from(value: Matrix) -> Self {
        ResourceData::Matrix(value)
    }
}
