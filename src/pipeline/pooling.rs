//! Pooling of per-trial data for plugins that run across trials.
//!
//! Silent pooling concatenates numeric payloads along the leading axis and
//! records an offset table so results can be split back to exact per-trial
//! slices. Non-silent pooling passes a plain list, one entry per trial.
//!
//! | per-trial payload | pooled as |
//! |---|---|
//! | `Scalar` | `Vector` of stacked scalars |
//! | `Vector` | concatenated `Vector` |
//! | `Matrix` | row-concatenated `Matrix` (column counts must match) |

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::types::{Matrix, ResourceData};

/// How a pooled value was assembled from per-trial values.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolLayout {
    /// Plain list, one entry per trial.
    Listed { trials: usize },
    /// Concatenated along the leading axis; trial `i` owns
    /// `offsets[i]..offsets[i + 1]`.
    Concatenated {
        offsets: Vec<usize>,
        dimensionality: usize,
    },
}

impl PoolLayout {
    pub fn trial_count(&self) -> usize {
        match self {
            PoolLayout::Listed { trials } => *trials,
            PoolLayout::Concatenated { offsets, .. } => offsets.len().saturating_sub(1),
        }
    }

    /// Total leading length of the pooled value.
    pub fn total_len(&self) -> usize {
        match self {
            PoolLayout::Listed { trials } => *trials,
            PoolLayout::Concatenated { offsets, .. } => offsets.last().copied().unwrap_or(0),
        }
    }
}

/// Combine per-trial values into one pooled value.
pub fn pack_pooled_resource(
    per_trial: &[ResourceData],
    silent: bool,
) -> PipelineResult<(ResourceData, PoolLayout)> {
    if !silent {
        return Ok((
            ResourceData::List(per_trial.to_vec()),
            PoolLayout::Listed {
                trials: per_trial.len(),
            },
        ));
    }

    let mut dims = Vec::with_capacity(per_trial.len());
    for data in per_trial {
        let dim = data.dimensionality().ok_or_else(|| {
            PipelineError::Dimensionality(format!(
                "cannot concatenate {} payloads",
                data.kind_name()
            ))
        })?;
        dims.push(dim);
    }
    let dimensionality = dims.first().copied().unwrap_or(1);
    if dims.iter().any(|&d| d != dimensionality) {
        return Err(PipelineError::Dimensionality(format!(
            "trials mix dimensionalities {:?}",
            dims
        )));
    }

    let mut offsets = Vec::with_capacity(per_trial.len() + 1);
    offsets.push(0);

    let pooled = match dimensionality {
        0 | 1 => {
            let mut values = Vec::new();
            for data in per_trial {
                match data {
                    ResourceData::Scalar(v) => values.push(*v),
                    ResourceData::Vector(v) => values.extend_from_slice(v),
                    other => {
                        return Err(PipelineError::Dimensionality(format!(
                            "expected a scalar or vector, got a {}",
                            other.kind_name()
                        )))
                    }
                }
                offsets.push(values.len());
            }
            ResourceData::Vector(values)
        }
        _ => {
            let cols = per_trial
                .first()
                .and_then(|d| d.as_matrix())
                .map(|m| m.cols())
                .unwrap_or(0);
            let mut pooled = Matrix::empty(cols);
            for data in per_trial {
                let m = data.as_matrix().ok_or_else(|| {
                    PipelineError::Dimensionality("expected a matrix".to_string())
                })?;
                if !pooled.append_rows(m) {
                    return Err(PipelineError::Dimensionality(format!(
                        "cannot concatenate matrices with {} and {} columns",
                        cols,
                        m.cols()
                    )));
                }
                offsets.push(pooled.rows());
            }
            ResourceData::Matrix(pooled)
        }
    };

    Ok((
        pooled,
        PoolLayout::Concatenated {
            offsets,
            dimensionality,
        },
    ))
}

/// Split a pooled value back into per-trial values using `layout`.
pub fn unpack_pooled_resource(
    pooled: &ResourceData,
    layout: &PoolLayout,
) -> PipelineResult<Vec<ResourceData>> {
    match layout {
        PoolLayout::Listed { trials } => {
            let items = pooled.as_list().ok_or_else(|| {
                PipelineError::Pooling(format!(
                    "expected a list of {} per-trial results, got a {}",
                    trials,
                    pooled.kind_name()
                ))
            })?;
            if items.len() != *trials {
                return Err(PipelineError::Pooling(format!(
                    "expected {} per-trial results, got {}",
                    trials,
                    items.len()
                )));
            }
            Ok(items.to_vec())
        }
        PoolLayout::Concatenated {
            offsets,
            dimensionality,
        } => {
            let total = layout.total_len();
            let len = pooled.leading_len().unwrap_or(0);
            if len != total {
                return Err(PipelineError::Pooling(format!(
                    "pooled result has leading length {}, layout expects {}",
                    len, total
                )));
            }

            let bounds = offsets.windows(2).map(|w| (w[0], w[1]));
            match pooled {
                ResourceData::Vector(values) => Ok(bounds
                    .map(|(start, end)| {
                        if *dimensionality == 0 && end - start == 1 {
                            ResourceData::Scalar(values[start])
                        } else {
                            ResourceData::Vector(values[start..end].to_vec())
                        }
                    })
                    .collect()),
                ResourceData::Matrix(m) => bounds
                    .map(|(start, end)| {
                        m.slice_rows(start, end)
                            .map(ResourceData::Matrix)
                            .ok_or_else(|| {
                                PipelineError::Pooling(format!(
                                    "rows {}..{} out of range",
                                    start, end
                                ))
                            })
                    })
                    .collect(),
                ResourceData::List(items) => Ok(bounds
                    .map(|(start, end)| ResourceData::List(items[start..end].to_vec()))
                    .collect()),
                other => Err(PipelineError::Pooling(format!(
                    "cannot split a {} result",
                    other.kind_name()
                ))),
            }
        }
    }
}
