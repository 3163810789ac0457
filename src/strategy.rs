//! Declarative processing strategies.
//!
//! A [`Strategy`] names the plugin used for each stage, the settings for
//! each stage, and any auxiliary plugins with their settings. Strategies
//! are stored as `.json` or `.toml` files.
//!
//! ```toml
//! name = "default"
//!
//! [methods_used]
//! detection_filter = "butterworth"
//! detection = "threshold"
//!
//! [settings.detection]
//! threshold = 4.5
//!
//! [auxiliary_stages.resample]
//! rate = 30000
//! ```

use crate::error::{Result, SpikepipeError};
use crate::plugin::Stage;
use crate::types::Settings;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Strategy file extensions
pub const STRATEGY_JSON_EXTENSION: &str = "json";
pub const STRATEGY_TOML_EXTENSION: &str = "toml";

#[derive(Debug, Clone, Copy)]
enum StrategyFormat {
    Json,
    Toml,
}

impl StrategyFormat {
    fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some(STRATEGY_JSON_EXTENSION) => Ok(Self::Json),
            Some(STRATEGY_TOML_EXTENSION) => Ok(Self::Toml),
            _ => Err(SpikepipeError::Strategy(format!(
                "Unsupported strategy file {} (expected .{} or .{})",
                path.display(),
                STRATEGY_JSON_EXTENSION,
                STRATEGY_TOML_EXTENSION
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Strategy {
    #[serde(default)]
    pub name: String,

    /// Plugin name per stage.
    #[serde(default)]
    pub methods_used: BTreeMap<Stage, String>,

    /// Keyword settings per stage.
    #[serde(default)]
    pub settings: BTreeMap<Stage, Settings>,

    /// Auxiliary plugin name to keyword settings.
    #[serde(default)]
    pub auxiliary_stages: BTreeMap<String, Settings>,
}

impl Strategy {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the plugin and settings for a stage.
    pub fn with_stage(mut self, stage: Stage, plugin: impl Into<String>, settings: Settings) -> Self {
        self.methods_used.insert(stage, plugin.into());
        self.settings.insert(stage, settings);
        self
    }

    pub fn with_auxiliary(mut self, plugin: impl Into<String>, settings: Settings) -> Self {
        self.auxiliary_stages.insert(plugin.into(), settings);
        self
    }

    /// Settings for a stage, empty if none were given.
    pub fn stage_settings(&self, stage: Stage) -> Settings {
        self.settings.get(&stage).cloned().unwrap_or_default()
    }

    /// Load a strategy, choosing the format from the file extension.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let format = StrategyFormat::from_path(path)?;
        let content = std::fs::read_to_string(path).map_err(|e| {
            SpikepipeError::Strategy(format!("Failed to read {}: {}", path.display(), e))
        })?;

        match format {
            StrategyFormat::Toml => toml::from_str(&content).map_err(|e| {
                SpikepipeError::Serialization(format!("Failed to parse strategy TOML: {}", e))
            }),
            StrategyFormat::Json => serde_json::from_str(&content).map_err(|e| {
                SpikepipeError::Serialization(format!("Failed to parse strategy JSON: {}", e))
            }),
        }
    }

    /// Save a strategy, choosing the format from the file extension.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = match StrategyFormat::from_path(path)? {
            StrategyFormat::Toml => toml::to_string_pretty(self).map_err(|e| {
                SpikepipeError::Serialization(format!("Failed to serialize strategy: {}", e))
            })?,
            StrategyFormat::Json => serde_json::to_string_pretty(self).map_err(|e| {
                SpikepipeError::Serialization(format!("Failed to serialize strategy: {}", e))
            })?,
        };
        std::fs::write(path, content)?;
        Ok(())
    }
}
