//! Configuration for spikepipe
//!
//! Settings are read from a TOML file. The default file lives in the
//! platform configuration directory:
//! - **Linux**: `~/.config/spikepipe/spikepipe.toml`
//! - **macOS**: `~/Library/Application Support/spikepipe/spikepipe.toml`
//! - **Windows**: `%APPDATA%\spikepipe\spikepipe.toml`
//!
//! # Example
//!
//! ```toml
//! [workers]
//! max_workers = 8
//! open_files_workers = 4
//! task_timeout_secs = 600
//!
//! [logging]
//! level = "debug"
//! directory = "/var/log/spikepipe"
//! ```

use crate::error::{Result, SpikepipeError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application identifier for config directories
pub const APP_ID: &str = "spikepipe";

/// Config filename
pub const CONFIG_FILE: &str = "spikepipe.toml";

/// Default number of threads used to open files
pub const DEFAULT_OPEN_FILES_WORKERS: usize = 4;

/// Default log level
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Get the application config directory path
pub fn config_dir() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_ID))
}

/// Get the path to the default config file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join(CONFIG_FILE))
}

fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_open_files_workers() -> usize {
    DEFAULT_OPEN_FILES_WORKERS
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

/// Worker pool settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Upper bound on plugin worker threads
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Threads used by `open_files`
    #[serde(default = "default_open_files_workers")]
    pub open_files_workers: usize,

    /// Give up on a run when no task finishes for this long
    #[serde(default)]
    pub task_timeout_secs: Option<u64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            open_files_workers: DEFAULT_OPEN_FILES_WORKERS,
            task_timeout_secs: None,
        }
    }
}

impl WorkerConfig {
    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs.map(Duration::from_secs)
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `spikepipe=debug`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Write daily rolling log files here in addition to stderr
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            directory: None,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub workers: WorkerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl PipelineConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SpikepipeError::Config(format!("Failed to read config {:?}: {}", path, e))
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| {
            SpikepipeError::Config(format!("Failed to parse config {:?}: {}", path, e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load the default config file, returning defaults on any error
    pub fn load_or_default() -> Self {
        let Some(path) = config_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        Self::load(&path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save configuration as TOML, creating parent directories
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    SpikepipeError::Config(format!("Failed to create config directory: {}", e))
                })?;
            }
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| SpikepipeError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| SpikepipeError::Config(format!("Failed to write config: {}", e)))
    }

    fn validate(&self) -> Result<()> {
        if self.workers.max_workers == 0 {
            return Err(SpikepipeError::Config(
                "workers.max_workers must be at least 1".to_string(),
            ));
        }
        if self.workers.open_files_workers == 0 {
            return Err(SpikepipeError::Config(
                "workers.open_files_workers must be at least 1".to_string(),
            ));
        }
        if self.workers.task_timeout_secs == Some(0) {
            return Err(SpikepipeError::Config(
                "workers.task_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert!(config.workers.max_workers >= 1);
        assert_eq!(config.workers.open_files_workers, DEFAULT_OPEN_FILES_WORKERS);
        assert_eq!(config.workers.task_timeout(), None);
        assert_eq!(config.logging.level, "info");
        assert!(config.logging.directory.is_none());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: PipelineConfig = toml::from_str(
            r#"
            [workers]
            task_timeout_secs = 30
            "#,
        )
        .unwrap();
        assert_eq!(config.workers.task_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.workers.open_files_workers, DEFAULT_OPEN_FILES_WORKERS);
        assert_eq!(config.logging, LoggingConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);

        let mut config = PipelineConfig::default();
        config.workers.max_workers = 3;
        config.workers.task_timeout_secs = Some(120);
        config.logging.level = "spikepipe=debug".to_string();
        config.logging.directory = Some(dir.path().join("logs"));

        config.save(&path).unwrap();
        assert_eq!(PipelineConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_rejects_zero_workers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "[workers]\nmax_workers = 0\n").unwrap();
        assert!(matches!(
            PipelineConfig::load(&path),
            Err(SpikepipeError::Config(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(PipelineConfig::load("/nonexistent/spikepipe.toml").is_err());
    }
}
