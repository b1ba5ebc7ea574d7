//! Layered configuration using Figment.
//!
//! Settings merge in precedence order: defaults, then a TOML file, then
//! `SCAN_PIPELINE_`-prefixed environment variables. The pipeline itself only
//! needs [`PipelineConfig`]; [`Settings`] adds the application and storage
//! sections a host process typically wants alongside it.

use std::path::PathBuf;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};

fn default_capacity() -> usize {
    10
}

fn default_parallelism() -> usize {
    4
}

fn default_app_name() -> String {
    "scan-pipeline".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./data")
}

/// Tuning knobs for one pipeline instance.
///
/// Capacity bounds how many points may be in flight at once and is the only
/// source of backpressure; parallelism sets the resolver worker count. The
/// two are independent: capacity 10 with parallelism 1 still admits ten
/// points, they just resolve one at a time.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Maximum points admitted but not yet broadcast.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Concurrent resolver workers.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            parallelism: default_parallelism(),
        }
    }
}

impl PipelineConfig {
    /// Check the values a pipeline can actually run with.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Configuration`] when capacity or parallelism is zero.
    pub fn validate(&self) -> PipelineResult<()> {
        if self.capacity == 0 {
            return Err(PipelineError::Configuration(
                "pipeline capacity must be at least 1".to_string(),
            ));
        }
        if self.parallelism == 0 {
            return Err(PipelineError::Configuration(
                "pipeline parallelism must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Host application settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApplicationSettings {
    /// Process name used in log output.
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Log level filter: trace, debug, info, warn, or error.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
        }
    }
}

/// Where persisted scan files land.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageSettings {
    /// Directory scan files are written into.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
        }
    }
}

/// Complete settings tree for a process hosting the pipeline.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Settings {
    /// `[application]` section.
    #[serde(default)]
    pub application: ApplicationSettings,
    /// `[pipeline]` section.
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// `[storage]` section.
    #[serde(default)]
    pub storage: StorageSettings,
}

impl Settings {
    /// Load from `config.toml` in the working directory plus environment.
    ///
    /// A missing file is fine; defaults and environment still apply.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from("config.toml")
    }

    /// Load from an explicit TOML path plus environment.
    ///
    /// Environment variables use the `SCAN_PIPELINE_` prefix with `_` as the
    /// section separator, e.g. `SCAN_PIPELINE_PIPELINE_CAPACITY=32`.
    pub fn load_from(path: &str) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("SCAN_PIPELINE_").split("_"))
            .extract()
    }

    /// Check the loaded tree before wiring anything up.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Configuration`] naming the offending field.
    pub fn validate(&self) -> PipelineResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(PipelineError::Configuration(format!(
                "invalid log level '{}', expected one of {valid_levels:?}",
                self.application.log_level
            )));
        }
        if self.storage.output_dir.as_os_str().is_empty() {
            return Err(PipelineError::Configuration(
                "storage output_dir must not be empty".to_string(),
            ));
        }
        self.pipeline.validate()
    }
}
