//! Configuration for drover.
//!
//! Everything lives in one `drover.toml`. Every section and field has a
//! default, so an empty file (or no file at all) is a valid configuration:
//!
//! ```toml
//! jobs_file = "accounts.json"
//!
//! [supervisor]
//! workers = 3
//! stagger = { min_ms = 1800000, max_ms = 3600000 }
//!
//! [pipeline]
//! mode = "sequential"
//!
//! [executor]
//! command = "./run-tasks.sh"
//! timeout_secs = 900
//! ```
//!
//! Relative paths are resolved against the directory holding the file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::classify::{ClassifierConfig, PatternClassifier};
use crate::error::{DroverError, Result};
use crate::operations::ExecutorConfig;
use crate::pipeline::PipelineConfig;
use crate::supervisor::SupervisorConfig;
use crate::throttle::ThrottleConfig;

/// Default config file name.
pub const DEFAULT_CONFIG_FILE: &str = "drover.toml";

/// Worker process settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Keep a worker alive in standby until the supervisor shuts it down.
    pub hold_on_standby: bool,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            hold_on_standby: true,
        }
    }
}

/// Completion ledger settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSettings {
    pub dir: PathBuf,
    /// Days kept by `drover ledger prune`.
    pub keep_days: u32,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".drover/ledger"),
            keep_days: 7,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DroverConfig {
    /// JSON array of jobs loaded at start.
    pub jobs_file: PathBuf,
    pub supervisor: SupervisorConfig,
    pub pipeline: PipelineConfig,
    pub throttle: ThrottleConfig,
    pub worker: WorkerSettings,
    pub ledger: LedgerSettings,
    pub executor: ExecutorConfig,
    pub classifier: ClassifierConfig,
}

impl Default for DroverConfig {
    fn default() -> Self {
        Self {
            jobs_file: PathBuf::from("jobs.json"),
            supervisor: SupervisorConfig::default(),
            pipeline: PipelineConfig::default(),
            throttle: ThrottleConfig::default(),
            worker: WorkerSettings::default(),
            ledger: LedgerSettings::default(),
            executor: ExecutorConfig::default(),
            classifier: ClassifierConfig::default(),
        }
    }
}

impl DroverConfig {
    /// Load configuration from `path`, or defaults if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`DroverError::Config`] if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            DroverError::config_with_path(format!("Failed to read config: {e}"), path.to_path_buf())
        })?;
        let mut config = Self::parse(&content)
            .map_err(|e| DroverError::config_with_path(e.to_string(), path.to_path_buf()))?;

        if let Some(base) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            config.resolve_paths(base);
        }
        Ok(config)
    }

    /// Parse configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`DroverError::Config`] on invalid TOML or unknown value types.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| DroverError::config(format!("Invalid TOML: {e}")))
    }

    /// Make relative paths absolute against `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        resolve(&mut self.jobs_file);
        resolve(&mut self.ledger.dir);
        if let Some(path) = self.supervisor.heartbeat_file.as_mut() {
            resolve(path);
        }
        if let Some(path) = self.supervisor.report_dir.as_mut() {
            resolve(path);
        }
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`DroverError::InvalidConfig`] for the first bad field.
    pub fn validate(&self) -> Result<()> {
        if self.supervisor.workers == 0 {
            return Err(DroverError::invalid_config(
                "supervisor.workers",
                "must be at least 1",
            ));
        }
        if self.supervisor.heartbeat_interval_secs == 0 {
            return Err(DroverError::invalid_config(
                "supervisor.heartbeat_interval_secs",
                "must be at least 1",
            ));
        }
        if self.pipeline.variants().is_empty() {
            return Err(DroverError::invalid_config(
                "pipeline",
                "at least one of primary/secondary must be enabled",
            ));
        }
        if self.pipeline.retry.max_attempts == 0 {
            return Err(DroverError::invalid_config(
                "pipeline.retry.max_attempts",
                "must be at least 1",
            ));
        }

        let throttle = &self.throttle;
        if throttle.window == 0 {
            return Err(DroverError::invalid_config(
                "throttle.window",
                "must be at least 1",
            ));
        }
        for (field, value) in [
            ("throttle.min_multiplier", throttle.min_multiplier),
            ("throttle.max_multiplier", throttle.max_multiplier),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(DroverError::invalid_config(
                    field,
                    format!("must be a positive number, got {value}"),
                ));
            }
        }
        if throttle.max_multiplier < throttle.min_multiplier {
            return Err(DroverError::invalid_config(
                "throttle.max_multiplier",
                "must not be below min_multiplier",
            ));
        }

        if self.ledger.keep_days == 0 {
            return Err(DroverError::invalid_config(
                "ledger.keep_days",
                "must be at least 1",
            ));
        }
        if self.executor.timeout_secs == 0 {
            return Err(DroverError::invalid_config(
                "executor.timeout_secs",
                "must be at least 1",
            ));
        }

        PatternClassifier::new(&self.classifier)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ExecutionMode;
    use crate::throttle::DelayRange;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = DroverConfig::load(Path::new("/nonexistent/drover.toml")).expect("load");
        assert_eq!(config, DroverConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_file() {
        let temp_dir = TempDir::new().expect("temp dir");
        let path = temp_dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(
            &path,
            r#"
jobs_file = "accounts.json"

[supervisor]
workers = 4
stagger = { min_ms = 10, max_ms = 20 }

[pipeline]
mode = "sequential"
secondary = false

[executor]
command = "/usr/bin/run-tasks"
"#,
        )
        .expect("write");

        let config = DroverConfig::load(&path).expect("load");
        assert_eq!(config.supervisor.workers, 4);
        assert_eq!(config.supervisor.stagger, DelayRange::new(10, 20));
        assert_eq!(config.pipeline.mode, ExecutionMode::Sequential);
        assert!(config.pipeline.primary);
        assert!(!config.pipeline.secondary);
        assert_eq!(config.executor.command, "/usr/bin/run-tasks");
        assert_eq!(config.jobs_file, temp_dir.path().join("accounts.json"));
        assert_eq!(config.ledger.dir, temp_dir.path().join(".drover/ledger"));
        assert!(config.worker.hold_on_standby);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let temp_dir = TempDir::new().expect("temp dir");
        let path = temp_dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&path, "[supervisor\nworkers = ").expect("write");

        let err = DroverConfig::load(&path).expect_err("invalid");
        assert!(matches!(err, DroverError::Config { path: Some(_), .. }));
        assert_eq!(err.exit_code(), 7);
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = DroverConfig::default();
        config.supervisor.workers = 0;
        let err = config.validate().expect_err("invalid");
        assert!(err.to_string().contains("supervisor.workers"));
    }

    #[test]
    fn test_validate_rejects_no_variants() {
        let mut config = DroverConfig::default();
        config.pipeline.primary = false;
        config.pipeline.secondary = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_throttle() {
        let mut config = DroverConfig::default();
        config.throttle.min_multiplier = 3.0;
        config.throttle.max_multiplier = 1.0;
        assert!(config.validate().is_err());

        config.throttle.max_multiplier = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_pattern() {
        let mut config = DroverConfig::default();
        config.classifier.ban_patterns = vec!["(unclosed".into()];
        let err = config.validate().expect_err("invalid");
        assert!(matches!(err, DroverError::InvalidConfig { .. }));
    }
}
