//! Shared configuration for the ETL healer binaries.
//!
//! Every binary (`etl-scheduler`, `health-monitor`, `etl-recovery`) reads the
//! same [`HealerConfig`] so that they agree on the state database, lock file,
//! PID marker and thresholds.
//!
//! # Resolution order
//!
//! 1. An explicit `--config` path
//! 2. The `ETL_HEALER_CONFIG` environment variable
//! 3. Built-in defaults
//!
//! After loading, `ETL_HEALER_DATA_DIR` overrides `paths.data_dir`.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod error;

pub use error::ConfigError;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Environment variable pointing at a TOML config file.
pub const ENV_CONFIG_PATH: &str = "ETL_HEALER_CONFIG";

/// Environment variable overriding the data directory.
pub const ENV_DATA_DIR: &str = "ETL_HEALER_DATA_DIR";

/// Longest accepted alert cooldown (one week).
pub const MAX_ALERT_COOLDOWN_MINUTES: u64 = 7 * 24 * 60;

/// Longest accepted health-check window (one year).
pub const MAX_WINDOW_HOURS: u64 = 365 * 24;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HealerConfig {
    pub paths: PathsConfig,
    pub schedule: ScheduleConfig,
    pub retry: RetryConfig,
    pub health: HealthConfig,
    pub notify: NotifyConfig,
    pub retention: RetentionConfig,
    pub recovery: RecoveryConfig,
    pub pipeline: PipelineConfig,
}

impl HealerConfig {
    /// Load configuration from an explicit path, `ETL_HEALER_CONFIG`, or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a referenced file is missing or invalid, or if the
    /// resulting configuration fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let resolved = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(ENV_CONFIG_PATH).map(PathBuf::from));

        let mut config = match resolved {
            Some(path) => Self::from_file(&path)?,
            None => {
                debug!("No config file given, using defaults");
                Self::default()
            }
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Defaults with environment overrides applied, for paths that must be
    /// known even when loading the configured file failed.
    #[must_use]
    pub fn defaults_from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Some(dir) = std::env::var_os(ENV_DATA_DIR) {
            debug!(data_dir = ?dir, "Data directory overridden from environment");
            self.paths.data_dir = PathBuf::from(dir);
        }
    }

    /// Read and parse a TOML config file without applying env overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.schedule.target_time()?;
        if self.schedule.window_minutes > 720 {
            return Err(ConfigError::Invalid(format!(
                "schedule.window_minutes must be <= 720, got {}",
                self.schedule.window_minutes
            )));
        }

        if self.health.min_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "health.min_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.health.window_hours == 0 {
            return Err(ConfigError::Invalid(
                "health.window_hours must be greater than zero".to_string(),
            ));
        }

        if self.health.window_hours > MAX_WINDOW_HOURS {
            return Err(ConfigError::Invalid(format!(
                "health.window_hours must be <= {MAX_WINDOW_HOURS}, got {}",
                self.health.window_hours
            )));
        }
        if self.health.alert_cooldown_minutes > MAX_ALERT_COOLDOWN_MINUTES {
            return Err(ConfigError::Invalid(format!(
                "health.alert_cooldown_minutes must be <= {MAX_ALERT_COOLDOWN_MINUTES}, got {}",
                self.health.alert_cooldown_minutes
            )));
        }

        let h = &self.health;
        for (name, t) in [
            ("db_latency_ms", &h.db_latency_ms),
            ("freshness_hours", &h.freshness_hours),
            ("duration_secs", &h.duration_secs),
            ("memory_mb", &h.memory_mb),
            ("error_rate", &h.error_rate),
            ("memory_used_pct", &h.memory_used_pct),
        ] {
            if t.warning >= t.critical {
                return Err(ConfigError::Invalid(format!(
                    "health.{name}: warning ({}) must be below critical ({})",
                    t.warning, t.critical
                )));
            }
        }
        // Lower free space is worse, so the ordering flips.
        if h.disk_free_pct.warning <= h.disk_free_pct.critical {
            return Err(ConfigError::Invalid(format!(
                "health.disk_free_pct: warning ({}) must be above critical ({})",
                h.disk_free_pct.warning, h.disk_free_pct.critical
            )));
        }

        for o in &self.retry.overrides {
            if o.max_attempts == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "retry override for {}: max_attempts must be at least 1",
                    o.error_type
                )));
            }
            if let Some(multiplier) = o.multiplier {
                if !multiplier.is_finite() || multiplier < 1.0 {
                    return Err(ConfigError::Invalid(format!(
                        "retry override for {}: multiplier must be a finite number >= 1.0, got {multiplier}",
                        o.error_type
                    )));
                }
            }
        }

        let mut seen = HashSet::new();
        for source in &self.pipeline.sources {
            if source.name.trim().is_empty() || source.command.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "pipeline.sources entries need a name and a command".to_string(),
                ));
            }
            if !seen.insert(source.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate pipeline source: {}",
                    source.name
                )));
            }
        }

        Ok(())
    }
}

/// Filesystem locations. Unset paths derive from `data_dir`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub data_dir: PathBuf,
    pub state_db: Option<PathBuf>,
    pub lock_file: Option<PathBuf>,
    pub pid_file: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub temp_dir: Option<PathBuf>,
    pub audit_log: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            state_db: None,
            lock_file: None,
            pid_file: None,
            log_dir: None,
            temp_dir: None,
            audit_log: None,
        }
    }
}

impl PathsConfig {
    #[must_use]
    pub fn state_db(&self) -> PathBuf {
        self.state_db
            .clone()
            .unwrap_or_else(|| self.data_dir.join("etl-state.db"))
    }

    #[must_use]
    pub fn lock_file(&self) -> PathBuf {
        self.lock_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("etl.lock"))
    }

    #[must_use]
    pub fn pid_file(&self) -> PathBuf {
        self.pid_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("health-monitor.pid"))
    }

    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("logs"))
    }

    #[must_use]
    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("tmp"))
    }

    #[must_use]
    pub fn audit_log(&self) -> PathBuf {
        self.audit_log
            .clone()
            .unwrap_or_else(|| self.log_dir().join("recovery-audit.jsonl"))
    }
}

/// Daily schedule window for non-manual runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Local wall-clock target, `HH:MM`
    pub target_time: String,
    /// Allowed deviation either side of the target
    pub window_minutes: u32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            target_time: "06:00".to_string(),
            window_minutes: 30,
        }
    }
}

impl ScheduleConfig {
    /// Parse `target_time`.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not `HH:MM` or `HH:MM:SS`.
    pub fn target_time(&self) -> Result<NaiveTime, ConfigError> {
        NaiveTime::parse_from_str(&self.target_time, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(&self.target_time, "%H:%M:%S"))
            .map_err(|_| {
                ConfigError::Invalid(format!(
                    "schedule.target_time must be HH:MM, got {:?}",
                    self.target_time
                ))
            })
    }
}

/// Retry tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Longest backoff the pipeline will sleep through inline before escalating
    pub max_inline_wait_secs: u64,
    /// Per-error-type policy overrides
    pub overrides: Vec<RetryOverride>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_inline_wait_secs: 900,
            overrides: vec![],
        }
    }
}

/// Override for one error type's retry policy. Unset fields keep the default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryOverride {
    pub error_type: String,
    pub max_attempts: Option<u32>,
    pub base_delay_secs: Option<u64>,
    pub multiplier: Option<f64>,
    pub max_delay_secs: Option<u64>,
}

/// Two ordered thresholds (warning is less severe than critical).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    pub warning: f64,
    pub critical: f64,
}

impl ThresholdConfig {
    #[must_use]
    pub const fn new(warning: f64, critical: f64) -> Self {
        Self { warning, critical }
    }
}

/// Health monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_secs: u64,
    /// Floor enforced on `--interval`
    pub min_interval_secs: u64,
    pub alert_cooldown_minutes: u64,
    /// Trailing window for performance and error-rate checks
    pub window_hours: u64,
    /// How long `--stop` waits before force-killing
    pub stop_timeout_secs: u64,
    pub db_latency_ms: ThresholdConfig,
    pub freshness_hours: ThresholdConfig,
    pub duration_secs: ThresholdConfig,
    pub memory_mb: ThresholdConfig,
    pub error_rate: ThresholdConfig,
    /// Lower is worse: warning above critical
    pub disk_free_pct: ThresholdConfig,
    pub memory_used_pct: ThresholdConfig,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            min_interval_secs: 60,
            alert_cooldown_minutes: 60,
            window_hours: 24,
            stop_timeout_secs: 30,
            db_latency_ms: ThresholdConfig::new(500.0, 2000.0),
            freshness_hours: ThresholdConfig::new(26.0, 50.0),
            duration_secs: ThresholdConfig::new(1800.0, 3600.0),
            memory_mb: ThresholdConfig::new(1024.0, 2048.0),
            error_rate: ThresholdConfig::new(0.1, 0.25),
            disk_free_pct: ThresholdConfig::new(20.0, 10.0),
            memory_used_pct: ThresholdConfig::new(85.0, 95.0),
        }
    }
}

impl HealthConfig {
    /// Clamp a requested interval to the configured floor.
    #[must_use]
    pub fn effective_interval(&self, requested: Option<u64>) -> u64 {
        requested
            .unwrap_or(self.interval_secs)
            .max(self.min_interval_secs)
    }
}

/// Operator notification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub recipients: Vec<String>,
    pub subject_prefix: String,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            recipients: vec![],
            subject_prefix: "[ETL]".to_string(),
        }
    }
}

/// Retention windows used by cleanup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub runs_days: u32,
    pub retry_days: u32,
    pub monitoring_days: u32,
    pub critical_error_days: u32,
    pub log_days: u32,
    pub temp_file_hours: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            runs_days: 90,
            retry_days: 30,
            monitoring_days: 30,
            critical_error_days: 90,
            log_days: 14,
            temp_file_hours: 24,
        }
    }
}

/// Recovery and fallback settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Delay before the run scheduled by `force-restart`
    pub restart_delay_minutes: u32,
    /// Recency bound for `restore-fallback`
    pub fallback_max_age_hours: u32,
    /// Lifetime of newly written fallback snapshots
    pub fallback_ttl_hours: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            restart_delay_minutes: 5,
            fallback_max_age_hours: 48,
            fallback_ttl_hours: 72,
        }
    }
}

/// External data sources.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub sources: Vec<SourceConfig>,
}

/// One extractor backed by an external command that prints a JSON array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_source_timeout")]
    pub timeout_secs: u64,
}

fn default_source_timeout() -> u64 {
    600
}
