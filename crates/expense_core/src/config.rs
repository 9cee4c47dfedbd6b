//! Engine configuration.
//!
//! # Responsibility
//! - Define tunables for bulk bounds, rate limits, retention and logging.
//! - Load them from JSON with per-field defaults.
//!
//! # Invariants
//! - A config returned by `from_json_str`/`load` has passed `validate()`.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::Path;

/// Top-level configuration for the lifecycle engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Upper bound on distinct ids per bulk request.
    pub max_bulk_targets: usize,
    /// SQLite busy timeout for per-record transactions.
    pub busy_timeout_ms: u64,
    pub rate_limits: RateLimitsConfig,
    pub retention: RetentionConfig,
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_bulk_targets: 100,
            busy_timeout_ms: 5_000,
            rate_limits: RateLimitsConfig::default(),
            retention: RetentionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Fixed-window admission policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitPolicy {
    pub max_requests: u32,
    pub window_seconds: u64,
}

impl RateLimitPolicy {
    pub const fn new(max_requests: u32, window_seconds: u64) -> Self {
        Self {
            max_requests,
            window_seconds,
        }
    }
}

/// Policies per operation class family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitsConfig {
    /// Applied to each bulk operation class separately.
    pub bulk: RateLimitPolicy,
    /// Applied to single-record soft delete and restore.
    pub single: RateLimitPolicy,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            bulk: RateLimitPolicy::new(5, 60),
            single: RateLimitPolicy::new(10, 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetentionConfig {
    /// Soft-deleted records older than this are purged.
    pub retention_days: u32,
    /// Candidates fetched per query.
    pub batch_size: u32,
    /// Hard cap on purges per sweep cycle.
    pub max_records_per_sweep: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_days: 30,
            batch_size: 100,
            max_records_per_sweep: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// One of `trace|debug|info|warn|error`.
    pub level: String,
    /// Absolute directory for rolling log files.
    pub log_dir: Option<String>,
    pub max_file_size_bytes: u64,
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: crate::logging::default_log_level().to_string(),
            log_dir: None,
            max_file_size_bytes: 10 * 1024 * 1024,
            max_files: 5,
        }
    }
}

/// Configuration load/validation errors.
#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: String,
        source: std::io::Error,
    },
    Parse(serde_json::Error),
    Invalid {
        field: &'static str,
        reason: String,
    },
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "failed to read config `{path}`: {source}"),
            Self::Parse(err) => write!(f, "failed to parse config: {err}"),
            Self::Invalid { field, reason } => write!(f, "invalid config `{field}`: {reason}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse(err) => Some(err),
            Self::Invalid { .. } => None,
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value)
    }
}

impl EngineConfig {
    /// Parses and validates a JSON document. Missing fields take defaults.
    pub fn from_json_str(value: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(value)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_bulk_targets == 0 {
            return Err(invalid("max_bulk_targets", "must be at least 1"));
        }
        for (field, policy) in [
            ("rate_limits.bulk", self.rate_limits.bulk),
            ("rate_limits.single", self.rate_limits.single),
        ] {
            if policy.window_seconds == 0 {
                return Err(invalid(field, "window_seconds must be at least 1"));
            }
        }
        if self.retention.retention_days == 0 {
            return Err(invalid("retention.retention_days", "must be at least 1"));
        }
        if self.retention.batch_size == 0 {
            return Err(invalid("retention.batch_size", "must be at least 1"));
        }
        if self.retention.max_records_per_sweep < self.retention.batch_size {
            return Err(invalid(
                "retention.max_records_per_sweep",
                "must not be smaller than retention.batch_size",
            ));
        }
        if self.logging.max_files == 0 {
            return Err(invalid("logging.max_files", "must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}
