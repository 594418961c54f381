//! Configuration structures.
//!
//! Configuration is loaded from JSON files and environment variables. Every
//! section has defaults, so an empty object is a valid config.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::errors::{Error, Result};
use crate::validation::validate_positive_duration;

/// Global kernel configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Scheduler/executor settings.
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Terminal job retention.
    #[serde(default)]
    pub cleanup: CleanupConfig,

    /// Telemetry bridge settings.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Config {
    /// Parse a JSON config document.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Apply `DIALECTIC_MAX_CONCURRENT_JOBS` and `DIALECTIC_POLL_INTERVAL`
    /// (humantime, e.g. `250ms`) on top of the loaded values.
    pub fn apply_env_overrides(mut self) -> Result<Self> {
        if let Ok(raw) = std::env::var("DIALECTIC_MAX_CONCURRENT_JOBS") {
            self.dispatch.max_concurrent_jobs = raw.parse().map_err(|_| {
                Error::validation(format!("DIALECTIC_MAX_CONCURRENT_JOBS: invalid value {raw:?}"))
            })?;
        }
        if let Ok(raw) = std::env::var("DIALECTIC_POLL_INTERVAL") {
            self.dispatch.poll_interval = humantime_serde::re::humantime::parse_duration(&raw)
                .map_err(|e| Error::validation(format!("DIALECTIC_POLL_INTERVAL: {e}")))?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dispatch.max_concurrent_jobs == 0 {
            return Err(Error::validation("dispatch.max_concurrent_jobs must be positive"));
        }
        validate_positive_duration(self.dispatch.poll_interval, "dispatch.poll_interval")?;
        validate_positive_duration(self.cleanup.interval, "cleanup.interval")?;
        if self.dispatch.training_max_attempts == 0 {
            return Err(Error::validation("dispatch.training_max_attempts must be positive"));
        }
        if self.dispatch.default_base_delay > self.dispatch.default_max_delay {
            return Err(Error::validation(
                "dispatch.default_base_delay exceeds dispatch.default_max_delay",
            ));
        }
        Ok(())
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Scheduler and executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Execution slots. Jobs beyond this wait in `queued`.
    pub max_concurrent_jobs: usize,

    /// Default awaiter poll cadence.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Attempts for training steps when the caller does not supply a policy.
    pub training_max_attempts: u32,

    /// Default retry base delay.
    #[serde(with = "humantime_serde")]
    pub default_base_delay: Duration,

    /// Default retry delay cap.
    #[serde(with = "humantime_serde")]
    pub default_max_delay: Duration,

    /// Accepted tenant spaces. Empty accepts any tenant.
    pub tenants: Vec<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 8,
            poll_interval: Duration::from_secs(1),
            training_max_attempts: 3,
            default_base_delay: Duration::from_secs(1),
            default_max_delay: Duration::from_secs(60),
            tenants: Vec::new(),
        }
    }
}

/// Configuration for the terminal job reaper.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// How often to run cleanup (default: 5 minutes)
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// How long to keep terminal jobs (default: 24 hours)
    #[serde(with = "humantime_serde")]
    pub job_retention: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            job_retention: Duration::from_secs(86_400),
        }
    }
}

/// Telemetry bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Stable handler name the bridge attaches under.
    pub handler_name: String,

    /// `metadata.source` value marking jobs owned by this system.
    pub source: String,

    /// Tenants whose jobs are always bridged.
    pub tenants: Vec<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            handler_name: "dialectic-telemetry".to_string(),
            source: "dialectic".to_string(),
            tenants: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = Config::from_json_str("{}").unwrap();
        assert_eq!(config.dispatch.max_concurrent_jobs, 8);
        assert_eq!(config.dispatch.poll_interval, Duration::from_secs(1));
        assert_eq!(config.telemetry.source, "dialectic");
    }

    #[test]
    fn test_humantime_durations() {
        let config = Config::from_json_str(
            r#"{"dispatch": {"poll_interval": "250ms", "default_base_delay": "2s"}}"#,
        )
        .unwrap();
        assert_eq!(config.dispatch.poll_interval, Duration::from_millis(250));
        assert_eq!(config.dispatch.default_base_delay, Duration::from_secs(2));
        // Unset fields keep their defaults
        assert_eq!(config.dispatch.training_max_attempts, 3);
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let err = Config::from_json_str(r#"{"dispatch": {"max_concurrent_jobs": 0}}"#).unwrap_err();
        assert!(err.to_string().contains("max_concurrent_jobs"));
    }

    #[test]
    fn test_rejects_inverted_delays() {
        let raw = r#"{"dispatch": {"default_base_delay": "2m", "default_max_delay": "1m"}}"#;
        assert!(Config::from_json_str(raw).is_err());
    }

    #[test]
    fn test_rejects_zero_cleanup_interval() {
        let err = Config::from_json_str(r#"{"cleanup": {"interval": "0s"}}"#).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(err.to_string().contains("cleanup.interval must be positive"));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"cleanup": {{"job_retention": "1h"}}}}"#).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.cleanup.job_retention, Duration::from_secs(3600));
    }

    #[test]
    fn test_from_missing_file_is_io_error() {
        let err = Config::from_file("/nonexistent/dialectic.json").unwrap_err();
        assert_eq!(err.code(), "io");
    }
}
