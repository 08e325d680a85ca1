//! Runtime configuration for aggregation and streaming runs.
//!
//! Every field has a default, so a JSON config file only needs to name what it
//! changes:
//!
//! ```json
//! { "streaming": { "acceleration_factor": 60.0, "pacing": false } }
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Settings for the parallel telemetry aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Worker threads, which is also the number of file chunks.
    pub workers: usize,
    /// Upper bound on data lines considered, `None` for the whole file.
    pub max_records: Option<u64>,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            max_records: Some(15_000),
        }
    }
}

impl AggregationConfig {
    /// # Errors
    ///
    /// Rejects a worker count of zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(invalid("aggregation.workers", "must be at least 1"));
        }
        Ok(())
    }
}

/// Settings for the replay pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub queue_capacity: usize,
    pub batch_size: usize,
    /// Records the producer enqueues before stopping, `None` for the whole file.
    pub max_records: Option<u64>,
    pub pacing: bool,
    /// Replay speed relative to the recorded timestamps; 1.0 is real time.
    pub acceleration_factor: f64,
    #[serde(with = "millis")]
    pub max_delay: Duration,
    #[serde(with = "millis")]
    pub poll_interval: Duration,
    pub report_every: u64,
    #[serde(with = "millis")]
    pub stop_timeout: Duration,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            batch_size: 100,
            max_records: Some(15_000),
            pacing: true,
            acceleration_factor: 10.0,
            max_delay: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
            report_every: 1_000,
            stop_timeout: Duration::from_secs(10),
        }
    }
}

impl StreamingConfig {
    /// # Errors
    ///
    /// Rejects an empty queue or batch and a non-positive acceleration factor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(invalid("streaming.queue_capacity", "must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(invalid("streaming.batch_size", "must be at least 1"));
        }
        if !(self.acceleration_factor > 0.0 && self.acceleration_factor.is_finite()) {
            return Err(invalid(
                "streaming.acceleration_factor",
                format!("must be positive, got {}", self.acceleration_factor),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub aggregation: AggregationConfig,
    pub streaming: StreamingConfig,
}

impl AppConfig {
    /// Loads and validates a JSON config file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid JSON, or
    /// holds an invalid value.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: AppConfig = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns the first invalid value found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.aggregation.validate()?;
        self.streaming.validate()
    }
}

/// Serialises a [`Duration`] as whole milliseconds.
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.aggregation.workers >= 1);
        assert_eq!(config.streaming.queue_capacity, 10_000);
        assert_eq!(config.streaming.max_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"streaming": {"acceleration_factor": 60.0, "max_delay": 250}}"#)
                .unwrap();

        assert_eq!(config.streaming.acceleration_factor, 60.0);
        assert_eq!(config.streaming.max_delay, Duration::from_millis(250));
        assert_eq!(config.streaming.batch_size, 100);
        assert_eq!(config.aggregation.max_records, Some(15_000));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.aggregation.workers = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.streaming.acceleration_factor = 0.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.streaming.queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.streaming.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"aggregation": {{"workers": 3, "max_records": null}}}}"#).unwrap();

        let config = AppConfig::from_file(file.path()).unwrap();
        assert_eq!(config.aggregation.workers, 3);
        assert_eq!(config.aggregation.max_records, None);
    }

    #[test]
    fn test_from_file_rejects_invalid() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"streaming": {{"batch_size": 0}}}}"#).unwrap();

        assert!(AppConfig::from_file(file.path()).is_err());
    }
}
