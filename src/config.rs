//! Service configuration.
//!
//! [`ServiceConfig`] groups the queue, pipeline and cancellation settings.
//! It is loaded from an optional YAML file (durations in milliseconds) and
//! then overridden by `REFINERY_*` environment variables.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cancellation::CancellationConfig;
use crate::pipeline::PipelineDefaults;
use crate::scheduler::QueueConfig;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid YAML for this schema.
    #[error("Invalid configuration file: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Complete service configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub queue: QueueConfig,
    pub pipeline: PipelineDefaults,
    pub cancellation: CancellationConfig,
}

impl ServiceConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a YAML document. Missing sections and fields keep their defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Loads a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    /// Creates configuration from defaults and environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().apply_env()
    }

    /// Applies environment overrides to every section.
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        Ok(Self {
            queue: self.queue.apply_env()?,
            pipeline: self.pipeline.apply_env()?,
            cancellation: self.cancellation.apply_env()?,
        })
    }

    /// Loads `path` if given, applies environment overrides and validates.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let base = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        let config = base.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Validates every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.queue.validate()?;
        self.pipeline.validate()?;
        self.cancellation.validate()?;
        Ok(())
    }
}

/// Parse an environment variable value.
pub(crate) fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
pub(crate) fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

/// Serializes a `Duration` as whole milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Serializes an optional `Duration` as whole milliseconds.
pub(crate) mod option_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        duration: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}

/// Parses an environment variable holding milliseconds.
pub(crate) fn parse_env_millis(value: &str, key: &str) -> Result<Duration, ConfigError> {
    parse_env_value::<u64>(value, key).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::QueueOrdering;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = ServiceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue.max_concurrent, 4);
        assert_eq!(config.pipeline.max_iterations, 3);
        assert_eq!(config.cancellation.graceful_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
queue:
  max_concurrent: 2
  ordering: strict_priority
pipeline:
  quality_threshold: 0.9
  timeout_ms: 1500
cancellation:
  cleanup_timeout_ms: 2000
"#;
        let config = ServiceConfig::from_yaml_str(yaml).expect("valid yaml");
        assert_eq!(config.queue.max_concurrent, 2);
        assert_eq!(config.queue.ordering, QueueOrdering::StrictPriority);
        assert!((config.pipeline.quality_threshold - 0.9).abs() < f64::EPSILON);
        assert_eq!(config.pipeline.timeout, Duration::from_millis(1500));
        assert_eq!(config.pipeline.max_iterations, 3);
        assert_eq!(config.cancellation.cleanup_timeout, Duration::from_secs(2));
        assert_eq!(config.cancellation.graceful_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_from_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "queue:\n  max_concurrent: 7").expect("write");

        let config = ServiceConfig::from_yaml_file(file.path()).expect("load");
        assert_eq!(config.queue.max_concurrent, 7);
    }

    #[test]
    fn test_invalid_yaml_is_reported() {
        let err = ServiceConfig::from_yaml_str("queue: [1, 2").expect_err("invalid yaml");
        assert!(matches!(err, ConfigError::Yaml(_)));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = ServiceConfig::from_yaml_file("/nonexistent/refinery.yaml").expect_err("missing");
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_parse_env_value() {
        assert_eq!(parse_env_value::<u32>("42", "KEY").ok(), Some(42));
        let err = parse_env_value::<u32>("abc", "KEY").expect_err("not a number");
        assert!(err.to_string().contains("KEY"));
    }

    #[test]
    fn test_parse_env_bool() {
        assert!(parse_env_bool("yes", "KEY").expect("bool"));
        assert!(!parse_env_bool("0", "KEY").expect("bool"));
        assert!(parse_env_bool("maybe", "KEY").is_err());
    }

    #[test]
    fn test_parse_env_millis() {
        assert_eq!(
            parse_env_millis("250", "KEY").ok(),
            Some(Duration::from_millis(250))
        );
    }
}
