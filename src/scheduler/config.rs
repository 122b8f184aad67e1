//! Queue manager configuration.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{duration_ms, parse_env_millis, parse_env_value, ConfigError};
use crate::domain::DEFAULT_REQUIRED_KEYS;

/// How queued jobs are ordered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOrdering {
    /// `urgent` and `high` jobs go to the front, `normal` and `low` to the back.
    ///
    /// Within the front band the most recently submitted job runs first.
    #[default]
    FrontInsertion,
    /// Highest priority first, first-in-first-out within a level.
    StrictPriority,
}

impl FromStr for QueueOrdering {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "front_insertion" | "front-insertion" => Ok(QueueOrdering::FrontInsertion),
            "strict_priority" | "strict-priority" => Ok(QueueOrdering::StrictPriority),
            other => Err(format!("unknown queue ordering '{}'", other)),
        }
    }
}

/// Configuration for the queue manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of jobs processing at once.
    pub max_concurrent: usize,
    /// Maximum number of queued jobs. Unbounded when `None`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_queue_size: Option<usize>,
    /// How long finished jobs stay queryable.
    #[serde(with = "duration_ms", rename = "result_retention_ms")]
    pub result_retention: Duration,
    /// Maximum number of finished jobs kept.
    pub result_cache_size: usize,
    /// Top-level keys every payload must contain.
    pub required_keys: Vec<String>,
    pub ordering: QueueOrdering,
    /// Capacity of the manager's command channel. Fixed at spawn.
    pub channel_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            max_queue_size: None,
            result_retention: Duration::from_secs(3600),
            result_cache_size: 1000,
            required_keys: DEFAULT_REQUIRED_KEYS.iter().map(|k| k.to_string()).collect(),
            ordering: QueueOrdering::FrontInsertion,
            channel_capacity: 256,
        }
    }
}

impl QueueConfig {
    /// Creates a configuration with the given concurrency limit.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            ..Default::default()
        }
    }

    /// Sets the concurrency limit.
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    /// Bounds the number of queued jobs.
    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = Some(size);
        self
    }

    /// Sets how long finished jobs stay queryable.
    pub fn with_result_retention(mut self, retention: Duration) -> Self {
        self.result_retention = retention;
        self
    }

    /// Sets the number of finished jobs kept.
    pub fn with_result_cache_size(mut self, size: usize) -> Self {
        self.result_cache_size = size;
        self
    }

    /// Sets the keys every payload must contain.
    pub fn with_required_keys<S: Into<String>>(mut self, keys: impl IntoIterator<Item = S>) -> Self {
        self.required_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the queue ordering.
    pub fn with_ordering(mut self, ordering: QueueOrdering) -> Self {
        self.ordering = ordering;
        self
    }

    /// Creates configuration from `REFINERY_QUEUE_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().apply_env()
    }

    /// Applies environment overrides.
    ///
    /// # Environment Variables
    ///
    /// - `REFINERY_QUEUE_MAX_CONCURRENT`: Concurrency limit (default: 4)
    /// - `REFINERY_QUEUE_MAX_SIZE`: Queue bound (default: unbounded)
    /// - `REFINERY_QUEUE_RESULT_RETENTION_MS`: Result retention (default: 3600000)
    /// - `REFINERY_QUEUE_RESULT_CACHE_SIZE`: Finished jobs kept (default: 1000)
    /// - `REFINERY_QUEUE_ORDERING`: `front_insertion` or `strict_priority`
    pub fn apply_env(mut self) -> Result<Self, ConfigError> {
        if let Ok(val) = std::env::var("REFINERY_QUEUE_MAX_CONCURRENT") {
            self.max_concurrent = parse_env_value(&val, "REFINERY_QUEUE_MAX_CONCURRENT")?;
        }
        if let Ok(val) = std::env::var("REFINERY_QUEUE_MAX_SIZE") {
            self.max_queue_size = Some(parse_env_value(&val, "REFINERY_QUEUE_MAX_SIZE")?);
        }
        if let Ok(val) = std::env::var("REFINERY_QUEUE_RESULT_RETENTION_MS") {
            self.result_retention = parse_env_millis(&val, "REFINERY_QUEUE_RESULT_RETENTION_MS")?;
        }
        if let Ok(val) = std::env::var("REFINERY_QUEUE_RESULT_CACHE_SIZE") {
            self.result_cache_size = parse_env_value(&val, "REFINERY_QUEUE_RESULT_CACHE_SIZE")?;
        }
        if let Ok(val) = std::env::var("REFINERY_QUEUE_ORDERING") {
            self.ordering = val.parse().map_err(|message| ConfigError::InvalidValue {
                key: "REFINERY_QUEUE_ORDERING".to_string(),
                message,
            })?;
        }
        Ok(self)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_concurrent must be greater than 0".to_string(),
            ));
        }
        if self.max_queue_size == Some(0) {
            return Err(ConfigError::ValidationFailed(
                "max_queue_size must be greater than 0".to_string(),
            ));
        }
        if self.result_cache_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "result_cache_size must be greater than 0".to_string(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "channel_capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
