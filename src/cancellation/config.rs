//! Configuration for the cancellation manager.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{duration_ms, parse_env_millis, parse_env_value, ConfigError};

/// Default time a worker gets to honour a cancellation request.
pub const DEFAULT_GRACEFUL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default upper bound on one cleanup run.
pub const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(15);

/// Default delay between cleanup completion and record removal.
pub const DEFAULT_DISPOSAL_DELAY: Duration = Duration::from_secs(5);

/// Default memory monitoring interval.
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(5);

/// Default fraction of system memory above which workers get a pressure hint.
pub const DEFAULT_MEMORY_THRESHOLD: f64 = 0.90;

/// Default command channel capacity.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Configuration for the cancellation manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CancellationConfig {
    /// Time a worker has to stop after a cancellation request before it is force-terminated.
    #[serde(with = "duration_ms", rename = "graceful_timeout_ms")]
    pub graceful_timeout: Duration,
    /// Upper bound on a cleanup run; the record is completed with a timeout result when hit.
    #[serde(with = "duration_ms", rename = "cleanup_timeout_ms")]
    pub cleanup_timeout: Duration,
    /// Grace window during which a cleaned-up record stays queryable.
    #[serde(with = "duration_ms", rename = "disposal_delay_ms")]
    pub disposal_delay: Duration,
    /// How often system memory is sampled.
    #[serde(with = "duration_ms", rename = "monitor_interval_ms")]
    pub monitor_interval: Duration,
    /// Used/total memory ratio that triggers a pressure hint.
    pub memory_threshold: f64,
    /// Capacity of the manager's command channel.
    pub channel_capacity: usize,
}

impl Default for CancellationConfig {
    fn default() -> Self {
        Self {
            graceful_timeout: DEFAULT_GRACEFUL_TIMEOUT,
            cleanup_timeout: DEFAULT_CLEANUP_TIMEOUT,
            disposal_delay: DEFAULT_DISPOSAL_DELAY,
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
            memory_threshold: DEFAULT_MEMORY_THRESHOLD,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl CancellationConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the graceful cancellation timeout.
    pub fn with_graceful_timeout(mut self, timeout: Duration) -> Self {
        self.graceful_timeout = timeout;
        self
    }

    /// Sets the cleanup timeout.
    pub fn with_cleanup_timeout(mut self, timeout: Duration) -> Self {
        self.cleanup_timeout = timeout;
        self
    }

    /// Sets the disposal delay.
    pub fn with_disposal_delay(mut self, delay: Duration) -> Self {
        self.disposal_delay = delay;
        self
    }

    /// Sets the memory monitoring interval.
    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    /// Sets the memory pressure threshold.
    pub fn with_memory_threshold(mut self, threshold: f64) -> Self {
        self.memory_threshold = threshold;
        self
    }

    /// Creates configuration from defaults and `REFINERY_CANCEL_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().apply_env()
    }

    /// Applies `REFINERY_CANCEL_*` environment overrides.
    ///
    /// # Environment Variables
    ///
    /// - `REFINERY_CANCEL_GRACEFUL_TIMEOUT_MS`
    /// - `REFINERY_CANCEL_CLEANUP_TIMEOUT_MS`
    /// - `REFINERY_CANCEL_DISPOSAL_DELAY_MS`
    /// - `REFINERY_CANCEL_MONITOR_INTERVAL_MS`
    /// - `REFINERY_CANCEL_MEMORY_THRESHOLD`
    pub fn apply_env(mut self) -> Result<Self, ConfigError> {
        if let Ok(val) = std::env::var("REFINERY_CANCEL_GRACEFUL_TIMEOUT_MS") {
            self.graceful_timeout = parse_env_millis(&val, "REFINERY_CANCEL_GRACEFUL_TIMEOUT_MS")?;
        }
        if let Ok(val) = std::env::var("REFINERY_CANCEL_CLEANUP_TIMEOUT_MS") {
            self.cleanup_timeout = parse_env_millis(&val, "REFINERY_CANCEL_CLEANUP_TIMEOUT_MS")?;
        }
        if let Ok(val) = std::env::var("REFINERY_CANCEL_DISPOSAL_DELAY_MS") {
            self.disposal_delay = parse_env_millis(&val, "REFINERY_CANCEL_DISPOSAL_DELAY_MS")?;
        }
        if let Ok(val) = std::env::var("REFINERY_CANCEL_MONITOR_INTERVAL_MS") {
            self.monitor_interval = parse_env_millis(&val, "REFINERY_CANCEL_MONITOR_INTERVAL_MS")?;
        }
        if let Ok(val) = std::env::var("REFINERY_CANCEL_MEMORY_THRESHOLD") {
            self.memory_threshold = parse_env_value(&val, "REFINERY_CANCEL_MEMORY_THRESHOLD")?;
        }
        Ok(self)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.graceful_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "graceful_timeout must be greater than 0".to_string(),
            ));
        }
        if self.cleanup_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "cleanup_timeout must be greater than 0".to_string(),
            ));
        }
        if self.monitor_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "monitor_interval must be greater than 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.memory_threshold) {
            return Err(ConfigError::ValidationFailed(
                "memory_threshold must be between 0.0 and 1.0".to_string(),
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
