//! Pipeline defaults and per-job options.
//!
//! [`PipelineDefaults`] supplies the values a caller leaves out;
//! [`RunOptions`] carries the caller's overrides and resolves into the
//! validated [`RefinementOptions`] a coordinator runs with.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{
    duration_ms, option_duration_ms, parse_env_millis, parse_env_value, ConfigError,
};
use crate::error::ValidationError;

/// Smallest accepted iteration cap.
pub const MIN_ITERATIONS: u32 = 1;

/// Largest accepted iteration cap.
pub const MAX_ITERATIONS: u32 = 5;

/// Default configuration for refinement runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineDefaults {
    /// Iteration cap when the caller gives none.
    pub max_iterations: u32,
    /// Overall score at which refinement stops.
    pub quality_threshold: f64,
    /// Wall-clock budget for one job, checked before each iteration.
    #[serde(with = "duration_ms", rename = "timeout_ms")]
    pub timeout: Duration,
    /// Number of trailing iterations inspected for stagnation.
    pub no_improvement_window: usize,
    /// Overall gain below which an iteration counts as no improvement.
    pub min_improvement: f64,
    /// Used/total memory ratio at which a job stops with `resource_limit`.
    pub memory_limit_fraction: f64,
    /// Thresholds at or below this turn a first-iteration rejection into `no_improvement`.
    pub low_threshold_cutoff: f64,
    /// Interval of the progress heartbeat, if any.
    #[serde(
        with = "option_duration_ms",
        rename = "progress_interval_ms",
        skip_serializing_if = "Option::is_none"
    )]
    pub progress_interval: Option<Duration>,
}

impl Default for PipelineDefaults {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            quality_threshold: 0.75,
            timeout: Duration::from_secs(300),
            no_improvement_window: 2,
            min_improvement: 0.01,
            memory_limit_fraction: 0.95,
            low_threshold_cutoff: 0.2,
            progress_interval: None,
        }
    }
}

impl PipelineDefaults {
    /// Creates defaults with standard values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the default iteration cap.
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Sets the default quality threshold.
    pub fn with_quality_threshold(mut self, threshold: f64) -> Self {
        self.quality_threshold = threshold;
        self
    }

    /// Sets the default timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the memory fraction that stops a job.
    pub fn with_memory_limit_fraction(mut self, fraction: f64) -> Self {
        self.memory_limit_fraction = fraction;
        self
    }

    /// Enables the progress heartbeat.
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = Some(interval);
        self
    }

    /// Creates defaults from `REFINERY_PIPELINE_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().apply_env()
    }

    /// Applies environment overrides.
    ///
    /// # Environment Variables
    ///
    /// - `REFINERY_PIPELINE_MAX_ITERATIONS`: Iteration cap (default: 3)
    /// - `REFINERY_PIPELINE_QUALITY_THRESHOLD`: Quality threshold (default: 0.75)
    /// - `REFINERY_PIPELINE_TIMEOUT_MS`: Job timeout in milliseconds (default: 300000)
    /// - `REFINERY_PIPELINE_MEMORY_LIMIT`: Memory fraction limit (default: 0.95)
    /// - `REFINERY_PIPELINE_PROGRESS_INTERVAL_MS`: Heartbeat interval (default: off)
    pub fn apply_env(mut self) -> Result<Self, ConfigError> {
        if let Ok(val) = std::env::var("REFINERY_PIPELINE_MAX_ITERATIONS") {
            self.max_iterations = parse_env_value(&val, "REFINERY_PIPELINE_MAX_ITERATIONS")?;
        }
        if let Ok(val) = std::env::var("REFINERY_PIPELINE_QUALITY_THRESHOLD") {
            self.quality_threshold = parse_env_value(&val, "REFINERY_PIPELINE_QUALITY_THRESHOLD")?;
        }
        if let Ok(val) = std::env::var("REFINERY_PIPELINE_TIMEOUT_MS") {
            self.timeout = parse_env_millis(&val, "REFINERY_PIPELINE_TIMEOUT_MS")?;
        }
        if let Ok(val) = std::env::var("REFINERY_PIPELINE_MEMORY_LIMIT") {
            self.memory_limit_fraction = parse_env_value(&val, "REFINERY_PIPELINE_MEMORY_LIMIT")?;
        }
        if let Ok(val) = std::env::var("REFINERY_PIPELINE_PROGRESS_INTERVAL_MS") {
            self.progress_interval =
                Some(parse_env_millis(&val, "REFINERY_PIPELINE_PROGRESS_INTERVAL_MS")?);
        }
        Ok(self)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_ITERATIONS..=MAX_ITERATIONS).contains(&self.max_iterations) {
            return Err(ConfigError::ValidationFailed(format!(
                "max_iterations must be between {} and {}",
                MIN_ITERATIONS, MAX_ITERATIONS
            )));
        }
        if !(0.0..=1.0).contains(&self.quality_threshold) {
            return Err(ConfigError::ValidationFailed(
                "quality_threshold must be between 0.0 and 1.0".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "timeout must be greater than 0".to_string(),
            ));
        }
        if self.no_improvement_window == 0 {
            return Err(ConfigError::ValidationFailed(
                "no_improvement_window must be greater than 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.memory_limit_fraction) {
            return Err(ConfigError::ValidationFailed(
                "memory_limit_fraction must be between 0.0 and 1.0".to_string(),
            ));
        }
        if self.progress_interval.is_some_and(|d| d.is_zero()) {
            return Err(ConfigError::ValidationFailed(
                "progress_interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Caller-supplied overrides for one job. `None` falls back to [`PipelineDefaults`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    pub max_iterations: Option<u32>,
    pub quality_threshold: Option<f64>,
    #[serde(with = "option_duration_ms", rename = "timeout_ms")]
    pub timeout: Option<Duration>,
    pub enable_cancellation: Option<bool>,
    pub enable_progress: Option<bool>,
    pub session_id: Option<String>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }

    pub fn with_quality_threshold(mut self, threshold: f64) -> Self {
        self.quality_threshold = Some(threshold);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancellation(mut self, enabled: bool) -> Self {
        self.enable_cancellation = Some(enabled);
        self
    }

    pub fn with_progress(mut self, enabled: bool) -> Self {
        self.enable_progress = Some(enabled);
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Fills in defaults and validates the result.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` for an out-of-range iteration cap or
    /// threshold, or a zero timeout.
    pub fn resolve(&self, defaults: &PipelineDefaults) -> Result<RefinementOptions, ValidationError> {
        let max_iterations = self.max_iterations.unwrap_or(defaults.max_iterations);
        if !(MIN_ITERATIONS..=MAX_ITERATIONS).contains(&max_iterations) {
            return Err(ValidationError::MaxIterationsOutOfRange {
                value: max_iterations,
                min: MIN_ITERATIONS,
                max: MAX_ITERATIONS,
            });
        }

        let quality_threshold = self.quality_threshold.unwrap_or(defaults.quality_threshold);
        if !(0.0..=1.0).contains(&quality_threshold) {
            return Err(ValidationError::QualityThresholdOutOfRange(quality_threshold));
        }

        let timeout = self.timeout.unwrap_or(defaults.timeout);
        if timeout.is_zero() {
            return Err(ValidationError::ZeroTimeout);
        }

        Ok(RefinementOptions {
            max_iterations,
            quality_threshold,
            timeout,
            enable_cancellation: self.enable_cancellation.unwrap_or(true),
            enable_progress: self.enable_progress.unwrap_or(false),
            session_id: self.session_id.clone(),
        })
    }
}

/// Validated options one job runs with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinementOptions {
    pub max_iterations: u32,
    pub quality_threshold: f64,
    #[serde(with = "duration_ms", rename = "timeout_ms")]
    pub timeout: Duration,
    pub enable_cancellation: bool,
    pub enable_progress: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}
