//! Termination reasons and the result of a refinement run.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::duration_ms;
use crate::domain::DomainConfig;
use crate::quality::QualityScore;

use super::state::{IterationMetrics, PipelineStage, PipelineState};

/// Why a refinement run stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum TerminationReason {
    QualityThresholdMet,
    MaxIterationsReached,
    NoImprovement,
    TimeoutExceeded,
    ResourceLimit,
    Error { stage: PipelineStage, message: String },
    Cancelled,
}

impl TerminationReason {
    /// Stable label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::QualityThresholdMet => "quality_threshold_met",
            TerminationReason::MaxIterationsReached => "max_iterations_reached",
            TerminationReason::NoImprovement => "no_improvement",
            TerminationReason::TimeoutExceeded => "timeout_exceeded",
            TerminationReason::ResourceLimit => "resource_limit",
            TerminationReason::Error { .. } => "error",
            TerminationReason::Cancelled => "cancelled",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, TerminationReason::Error { .. })
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationReason::Error { stage, message } => {
                write!(f, "error during {}: {}", stage, message)
            }
            other => write!(f, "{}", other.as_str()),
        }
    }
}

/// Outcome of a refinement run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinementResult {
    pub original_config: DomainConfig,
    pub final_config: DomainConfig,
    pub original_quality: QualityScore,
    pub final_quality: QualityScore,
    /// Final minus original overall score.
    pub quality_delta: f64,
    pub iteration_count: u32,
    #[serde(with = "duration_ms", rename = "elapsed_ms")]
    pub elapsed: Duration,
    /// Dimensions most often improved across iterations, most frequent first.
    pub top_improved_dimensions: Vec<String>,
    pub termination_reason: TerminationReason,
    pub history: Vec<IterationMetrics>,
}

impl RefinementResult {
    /// Builds the result from the final pipeline state.
    pub fn from_state(state: PipelineState, reason: TerminationReason) -> Self {
        let top_improved_dimensions = state.top_improved_dimensions();
        let elapsed = state.elapsed();
        Self {
            quality_delta: state.current_quality.overall - state.original_quality.overall,
            original_config: state.original_config,
            final_config: state.current_config,
            original_quality: state.original_quality,
            final_quality: state.current_quality,
            iteration_count: state.iteration_count,
            elapsed,
            top_improved_dimensions,
            termination_reason: reason,
            history: state.history,
        }
    }

    /// Like [`from_state`](Self::from_state) but reports the original configuration as final.
    pub fn reverted(state: PipelineState, reason: TerminationReason) -> Self {
        let mut result = Self::from_state(state, reason);
        result.final_config = result.original_config.clone();
        result.final_quality = result.original_quality.clone();
        result.quality_delta = 0.0;
        result
    }

    /// True if the configuration changed.
    pub fn changed(&self) -> bool {
        self.final_config != self.original_config
    }
}
