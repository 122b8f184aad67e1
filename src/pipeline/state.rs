//! Per-job pipeline state.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::duration_ms;
use crate::domain::DomainConfig;
use crate::quality::{Feedback, QualityScore};

use super::config::RefinementOptions;

/// Stage of the refinement state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Init,
    Evaluating,
    FeedbackGeneration,
    Refining,
    Validating,
    IterationCheck,
    Terminated,
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PipelineStage::Init => "init",
            PipelineStage::Evaluating => "evaluating",
            PipelineStage::FeedbackGeneration => "feedback_generation",
            PipelineStage::Refining => "refining",
            PipelineStage::Validating => "validating",
            PipelineStage::IterationCheck => "iteration_check",
            PipelineStage::Terminated => "terminated",
        };
        write!(f, "{}", name)
    }
}

/// Metrics for one completed iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationMetrics {
    /// 1-based iteration number.
    pub iteration: u32,
    pub quality_before: f64,
    pub quality_after: f64,
    pub quality_change: f64,
    pub improved_dimensions: Vec<String>,
    pub degraded_dimensions: Vec<String>,
    #[serde(with = "duration_ms", rename = "duration_ms")]
    pub duration: Duration,
}

/// State owned by one coordinator run.
#[derive(Debug)]
pub struct PipelineState {
    pub original_config: DomainConfig,
    pub current_config: DomainConfig,
    pub original_quality: QualityScore,
    pub current_quality: QualityScore,
    pub iteration_count: u32,
    pub history: Vec<IterationMetrics>,
    pub options: RefinementOptions,
    pub stage: PipelineStage,
    started_at: Instant,
    /// Feedback from the latest iteration. Dropped under memory pressure.
    pub(crate) scratch_feedback: Option<Feedback>,
}

impl PipelineState {
    /// Creates state for a configuration whose initial quality is known.
    pub fn new(config: DomainConfig, quality: QualityScore, options: RefinementOptions) -> Self {
        Self::started_at(config, quality, options, Instant::now())
    }

    pub(crate) fn started_at(
        config: DomainConfig,
        quality: QualityScore,
        options: RefinementOptions,
        started_at: Instant,
    ) -> Self {
        Self {
            original_config: config.clone(),
            current_config: config,
            original_quality: quality.clone(),
            current_quality: quality,
            iteration_count: 0,
            history: Vec::new(),
            options,
            stage: PipelineStage::Init,
            started_at,
            scratch_feedback: None,
        }
    }

    /// Wall time since the run started.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Accepts a refinement and records its metrics.
    pub fn apply_iteration(
        &mut self,
        config: DomainConfig,
        quality: QualityScore,
        metrics: IterationMetrics,
    ) {
        self.current_config = config;
        self.current_quality = quality;
        self.history.push(metrics);
        self.iteration_count += 1;
    }

    /// True when each of the last `window` iterations gained less than `min_improvement`.
    pub fn is_stagnant(&self, window: usize, min_improvement: f64) -> bool {
        window > 0
            && self.history.len() >= window
            && self.history[self.history.len() - window..]
                .iter()
                .all(|m| m.quality_change < min_improvement)
    }

    /// Dimensions ranked by how many iterations improved them, most frequent first.
    ///
    /// Ties are broken by name so the ranking is deterministic.
    pub fn top_improved_dimensions(&self) -> Vec<String> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for metrics in &self.history {
            for dimension in &metrics.improved_dimensions {
                *counts.entry(dimension.as_str()).or_insert(0) += 1;
            }
        }

        let mut ranked: Vec<_> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        ranked.into_iter().map(|(name, _)| name.to_string()).collect()
    }

    /// Releases cached per-iteration data. Returns true if anything was dropped.
    pub fn drop_scratch(&mut self) -> bool {
        self.scratch_feedback.take().is_some()
    }
}
