//! Shared collaborators and helpers for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Semaphore;

use config_refinery::cancellation::{CancellationConfig, CancellationManager, CancellationManagerHandle, FixedMemoryProbe};
use config_refinery::error::CollaboratorError;
use config_refinery::pipeline::{Collaborators, PipelineCoordinator, PipelineDefaults};
use config_refinery::quality::{
    Evaluator, Feedback, QualityScore, Refiner, Suggestion, ValidationReport, Validator,
};
use config_refinery::scheduler::{JobRequest, JobStatus, QueueHandle};
use config_refinery::DomainConfig;

/// Scores a fixed value until the config carries a `refined` flag.
pub struct FlagEvaluator {
    pub before: f64,
    pub after: f64,
}

impl FlagEvaluator {
    pub fn new() -> Self {
        Self {
            before: 0.1,
            after: 1.0,
        }
    }

    /// Returns the same score before and after refinement.
    pub fn flat(score: f64) -> Self {
        Self {
            before: score,
            after: score,
        }
    }
}

#[async_trait]
impl Evaluator for FlagEvaluator {
    async fn evaluate(&self, config: &DomainConfig) -> Result<QualityScore, CollaboratorError> {
        let score = if config.get("refined").is_some() {
            self.after
        } else {
            self.before
        };
        Ok(QualityScore::new(score))
    }

    async fn generate_feedback(&self, _config: &DomainConfig) -> Result<Feedback, CollaboratorError> {
        Ok(Feedback::new(vec![Suggestion::actionable(
            "completeness",
            "describe the retry pattern",
        )]))
    }
}

/// Never returns a score and ignores cancellation.
pub struct HangingEvaluator;

#[async_trait]
impl Evaluator for HangingEvaluator {
    async fn evaluate(&self, _config: &DomainConfig) -> Result<QualityScore, CollaboratorError> {
        std::future::pending().await
    }

    async fn generate_feedback(&self, _config: &DomainConfig) -> Result<Feedback, CollaboratorError> {
        std::future::pending().await
    }
}

/// Refines only after acquiring a permit, so tests decide when work finishes.
pub struct GatedRefiner {
    pub gate: Arc<Semaphore>,
}

#[async_trait]
impl Refiner for GatedRefiner {
    async fn apply_improvements(
        &self,
        config: &DomainConfig,
        _feedback: &Feedback,
    ) -> Result<DomainConfig, CollaboratorError> {
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| CollaboratorError::Unavailable(e.to_string()))?;
        permit.forget();
        Ok(config.clone().with("refined", json!(true)))
    }
}

/// Accepts every refinement.
pub struct AcceptingValidator {
    pub quality_change: f64,
}

#[async_trait]
impl Validator for AcceptingValidator {
    async fn validate_improvements(
        &self,
        _old: &DomainConfig,
        _new: &DomainConfig,
    ) -> Result<ValidationReport, CollaboratorError> {
        Ok(ValidationReport::accept(self.quality_change))
    }
}

/// A coordinator whose refiner waits on the returned semaphore.
pub fn gated_coordinator(evaluator: FlagEvaluator) -> (PipelineCoordinator, Arc<Semaphore>) {
    let gate = Arc::new(Semaphore::new(0));
    let coordinator = PipelineCoordinator::new(
        Collaborators::new(
            Arc::new(evaluator),
            Arc::new(GatedRefiner {
                gate: Arc::clone(&gate),
            }),
            Arc::new(AcceptingValidator {
                quality_change: 0.9,
            }),
        ),
        PipelineDefaults::default(),
    )
    .with_memory_probe(Arc::new(FixedMemoryProbe::new(0.1)));
    (coordinator, gate)
}

/// A coordinator that hangs in its first evaluation.
pub fn hanging_coordinator() -> PipelineCoordinator {
    PipelineCoordinator::new(
        Collaborators::new(
            Arc::new(HangingEvaluator),
            Arc::new(GatedRefiner {
                gate: Arc::new(Semaphore::new(0)),
            }),
            Arc::new(AcceptingValidator {
                quality_change: 0.9,
            }),
        ),
        PipelineDefaults::default(),
    )
    .with_memory_probe(Arc::new(FixedMemoryProbe::new(0.1)))
}

/// A cancellation manager with short timeouts.
pub fn cancellation_manager(graceful_timeout: Duration) -> CancellationManagerHandle {
    let config = CancellationConfig::new()
        .with_graceful_timeout(graceful_timeout)
        .with_cleanup_timeout(Duration::from_millis(500))
        .with_disposal_delay(Duration::from_millis(50))
        .with_monitor_interval(Duration::from_secs(60));
    CancellationManager::spawn_with_probe(config, Arc::new(FixedMemoryProbe::new(0.1)))
        .expect("spawn cancellation manager")
}

pub fn payload(name: &str) -> DomainConfig {
    DomainConfig::new()
        .with("domain", json!(name))
        .with("patterns", json!([{"name": "retry"}]))
}

/// Polls `status` until the job reaches `status`.
pub async fn wait_for_status(handle: &QueueHandle, job_id: &str, status: JobStatus) -> JobRequest {
    for _ in 0..400 {
        let request = handle.status(job_id).await.expect("status");
        if request.status == status {
            return request;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("job {job_id} never reached {status}");
}
