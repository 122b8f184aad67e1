//! End-to-end refinement runs and their termination reasons.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use config_refinery::cancellation::FixedMemoryProbe;
use config_refinery::pipeline::{
    Collaborators, PipelineCoordinator, PipelineDefaults, PipelineError, RunOptions,
    TerminationReason,
};
use config_refinery::DomainConfig;

use common::{gated_coordinator, payload, FlagEvaluator};

fn baseline() -> PipelineCoordinator {
    PipelineCoordinator::new(Collaborators::baseline(), PipelineDefaults::default())
        .with_memory_probe(Arc::new(FixedMemoryProbe::new(0.1)))
}

fn sparse() -> DomainConfig {
    DomainConfig::new()
        .with("domain", json!("billing"))
        .with("patterns", json!([{"name": "invoice"}]))
}

#[tokio::test]
async fn test_baseline_run_improves_sparse_config() {
    let coordinator = baseline();
    let options = RunOptions::new()
        .with_max_iterations(5)
        .with_quality_threshold(0.95);

    let result = coordinator.run(sparse(), &options).await.expect("run");

    assert!(result.final_quality.overall > result.original_quality.overall);
    assert!(result.quality_delta > 0.0);
    assert!(result.iteration_count >= 1 && result.iteration_count <= 5);
    assert_eq!(result.history.len(), result.iteration_count as usize);
    assert!(!result.termination_reason.is_error());
    assert_eq!(result.original_config, sparse());
    assert_eq!(result.final_config.domain_name(), Some("billing"));
}

#[tokio::test]
async fn test_zero_threshold_returns_original_untouched() {
    let coordinator = baseline();
    let options = RunOptions::new().with_quality_threshold(0.0);

    let result = coordinator.run(sparse(), &options).await.expect("run");

    assert_eq!(result.termination_reason, TerminationReason::QualityThresholdMet);
    assert_eq!(result.iteration_count, 0);
    assert_eq!(result.final_config, result.original_config);
    assert!(result.history.is_empty());
}

#[tokio::test]
async fn test_flat_quality_keeps_original_config() {
    let (coordinator, gate) = gated_coordinator(FlagEvaluator::flat(0.5));
    gate.add_permits(5);
    let options = RunOptions::new().with_quality_threshold(0.9);

    let result = coordinator.run(payload("flat"), &options).await.expect("run");

    assert_eq!(result.termination_reason, TerminationReason::NoImprovement);
    assert_eq!(result.iteration_count, 0);
    assert!(result.final_config.get("refined").is_none());
    assert!(result.quality_delta.abs() < 1e-9);
}

#[tokio::test]
async fn test_single_iteration_cap() {
    let (coordinator, gate) = gated_coordinator(FlagEvaluator {
        before: 0.1,
        after: 0.4,
    });
    gate.add_permits(5);
    let options = RunOptions::new().with_max_iterations(1).with_quality_threshold(0.9);

    let result = coordinator.run(payload("capped"), &options).await.expect("run");

    assert_eq!(result.termination_reason, TerminationReason::MaxIterationsReached);
    assert_eq!(result.iteration_count, 1);
    assert!((result.final_quality.overall - 0.4).abs() < 1e-9);
}

#[tokio::test]
async fn test_invalid_options_rejected_before_work() {
    let coordinator = baseline();

    let err = coordinator
        .run(sparse(), &RunOptions::new().with_quality_threshold(1.5))
        .await
        .expect_err("threshold out of range");
    assert!(matches!(err, PipelineError::Validation(_)));

    let err = coordinator
        .run(sparse(), &RunOptions::new().with_timeout(Duration::ZERO))
        .await
        .expect_err("zero timeout");
    assert!(matches!(err, PipelineError::Validation(_)));

    let err = coordinator
        .run(DomainConfig::new().with("domain", json!("x")), &RunOptions::new())
        .await
        .expect_err("missing patterns");
    assert!(matches!(err, PipelineError::Validation(_)));
}
