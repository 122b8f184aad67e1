//! Validator that compares evaluator scores before and after a refinement.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::domain::DomainConfig;
use crate::error::CollaboratorError;

use super::collaborators::{Evaluator, Validator};
use super::score::{Recommendation, ValidationReport};

/// Default tolerance below which an overall drop is ignored.
const DEFAULT_TOLERANCE: f64 = 1e-6;

/// Accepts a refinement when overall quality did not drop and no dimension degraded.
pub struct ScoreValidator {
    evaluator: Arc<dyn Evaluator>,
    tolerance: f64,
}

impl ScoreValidator {
    /// Creates a validator scoring both configurations with `evaluator`.
    pub fn new(evaluator: Arc<dyn Evaluator>) -> Self {
        Self {
            evaluator,
            tolerance: DEFAULT_TOLERANCE,
        }
    }

    /// Sets the tolerance for overall quality drops.
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance.abs();
        self
    }
}

#[async_trait]
impl Validator for ScoreValidator {
    async fn validate_improvements(
        &self,
        old_config: &DomainConfig,
        new_config: &DomainConfig,
    ) -> Result<ValidationReport, CollaboratorError> {
        let before = self
            .evaluator
            .evaluate(old_config)
            .await
            .map_err(|e| CollaboratorError::Validation(e.to_string()))?;
        let after = self
            .evaluator
            .evaluate(new_config)
            .await
            .map_err(|e| CollaboratorError::Validation(e.to_string()))?;

        let quality_change = after.overall - before.overall;
        let improved = after.improved_over(&before);
        let degraded = after.degraded_from(&before);

        let recommendation = if quality_change >= -self.tolerance && degraded.is_empty() {
            Recommendation::Accept
        } else {
            Recommendation::Reject
        };

        debug!(
            quality_change,
            improved = improved.len(),
            degraded = degraded.len(),
            %recommendation,
            "Validated refinement"
        );

        Ok(ValidationReport {
            recommendation,
            quality_change,
            improved_dimensions: improved,
            degraded_dimensions: degraded,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::{Feedback, QualityScore};
    use serde_json::json;

    /// Scores a configuration by the numeric `score` field it carries.
    struct FieldScoreEvaluator;

    #[async_trait]
    impl Evaluator for FieldScoreEvaluator {
        async fn evaluate(&self, config: &DomainConfig) -> Result<QualityScore, CollaboratorError> {
            let score = config
                .get("score")
                .and_then(|v| v.as_f64())
                .ok_or_else(|| CollaboratorError::Evaluation("no score".to_string()))?;
            let clarity = config.get("clarity").and_then(|v| v.as_f64()).unwrap_or(0.5);
            Ok(QualityScore::new(score).with_dimension("clarity", clarity))
        }

        async fn generate_feedback(
            &self,
            _config: &DomainConfig,
        ) -> Result<Feedback, CollaboratorError> {
            Ok(Feedback::empty())
        }
    }

    fn config(score: f64, clarity: f64) -> DomainConfig {
        DomainConfig::new()
            .with("score", json!(score))
            .with("clarity", json!(clarity))
    }

    #[tokio::test]
    async fn test_accepts_improvement() {
        let validator = ScoreValidator::new(Arc::new(FieldScoreEvaluator));
        let report = validator
            .validate_improvements(&config(0.5, 0.5), &config(0.7, 0.9))
            .await
            .expect("validation succeeds");

        assert!(report.is_accepted());
        assert!((report.quality_change - 0.2).abs() < 1e-9);
        assert_eq!(report.improved_dimensions, vec!["clarity".to_string()]);
        assert!(report.degraded_dimensions.is_empty());
    }

    #[tokio::test]
    async fn test_accepts_unchanged_quality() {
        let validator = ScoreValidator::new(Arc::new(FieldScoreEvaluator));
        let report = validator
            .validate_improvements(&config(0.5, 0.5), &config(0.5, 0.5))
            .await
            .expect("validation succeeds");

        assert!(report.is_accepted());
        assert!(report.improved_dimensions.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_degraded_dimension() {
        let validator = ScoreValidator::new(Arc::new(FieldScoreEvaluator));
        let report = validator
            .validate_improvements(&config(0.6, 0.9), &config(0.7, 0.3))
            .await
            .expect("validation succeeds");

        assert_eq!(report.recommendation, Recommendation::Reject);
        assert_eq!(report.degraded_dimensions, vec!["clarity".to_string()]);
    }

    #[tokio::test]
    async fn test_evaluator_failure_maps_to_validation_error() {
        let validator = ScoreValidator::new(Arc::new(FieldScoreEvaluator));
        let err = validator
            .validate_improvements(&DomainConfig::new(), &config(0.5, 0.5))
            .await
            .expect_err("missing score fails");

        assert!(matches!(err, CollaboratorError::Validation(_)));
    }
}
