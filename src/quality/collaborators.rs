//! Collaborator contracts.

use async_trait::async_trait;

use crate::domain::DomainConfig;
use crate::error::CollaboratorError;

use super::score::{Feedback, QualityScore, ValidationReport};

/// Scores configurations and generates feedback for them.
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Computes the multi-dimensional quality of a configuration.
    async fn evaluate(&self, config: &DomainConfig) -> Result<QualityScore, CollaboratorError>;

    /// Produces feedback describing how the configuration could improve.
    async fn generate_feedback(&self, config: &DomainConfig)
        -> Result<Feedback, CollaboratorError>;
}

/// Rewrites a configuration guided by feedback.
#[async_trait]
pub trait Refiner: Send + Sync {
    /// Returns a new configuration with the feedback applied.
    async fn apply_improvements(
        &self,
        config: &DomainConfig,
        feedback: &Feedback,
    ) -> Result<DomainConfig, CollaboratorError>;
}

/// Decides whether a refinement should be kept.
#[async_trait]
pub trait Validator: Send + Sync {
    /// Compares the configuration before and after a refinement.
    async fn validate_improvements(
        &self,
        old_config: &DomainConfig,
        new_config: &DomainConfig,
    ) -> Result<ValidationReport, CollaboratorError>;
}
