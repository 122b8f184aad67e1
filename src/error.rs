//! Error types shared across the refinery subsystems.
//!
//! Subsystem-specific errors live next to the code that raises them
//! (`QueueError`, `CancellationError`, `PipelineError`, `ConfigError`).
//! This module holds the two kinds that cross subsystem boundaries:
//! - Submission-time validation of payloads and options
//! - Failures reported by the external collaborators (evaluator, refiner, validator)

use thiserror::Error;

/// Errors raised while validating a submission before any resources are allocated.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("Payload must be a JSON object")]
    PayloadNotObject,

    #[error("Payload is missing required keys: {}", .0.join(", "))]
    MissingKeys(Vec<String>),

    #[error("max_iterations must be between {min} and {max}, got {value}")]
    MaxIterationsOutOfRange { value: u32, min: u32, max: u32 },

    #[error("quality_threshold must be between 0.0 and 1.0, got {0}")]
    QualityThresholdOutOfRange(f64),

    #[error("timeout must be greater than 0")]
    ZeroTimeout,

    #[error("Unknown priority '{0}' (expected low, normal, high or urgent)")]
    UnknownPriority(String),
}

/// Errors reported by an external collaborator while serving a pipeline stage.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CollaboratorError {
    #[error("Evaluation failed: {0}")]
    Evaluation(String),

    #[error("Feedback generation failed: {0}")]
    Feedback(String),

    #[error("Refinement failed: {0}")]
    Refinement(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Collaborator unavailable: {0}")]
    Unavailable(String),
}
