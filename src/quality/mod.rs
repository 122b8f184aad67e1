//! Quality collaborators consumed by the pipeline coordinator.
//!
//! The coordinator never scores or rewrites a configuration itself. It calls
//! three narrow contracts:
//!
//! - **Evaluator**: scores a configuration and produces actionable feedback
//! - **Refiner**: applies feedback to produce a new configuration
//! - **Validator**: compares an old and a new configuration and recommends
//!   accepting or rejecting the refinement
//!
//! [`ScoreValidator`] is a validator built on any evaluator. The `baseline`
//! collaborators are simple field-coverage heuristics used by the CLI when no
//! model-backed implementation is wired in.

mod baseline;
mod collaborators;
mod score;
mod validator;

pub use baseline::{CoverageEvaluator, TemplateRefiner, RECOMMENDED_KEYS};
pub use collaborators::{Evaluator, Refiner, Validator};
pub use score::{Feedback, QualityScore, Recommendation, Suggestion, ValidationReport};
pub use validator::ScoreValidator;
