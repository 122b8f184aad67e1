//! config-refinery: iterative refinement of domain configurations.
//!
//! A configuration is scored, improved from feedback and validated in a
//! bounded loop. Jobs are admitted through a priority queue and every worker
//! can be cancelled cooperatively, with forced termination and resource
//! cleanup as the fallback.

pub mod cancellation;
pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod quality;
pub mod scheduler;

pub use config::{ConfigError, ServiceConfig};
pub use domain::DomainConfig;
pub use error::{CollaboratorError, ValidationError};
pub use pipeline::{PipelineCoordinator, PipelineError, RefinementResult, TerminationReason};
pub use scheduler::{QueueError, QueueHandle, QueueManager};
