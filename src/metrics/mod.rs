//! Metrics module for Prometheus-based monitoring.
//!
//! Covers queue admission, pipeline terminations and cancellation cleanup.
//!
//! # Example
//!
//! ```ignore
//! use config_refinery::metrics::{export_metrics, init_metrics, record_job_submitted};
//!
//! // Initialize metrics on startup
//! init_metrics().expect("Failed to initialize metrics");
//!
//! record_job_submitted("normal");
//!
//! // Export metrics in text exposition format
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{
    observe_iterations, record_cleanup_outcome, record_forced_termination, record_job_finished,
    record_job_submitted, record_memory_pressure, record_termination, set_jobs_in_progress,
    set_queue_depth,
};
pub use self::prometheus::{export_metrics, init_metrics, REGISTRY};
