//! Iterative refinement pipeline.
//!
//! A run scores a configuration, asks for feedback, applies it and validates
//! the result, repeating until one termination criterion holds:
//!
//! 1. cancellation was requested
//! 2. the quality threshold is met
//! 3. the iteration limit is reached
//! 4. recent iterations stopped improving
//! 5. the time budget is exhausted
//! 6. system memory is above the configured limit
//!
//! The loop never writes to shared state; everything lives in a
//! [`PipelineState`] owned by the worker task.
//!
//! # Example
//!
//! ```ignore
//! use config_refinery::pipeline::{Collaborators, PipelineCoordinator, PipelineDefaults, RunOptions};
//!
//! let coordinator = PipelineCoordinator::new(Collaborators::baseline(), PipelineDefaults::default());
//! let result = coordinator.run(config, &RunOptions::new().with_max_iterations(2)).await?;
//! println!("{} after {} iterations", result.termination_reason, result.iteration_count);
//! ```

mod config;
mod coordinator;
mod progress;
mod result;
mod state;

pub use config::{PipelineDefaults, RefinementOptions, RunOptions, MAX_ITERATIONS, MIN_ITERATIONS};
pub use coordinator::{
    Collaborators, PipelineCoordinator, PipelineError, SpawnError, WorkerLaunch, WorkerTask,
};
pub use progress::{ChannelProgressSink, ProgressSink, ProgressUpdate};
pub use result::{RefinementResult, TerminationReason};
pub use state::{IterationMetrics, PipelineStage, PipelineState};
