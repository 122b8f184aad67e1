//! Cancellation and resource cleanup for refinement workers.
//!
//! Workers register with the [`CancellationManager`] and poll their
//! cancellation token at checkpoints. A cancellation request gives the
//! worker a graceful window; workers that do not stop in time are aborted.
//! However a worker ends, every resource it registered is released once,
//! in a fixed order, under a cleanup timeout.
//!
//! # Example
//!
//! ```ignore
//! use config_refinery::cancellation::{CancellationConfig, CancellationManager};
//!
//! let manager = CancellationManager::spawn(CancellationConfig::default())?;
//! let handle = manager.register("job-1", worker).await?;
//! manager.request_cancel(handle, "user request").await?;
//! ```

pub mod cleanup;
pub mod config;
pub mod manager;
pub mod monitor;
pub mod record;
pub mod resources;
pub mod worker;

pub use cleanup::{CallbackOutcome, CleanupReport, KindReport};
pub use config::CancellationConfig;
pub use manager::{
    ActiveRecord, CancellationError, CancellationManager, CancellationManagerHandle,
};
pub use monitor::{FixedMemoryProbe, MemoryProbe, MemoryUsage, SystemMemoryProbe};
pub use record::{CancellationHandle, LifecycleState, RecordSnapshot, TerminationKind};
pub use resources::{CleanupCallback, ResourceDescriptor, ResourceKind, ResourceRegistry};
pub use worker::{signal_channel, ExitGuard, WorkerExit, WorkerHandle, WorkerSignal};
