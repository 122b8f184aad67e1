//! Job admission and priority scheduling.
//!
//! - **QueueManager**: actor owning the pending queue, the running set and
//!   the finished-job cache
//! - **JobQueue**: pending jobs ordered by priority
//! - **JobRequest**: a submitted job with its monotonic status
//!
//! # Architecture
//!
//! ```text
//!    submit / cancel / status
//!              │
//!       ┌──────▼───────┐        spawn_worker        ┌──────────┐
//!       │ QueueManager │ ─────────────────────────▶ │  Worker  │
//!       │    (actor)   │ ◀───────── exit ────────── │  (task)  │
//!       └──────┬───────┘                            └────┬─────┘
//!              │ cancel running job                      │ register
//!       ┌──────▼──────────────┐                          │
//!       │ CancellationManager │ ◀────────────────────────┘
//!       └─────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use config_refinery::scheduler::{Priority, QueueConfig, QueueManager, SubmitOptions};
//!
//! let queue = QueueManager::spawn(QueueConfig::new(2), coordinator)?;
//! let job_id = queue
//!     .submit(config, SubmitOptions::new().with_priority(Priority::Urgent))
//!     .await?;
//! let status = queue.status(&job_id).await?;
//! queue.shutdown().await?;
//! ```

pub mod config;
pub mod job;
pub mod manager;
pub mod queue;

pub use config::{QueueConfig, QueueOrdering};
pub use job::{JobCallback, JobNotification, JobRequest, JobStatus, Priority, SubmitOptions};
pub use manager::{QueueError, QueueHandle, QueueManager, QueueStats};
pub use queue::{JobQueue, QueuedJob, ResultsCache};
