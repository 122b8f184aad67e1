//! Job definitions for the queue manager.
//!
//! - `Priority`: admission priority of a job
//! - `JobStatus`: monotonic job lifecycle
//! - `JobRequest`: a submitted job and its status fields
//! - `JobNotification`: terminal message delivered to a submitter
//! - `SubmitOptions`: per-submission settings

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::domain::DomainConfig;
use crate::error::ValidationError;
use crate::pipeline::{ProgressUpdate, RefinementResult, RunOptions};

/// Admission priority of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }

    /// True for the levels inserted at the front of a front-insertion queue.
    pub fn is_expedited(&self) -> bool {
        matches!(self, Priority::High | Priority::Urgent)
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Priority {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            _ => Err(ValidationError::UnknownPriority(s.to_string())),
        }
    }
}

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether moving to `next` keeps the lifecycle monotonic.
    ///
    /// A queued job may fail without processing when its worker cannot be spawned.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match self {
            JobStatus::Queued => matches!(
                next,
                JobStatus::Processing | JobStatus::Failed | JobStatus::Cancelled
            ),
            JobStatus::Processing => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A submitted job.
///
/// Only the queue manager mutates the status fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub id: String,
    pub payload: DomainConfig,
    pub priority: Priority,
    #[serde(default)]
    pub session_id: Option<String>,
    pub status: JobStatus,
    pub queued_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Latest progress reported by the worker.
    #[serde(default)]
    pub progress: Option<ProgressUpdate>,
    #[serde(default)]
    pub result: Option<RefinementResult>,
    /// Failure message, or the reason for cancellation.
    #[serde(default)]
    pub error: Option<String>,
}

impl JobRequest {
    /// Creates a queued job with a fresh id.
    pub fn new(payload: DomainConfig, priority: Priority) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            payload,
            priority,
            session_id: None,
            status: JobStatus::Queued,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            progress: None,
            result: None,
            error: None,
        }
    }

    pub fn with_session_id(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    fn transition(&mut self, next: JobStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        true
    }

    /// Marks the job as admitted. Returns false if it was not queued.
    pub fn mark_processing(&mut self) -> bool {
        let moved = self.transition(JobStatus::Processing);
        if moved {
            self.started_at = Some(Utc::now());
        }
        moved
    }

    /// Records a successful result.
    pub fn complete(&mut self, result: RefinementResult) -> bool {
        let moved = self.transition(JobStatus::Completed);
        if moved {
            self.result = Some(result);
        }
        moved
    }

    /// Records a failure.
    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        let moved = self.transition(JobStatus::Failed);
        if moved {
            self.error = Some(error.into());
        }
        moved
    }

    /// Records a cancellation.
    pub fn cancel(&mut self, reason: impl Into<String>) -> bool {
        let moved = self.transition(JobStatus::Cancelled);
        if moved {
            self.error = Some(reason.into());
        }
        moved
    }

    /// Notification describing the terminal state, if the job has one.
    pub fn notification(&self) -> Option<JobNotification> {
        let job_id = self.id.clone();
        let message = || self.error.clone().unwrap_or_default();
        match self.status {
            JobStatus::Completed => self.result.clone().map(|result| JobNotification::Completed {
                job_id,
                result: Box::new(result),
            }),
            JobStatus::Failed => Some(JobNotification::Failed {
                job_id,
                error: message(),
            }),
            JobStatus::Cancelled => Some(JobNotification::Cancelled {
                job_id,
                reason: message(),
            }),
            JobStatus::Queued | JobStatus::Processing => None,
        }
    }
}

/// Terminal message delivered to a job's callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobNotification {
    Completed {
        job_id: String,
        result: Box<RefinementResult>,
    },
    Failed {
        job_id: String,
        error: String,
    },
    Cancelled {
        job_id: String,
        reason: String,
    },
}

impl JobNotification {
    pub fn job_id(&self) -> &str {
        match self {
            JobNotification::Completed { job_id, .. }
            | JobNotification::Failed { job_id, .. }
            | JobNotification::Cancelled { job_id, .. } => job_id,
        }
    }

    pub fn status(&self) -> JobStatus {
        match self {
            JobNotification::Completed { .. } => JobStatus::Completed,
            JobNotification::Failed { .. } => JobStatus::Failed,
            JobNotification::Cancelled { .. } => JobStatus::Cancelled,
        }
    }

    /// The result carried by a `completed` notification.
    pub fn result(&self) -> Option<&RefinementResult> {
        match self {
            JobNotification::Completed { result, .. } => Some(result),
            _ => None,
        }
    }
}

/// Destination for completion notifications.
pub type JobCallback = mpsc::UnboundedSender<JobNotification>;

/// Per-submission settings.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub priority: Priority,
    pub run: RunOptions,
    pub callback: Option<JobCallback>,
}

impl SubmitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the pipeline overrides for the job.
    pub fn with_run_options(mut self, run: RunOptions) -> Self {
        self.run = run;
        self
    }

    /// Delivers the terminal notification to `callback`.
    pub fn with_callback(mut self, callback: JobCallback) -> Self {
        self.callback = Some(callback);
        self
    }
}
