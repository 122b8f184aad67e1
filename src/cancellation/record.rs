//! Cancellation records and their lifecycle.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::cleanup::CleanupReport;
use super::resources::{ResourceKind, ResourceRegistry};
use super::worker::WorkerSignal;

/// Opaque identifier for a registered worker. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CancellationHandle(Uuid);

impl CancellationHandle {
    /// Allocates a fresh handle.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying identifier.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CancellationHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CancellationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a cancellation record.
///
/// Transitions only move forward:
/// `Active -> Cancelling -> Cancelled -> Cleanup -> Completed`, with
/// `Active -> Cleanup` for workers that finish on their own and
/// `Cleanup -> Error` when the cleanup task itself crashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Active,
    Cancelling,
    Cancelled,
    Cleanup,
    Completed,
    Error,
}

impl LifecycleState {
    /// True once cancellation has been requested or applied and cleanup has not finished.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            LifecycleState::Cancelling | LifecycleState::Cancelled | LifecycleState::Cleanup
        )
    }

    /// True while the worker may still be running.
    pub fn is_live(&self) -> bool {
        matches!(self, LifecycleState::Active | LifecycleState::Cancelling)
    }

    /// True once nothing further happens to the record.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Completed | LifecycleState::Error)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LifecycleState::Active => "active",
            LifecycleState::Cancelling => "cancelling",
            LifecycleState::Cancelled => "cancelled",
            LifecycleState::Cleanup => "cleanup",
            LifecycleState::Completed => "completed",
            LifecycleState::Error => "error",
        };
        write!(f, "{}", name)
    }
}

/// How the worker behind a record ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationKind {
    /// Finished without a cancellation request.
    Finished,
    /// Stopped after a cancellation request within the graceful window.
    Graceful,
    /// Aborted by the manager.
    Forced,
    /// Ended abnormally without a request (aborted elsewhere or panicked).
    Crashed,
}

/// Manager-side bookkeeping for one worker.
#[derive(Debug)]
pub(crate) struct CancellationRecord {
    pub handle: CancellationHandle,
    pub job_id: String,
    pub token: CancellationToken,
    pub abort: AbortHandle,
    pub signals: mpsc::Sender<WorkerSignal>,
    pub state: LifecycleState,
    pub termination: Option<TerminationKind>,
    pub cancel_reason: Option<String>,
    pub resources: ResourceRegistry,
    pub registered_at: DateTime<Utc>,
    pub cancellation_requested_at: Option<DateTime<Utc>>,
    pub cleanup_started_at: Option<DateTime<Utc>>,
    pub cleanup_completed_at: Option<DateTime<Utc>>,
    pub cleanup_report: Option<CleanupReport>,
    pub graceful_timer: Option<AbortHandle>,
}

impl CancellationRecord {
    pub fn new(
        job_id: String,
        token: CancellationToken,
        abort: AbortHandle,
        signals: mpsc::Sender<WorkerSignal>,
    ) -> Self {
        Self {
            handle: CancellationHandle::new(),
            job_id,
            token,
            abort,
            signals,
            state: LifecycleState::Active,
            termination: None,
            cancel_reason: None,
            resources: ResourceRegistry::new(),
            registered_at: Utc::now(),
            cancellation_requested_at: None,
            cleanup_started_at: None,
            cleanup_completed_at: None,
            cleanup_report: None,
            graceful_timer: None,
        }
    }

    /// Cancels the graceful-termination timer if one is pending.
    pub fn disarm_timer(&mut self) {
        if let Some(timer) = self.graceful_timer.take() {
            timer.abort();
        }
    }

    /// Folds a cleanup run into the stored report.
    pub fn merge_report(&mut self, report: CleanupReport) {
        match self.cleanup_report.as_mut() {
            Some(existing) => existing.merge(report),
            None => self.cleanup_report = Some(report),
        }
    }

    pub fn snapshot(&self) -> RecordSnapshot {
        RecordSnapshot {
            handle: self.handle,
            job_id: self.job_id.clone(),
            state: self.state,
            termination: self.termination,
            cancel_reason: self.cancel_reason.clone(),
            resource_counts: self.resources.counts(),
            registered_at: self.registered_at,
            cancellation_requested_at: self.cancellation_requested_at,
            cleanup_started_at: self.cleanup_started_at,
            cleanup_completed_at: self.cleanup_completed_at,
            cleanup_report: self.cleanup_report.clone(),
        }
    }
}

/// Point-in-time view of a record, returned by status queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordSnapshot {
    pub handle: CancellationHandle,
    pub job_id: String,
    pub state: LifecycleState,
    pub termination: Option<TerminationKind>,
    pub cancel_reason: Option<String>,
    /// Resources still tracked, per kind.
    pub resource_counts: BTreeMap<ResourceKind, usize>,
    pub registered_at: DateTime<Utc>,
    pub cancellation_requested_at: Option<DateTime<Utc>>,
    pub cleanup_started_at: Option<DateTime<Utc>>,
    pub cleanup_completed_at: Option<DateTime<Utc>>,
    pub cleanup_report: Option<CleanupReport>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_unique() {
        let a = CancellationHandle::new();
        let b = CancellationHandle::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string(), a.as_uuid().to_string());
    }

    #[test]
    fn test_is_cancelled_states() {
        assert!(!LifecycleState::Active.is_cancelled());
        assert!(LifecycleState::Cancelling.is_cancelled());
        assert!(LifecycleState::Cancelled.is_cancelled());
        assert!(LifecycleState::Cleanup.is_cancelled());
        assert!(!LifecycleState::Completed.is_cancelled());
        assert!(!LifecycleState::Error.is_cancelled());
    }

    #[test]
    fn test_live_and_terminal_states() {
        assert!(LifecycleState::Active.is_live());
        assert!(LifecycleState::Cancelling.is_live());
        assert!(!LifecycleState::Cleanup.is_live());
        assert!(LifecycleState::Completed.is_terminal());
        assert!(LifecycleState::Error.is_terminal());
        assert!(!LifecycleState::Cancelled.is_terminal());
    }

    #[tokio::test]
    async fn test_new_record_snapshot() {
        let task = tokio::spawn(std::future::pending::<()>());
        let (signals, _rx) = mpsc::channel(1);
        let record = CancellationRecord::new(
            "job-1".to_string(),
            CancellationToken::new(),
            task.abort_handle(),
            signals,
        );

        let snapshot = record.snapshot();
        assert_eq!(snapshot.job_id, "job-1");
        assert_eq!(snapshot.state, LifecycleState::Active);
        assert!(snapshot.resource_counts.is_empty());
        assert!(snapshot.termination.is_none());
        task.abort();
    }
}
