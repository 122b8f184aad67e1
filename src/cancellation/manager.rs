//! Cancellation manager actor.
//!
//! The manager owns every cancellation record and is driven entirely by
//! messages, so lifecycle transitions for one record are serialized without
//! locks. Timers, exit watchers and cleanup runs are side tasks that report
//! back through the same command channel.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::ConfigError;
use crate::metrics;

use super::cleanup::{self, CleanupReport};
use super::config::CancellationConfig;
use super::monitor::{MemoryProbe, SystemMemoryProbe};
use super::record::{
    CancellationHandle, CancellationRecord, LifecycleState, RecordSnapshot, TerminationKind,
};
use super::resources::{ResourceDescriptor, ResourceRegistry};
use super::worker::{WorkerExit, WorkerHandle, WorkerSignal};

/// Errors returned by the cancellation manager.
#[derive(Debug, Error)]
pub enum CancellationError {
    #[error("Unknown cancellation handle: {0}")]
    NotFound(CancellationHandle),

    #[error("Cancellation manager is not running")]
    ManagerUnavailable,

    #[error("No Tokio runtime available to start the cancellation manager")]
    NoRuntime,

    #[error("Invalid cancellation configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("Cleanup task failed: {0}")]
    CleanupFailed(String),
}

/// Summary row returned by [`CancellationManagerHandle::list_active`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveRecord {
    pub handle: CancellationHandle,
    pub job_id: String,
    pub state: LifecycleState,
}

enum CleanupOutcome {
    Finished(CleanupReport),
    Crashed(String),
}

enum Command {
    Register {
        job_id: String,
        worker: WorkerHandle,
        reply: oneshot::Sender<CancellationHandle>,
    },
    RequestCancel {
        handle: CancellationHandle,
        reason: String,
        reply: oneshot::Sender<Result<bool, CancellationError>>,
    },
    ForceTerminate {
        handle: CancellationHandle,
        reason: String,
        reply: oneshot::Sender<Result<bool, CancellationError>>,
    },
    IsCancelled {
        handle: CancellationHandle,
        reply: oneshot::Sender<Result<bool, CancellationError>>,
    },
    RegisterResource {
        handle: CancellationHandle,
        descriptor: ResourceDescriptor,
        reply: oneshot::Sender<Result<(), CancellationError>>,
    },
    CleanupResources {
        handle: CancellationHandle,
        reply: oneshot::Sender<Result<CleanupReport, CancellationError>>,
    },
    GetStatus {
        handle: CancellationHandle,
        reply: oneshot::Sender<Result<RecordSnapshot, CancellationError>>,
    },
    FindByJob {
        job_id: String,
        reply: oneshot::Sender<Option<CancellationHandle>>,
    },
    ListActive {
        reply: oneshot::Sender<Vec<ActiveRecord>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    WorkerExited {
        handle: CancellationHandle,
        exit: WorkerExit,
    },
    GracefulTimeout {
        handle: CancellationHandle,
    },
    CleanupFinished {
        handle: CancellationHandle,
        outcome: CleanupOutcome,
        final_run: bool,
    },
    Dispose {
        handle: CancellationHandle,
    },
}

/// Tracks workers, drives graceful and forced termination, and releases
/// per-job resources.
pub struct CancellationManager {
    config: CancellationConfig,
    probe: Arc<dyn MemoryProbe>,
    records: HashMap<CancellationHandle, CancellationRecord>,
    by_job: HashMap<String, CancellationHandle>,
    rx: mpsc::Receiver<Command>,
    tx: mpsc::WeakSender<Command>,
}

impl CancellationManager {
    /// Starts a manager sampling system memory.
    ///
    /// # Errors
    ///
    /// Returns `CancellationError::InvalidConfig` for an invalid configuration
    /// and `CancellationError::NoRuntime` outside a Tokio runtime.
    pub fn spawn(config: CancellationConfig) -> Result<CancellationManagerHandle, CancellationError> {
        Self::spawn_with_probe(config, Arc::new(SystemMemoryProbe::new()))
    }

    /// Starts a manager with a custom memory probe.
    pub fn spawn_with_probe(
        config: CancellationConfig,
        probe: Arc<dyn MemoryProbe>,
    ) -> Result<CancellationManagerHandle, CancellationError> {
        config.validate()?;
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| CancellationError::NoRuntime)?;

        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let manager = Self {
            config,
            probe,
            records: HashMap::new(),
            by_job: HashMap::new(),
            rx,
            tx: tx.downgrade(),
        };
        runtime.spawn(manager.run());

        Ok(CancellationManagerHandle { tx })
    }

    async fn run(mut self) {
        let mut monitor = tokio::time::interval(self.config.monitor_interval);
        monitor.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            graceful_timeout_ms = self.config.graceful_timeout.as_millis() as u64,
            cleanup_timeout_ms = self.config.cleanup_timeout.as_millis() as u64,
            "Cancellation manager started"
        );

        loop {
            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = monitor.tick() => self.check_memory(),
            }
        }

        info!(records = self.records.len(), "Cancellation manager stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Register {
                job_id,
                worker,
                reply,
            } => {
                let handle = self.register(job_id, worker);
                let _ = reply.send(handle);
            }
            Command::RequestCancel {
                handle,
                reason,
                reply,
            } => {
                let _ = reply.send(self.request_cancel(handle, reason));
            }
            Command::ForceTerminate {
                handle,
                reason,
                reply,
            } => {
                let _ = reply.send(self.force_terminate(handle, reason));
            }
            Command::IsCancelled { handle, reply } => {
                let result = self
                    .records
                    .get(&handle)
                    .map(|r| r.state.is_cancelled())
                    .ok_or(CancellationError::NotFound(handle));
                let _ = reply.send(result);
            }
            Command::RegisterResource {
                handle,
                descriptor,
                reply,
            } => {
                let _ = reply.send(self.register_resource(handle, descriptor));
            }
            Command::CleanupResources { handle, reply } => {
                self.cleanup_resources(handle, reply);
            }
            Command::GetStatus { handle, reply } => {
                let result = self
                    .records
                    .get(&handle)
                    .map(CancellationRecord::snapshot)
                    .ok_or(CancellationError::NotFound(handle));
                let _ = reply.send(result);
            }
            Command::FindByJob { job_id, reply } => {
                let _ = reply.send(self.by_job.get(&job_id).copied());
            }
            Command::ListActive { reply } => {
                let _ = reply.send(self.list_active());
            }
            Command::Shutdown { reply } => {
                self.shutdown();
                let _ = reply.send(());
            }
            Command::WorkerExited { handle, exit } => self.worker_exited(handle, exit),
            Command::GracefulTimeout { handle } => self.graceful_timeout(handle),
            Command::CleanupFinished {
                handle,
                outcome,
                final_run,
            } => self.cleanup_finished(handle, outcome, final_run),
            Command::Dispose { handle } => self.dispose(handle),
        }
    }

    fn register(&mut self, job_id: String, worker: WorkerHandle) -> CancellationHandle {
        let WorkerHandle {
            token,
            abort,
            exit,
            signals,
        } = worker;
        let pre_cancelled = token.is_cancelled();
        let record = CancellationRecord::new(job_id.clone(), token, abort, signals);
        let handle = record.handle;

        let tx = self.tx.clone();
        tokio::spawn(async move {
            let exit = exit.await.unwrap_or(WorkerExit::Aborted);
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Command::WorkerExited { handle, exit }).await;
            }
        });

        debug!(handle = %handle, job_id = %job_id, "Registered worker");
        self.by_job.insert(job_id, handle);
        self.records.insert(handle, record);

        // A cancel that raced ahead of registration still gets the grace
        // period and the forced fallback.
        if pre_cancelled {
            let _ = self.request_cancel(handle, "cancelled before registration".to_string());
        }
        handle
    }

    fn request_cancel(
        &mut self,
        handle: CancellationHandle,
        reason: String,
    ) -> Result<bool, CancellationError> {
        let record = self
            .records
            .get_mut(&handle)
            .ok_or(CancellationError::NotFound(handle))?;

        if record.state != LifecycleState::Active {
            debug!(handle = %handle, state = %record.state, "Cancellation already in progress");
            return Ok(false);
        }

        record.state = LifecycleState::Cancelling;
        record.cancellation_requested_at = Some(Utc::now());
        record.token.cancel();

        let tx = self.tx.clone();
        let grace = self.config.graceful_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Command::GracefulTimeout { handle }).await;
            }
        });
        record.graceful_timer = Some(timer.abort_handle());

        info!(
            handle = %handle,
            job_id = %record.job_id,
            reason = %reason,
            "Cancellation requested"
        );
        record.cancel_reason = Some(reason);
        Ok(true)
    }

    fn force_terminate(
        &mut self,
        handle: CancellationHandle,
        reason: String,
    ) -> Result<bool, CancellationError> {
        let record = self
            .records
            .get_mut(&handle)
            .ok_or(CancellationError::NotFound(handle))?;

        if !record.state.is_live() {
            return Ok(false);
        }

        record.disarm_timer();
        record.token.cancel();
        record.abort.abort();
        record.cancellation_requested_at.get_or_insert_with(Utc::now);
        record.state = LifecycleState::Cancelled;
        record.termination = Some(TerminationKind::Forced);

        warn!(
            handle = %handle,
            job_id = %record.job_id,
            reason = %reason,
            "Force-terminated worker"
        );
        record.cancel_reason.get_or_insert(reason);
        metrics::record_forced_termination();

        self.begin_final_cleanup(handle);
        Ok(true)
    }

    fn graceful_timeout(&mut self, handle: CancellationHandle) {
        let still_cancelling = self
            .records
            .get(&handle)
            .is_some_and(|r| r.state == LifecycleState::Cancelling);
        if still_cancelling {
            let _ = self.force_terminate(handle, "graceful timeout expired".to_string());
        }
    }

    fn worker_exited(&mut self, handle: CancellationHandle, exit: WorkerExit) {
        let Some(record) = self.records.get_mut(&handle) else {
            return;
        };

        match record.state {
            LifecycleState::Active => {
                if exit == WorkerExit::Shutdown && record.token.is_cancelled() {
                    record.state = LifecycleState::Cancelled;
                    record.termination = Some(TerminationKind::Graceful);
                } else if exit.is_clean() {
                    record.termination = Some(TerminationKind::Finished);
                } else {
                    record.state = LifecycleState::Cancelled;
                    record.termination = Some(TerminationKind::Crashed);
                }
            }
            LifecycleState::Cancelling => {
                record.disarm_timer();
                record.state = LifecycleState::Cancelled;
                record.termination = Some(TerminationKind::Graceful);
            }
            _ => return,
        }

        debug!(
            handle = %handle,
            job_id = %record.job_id,
            exit = ?exit,
            state = %record.state,
            "Worker exited"
        );
        self.begin_final_cleanup(handle);
    }

    fn begin_final_cleanup(&mut self, handle: CancellationHandle) {
        let Some(record) = self.records.get_mut(&handle) else {
            return;
        };
        record.state = LifecycleState::Cleanup;
        record.cleanup_started_at = Some(Utc::now());
        let registry = record.resources.take();
        self.spawn_cleanup(handle, registry, None, true);
    }

    fn spawn_cleanup(
        &self,
        handle: CancellationHandle,
        registry: ResourceRegistry,
        reply: Option<oneshot::Sender<Result<CleanupReport, CancellationError>>>,
        final_run: bool,
    ) {
        let tx = self.tx.clone();
        let timeout = self.config.cleanup_timeout;

        tokio::spawn(async move {
            let started_at = Utc::now();
            let task = tokio::spawn(cleanup::release_all(registry));
            let abort = task.abort_handle();

            let outcome = match tokio::time::timeout(timeout, task).await {
                Ok(Ok(report)) => CleanupOutcome::Finished(report),
                Ok(Err(e)) => CleanupOutcome::Crashed(e.to_string()),
                Err(_) => {
                    abort.abort();
                    CleanupOutcome::Finished(CleanupReport::timed_out(started_at))
                }
            };

            if let Some(reply) = reply {
                let result = match &outcome {
                    CleanupOutcome::Finished(report) => Ok(report.clone()),
                    CleanupOutcome::Crashed(e) => Err(CancellationError::CleanupFailed(e.clone())),
                };
                let _ = reply.send(result);
            }

            if let Some(tx) = tx.upgrade() {
                let _ = tx
                    .send(Command::CleanupFinished {
                        handle,
                        outcome,
                        final_run,
                    })
                    .await;
            }
        });
    }

    fn cleanup_finished(
        &mut self,
        handle: CancellationHandle,
        outcome: CleanupOutcome,
        final_run: bool,
    ) {
        let Some(record) = self.records.get_mut(&handle) else {
            return;
        };

        match outcome {
            CleanupOutcome::Finished(report) => {
                let timed_out = report.timed_out;
                let failed = report.total_failed();
                record.merge_report(report);
                if !final_run {
                    return;
                }
                record.state = LifecycleState::Completed;
                if timed_out {
                    warn!(handle = %handle, job_id = %record.job_id, "Cleanup timed out");
                    metrics::record_cleanup_outcome("timed_out");
                } else {
                    info!(
                        handle = %handle,
                        job_id = %record.job_id,
                        failed,
                        "Cleanup completed"
                    );
                    metrics::record_cleanup_outcome("completed");
                }
            }
            CleanupOutcome::Crashed(e) => {
                error!(handle = %handle, job_id = %record.job_id, error = %e, "Cleanup task crashed");
                if !final_run {
                    return;
                }
                record.state = LifecycleState::Error;
                metrics::record_cleanup_outcome("error");
            }
        }

        record.cleanup_completed_at = Some(Utc::now());

        let tx = self.tx.clone();
        let delay = self.config.disposal_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Command::Dispose { handle }).await;
            }
        });
    }

    fn dispose(&mut self, handle: CancellationHandle) {
        if let Some(record) = self.records.remove(&handle) {
            if self.by_job.get(&record.job_id) == Some(&handle) {
                self.by_job.remove(&record.job_id);
            }
            debug!(handle = %handle, job_id = %record.job_id, "Disposed cancellation record");
        }
    }

    fn register_resource(
        &mut self,
        handle: CancellationHandle,
        descriptor: ResourceDescriptor,
    ) -> Result<(), CancellationError> {
        let record = self
            .records
            .get_mut(&handle)
            .ok_or(CancellationError::NotFound(handle))?;

        match record.state {
            LifecycleState::Active | LifecycleState::Cancelling | LifecycleState::Cancelled => {
                record.resources.register(descriptor);
            }
            LifecycleState::Cleanup | LifecycleState::Completed | LifecycleState::Error => {
                debug!(
                    handle = %handle,
                    kind = %descriptor.kind(),
                    "Releasing resource registered after cleanup started"
                );
                let mut registry = ResourceRegistry::new();
                registry.register(descriptor);
                self.spawn_cleanup(handle, registry, None, false);
            }
        }
        Ok(())
    }

    fn cleanup_resources(
        &mut self,
        handle: CancellationHandle,
        reply: oneshot::Sender<Result<CleanupReport, CancellationError>>,
    ) {
        let Some(record) = self.records.get_mut(&handle) else {
            let _ = reply.send(Err(CancellationError::NotFound(handle)));
            return;
        };
        let registry = record.resources.take();
        self.spawn_cleanup(handle, registry, Some(reply), false);
    }

    fn list_active(&self) -> Vec<ActiveRecord> {
        let mut records: Vec<_> = self
            .records
            .values()
            .filter(|r| !r.state.is_terminal())
            .collect();
        records.sort_by_key(|r| r.registered_at);
        records
            .into_iter()
            .map(|r| ActiveRecord {
                handle: r.handle,
                job_id: r.job_id.clone(),
                state: r.state,
            })
            .collect()
    }

    fn check_memory(&mut self) {
        let Some(sample) = self.probe.sample() else {
            return;
        };
        let fraction = sample.fraction();
        if fraction <= self.config.memory_threshold {
            return;
        }

        let mut notified = 0usize;
        for record in self.records.values().filter(|r| r.state.is_live()) {
            if record.signals.try_send(WorkerSignal::MemoryPressure).is_ok() {
                notified += 1;
            }
        }

        if notified > 0 {
            warn!(
                used_fraction = fraction,
                threshold = self.config.memory_threshold,
                notified,
                "Memory pressure, asked workers to release cached data"
            );
            metrics::record_memory_pressure();
        }
    }

    fn shutdown(&mut self) {
        let live: Vec<_> = self
            .records
            .values()
            .filter(|r| r.state.is_live())
            .map(|r| r.handle)
            .collect();

        info!(workers = live.len(), "Shutting down cancellation manager");
        for handle in live {
            let _ = self.force_terminate(handle, "manager shutdown".to_string());
        }
    }
}

/// Cloneable client for a running [`CancellationManager`].
#[derive(Clone)]
pub struct CancellationManagerHandle {
    tx: mpsc::Sender<Command>,
}

impl std::fmt::Debug for CancellationManagerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationManagerHandle")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl CancellationManagerHandle {
    async fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, CancellationError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| CancellationError::ManagerUnavailable)?;
        rx.await.map_err(|_| CancellationError::ManagerUnavailable)
    }

    /// Tracks a worker and returns its handle.
    pub async fn register(
        &self,
        job_id: impl Into<String>,
        worker: WorkerHandle,
    ) -> Result<CancellationHandle, CancellationError> {
        let job_id = job_id.into();
        self.call(|reply| Command::Register {
            job_id,
            worker,
            reply,
        })
        .await
    }

    /// Asks a worker to stop.
    ///
    /// Returns `true` if this call started the cancellation and `false` if
    /// the record was already past `Active`. Workers that do not stop within
    /// the graceful timeout are aborted.
    pub async fn request_cancel(
        &self,
        handle: CancellationHandle,
        reason: impl Into<String>,
    ) -> Result<bool, CancellationError> {
        let reason = reason.into();
        self.call(|reply| Command::RequestCancel {
            handle,
            reason,
            reply,
        })
        .await?
    }

    /// Aborts a worker immediately and starts cleanup.
    pub async fn force_terminate(
        &self,
        handle: CancellationHandle,
        reason: impl Into<String>,
    ) -> Result<bool, CancellationError> {
        let reason = reason.into();
        self.call(|reply| Command::ForceTerminate {
            handle,
            reason,
            reply,
        })
        .await?
    }

    /// True while the record is cancelling, cancelled or cleaning up.
    pub async fn is_cancelled(&self, handle: CancellationHandle) -> Result<bool, CancellationError> {
        self.call(|reply| Command::IsCancelled { handle, reply })
            .await?
    }

    /// Tracks a resource for release at cleanup.
    ///
    /// Resources registered after cleanup has started are released right away.
    pub async fn register_resource(
        &self,
        handle: CancellationHandle,
        descriptor: ResourceDescriptor,
    ) -> Result<(), CancellationError> {
        self.call(|reply| Command::RegisterResource {
            handle,
            descriptor,
            reply,
        })
        .await?
    }

    /// Releases every currently tracked resource without changing the
    /// record's state. A second call releases nothing.
    pub async fn cleanup_resources(
        &self,
        handle: CancellationHandle,
    ) -> Result<CleanupReport, CancellationError> {
        self.call(|reply| Command::CleanupResources { handle, reply })
            .await?
    }

    /// Snapshot of a record.
    pub async fn status(&self, handle: CancellationHandle) -> Result<RecordSnapshot, CancellationError> {
        self.call(|reply| Command::GetStatus { handle, reply })
            .await?
    }

    /// Handle of the most recent worker registered for `job_id`.
    pub async fn find_by_job(
        &self,
        job_id: impl Into<String>,
    ) -> Result<Option<CancellationHandle>, CancellationError> {
        let job_id = job_id.into();
        self.call(|reply| Command::FindByJob { job_id, reply }).await
    }

    /// Records whose cleanup has not finished, oldest first.
    pub async fn list_active(&self) -> Result<Vec<ActiveRecord>, CancellationError> {
        self.call(|reply| Command::ListActive { reply }).await
    }

    /// Force-terminates every live worker and stops the manager.
    pub async fn shutdown(&self) -> Result<(), CancellationError> {
        self.call(|reply| Command::Shutdown { reply }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::monitor::FixedMemoryProbe;
    use crate::cancellation::resources::ResourceKind;
    use crate::cancellation::worker::{signal_channel, ExitGuard};
    use std::time::Duration;
    use tokio::task::JoinHandle;
    use tokio_util::sync::CancellationToken;

    struct TestWorker {
        handle: CancellationHandle,
        task: JoinHandle<()>,
        signals: mpsc::Receiver<WorkerSignal>,
    }

    /// Registers a worker that either stops at the first cancellation or ignores it.
    async fn start_worker(manager: &CancellationManagerHandle, cooperative: bool) -> TestWorker {
        let token = CancellationToken::new();
        let (guard, exit) = ExitGuard::new();
        let (signal_tx, signals) = signal_channel();
        let worker_token = token.clone();

        let task = tokio::spawn(async move {
            if cooperative {
                worker_token.cancelled().await;
                guard.finish(WorkerExit::Shutdown);
            } else {
                let _guard = guard;
                std::future::pending::<()>().await;
            }
        });

        let handle = manager
            .register(
                "job-1",
                WorkerHandle::new(token, task.abort_handle(), exit, signal_tx),
            )
            .await
            .expect("register");

        TestWorker {
            handle,
            task,
            signals,
        }
    }

    async fn wait_for_state(
        manager: &CancellationManagerHandle,
        handle: CancellationHandle,
        target: LifecycleState,
    ) -> RecordSnapshot {
        for _ in 0..400 {
            let snapshot = manager.status(handle).await.expect("status");
            if snapshot.state == target {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("record never reached {target}");
    }

    #[tokio::test]
    async fn test_graceful_cancellation_releases_resources() {
        let manager = CancellationManager::spawn(CancellationConfig::default()).expect("spawn");
        let worker = start_worker(&manager, true).await;

        let dir = tempfile::tempdir().expect("tempdir");
        let scratch = dir.path().join("scratch.json");
        std::fs::write(&scratch, "{}").expect("write");
        manager
            .register_resource(worker.handle, ResourceDescriptor::file(&scratch))
            .await
            .expect("register resource");

        assert!(manager
            .request_cancel(worker.handle, "user request")
            .await
            .expect("cancel"));

        let snapshot = wait_for_state(&manager, worker.handle, LifecycleState::Completed).await;
        assert_eq!(snapshot.termination, Some(TerminationKind::Graceful));
        assert_eq!(snapshot.cancel_reason.as_deref(), Some("user request"));
        assert!(snapshot.cleanup_completed_at.is_some());
        let report = snapshot.cleanup_report.expect("report");
        assert_eq!(report.kind(ResourceKind::File).map(|k| k.released), Some(1));
        assert!(!scratch.exists());
        assert!(worker.task.await.is_ok());
    }

    #[tokio::test]
    async fn test_request_cancel_is_idempotent() {
        let manager = CancellationManager::spawn(CancellationConfig::default()).expect("spawn");
        let worker = start_worker(&manager, false).await;

        assert!(manager.request_cancel(worker.handle, "first").await.expect("cancel"));
        assert!(!manager.request_cancel(worker.handle, "second").await.expect("cancel"));
        assert!(manager.is_cancelled(worker.handle).await.expect("query"));

        let snapshot = manager.status(worker.handle).await.expect("status");
        assert_eq!(snapshot.state, LifecycleState::Cancelling);
        assert_eq!(snapshot.cancel_reason.as_deref(), Some("first"));
        manager
            .force_terminate(worker.handle, "test teardown")
            .await
            .expect("force");
    }

    #[tokio::test]
    async fn test_unresponsive_worker_is_force_terminated() {
        let config = CancellationConfig::default().with_graceful_timeout(Duration::from_millis(50));
        let manager = CancellationManager::spawn(config).expect("spawn");
        let worker = start_worker(&manager, false).await;

        manager
            .request_cancel(worker.handle, "user request")
            .await
            .expect("cancel");

        let snapshot = wait_for_state(&manager, worker.handle, LifecycleState::Completed).await;
        assert_eq!(snapshot.termination, Some(TerminationKind::Forced));
        assert!(worker.task.await.expect_err("aborted").is_cancelled());
    }

    #[tokio::test]
    async fn test_worker_cancelled_before_registration_is_terminated() {
        let config = CancellationConfig::default().with_graceful_timeout(Duration::from_millis(50));
        let manager = CancellationManager::spawn(config).expect("spawn");

        let token = CancellationToken::new();
        token.cancel();
        let (guard, exit) = ExitGuard::new();
        let (signal_tx, _signals) = signal_channel();
        let task = tokio::spawn(async move {
            let _guard = guard;
            std::future::pending::<()>().await;
        });

        let handle = manager
            .register(
                "job-early",
                WorkerHandle::new(token, task.abort_handle(), exit, signal_tx),
            )
            .await
            .expect("register");

        assert!(manager.is_cancelled(handle).await.expect("lookup"));
        let snapshot = wait_for_state(&manager, handle, LifecycleState::Completed).await;
        assert_eq!(snapshot.termination, Some(TerminationKind::Forced));
        assert_eq!(
            snapshot.cancel_reason.as_deref(),
            Some("cancelled before registration")
        );
        assert!(task.await.expect_err("aborted").is_cancelled());
    }

    #[tokio::test]
    async fn test_force_terminate_skips_grace_period() {
        let manager = CancellationManager::spawn(CancellationConfig::default()).expect("spawn");
        let worker = start_worker(&manager, false).await;

        assert!(manager
            .force_terminate(worker.handle, "operator")
            .await
            .expect("force"));
        assert!(!manager
            .force_terminate(worker.handle, "operator")
            .await
            .expect("force"));

        let snapshot = wait_for_state(&manager, worker.handle, LifecycleState::Completed).await;
        assert_eq!(snapshot.termination, Some(TerminationKind::Forced));
        assert!(worker.task.await.expect_err("aborted").is_cancelled());
    }

    #[tokio::test]
    async fn test_normal_exit_completes_record() {
        let manager = CancellationManager::spawn(CancellationConfig::default()).expect("spawn");
        let token = CancellationToken::new();
        let (guard, exit) = ExitGuard::new();
        let (signal_tx, _signals) = signal_channel();
        let (go_tx, go_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let _ = go_rx.await;
            guard.finish(WorkerExit::Normal);
        });
        let handle = manager
            .register("job-2", WorkerHandle::new(token, task.abort_handle(), exit, signal_tx))
            .await
            .expect("register");
        let _ = go_tx.send(());

        let snapshot = wait_for_state(&manager, handle, LifecycleState::Completed).await;
        assert_eq!(snapshot.termination, Some(TerminationKind::Finished));
        assert!(!manager.is_cancelled(handle).await.expect("query"));
        assert!(!manager.request_cancel(handle, "too late").await.expect("cancel"));
    }

    #[tokio::test]
    async fn test_unknown_handle_is_not_found() {
        let manager = CancellationManager::spawn(CancellationConfig::default()).expect("spawn");
        let unknown = CancellationHandle::new();

        assert!(matches!(
            manager.is_cancelled(unknown).await,
            Err(CancellationError::NotFound(h)) if h == unknown
        ));
        assert!(matches!(
            manager.request_cancel(unknown, "x").await,
            Err(CancellationError::NotFound(_))
        ));
        assert!(matches!(
            manager.status(unknown).await,
            Err(CancellationError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_manual_cleanup_is_idempotent() {
        let manager = CancellationManager::spawn(CancellationConfig::default()).expect("spawn");
        let worker = start_worker(&manager, true).await;

        let dir = tempfile::tempdir().expect("tempdir");
        let scratch = dir.path().join("partial.yaml");
        std::fs::write(&scratch, "domain: x").expect("write");
        manager
            .register_resource(worker.handle, ResourceDescriptor::file(&scratch))
            .await
            .expect("register resource");

        let first = manager.cleanup_resources(worker.handle).await.expect("cleanup");
        assert_eq!(first.total_released(), 1);
        let second = manager.cleanup_resources(worker.handle).await.expect("cleanup");
        assert_eq!(second.total_released(), 0);

        let snapshot = manager.status(worker.handle).await.expect("status");
        assert_eq!(snapshot.state, LifecycleState::Active);
        manager.request_cancel(worker.handle, "done").await.expect("cancel");
    }

    #[tokio::test]
    async fn test_late_resource_is_released_immediately() {
        let manager = CancellationManager::spawn(CancellationConfig::default()).expect("spawn");
        let worker = start_worker(&manager, true).await;
        manager.request_cancel(worker.handle, "stop").await.expect("cancel");
        wait_for_state(&manager, worker.handle, LifecycleState::Completed).await;

        let dir = tempfile::tempdir().expect("tempdir");
        let late = dir.path().join("late.tmp");
        std::fs::write(&late, "x").expect("write");
        manager
            .register_resource(worker.handle, ResourceDescriptor::file(&late))
            .await
            .expect("register resource");

        for _ in 0..200 {
            if !late.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!late.exists());
    }

    #[tokio::test]
    async fn test_cleanup_timeout_completes_record() {
        let config = CancellationConfig::default().with_cleanup_timeout(Duration::from_millis(50));
        let manager = CancellationManager::spawn(config).expect("spawn");
        let worker = start_worker(&manager, true).await;

        manager
            .register_resource(
                worker.handle,
                ResourceDescriptor::callback("slow flush", || {
                    std::thread::sleep(Duration::from_millis(1000));
                    Ok(())
                }),
            )
            .await
            .expect("register resource");
        manager.request_cancel(worker.handle, "stop").await.expect("cancel");

        let snapshot = wait_for_state(&manager, worker.handle, LifecycleState::Completed).await;
        let report = snapshot.cleanup_report.expect("report");
        assert!(report.timed_out);
    }

    #[tokio::test]
    async fn test_records_are_disposed_after_delay() {
        let config = CancellationConfig::default().with_disposal_delay(Duration::from_millis(30));
        let manager = CancellationManager::spawn(config).expect("spawn");
        let worker = start_worker(&manager, true).await;

        assert_eq!(
            manager.find_by_job("job-1").await.expect("lookup"),
            Some(worker.handle)
        );
        manager.request_cancel(worker.handle, "stop").await.expect("cancel");

        let mut disposed = false;
        for _ in 0..200 {
            if matches!(
                manager.status(worker.handle).await,
                Err(CancellationError::NotFound(_))
            ) {
                disposed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(disposed);
        assert_eq!(manager.find_by_job("job-1").await.expect("lookup"), None);
    }

    #[tokio::test]
    async fn test_memory_pressure_signals_live_workers() {
        let config = CancellationConfig::default()
            .with_monitor_interval(Duration::from_millis(20))
            .with_memory_threshold(0.9);
        let probe = Arc::new(FixedMemoryProbe::new(0.97));
        let manager = CancellationManager::spawn_with_probe(config, probe).expect("spawn");
        let mut worker = start_worker(&manager, true).await;

        let signal = tokio::time::timeout(Duration::from_secs(2), worker.signals.recv())
            .await
            .expect("signal before timeout");
        assert_eq!(signal, Some(WorkerSignal::MemoryPressure));
        manager.request_cancel(worker.handle, "done").await.expect("cancel");
    }

    #[tokio::test]
    async fn test_list_active_and_shutdown() {
        let manager = CancellationManager::spawn(CancellationConfig::default()).expect("spawn");
        let worker = start_worker(&manager, false).await;

        let active = manager.list_active().await.expect("list");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].handle, worker.handle);
        assert_eq!(active[0].job_id, "job-1");
        assert_eq!(active[0].state, LifecycleState::Active);

        manager.shutdown().await.expect("shutdown");
        assert!(worker.task.await.expect_err("aborted").is_cancelled());
        assert!(matches!(
            manager.list_active().await,
            Err(CancellationError::ManagerUnavailable)
        ));
    }

    #[test]
    fn test_spawn_outside_runtime_fails() {
        assert!(matches!(
            CancellationManager::spawn(CancellationConfig::default()),
            Err(CancellationError::NoRuntime)
        ));
    }
}
