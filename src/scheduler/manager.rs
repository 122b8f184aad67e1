//! Queue manager actor.
//!
//! One task owns the pending queue, the running set and the results cache.
//! Every mutation arrives as a message, so admission can never race past the
//! concurrency limit. Workers run in their own tasks; a watcher task per
//! worker reports its exit back through the command channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{duration_ms, ConfigError};
use crate::domain::DomainConfig;
use crate::error::ValidationError;
use crate::metrics;
use crate::pipeline::{
    PipelineCoordinator, PipelineError, ProgressSink, ProgressUpdate, RefinementResult,
    TerminationReason, WorkerLaunch,
};

use super::config::QueueConfig;
use super::job::{JobCallback, JobNotification, JobRequest, JobStatus, SubmitOptions};
use super::queue::{JobQueue, QueuedJob, ResultsCache};

/// Errors returned by the queue manager.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Invalid submission: {0}")]
    Validation(#[from] ValidationError),

    #[error("Job {0} not found")]
    NotFound(String),

    #[error("Queue is full ({0} jobs waiting)")]
    QueueFull(usize),

    #[error("Queue is shutting down")]
    ShuttingDown,

    #[error("Queue manager is not running")]
    ManagerUnavailable,

    #[error("No Tokio runtime available to start the queue manager")]
    NoRuntime,

    #[error("Invalid queue configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
}

/// Counters describing the queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    /// Jobs waiting for admission.
    pub queued: usize,
    /// Jobs currently processing.
    pub running: usize,
    pub max_concurrent: usize,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Mean time from admission to terminal status over processed jobs.
    #[serde(with = "duration_ms", rename = "average_job_duration_ms")]
    pub average_job_duration: Duration,
}

impl QueueStats {
    /// Returns the total number of jobs that reached a terminal status.
    pub fn total_processed(&self) -> u64 {
        self.completed + self.failed + self.cancelled
    }

    /// Returns the share of terminal jobs that completed, as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.completed as f64 / total as f64) * 100.0
    }
}

/// How a worker ended, as seen by the queue.
enum JobOutcome {
    Completed(RefinementResult),
    Failed(String),
    Cancelled(String),
}

impl JobOutcome {
    fn from_join(outcome: Result<Result<RefinementResult, PipelineError>, JoinError>) -> Self {
        match outcome {
            Ok(Ok(result)) if result.termination_reason == TerminationReason::Cancelled => {
                JobOutcome::Cancelled("cancelled by request".to_string())
            }
            Ok(Ok(result)) => JobOutcome::Completed(result),
            Ok(Err(e)) => JobOutcome::Failed(e.to_string()),
            Err(e) if e.is_cancelled() => JobOutcome::Cancelled("force terminated".to_string()),
            Err(e) => {
                error!(error = %e, "Worker panicked");
                JobOutcome::Failed(format!("worker panicked: {}", e))
            }
        }
    }
}

struct RunningJob {
    request: JobRequest,
    callback: Option<JobCallback>,
    token: CancellationToken,
    abort: AbortHandle,
    cooperative: bool,
    admitted_at: Instant,
}

#[derive(Default)]
struct Counters {
    submitted: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
    total_duration: Duration,
}

enum Command {
    Submit {
        payload: DomainConfig,
        options: SubmitOptions,
        reply: oneshot::Sender<Result<String, QueueError>>,
    },
    Status {
        job_id: String,
        reply: oneshot::Sender<Result<JobRequest, QueueError>>,
    },
    Cancel {
        job_id: String,
        reply: oneshot::Sender<Result<(), QueueError>>,
    },
    ListActive {
        reply: oneshot::Sender<Vec<JobRequest>>,
    },
    UpdateConfig {
        config: QueueConfig,
        reply: oneshot::Sender<Result<(), QueueError>>,
    },
    Stats {
        reply: oneshot::Sender<QueueStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    Progress {
        job_id: String,
        update: ProgressUpdate,
    },
    WorkerExited {
        job_id: String,
        outcome: JobOutcome,
    },
}

/// Queue manager actor. Use [`QueueManager::spawn`] and talk to it through
/// the returned [`QueueHandle`].
pub struct QueueManager {
    config: QueueConfig,
    coordinator: PipelineCoordinator,
    pending: JobQueue,
    running: HashMap<String, RunningJob>,
    results: ResultsCache,
    counters: Counters,
    shutdown_waiters: Option<Vec<oneshot::Sender<()>>>,
    rx: mpsc::Receiver<Command>,
    self_tx: mpsc::WeakSender<Command>,
}

impl QueueManager {
    /// Starts the actor on the current runtime.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::InvalidConfig` for an invalid configuration and
    /// `QueueError::NoRuntime` outside a Tokio runtime.
    pub fn spawn(
        config: QueueConfig,
        coordinator: PipelineCoordinator,
    ) -> Result<QueueHandle, QueueError> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| QueueError::NoRuntime)?;

        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let manager = Self {
            pending: JobQueue::new(config.ordering),
            results: ResultsCache::new(config.result_cache_size, config.result_retention),
            running: HashMap::new(),
            counters: Counters::default(),
            shutdown_waiters: None,
            self_tx: tx.downgrade(),
            rx,
            coordinator,
            config,
        };

        info!(
            max_concurrent = manager.config.max_concurrent,
            ordering = ?manager.config.ordering,
            "Starting queue manager"
        );
        runtime.spawn(manager.run());

        Ok(QueueHandle { tx })
    }

    async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            self.handle(command);
        }
        debug!("Queue manager stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Submit {
                payload,
                options,
                reply,
            } => {
                let _ = reply.send(self.submit(payload, options));
            }
            Command::Status { job_id, reply } => {
                let _ = reply.send(self.status(&job_id));
            }
            Command::Cancel { job_id, reply } => self.cancel(job_id, reply),
            Command::ListActive { reply } => {
                let _ = reply.send(self.list_active());
            }
            Command::UpdateConfig { config, reply } => {
                let _ = reply.send(self.update_config(config));
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::Shutdown { reply } => self.shutdown(reply),
            Command::Progress { job_id, update } => {
                if let Some(job) = self.running.get_mut(&job_id) {
                    job.request.progress = Some(update);
                }
            }
            Command::WorkerExited { job_id, outcome } => self.worker_exited(job_id, outcome),
        }
    }

    fn submit(&mut self, payload: DomainConfig, options: SubmitOptions) -> Result<String, QueueError> {
        if self.shutdown_waiters.is_some() {
            return Err(QueueError::ShuttingDown);
        }
        payload.validate_required(&self.config.required_keys)?;
        let resolved = options.run.resolve(self.coordinator.defaults())?;
        if let Some(limit) = self.config.max_queue_size {
            if self.pending.len() >= limit {
                return Err(QueueError::QueueFull(self.pending.len()));
            }
        }

        let request = JobRequest::new(payload, options.priority)
            .with_session_id(resolved.session_id.clone());
        let job_id = request.id.clone();

        info!(
            job_id = %job_id,
            priority = %request.priority,
            queued = self.pending.len(),
            "Job submitted"
        );
        metrics::record_job_submitted(request.priority.as_str());
        self.counters.submitted += 1;

        self.pending.enqueue(request, resolved, options.callback);
        self.try_admit();
        Ok(job_id)
    }

    /// Admits queued jobs while capacity allows.
    fn try_admit(&mut self) {
        while self.shutdown_waiters.is_none() && self.running.len() < self.config.max_concurrent {
            let Some(job) = self.pending.dequeue() else {
                break;
            };
            self.start(job);
        }
        self.update_gauges();
    }

    fn start(&mut self, job: QueuedJob) {
        let QueuedJob {
            mut request,
            options,
            callback,
            ..
        } = job;
        let job_id = request.id.clone();
        let token = CancellationToken::new();
        let cooperative = options.enable_cancellation;

        let mut launch = WorkerLaunch::new(job_id.clone(), request.payload.clone(), options)
            .with_token(token.clone());
        if launch.options.enable_progress {
            launch = launch.with_progress(Arc::new(QueueProgressSink {
                job_id: job_id.clone(),
                tx: self.self_tx.clone(),
            }));
        }

        let task = match self.coordinator.spawn_worker(launch) {
            Ok(task) => task,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Failed to spawn worker");
                request.fail(format!("failed to spawn worker: {}", e));
                self.record_terminal(request, callback, Duration::ZERO);
                return;
            }
        };

        request.mark_processing();
        let abort = task.abort_handle();
        let watcher_tx = self.self_tx.clone();
        let watched_id = job_id.clone();
        tokio::spawn(async move {
            let outcome = JobOutcome::from_join(task.await);
            if let Some(tx) = watcher_tx.upgrade() {
                let _ = tx
                    .send(Command::WorkerExited {
                        job_id: watched_id,
                        outcome,
                    })
                    .await;
            }
        });

        info!(job_id = %job_id, running = self.running.len() + 1, "Job admitted");
        self.running.insert(
            job_id,
            RunningJob {
                request,
                callback,
                token,
                abort,
                cooperative,
                admitted_at: Instant::now(),
            },
        );
    }

    fn worker_exited(&mut self, job_id: String, outcome: JobOutcome) {
        let Some(job) = self.running.remove(&job_id) else {
            warn!(job_id = %job_id, "Exit reported for unknown job");
            return;
        };
        let RunningJob {
            mut request,
            callback,
            admitted_at,
            ..
        } = job;

        match outcome {
            JobOutcome::Completed(result) => {
                info!(
                    job_id = %job_id,
                    reason = %result.termination_reason,
                    iterations = result.iteration_count,
                    "Job completed"
                );
                request.complete(result);
            }
            JobOutcome::Failed(error) => {
                warn!(job_id = %job_id, error = %error, "Job failed");
                request.fail(error);
            }
            JobOutcome::Cancelled(reason) => {
                info!(job_id = %job_id, reason = %reason, "Job cancelled");
                request.cancel(reason);
            }
        }

        self.record_terminal(request, callback, admitted_at.elapsed());
        self.try_admit();
        self.notify_shutdown_waiters();
    }

    /// Moves a terminal job into the results cache and notifies its submitter.
    fn record_terminal(&mut self, request: JobRequest, callback: Option<JobCallback>, elapsed: Duration) {
        match request.status {
            JobStatus::Completed => self.counters.completed += 1,
            JobStatus::Failed => self.counters.failed += 1,
            JobStatus::Cancelled => self.counters.cancelled += 1,
            JobStatus::Queued | JobStatus::Processing => {}
        }
        self.counters.total_duration += elapsed;
        metrics::record_job_finished(request.status.as_str(), elapsed);

        if let (Some(callback), Some(notification)) = (callback, request.notification()) {
            if callback.send(notification).is_err() {
                debug!(job_id = %request.id, "Callback receiver dropped");
            }
        }
        self.results.insert(request);
    }

    fn status(&mut self, job_id: &str) -> Result<JobRequest, QueueError> {
        if let Some(job) = self.running.get(job_id) {
            return Ok(job.request.clone());
        }
        if let Some(request) = self.results.get(job_id) {
            return Ok(request.clone());
        }
        self.pending
            .get(job_id)
            .cloned()
            .ok_or_else(|| QueueError::NotFound(job_id.to_string()))
    }

    fn cancel(&mut self, job_id: String, reply: oneshot::Sender<Result<(), QueueError>>) {
        if let Some(job) = self.pending.remove(&job_id) {
            info!(job_id = %job_id, "Cancelled queued job");
            let mut request = job.request;
            request.cancel("cancelled while queued");
            self.record_terminal(request, job.callback, Duration::ZERO);
            let _ = reply.send(Ok(()));
            self.try_admit();
            return;
        }

        if let Some(job) = self.running.get(&job_id) {
            self.cancel_running(&job_id, job.token.clone(), job.abort.clone(), job.cooperative, reply);
            return;
        }

        let result = if self.results.contains(&job_id) {
            debug!(job_id = %job_id, "Cancel ignored for finished job");
            Ok(())
        } else {
            Err(QueueError::NotFound(job_id))
        };
        let _ = reply.send(result);
    }

    /// Forwards cancellation of a running job without blocking the actor.
    ///
    /// The worker's exit drives the status change.
    fn cancel_running(
        &self,
        job_id: &str,
        token: CancellationToken,
        abort: AbortHandle,
        cooperative: bool,
        reply: oneshot::Sender<Result<(), QueueError>>,
    ) {
        if !cooperative {
            info!(job_id = %job_id, "Aborting job without cancellation support");
            abort.abort();
            let _ = reply.send(Ok(()));
            return;
        }

        let Some(manager) = self.coordinator.cancellation_manager().cloned() else {
            token.cancel();
            let _ = reply.send(Ok(()));
            return;
        };

        let job_id = job_id.to_string();
        tokio::spawn(async move {
            match manager.find_by_job(job_id.clone()).await {
                Ok(Some(handle)) => match manager.request_cancel(handle, "cancelled by caller").await {
                    Ok(started) => debug!(job_id = %job_id, started, "Cancellation forwarded"),
                    Err(e) => {
                        warn!(job_id = %job_id, error = %e, "Cancellation manager rejected request");
                        token.cancel();
                    }
                },
                Ok(None) => {
                    token.cancel();
                    // The worker may have registered between the lookup and the cancel.
                    if let Ok(Some(handle)) = manager.find_by_job(job_id.clone()).await {
                        let _ = manager.request_cancel(handle, "cancelled by caller").await;
                    }
                }
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Cancellation manager unavailable");
                    token.cancel();
                }
            }
            let _ = reply.send(Ok(()));
        });
    }

    fn list_active(&self) -> Vec<JobRequest> {
        let mut running: Vec<_> = self.running.values().map(|job| job.request.clone()).collect();
        running.sort_by_key(|request| request.started_at);

        self.pending.iter().cloned().chain(running).collect()
    }

    fn update_config(&mut self, config: QueueConfig) -> Result<(), QueueError> {
        config.validate()?;
        info!(
            max_concurrent = config.max_concurrent,
            ordering = ?config.ordering,
            "Queue configuration updated"
        );

        self.pending.set_ordering(config.ordering);
        self.results
            .resize(config.result_cache_size, config.result_retention);
        self.config = QueueConfig {
            channel_capacity: self.config.channel_capacity,
            ..config
        };
        self.try_admit();
        Ok(())
    }

    fn stats(&self) -> QueueStats {
        let processed = self.counters.completed + self.counters.failed + self.counters.cancelled;
        let average_job_duration = average_duration(self.counters.total_duration, processed);

        QueueStats {
            queued: self.pending.len(),
            running: self.running.len(),
            max_concurrent: self.config.max_concurrent,
            submitted: self.counters.submitted,
            completed: self.counters.completed,
            failed: self.counters.failed,
            cancelled: self.counters.cancelled,
            average_job_duration,
        }
    }

    fn shutdown(&mut self, reply: oneshot::Sender<()>) {
        let waiters = self.shutdown_waiters.get_or_insert_with(Vec::new);
        waiters.push(reply);
        if waiters.len() > 1 {
            return;
        }

        info!(
            queued = self.pending.len(),
            running = self.running.len(),
            "Shutting down queue manager"
        );
        for job in self.pending.drain() {
            let mut request = job.request;
            request.cancel("queue shutting down");
            self.record_terminal(request, job.callback, Duration::ZERO);
        }

        let running: Vec<_> = self
            .running
            .iter()
            .map(|(id, job)| (id.clone(), job.token.clone(), job.abort.clone(), job.cooperative))
            .collect();
        for (job_id, token, abort, cooperative) in running {
            let (ack, _) = oneshot::channel();
            self.cancel_running(&job_id, token, abort, cooperative, ack);
        }

        self.update_gauges();
        self.notify_shutdown_waiters();
    }

    fn notify_shutdown_waiters(&mut self) {
        if !self.running.is_empty() {
            return;
        }
        if let Some(waiters) = self.shutdown_waiters.as_mut() {
            for waiter in waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    fn update_gauges(&self) {
        metrics::set_queue_depth(self.pending.len());
        metrics::set_jobs_in_progress(self.running.len());
    }
}

/// Mean duration over `processed` jobs.
fn average_duration(total: Duration, processed: u64) -> Duration {
    if processed == 0 {
        return Duration::ZERO;
    }
    total.div_f64(processed as f64)
}

/// Forwards a worker's progress into the queue so status queries see it.
struct QueueProgressSink {
    job_id: String,
    tx: mpsc::WeakSender<Command>,
}

impl ProgressSink for QueueProgressSink {
    fn report(&self, update: ProgressUpdate) {
        if let Some(tx) = self.tx.upgrade() {
            // Dropped under backpressure; the next update supersedes it.
            let _ = tx.try_send(Command::Progress {
                job_id: self.job_id.clone(),
                update,
            });
        }
    }
}

/// Cloneable client for a running [`QueueManager`].
#[derive(Clone)]
pub struct QueueHandle {
    tx: mpsc::Sender<Command>,
}

impl std::fmt::Debug for QueueHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueHandle")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl QueueHandle {
    async fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, QueueError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| QueueError::ManagerUnavailable)?;
        rx.await.map_err(|_| QueueError::ManagerUnavailable)
    }

    /// Queues a job and returns its id. The job may start immediately.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Validation` for a payload missing required keys
    /// or out-of-range options, `QueueError::QueueFull` when the queue bound
    /// is reached and `QueueError::ShuttingDown` after [`shutdown`](Self::shutdown).
    pub async fn submit(&self, payload: DomainConfig, options: SubmitOptions) -> Result<String, QueueError> {
        self.call(|reply| Command::Submit {
            payload,
            options,
            reply,
        })
        .await?
    }

    /// Submits a job and waits for its terminal notification.
    ///
    /// Any callback in `options` is replaced.
    pub async fn submit_and_wait(
        &self,
        payload: DomainConfig,
        options: SubmitOptions,
    ) -> Result<JobNotification, QueueError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.submit(payload, options.with_callback(tx)).await?;
        rx.recv().await.ok_or(QueueError::ManagerUnavailable)
    }

    /// Snapshot of a job: running, then finished, then queued.
    pub async fn status(&self, job_id: impl Into<String>) -> Result<JobRequest, QueueError> {
        let job_id = job_id.into();
        self.call(|reply| Command::Status { job_id, reply }).await?
    }

    /// Cancels a job.
    ///
    /// A queued job is cancelled immediately. For a running job the request
    /// is forwarded to the worker and its exit sets the final status.
    /// Cancelling a finished job does nothing.
    pub async fn cancel(&self, job_id: impl Into<String>) -> Result<(), QueueError> {
        let job_id = job_id.into();
        self.call(|reply| Command::Cancel { job_id, reply }).await?
    }

    /// Queued jobs in admission order followed by running jobs.
    pub async fn list_active(&self) -> Result<Vec<JobRequest>, QueueError> {
        self.call(|reply| Command::ListActive { reply }).await
    }

    /// Replaces the queue configuration. A higher concurrency limit admits
    /// waiting jobs right away.
    pub async fn update_config(&self, config: QueueConfig) -> Result<(), QueueError> {
        self.call(|reply| Command::UpdateConfig { config, reply })
            .await?
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        self.call(|reply| Command::Stats { reply }).await
    }

    /// Cancels queued jobs, asks running jobs to stop and waits until none run.
    pub async fn shutdown(&self) -> Result<(), QueueError> {
        self.call(|reply| Command::Shutdown { reply }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::FixedMemoryProbe;
    use crate::error::CollaboratorError;
    use crate::pipeline::{Collaborators, PipelineDefaults, RunOptions};
    use crate::quality::{
        Evaluator, Feedback, QualityScore, Refiner, Suggestion, ValidationReport, Validator,
    };
    use crate::scheduler::job::Priority;
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Semaphore;

    /// Scores 1.0 once a config has been refined, 0.1 before.
    struct FlagEvaluator;

    #[async_trait]
    impl Evaluator for FlagEvaluator {
        async fn evaluate(&self, config: &DomainConfig) -> Result<QualityScore, CollaboratorError> {
            let refined = config.get("refined").is_some();
            Ok(QualityScore::new(if refined { 1.0 } else { 0.1 }))
        }

        async fn generate_feedback(&self, _config: &DomainConfig) -> Result<Feedback, CollaboratorError> {
            Ok(Feedback::new(vec![Suggestion::actionable("completeness", "refine")]))
        }
    }

    /// Waits for a permit before refining.
    struct GatedRefiner {
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl Refiner for GatedRefiner {
        async fn apply_improvements(
            &self,
            config: &DomainConfig,
            _feedback: &Feedback,
        ) -> Result<DomainConfig, CollaboratorError> {
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| CollaboratorError::Unavailable(e.to_string()))?;
            permit.forget();
            Ok(config.clone().with("refined", json!(true)))
        }
    }

    struct AcceptingValidator;

    #[async_trait]
    impl Validator for AcceptingValidator {
        async fn validate_improvements(
            &self,
            _old: &DomainConfig,
            _new: &DomainConfig,
        ) -> Result<ValidationReport, CollaboratorError> {
            Ok(ValidationReport::accept(0.9).with_improved(vec!["completeness".to_string()]))
        }
    }

    fn queue(max_concurrent: usize) -> (QueueHandle, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let coordinator = PipelineCoordinator::new(
            Collaborators::new(
                Arc::new(FlagEvaluator),
                Arc::new(GatedRefiner {
                    gate: Arc::clone(&gate),
                }),
                Arc::new(AcceptingValidator),
            ),
            PipelineDefaults::default(),
        )
        .with_memory_probe(Arc::new(FixedMemoryProbe::new(0.1)));
        let handle = QueueManager::spawn(QueueConfig::new(max_concurrent), coordinator).expect("spawn");
        (handle, gate)
    }

    fn payload(name: &str) -> DomainConfig {
        DomainConfig::new()
            .with("domain", json!(name))
            .with("patterns", json!([]))
    }

    async fn wait_for_status(handle: &QueueHandle, job_id: &str, status: JobStatus) -> JobRequest {
        for _ in 0..400 {
            let request = handle.status(job_id).await.expect("status");
            if request.status == status {
                return request;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {job_id} never reached {status}");
    }

    #[tokio::test]
    async fn test_submit_validation_rejected() {
        let (handle, _gate) = queue(1);

        let err = handle
            .submit(DomainConfig::new().with("domain", json!("x")), SubmitOptions::new())
            .await
            .expect_err("missing patterns");
        assert!(matches!(err, QueueError::Validation(ValidationError::MissingKeys(_))));

        let options = SubmitOptions::new().with_run_options(RunOptions::new().with_max_iterations(9));
        let err = handle.submit(payload("x"), options).await.expect_err("out of range");
        assert!(matches!(
            err,
            QueueError::Validation(ValidationError::MaxIterationsOutOfRange { .. })
        ));

        assert_eq!(handle.stats().await.expect("stats").submitted, 0);
    }

    #[tokio::test]
    async fn test_job_completes_and_notifies() {
        let (handle, gate) = queue(1);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let job_id = handle
            .submit(payload("a"), SubmitOptions::new().with_callback(tx))
            .await
            .expect("submit");
        wait_for_status(&handle, &job_id, JobStatus::Processing).await;
        gate.add_permits(1);

        let notification = rx.recv().await.expect("notification");
        assert_eq!(notification.job_id(), job_id);
        assert_eq!(notification.status(), JobStatus::Completed);
        let result = notification.result().expect("result");
        assert_eq!(result.termination_reason, TerminationReason::QualityThresholdMet);

        let request = handle.status(&job_id).await.expect("status");
        assert_eq!(request.status, JobStatus::Completed);
        assert!(request.started_at.is_some());
        assert!(request.completed_at.is_some());
        assert!(request.result.is_some());
        assert!(request.error.is_none());
    }

    #[tokio::test]
    async fn test_concurrency_limit_and_queue_cancel() {
        let (handle, gate) = queue(1);

        let first = handle.submit(payload("a"), SubmitOptions::new()).await.expect("submit");
        let second = handle.submit(payload("b"), SubmitOptions::new()).await.expect("submit");

        assert_eq!(handle.status(&first).await.expect("status").status, JobStatus::Processing);
        assert_eq!(handle.status(&second).await.expect("status").status, JobStatus::Queued);
        assert_eq!(handle.list_active().await.expect("list").len(), 2);

        handle.cancel(&second).await.expect("cancel");
        let cancelled = handle.status(&second).await.expect("status");
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(cancelled.started_at.is_none());

        gate.add_permits(1);
        wait_for_status(&handle, &first, JobStatus::Completed).await;

        let stats = handle.stats().await.expect("stats");
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.running, 0);
        assert!((stats.success_rate() - 50.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_update_config_admits_waiting_jobs() {
        let (handle, gate) = queue(1);

        let first = handle.submit(payload("a"), SubmitOptions::new()).await.expect("submit");
        let second = handle.submit(payload("b"), SubmitOptions::new()).await.expect("submit");
        assert_eq!(handle.status(&second).await.expect("status").status, JobStatus::Queued);

        handle
            .update_config(QueueConfig::new(2))
            .await
            .expect("update");
        assert_eq!(handle.status(&second).await.expect("status").status, JobStatus::Processing);

        gate.add_permits(2);
        wait_for_status(&handle, &first, JobStatus::Completed).await;
        wait_for_status(&handle, &second, JobStatus::Completed).await;

        assert!(handle.update_config(QueueConfig::new(0)).await.is_err());
    }

    #[tokio::test]
    async fn test_queue_bound() {
        let gate = Arc::new(Semaphore::new(0));
        let coordinator = PipelineCoordinator::new(
            Collaborators::new(
                Arc::new(FlagEvaluator),
                Arc::new(GatedRefiner { gate }),
                Arc::new(AcceptingValidator),
            ),
            PipelineDefaults::default(),
        );
        let handle = QueueManager::spawn(QueueConfig::new(1).with_max_queue_size(1), coordinator)
            .expect("spawn");

        handle.submit(payload("a"), SubmitOptions::new()).await.expect("runs");
        handle.submit(payload("b"), SubmitOptions::new()).await.expect("queued");
        let err = handle
            .submit(payload("c"), SubmitOptions::new())
            .await
            .expect_err("full");
        assert!(matches!(err, QueueError::QueueFull(1)));
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let (handle, _gate) = queue(1);
        assert!(matches!(
            handle.status("missing").await,
            Err(QueueError::NotFound(_))
        ));
        assert!(matches!(
            handle.cancel("missing").await,
            Err(QueueError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_running_job_without_manager() {
        let (handle, gate) = queue(1);
        let options = SubmitOptions::new().with_priority(Priority::High);
        let job_id = handle.submit(payload("a"), options).await.expect("submit");
        wait_for_status(&handle, &job_id, JobStatus::Processing).await;

        handle.cancel(&job_id).await.expect("cancel");
        gate.add_permits(1);

        let request = wait_for_status(&handle, &job_id, JobStatus::Cancelled).await;
        assert_eq!(request.error.as_deref(), Some("cancelled by request"));

        // Cancelling a finished job is a no-op.
        handle.cancel(&job_id).await.expect("no-op");
    }

    #[tokio::test]
    async fn test_shutdown_cancels_everything() {
        let (handle, gate) = queue(1);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let running = handle.submit(payload("a"), SubmitOptions::new()).await.expect("submit");
        let queued = handle
            .submit(payload("b"), SubmitOptions::new().with_callback(tx))
            .await
            .expect("submit");
        wait_for_status(&handle, &running, JobStatus::Processing).await;

        let shutdown = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.shutdown().await })
        };

        let notification = rx.recv().await.expect("queued job notified");
        assert_eq!(notification.job_id(), queued);
        assert_eq!(notification.status(), JobStatus::Cancelled);

        gate.add_permits(1);
        shutdown.await.expect("join").expect("shutdown");

        assert_eq!(handle.status(&running).await.expect("status").status, JobStatus::Cancelled);
        assert!(matches!(
            handle.submit(payload("c"), SubmitOptions::new()).await,
            Err(QueueError::ShuttingDown)
        ));
    }

    #[test]
    fn test_spawn_outside_runtime() {
        let coordinator = PipelineCoordinator::new(Collaborators::baseline(), PipelineDefaults::default());
        assert!(matches!(
            QueueManager::spawn(QueueConfig::default(), coordinator),
            Err(QueueError::NoRuntime)
        ));
    }

    #[test]
    fn test_stats_rates() {
        let stats = QueueStats {
            completed: 3,
            failed: 1,
            ..Default::default()
        };
        assert_eq!(stats.total_processed(), 4);
        assert!((stats.success_rate() - 75.0).abs() < 1e-9);
        assert_eq!(QueueStats::default().success_rate(), 0.0);
    }

    #[test]
    fn test_average_duration() {
        assert_eq!(average_duration(Duration::from_secs(9), 0), Duration::ZERO);
        assert_eq!(
            average_duration(Duration::from_secs(9), 3),
            Duration::from_secs(3)
        );
        // Counts past u32::MAX must not wrap to a zero divisor.
        assert_eq!(
            average_duration(Duration::from_secs(1 << 32), 1 << 32),
            Duration::from_secs(1)
        );
    }
}
