//! Pipeline coordinator.
//!
//! Drives one job through evaluate, feedback, refine and validate until a
//! termination criterion holds. The loop always runs inside its own Tokio
//! task: [`PipelineCoordinator::run`] awaits that task, while the queue uses
//! [`PipelineCoordinator::spawn_worker`] and watches the returned handle.

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cancellation::{
    signal_channel, CancellationHandle, CancellationManagerHandle, ExitGuard, MemoryProbe,
    ResourceDescriptor, SystemMemoryProbe, WorkerExit, WorkerHandle, WorkerSignal,
};
use crate::domain::{DomainConfig, DEFAULT_REQUIRED_KEYS};
use crate::error::{CollaboratorError, ValidationError};
use crate::metrics;
use crate::quality::{CoverageEvaluator, Evaluator, Refiner, ScoreValidator, TemplateRefiner, Validator};

use super::config::{PipelineDefaults, RefinementOptions, RunOptions};
use super::progress::{Heartbeat, ProgressReporter, ProgressSink};
use super::result::{RefinementResult, TerminationReason};
use super::state::{IterationMetrics, PipelineStage, PipelineState};

/// Errors that end a run without a result.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid submission: {0}")]
    Validation(#[from] ValidationError),

    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: PipelineStage,
        #[source]
        source: CollaboratorError,
    },

    #[error("Refinement rejected on the first iteration (quality change {quality_change:.4})")]
    RefinementRejected { quality_change: f64 },

    #[error("Failed to spawn worker: {0}")]
    Spawn(#[from] SpawnError),

    #[error("Worker was force-terminated")]
    ForceTerminated,

    #[error("Worker panicked: {0}")]
    WorkerPanicked(String),
}

/// Errors starting a worker task.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SpawnError {
    #[error("No Tokio runtime available")]
    NoRuntime,
}

/// The three external collaborators a run calls.
#[derive(Clone)]
pub struct Collaborators {
    pub evaluator: Arc<dyn Evaluator>,
    pub refiner: Arc<dyn Refiner>,
    pub validator: Arc<dyn Validator>,
}

impl Collaborators {
    pub fn new(
        evaluator: Arc<dyn Evaluator>,
        refiner: Arc<dyn Refiner>,
        validator: Arc<dyn Validator>,
    ) -> Self {
        Self {
            evaluator,
            refiner,
            validator,
        }
    }

    /// Field-coverage heuristics with a score-comparing validator.
    pub fn baseline() -> Self {
        let evaluator: Arc<dyn Evaluator> = Arc::new(CoverageEvaluator::new());
        Self {
            validator: Arc::new(ScoreValidator::new(Arc::clone(&evaluator))),
            refiner: Arc::new(TemplateRefiner::new()),
            evaluator,
        }
    }
}

/// Everything a worker needs to run one job.
pub struct WorkerLaunch {
    pub job_id: String,
    pub config: DomainConfig,
    pub options: RefinementOptions,
    pub token: CancellationToken,
    pub progress: Option<Arc<dyn ProgressSink>>,
}

impl WorkerLaunch {
    pub fn new(job_id: impl Into<String>, config: DomainConfig, options: RefinementOptions) -> Self {
        Self {
            job_id: job_id.into(),
            config,
            options,
            token: CancellationToken::new(),
            progress: None,
        }
    }

    /// Uses a token the caller keeps a clone of.
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// Sends progress updates to `sink` when the job has progress enabled.
    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }
}

/// Task handle of a spawned worker.
pub type WorkerTask = JoinHandle<Result<RefinementResult, PipelineError>>;

/// Per-run cancellation plumbing.
struct RunControl {
    token: Option<CancellationToken>,
    signals: Option<mpsc::Receiver<WorkerSignal>>,
    registration: Option<(CancellationManagerHandle, CancellationHandle)>,
}

impl RunControl {
    fn is_cancelled(&self) -> bool {
        self.token.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    fn drain_signals(&mut self, state: &mut PipelineState, job_id: &str) {
        let Some(signals) = self.signals.as_mut() else {
            return;
        };
        while let Ok(signal) = signals.try_recv() {
            match signal {
                WorkerSignal::MemoryPressure => {
                    let dropped = state.drop_scratch();
                    info!(job_id = %job_id, dropped, "Memory pressure hint received");
                }
            }
        }
    }
}

/// Runs refinement loops over domain configurations.
#[derive(Clone)]
pub struct PipelineCoordinator {
    collaborators: Collaborators,
    defaults: PipelineDefaults,
    required_keys: Vec<String>,
    cancellation: Option<CancellationManagerHandle>,
    memory_probe: Arc<dyn MemoryProbe>,
}

impl PipelineCoordinator {
    /// Creates a coordinator without a cancellation manager.
    pub fn new(collaborators: Collaborators, defaults: PipelineDefaults) -> Self {
        Self {
            collaborators,
            defaults,
            required_keys: DEFAULT_REQUIRED_KEYS.iter().map(|k| k.to_string()).collect(),
            cancellation: None,
            memory_probe: Arc::new(SystemMemoryProbe::new()),
        }
    }

    /// Registers workers with `manager` when cancellation is enabled for a job.
    pub fn with_cancellation(mut self, manager: CancellationManagerHandle) -> Self {
        self.cancellation = Some(manager);
        self
    }

    /// Replaces the probe used for the resource-limit check.
    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.memory_probe = probe;
        self
    }

    /// Sets the keys `run` requires in a payload.
    pub fn with_required_keys<S: Into<String>>(mut self, keys: impl IntoIterator<Item = S>) -> Self {
        self.required_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn defaults(&self) -> &PipelineDefaults {
        &self.defaults
    }

    pub fn cancellation_manager(&self) -> Option<&CancellationManagerHandle> {
        self.cancellation.as_ref()
    }

    /// Runs the full loop and waits for its result.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Validation` for an invalid payload or options,
    /// `PipelineError::Stage` if the initial evaluation fails,
    /// `PipelineError::RefinementRejected` for a first-iteration rejection
    /// under a normal threshold, and `PipelineError::ForceTerminated` if the
    /// worker was aborted.
    pub async fn run(
        &self,
        config: DomainConfig,
        options: &RunOptions,
    ) -> Result<RefinementResult, PipelineError> {
        config.validate_required(&self.required_keys)?;
        let options = options.resolve(&self.defaults)?;
        let job_id = format!("run-{}", Uuid::new_v4());

        let worker = self.spawn_worker(WorkerLaunch::new(job_id, config, options))?;
        match worker.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => Err(PipelineError::ForceTerminated),
            Err(e) => Err(PipelineError::WorkerPanicked(e.to_string())),
        }
    }

    /// Starts the loop in a new task and returns its handle.
    ///
    /// # Errors
    ///
    /// Returns `SpawnError::NoRuntime` when called outside a Tokio runtime.
    pub fn spawn_worker(&self, launch: WorkerLaunch) -> Result<WorkerTask, SpawnError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SpawnError::NoRuntime)?;

        let (abort_tx, abort_rx) = oneshot::channel();
        let coordinator = self.clone();
        let task = runtime.spawn(async move { coordinator.worker_main(launch, abort_rx).await });
        let _ = abort_tx.send(task.abort_handle());

        Ok(task)
    }

    async fn worker_main(
        self,
        launch: WorkerLaunch,
        abort_rx: oneshot::Receiver<AbortHandle>,
    ) -> Result<RefinementResult, PipelineError> {
        let WorkerLaunch {
            job_id,
            config,
            options,
            token,
            progress,
        } = launch;

        let (guard, exit_rx) = ExitGuard::new();
        let mut control = RunControl {
            token: options.enable_cancellation.then(|| token.clone()),
            signals: None,
            registration: None,
        };

        if options.enable_cancellation {
            if let Some(manager) = &self.cancellation {
                let (signal_tx, signal_rx) = signal_channel();
                if let Ok(abort) = abort_rx.await {
                    let worker = WorkerHandle::new(token, abort, exit_rx, signal_tx);
                    match manager.register(job_id.clone(), worker).await {
                        Ok(handle) => {
                            control.signals = Some(signal_rx);
                            control.registration = Some((manager.clone(), handle));
                        }
                        Err(e) => {
                            warn!(job_id = %job_id, error = %e, "Running without cancellation tracking");
                        }
                    }
                }
            }
        }

        let progress = if options.enable_progress { progress } else { None };
        let outcome = self.drive(&job_id, config, options, progress, &mut control).await;

        let exit = match &outcome {
            Ok(result) if result.termination_reason == TerminationReason::Cancelled => {
                WorkerExit::Shutdown
            }
            _ => WorkerExit::Normal,
        };
        guard.finish(exit);
        outcome
    }

    async fn drive(
        &self,
        job_id: &str,
        config: DomainConfig,
        options: RefinementOptions,
        progress: Option<Arc<dyn ProgressSink>>,
        control: &mut RunControl,
    ) -> Result<RefinementResult, PipelineError> {
        let started_at = Instant::now();
        let reporter = ProgressReporter::new(progress, started_at);
        let evaluator = &self.collaborators.evaluator;

        info!(
            job_id = %job_id,
            max_iterations = options.max_iterations,
            quality_threshold = options.quality_threshold,
            "Starting refinement"
        );

        reporter.report(PipelineStage::Evaluating, 0, 0.0);
        let initial = evaluator
            .evaluate(&config)
            .await
            .map_err(|source| PipelineError::Stage {
                stage: PipelineStage::Evaluating,
                source,
            })?;
        debug!(job_id = %job_id, quality = initial.overall, "Initial evaluation");

        let mut state = PipelineState::started_at(config, initial, options, started_at);
        let _heartbeat = self.start_heartbeat(&reporter, control, job_id).await;

        loop {
            state.stage = PipelineStage::IterationCheck;
            control.drain_signals(&mut state, job_id);
            reporter.report(
                PipelineStage::IterationCheck,
                state.iteration_count,
                state.current_quality.overall,
            );
            if let Some(reason) = self.check_termination(&state, control) {
                return Ok(self.finish(job_id, state, reason));
            }

            let iteration = state.iteration_count + 1;
            let iteration_started = Instant::now();

            state.stage = PipelineStage::FeedbackGeneration;
            reporter.report(state.stage, state.iteration_count, state.current_quality.overall);
            let feedback = match evaluator.generate_feedback(&state.current_config).await {
                Ok(feedback) => feedback,
                Err(e) => return Ok(self.stage_failed(job_id, state, e)),
            };
            if control.is_cancelled() {
                return Ok(self.finish(job_id, state, TerminationReason::Cancelled));
            }
            if !feedback.has_actionable_suggestions() {
                debug!(job_id = %job_id, iteration, "No actionable feedback");
                return Ok(self.finish(job_id, state, TerminationReason::NoImprovement));
            }

            state.stage = PipelineStage::Refining;
            reporter.report(state.stage, state.iteration_count, state.current_quality.overall);
            let refined = match self
                .collaborators
                .refiner
                .apply_improvements(&state.current_config, &feedback)
                .await
            {
                Ok(refined) => refined,
                Err(e) => return Ok(self.stage_failed(job_id, state, e)),
            };
            state.scratch_feedback = Some(feedback);
            if control.is_cancelled() {
                return Ok(self.finish(job_id, state, TerminationReason::Cancelled));
            }

            state.stage = PipelineStage::Validating;
            reporter.report(state.stage, state.iteration_count, state.current_quality.overall);
            let report = match self
                .collaborators
                .validator
                .validate_improvements(&state.current_config, &refined)
                .await
            {
                Ok(report) => report,
                Err(e) => return Ok(self.stage_failed(job_id, state, e)),
            };
            if control.is_cancelled() {
                return Ok(self.finish(job_id, state, TerminationReason::Cancelled));
            }

            if !report.is_accepted() {
                info!(
                    job_id = %job_id,
                    iteration,
                    recommendation = %report.recommendation,
                    quality_change = report.quality_change,
                    "Refinement rejected"
                );
                if state.iteration_count == 0 {
                    if state.options.quality_threshold <= self.defaults.low_threshold_cutoff {
                        state.stage = PipelineStage::Terminated;
                        metrics::record_termination(TerminationReason::NoImprovement.as_str());
                        metrics::observe_iterations(0);
                        return Ok(RefinementResult::reverted(
                            state,
                            TerminationReason::NoImprovement,
                        ));
                    }
                    metrics::record_termination("error");
                    return Err(PipelineError::RefinementRejected {
                        quality_change: report.quality_change,
                    });
                }
                let reason = TerminationReason::Error {
                    stage: PipelineStage::Validating,
                    message: format!(
                        "refinement rejected by validator (quality change {:.4})",
                        report.quality_change
                    ),
                };
                return Ok(self.finish(job_id, state, reason));
            }

            state.stage = PipelineStage::Evaluating;
            reporter.report(state.stage, state.iteration_count, state.current_quality.overall);
            let new_quality = match evaluator.evaluate(&refined).await {
                Ok(quality) => quality,
                Err(e) => return Ok(self.stage_failed(job_id, state, e)),
            };
            if control.is_cancelled() {
                return Ok(self.finish(job_id, state, TerminationReason::Cancelled));
            }

            let quality_change = new_quality.overall - state.current_quality.overall;
            if quality_change < self.defaults.min_improvement && report.improved_dimensions.is_empty()
            {
                debug!(
                    job_id = %job_id,
                    iteration,
                    quality_change,
                    "Refinement improved nothing, keeping current configuration"
                );
                return Ok(self.finish(job_id, state, TerminationReason::NoImprovement));
            }

            let metrics = IterationMetrics {
                iteration,
                quality_before: state.current_quality.overall,
                quality_after: new_quality.overall,
                quality_change,
                improved_dimensions: report.improved_dimensions,
                degraded_dimensions: report.degraded_dimensions,
                duration: iteration_started.elapsed(),
            };
            state.apply_iteration(refined, new_quality, metrics);

            info!(
                job_id = %job_id,
                iteration,
                quality = state.current_quality.overall,
                quality_change,
                "Iteration completed"
            );
        }
    }

    /// Termination criteria checked before each iteration, first match wins.
    fn check_termination(&self, state: &PipelineState, control: &RunControl) -> Option<TerminationReason> {
        if control.is_cancelled() {
            return Some(TerminationReason::Cancelled);
        }
        if state.current_quality.overall >= state.options.quality_threshold {
            return Some(TerminationReason::QualityThresholdMet);
        }
        if state.iteration_count >= state.options.max_iterations {
            return Some(TerminationReason::MaxIterationsReached);
        }
        if state.is_stagnant(self.defaults.no_improvement_window, self.defaults.min_improvement) {
            return Some(TerminationReason::NoImprovement);
        }
        if state.elapsed() > state.options.timeout {
            return Some(TerminationReason::TimeoutExceeded);
        }
        if let Some(sample) = self.memory_probe.sample() {
            if sample.fraction() >= self.defaults.memory_limit_fraction {
                warn!(
                    used_fraction = sample.fraction(),
                    limit = self.defaults.memory_limit_fraction,
                    "Memory limit reached"
                );
                return Some(TerminationReason::ResourceLimit);
            }
        }
        None
    }

    async fn start_heartbeat(
        &self,
        reporter: &ProgressReporter,
        control: &RunControl,
        job_id: &str,
    ) -> Option<Heartbeat> {
        let interval = self.defaults.progress_interval?;
        let heartbeat = reporter.start_heartbeat(interval)?;

        if let Some((manager, handle)) = &control.registration {
            let timer = ResourceDescriptor::Timer(heartbeat.abort_handle());
            if let Err(e) = manager.register_resource(*handle, timer).await {
                debug!(job_id = %job_id, error = %e, "Heartbeat not tracked");
            }
        }
        Some(heartbeat)
    }

    fn stage_failed(&self, job_id: &str, state: PipelineState, error: CollaboratorError) -> RefinementResult {
        warn!(job_id = %job_id, stage = %state.stage, error = %error, "Pipeline stage failed");
        let reason = TerminationReason::Error {
            stage: state.stage,
            message: error.to_string(),
        };
        self.finish(job_id, state, reason)
    }

    fn finish(&self, job_id: &str, mut state: PipelineState, reason: TerminationReason) -> RefinementResult {
        state.stage = PipelineStage::Terminated;
        metrics::record_termination(reason.as_str());
        metrics::observe_iterations(state.iteration_count);

        info!(
            job_id = %job_id,
            reason = %reason,
            iterations = state.iteration_count,
            quality = state.current_quality.overall,
            elapsed_ms = state.elapsed().as_millis() as u64,
            "Refinement finished"
        );
        RefinementResult::from_state(state, reason)
    }
}
