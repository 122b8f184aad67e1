//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by the refinery and
//! provides functions for initializing, registering, and exporting them.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all refinery metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Jobs accepted by the queue, labeled by priority.
pub static JOBS_SUBMITTED: OnceLock<CounterVec> = OnceLock::new();

/// Jobs that reached a terminal status, labeled by status.
pub static JOBS_FINISHED: OnceLock<CounterVec> = OnceLock::new();

/// Job duration in seconds from admission to terminal status, labeled by status.
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Number of jobs waiting for admission.
pub static QUEUE_DEPTH: OnceLock<Gauge> = OnceLock::new();

/// Number of jobs currently being processed.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Completed refinement iterations per run.
pub static PIPELINE_ITERATIONS: OnceLock<Histogram> = OnceLock::new();

/// Pipeline terminations, labeled by reason.
pub static TERMINATIONS: OnceLock<CounterVec> = OnceLock::new();

/// Final cleanup runs, labeled by outcome.
pub static CLEANUP_OUTCOMES: OnceLock<CounterVec> = OnceLock::new();

/// Workers aborted by the cancellation manager.
pub static FORCED_TERMINATIONS: OnceLock<Counter> = OnceLock::new();

/// Memory-pressure hints broadcast to workers.
pub static MEMORY_PRESSURE_EVENTS: OnceLock<Counter> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Later calls leave the first registry in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    // Queue metrics
    let jobs_submitted = CounterVec::new(
        Opts::new("refinery_jobs_submitted_total", "Jobs accepted by the queue"),
        &["priority"],
    )?;

    let jobs_finished = CounterVec::new(
        Opts::new(
            "refinery_jobs_finished_total",
            "Jobs that reached a terminal status",
        ),
        &["status"],
    )?;

    let job_duration = HistogramVec::new(
        HistogramOpts::new("refinery_job_duration_seconds", "Job duration in seconds")
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
        &["status"],
    )?;

    let queue_depth = Gauge::new("refinery_queue_depth", "Number of jobs waiting for admission")?;

    let jobs_in_progress = Gauge::new(
        "refinery_jobs_in_progress",
        "Number of jobs currently being processed",
    )?;

    // Pipeline metrics
    let pipeline_iterations = Histogram::with_opts(
        HistogramOpts::new(
            "refinery_pipeline_iterations",
            "Completed refinement iterations per run",
        )
        .buckets(vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]),
    )?;

    let terminations = CounterVec::new(
        Opts::new(
            "refinery_pipeline_terminations_total",
            "Pipeline terminations by reason",
        ),
        &["reason"],
    )?;

    // Cancellation metrics
    let cleanup_outcomes = CounterVec::new(
        Opts::new("refinery_cleanup_runs_total", "Final cleanup runs by outcome"),
        &["outcome"],
    )?;

    let forced_terminations = Counter::new(
        "refinery_forced_terminations_total",
        "Workers aborted after ignoring cancellation",
    )?;

    let memory_pressure_events = Counter::new(
        "refinery_memory_pressure_events_total",
        "Memory-pressure hints broadcast to workers",
    )?;

    registry.register(Box::new(jobs_submitted.clone()))?;
    registry.register(Box::new(jobs_finished.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(pipeline_iterations.clone()))?;
    registry.register(Box::new(terminations.clone()))?;
    registry.register(Box::new(cleanup_outcomes.clone()))?;
    registry.register(Box::new(forced_terminations.clone()))?;
    registry.register(Box::new(memory_pressure_events.clone()))?;

    // If any of these fail, another thread initialized first
    let _ = REGISTRY.set(registry);
    let _ = JOBS_SUBMITTED.set(jobs_submitted);
    let _ = JOBS_FINISHED.set(jobs_finished);
    let _ = JOB_DURATION.set(job_duration);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = PIPELINE_ITERATIONS.set(pipeline_iterations);
    let _ = TERMINATIONS.set(terminations);
    let _ = CLEANUP_OUTCOMES.set(cleanup_outcomes);
    let _ = FORCED_TERMINATIONS.set(forced_terminations);
    let _ = MEMORY_PRESSURE_EVENTS.set(memory_pressure_events);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead if the registry has not been initialized
/// or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
