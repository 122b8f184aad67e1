//! Recording helpers.
//!
//! Every helper is a no-op until [`init_metrics`](super::init_metrics) has
//! run, so library code records unconditionally.

use std::time::Duration;

use super::prometheus::{
    CLEANUP_OUTCOMES, FORCED_TERMINATIONS, JOBS_FINISHED, JOBS_IN_PROGRESS, JOBS_SUBMITTED,
    JOB_DURATION, MEMORY_PRESSURE_EVENTS, PIPELINE_ITERATIONS, QUEUE_DEPTH, TERMINATIONS,
};

/// Records an accepted submission.
pub fn record_job_submitted(priority: &str) {
    if let Some(counter) = JOBS_SUBMITTED.get() {
        counter.with_label_values(&[priority]).inc();
    }
}

/// Records a job reaching a terminal status.
pub fn record_job_finished(status: &str, duration: Duration) {
    if let Some(counter) = JOBS_FINISHED.get() {
        counter.with_label_values(&[status]).inc();
    }
    if let Some(histogram) = JOB_DURATION.get() {
        histogram
            .with_label_values(&[status])
            .observe(duration.as_secs_f64());
    }

    tracing::trace!(
        status = status,
        duration_secs = duration.as_secs_f64(),
        "Recorded job metric"
    );
}

/// Sets the number of queued jobs.
pub fn set_queue_depth(depth: usize) {
    if let Some(gauge) = QUEUE_DEPTH.get() {
        gauge.set(depth as f64);
    }
}

/// Sets the number of processing jobs.
pub fn set_jobs_in_progress(count: usize) {
    if let Some(gauge) = JOBS_IN_PROGRESS.get() {
        gauge.set(count as f64);
    }
}

/// Records the iteration count of a finished run.
pub fn observe_iterations(iterations: u32) {
    if let Some(histogram) = PIPELINE_ITERATIONS.get() {
        histogram.observe(f64::from(iterations));
    }
}

/// Records why a run stopped.
pub fn record_termination(reason: &str) {
    if let Some(counter) = TERMINATIONS.get() {
        counter.with_label_values(&[reason]).inc();
    }
}

/// Records how a final cleanup run ended: `completed`, `timed_out` or `error`.
pub fn record_cleanup_outcome(outcome: &str) {
    if let Some(counter) = CLEANUP_OUTCOMES.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

pub fn record_forced_termination() {
    if let Some(counter) = FORCED_TERMINATIONS.get() {
        counter.inc();
    }
}

pub fn record_memory_pressure() {
    if let Some(counter) = MEMORY_PRESSURE_EVENTS.get() {
        counter.inc();
    }
}
