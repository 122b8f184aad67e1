//! Progress reporting for running jobs.
//!
//! A coordinator reports a [`ProgressUpdate`] at every stage boundary. When a
//! heartbeat interval is configured, a background task re-sends the latest
//! update periodically so long collaborator calls still show signs of life.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};

use crate::config::duration_ms;

use super::state::PipelineStage;

/// Snapshot of where a job is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub stage: PipelineStage,
    /// Completed iterations.
    pub iteration: u32,
    pub current_quality: f64,
    #[serde(with = "duration_ms", rename = "elapsed_ms")]
    pub elapsed: Duration,
}

/// Destination for progress updates.
pub trait ProgressSink: Send + Sync {
    fn report(&self, update: ProgressUpdate);
}

/// Forwards updates into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelProgressSink {
    tx: mpsc::UnboundedSender<ProgressUpdate>,
}

impl ChannelProgressSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelProgressSink {
    fn report(&self, update: ProgressUpdate) {
        let _ = self.tx.send(update);
    }
}

/// Per-run reporter remembering the latest update.
pub(crate) struct ProgressReporter {
    sink: Option<Arc<dyn ProgressSink>>,
    latest: Arc<Mutex<Option<ProgressUpdate>>>,
    started_at: Instant,
}

impl ProgressReporter {
    pub fn new(sink: Option<Arc<dyn ProgressSink>>, started_at: Instant) -> Self {
        Self {
            sink,
            latest: Arc::new(Mutex::new(None)),
            started_at,
        }
    }

    pub fn report(&self, stage: PipelineStage, iteration: u32, current_quality: f64) {
        let Some(sink) = &self.sink else {
            return;
        };
        let update = ProgressUpdate {
            stage,
            iteration,
            current_quality,
            elapsed: self.started_at.elapsed(),
        };
        if let Ok(mut latest) = self.latest.lock() {
            *latest = Some(update.clone());
        }
        sink.report(update);
    }

    /// Starts a heartbeat re-sending the latest update every `interval`.
    pub fn start_heartbeat(&self, interval: Duration) -> Option<Heartbeat> {
        let sink = self.sink.clone()?;
        let latest = Arc::clone(&self.latest);
        let started_at = self.started_at;

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // skip the immediate first tick

            loop {
                tick.tick().await;
                let update = latest.lock().ok().and_then(|guard| guard.clone());
                if let Some(mut update) = update {
                    update.elapsed = started_at.elapsed();
                    sink.report(update);
                }
            }
        });

        Some(Heartbeat { handle })
    }
}

/// Background heartbeat task. Stops when dropped.
pub(crate) struct Heartbeat {
    handle: JoinHandle<()>,
}

impl Heartbeat {
    pub fn abort_handle(&self) -> AbortHandle {
        self.handle.abort_handle()
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_report_forwards_to_sink() {
        let (sink, mut rx) = ChannelProgressSink::new();
        let reporter = ProgressReporter::new(Some(Arc::new(sink)), Instant::now());

        reporter.report(PipelineStage::Refining, 1, 0.6);

        let update = rx.recv().await.expect("update");
        assert_eq!(update.stage, PipelineStage::Refining);
        assert_eq!(update.iteration, 1);
        assert_eq!(update.current_quality, 0.6);
    }

    #[tokio::test]
    async fn test_reporter_without_sink_is_silent() {
        let reporter = ProgressReporter::new(None, Instant::now());
        reporter.report(PipelineStage::Evaluating, 0, 0.1);
        assert!(reporter.start_heartbeat(Duration::from_millis(10)).is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_resends_latest_update() {
        let (sink, mut rx) = ChannelProgressSink::new();
        let reporter = ProgressReporter::new(Some(Arc::new(sink)), Instant::now());
        reporter.report(PipelineStage::Validating, 2, 0.8);
        let _ = rx.recv().await;

        let heartbeat = reporter
            .start_heartbeat(Duration::from_millis(10))
            .expect("heartbeat");
        let update = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("heartbeat fires")
            .expect("update");
        assert_eq!(update.stage, PipelineStage::Validating);
        assert_eq!(update.iteration, 2);

        let abort = heartbeat.abort_handle();
        drop(heartbeat);
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(abort.is_finished());
    }
}
