//! Worker-side plumbing for cooperative cancellation.
//!
//! A worker registered with the manager hands over a [`WorkerHandle`]:
//! the cancellation token it polls at checkpoints, an abort handle for
//! forced termination, the receiving end of its [`ExitGuard`] and a channel
//! for runtime hints.

use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

/// Capacity of the per-worker hint channel.
pub const SIGNAL_CHANNEL_CAPACITY: usize = 8;

/// How a worker task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Ran to completion.
    Normal,
    /// Stopped early after observing a cancellation checkpoint.
    Shutdown,
    /// Dropped without finishing, usually because the task was aborted.
    Aborted,
    /// Unwound from a panic.
    Panicked,
}

impl WorkerExit {
    /// Returns true for exits the worker reported itself.
    pub fn is_clean(&self) -> bool {
        matches!(self, WorkerExit::Normal | WorkerExit::Shutdown)
    }
}

/// Hints the manager sends to running workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerSignal {
    /// System memory crossed the configured threshold; drop cached data.
    MemoryPressure,
}

/// Reports a worker's exit kind exactly once.
///
/// `finish` reports a clean exit. If the guard is dropped instead (the task
/// was aborted or panicked) the drop reports `Aborted` or `Panicked`.
#[derive(Debug)]
pub struct ExitGuard {
    tx: Option<oneshot::Sender<WorkerExit>>,
}

impl ExitGuard {
    /// Creates a guard and the receiver the manager watches.
    pub fn new() -> (Self, oneshot::Receiver<WorkerExit>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Reports a clean exit.
    pub fn finish(mut self, exit: WorkerExit) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(exit);
        }
    }
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let exit = if std::thread::panicking() {
                WorkerExit::Panicked
            } else {
                WorkerExit::Aborted
            };
            let _ = tx.send(exit);
        }
    }
}

/// Everything the manager needs to control one worker.
#[derive(Debug)]
pub struct WorkerHandle {
    pub token: CancellationToken,
    pub abort: AbortHandle,
    pub exit: oneshot::Receiver<WorkerExit>,
    pub signals: mpsc::Sender<WorkerSignal>,
}

impl WorkerHandle {
    /// Bundles the control surfaces of a worker.
    pub fn new(
        token: CancellationToken,
        abort: AbortHandle,
        exit: oneshot::Receiver<WorkerExit>,
        signals: mpsc::Sender<WorkerSignal>,
    ) -> Self {
        Self {
            token,
            abort,
            exit,
            signals,
        }
    }
}

/// Creates the hint channel for a worker.
pub fn signal_channel() -> (mpsc::Sender<WorkerSignal>, mpsc::Receiver<WorkerSignal>) {
    mpsc::channel(SIGNAL_CHANNEL_CAPACITY)
}
