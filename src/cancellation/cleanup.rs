//! Resource release.
//!
//! Resources are released kind by kind in a fixed order (processes, memory
//! tables, files, network connections, timers, monitors) and cleanup callbacks
//! run last. A failure on one item is recorded and never stops the rest.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::resources::{CleanupCallback, ResourceDescriptor, ResourceKind, ResourceRegistry};

/// How long a killed process gets to be reaped.
const PROCESS_REAP_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-kind release counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindReport {
    /// Items that were actively released.
    pub released: usize,
    /// Items that needed no action (process already exited, file already gone).
    pub skipped: usize,
    /// Items whose release failed.
    pub failed: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl KindReport {
    fn record(&mut self, outcome: Result<Release, String>) {
        match outcome {
            Ok(Release::Released) => self.released += 1,
            Ok(Release::Skipped) => self.skipped += 1,
            Err(e) => {
                self.failed += 1;
                self.errors.push(e);
            }
        }
    }

    fn merge(&mut self, other: KindReport) {
        self.released += other.released;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.errors.extend(other.errors);
    }
}

/// Outcome of one cleanup callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackOutcome {
    pub label: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Summary of one or more cleanup runs for a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub kinds: BTreeMap<ResourceKind, KindReport>,
    pub callbacks: Vec<CallbackOutcome>,
    /// Set when a run hit the cleanup timeout and was abandoned.
    pub timed_out: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl CleanupReport {
    fn empty() -> Self {
        let now = Utc::now();
        Self {
            kinds: BTreeMap::new(),
            callbacks: Vec::new(),
            timed_out: false,
            started_at: now,
            finished_at: now,
        }
    }

    /// Report for a run that was abandoned at the timeout.
    pub fn timed_out(started_at: DateTime<Utc>) -> Self {
        Self {
            timed_out: true,
            started_at,
            ..Self::empty()
        }
    }

    /// Number of items released across all kinds.
    pub fn total_released(&self) -> usize {
        self.kinds.values().map(|k| k.released).sum()
    }

    /// Number of failed items and callbacks.
    pub fn total_failed(&self) -> usize {
        self.kinds.values().map(|k| k.failed).sum::<usize>()
            + self.callbacks.iter().filter(|c| !c.success).count()
    }

    /// True if every run finished in time and nothing failed.
    pub fn is_clean(&self) -> bool {
        !self.timed_out && self.total_failed() == 0
    }

    /// Counters for one kind.
    pub fn kind(&self, kind: ResourceKind) -> Option<&KindReport> {
        self.kinds.get(&kind)
    }

    /// Folds a later run into this report.
    pub fn merge(&mut self, other: CleanupReport) {
        for (kind, report) in other.kinds {
            self.kinds.entry(kind).or_default().merge(report);
        }
        self.callbacks.extend(other.callbacks);
        self.timed_out |= other.timed_out;
        self.finished_at = self.finished_at.max(other.finished_at);
    }
}

enum Release {
    Released,
    Skipped,
}

enum ItemOutcome {
    Resource(Result<Release, String>),
    Callback(CallbackOutcome),
}

/// Releases every resource in `registry`.
pub async fn release_all(registry: ResourceRegistry) -> CleanupReport {
    let mut report = CleanupReport::empty();

    for (kind, items) in registry.into_groups() {
        let outcomes = if kind == ResourceKind::Callback {
            // Callbacks run one at a time, in registration order.
            let mut outcomes = Vec::with_capacity(items.len());
            for item in items {
                outcomes.push(release_one(item).await);
            }
            outcomes
        } else {
            // Kinds are released in order; items of one kind concurrently.
            futures::future::join_all(items.into_iter().map(release_one)).await
        };

        let mut kind_report = KindReport::default();
        for outcome in outcomes {
            match outcome {
                ItemOutcome::Resource(result) => kind_report.record(result),
                ItemOutcome::Callback(callback) => report.callbacks.push(callback),
            }
        }
        if kind != ResourceKind::Callback {
            debug!(
                kind = %kind,
                released = kind_report.released,
                failed = kind_report.failed,
                "Released resources"
            );
            report.kinds.insert(kind, kind_report);
        }
    }

    report.finished_at = Utc::now();
    report
}

async fn release_one(descriptor: ResourceDescriptor) -> ItemOutcome {
    let result = match descriptor {
        ResourceDescriptor::Process(mut child) => match child.try_wait() {
            Ok(Some(_)) => Ok(Release::Skipped),
            Ok(None) => match child.start_kill() {
                Ok(()) => {
                    let _ = tokio::time::timeout(PROCESS_REAP_TIMEOUT, child.wait()).await;
                    Ok(Release::Released)
                }
                Err(e) => Err(format!("failed to kill process: {e}")),
            },
            Err(e) => Err(format!("failed to query process: {e}")),
        },
        ResourceDescriptor::Memory { label, table } => {
            debug!(label = %label, "Dropping memory table");
            drop(table);
            Ok(Release::Released)
        }
        ResourceDescriptor::File(path) => match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(Release::Released),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Release::Skipped),
            Err(e) => Err(format!("failed to remove {}: {e}", path.display())),
        },
        ResourceDescriptor::Network(mut stream) => stream
            .shutdown()
            .await
            .map(|()| Release::Released)
            .map_err(|e| format!("failed to close connection: {e}")),
        ResourceDescriptor::Timer(handle) | ResourceDescriptor::Monitor(handle) => {
            if handle.is_finished() {
                Ok(Release::Skipped)
            } else {
                handle.abort();
                Ok(Release::Released)
            }
        }
        ResourceDescriptor::Callback { label, callback } => {
            return ItemOutcome::Callback(run_callback(label, callback).await);
        }
    };
    ItemOutcome::Resource(result)
}

/// Runs a callback on the blocking pool so a slow one cannot stall the
/// runtime or outlive an abandoned cleanup run on an async worker.
async fn run_callback(label: String, callback: CleanupCallback) -> CallbackOutcome {
    let result = match tokio::task::spawn_blocking(callback).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err("callback panicked".to_string()),
        Err(e) => Err(format!("callback did not run: {e}")),
    };

    match result {
        Ok(()) => CallbackOutcome {
            label,
            success: true,
            error: None,
        },
        Err(e) => {
            warn!(label = %label, error = %e, "Cleanup callback failed");
            CallbackOutcome {
                label,
                success: false,
                error: Some(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn test_release_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let present = dir.path().join("scratch.json");
        std::fs::write(&present, "{}").expect("write");
        let missing = dir.path().join("missing.json");

        let mut registry = ResourceRegistry::new();
        registry.register(ResourceDescriptor::file(&present));
        registry.register(ResourceDescriptor::file(&missing));

        let report = release_all(registry).await;
        let files = report.kind(ResourceKind::File).expect("file report");
        assert_eq!(files.released, 1);
        assert_eq!(files.skipped, 1);
        assert!(!present.exists());
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_callbacks_run_last_and_failures_are_isolated() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let ran = Arc::new(AtomicUsize::new(0));

        let mut registry = ResourceRegistry::new();
        {
            let order = Arc::clone(&order);
            registry.register(ResourceDescriptor::callback("first", move || {
                order.lock().expect("lock").push("first");
                Err("disk busy".to_string())
            }));
        }
        registry.register(ResourceDescriptor::callback("panics", || panic!("boom")));
        {
            let ran = Arc::clone(&ran);
            registry.register(ResourceDescriptor::callback("last", move || {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }
        let timer = tokio::spawn(std::future::pending::<()>());
        registry.register(ResourceDescriptor::Timer(timer.abort_handle()));

        let report = release_all(registry).await;

        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(report.callbacks.len(), 3);
        assert!(!report.callbacks[0].success);
        assert_eq!(report.callbacks[0].error.as_deref(), Some("disk busy"));
        assert!(!report.callbacks[1].success);
        assert!(report.callbacks[2].success);
        assert_eq!(report.total_failed(), 2);
        assert!(!report.is_clean());
        assert_eq!(
            report.kind(ResourceKind::Timer).map(|k| k.released),
            Some(1)
        );
        assert!(timer.await.expect_err("aborted").is_cancelled());
    }

    #[tokio::test]
    async fn test_release_network_and_memory() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let stream = tokio::net::TcpStream::connect(addr).await.expect("connect");

        let mut registry = ResourceRegistry::new();
        registry.register(ResourceDescriptor::Network(stream));
        registry.register(ResourceDescriptor::memory("scores", vec![0.5f64; 64]));

        let report = release_all(registry).await;
        assert_eq!(
            report.kind(ResourceKind::Network).map(|k| k.released),
            Some(1)
        );
        assert_eq!(
            report.kind(ResourceKind::Memory).map(|k| k.released),
            Some(1)
        );
        assert_eq!(report.total_released(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_release_kills_running_process() {
        let child = tokio::process::Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .expect("spawn sleep");

        let mut registry = ResourceRegistry::new();
        registry.register(ResourceDescriptor::Process(child));

        let report = release_all(registry).await;
        assert_eq!(
            report.kind(ResourceKind::Process).map(|k| k.released),
            Some(1)
        );
    }

    #[test]
    fn test_merge_reports() {
        let mut first = CleanupReport::empty();
        first.kinds.insert(
            ResourceKind::File,
            KindReport {
                released: 1,
                ..Default::default()
            },
        );
        let mut second = CleanupReport::timed_out(Utc::now());
        second.kinds.insert(
            ResourceKind::File,
            KindReport {
                released: 2,
                ..Default::default()
            },
        );

        first.merge(second);
        assert_eq!(first.total_released(), 3);
        assert!(first.timed_out);
    }
}
