//! Per-job resource registry.
//!
//! Every resource a job acquires can be registered under its kind so that
//! cleanup can release it no matter how the job ends.

use std::any::Any;
use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::process::Child;
use tokio::task::AbortHandle;

/// Caller-supplied cleanup step, run after every tracked resource is released.
pub type CleanupCallback = Box<dyn FnOnce() -> Result<(), String> + Send>;

/// Kinds of tracked resources, in release order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Process,
    Memory,
    File,
    Network,
    Timer,
    Monitor,
    Callback,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResourceKind::Process => "process",
            ResourceKind::Memory => "memory",
            ResourceKind::File => "file",
            ResourceKind::Network => "network",
            ResourceKind::Timer => "timer",
            ResourceKind::Monitor => "monitor",
            ResourceKind::Callback => "callback",
        };
        write!(f, "{}", name)
    }
}

/// A resource held by a job.
pub enum ResourceDescriptor {
    /// Child process, killed if still running.
    Process(Child),
    /// In-memory table, released by dropping it.
    Memory {
        label: String,
        table: Box<dyn Any + Send>,
    },
    /// Temporary file, deleted if present.
    File(PathBuf),
    /// Network connection, shut down and closed.
    Network(TcpStream),
    /// Timer task, aborted.
    Timer(AbortHandle),
    /// Termination-watch task, aborted.
    Monitor(AbortHandle),
    /// Arbitrary cleanup step.
    Callback {
        label: String,
        callback: CleanupCallback,
    },
}

impl ResourceDescriptor {
    /// Wraps an in-memory value.
    pub fn memory(label: impl Into<String>, table: impl Any + Send) -> Self {
        ResourceDescriptor::Memory {
            label: label.into(),
            table: Box::new(table),
        }
    }

    /// Wraps a file path.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        ResourceDescriptor::File(path.into())
    }

    /// Wraps a cleanup callback.
    pub fn callback<F>(label: impl Into<String>, callback: F) -> Self
    where
        F: FnOnce() -> Result<(), String> + Send + 'static,
    {
        ResourceDescriptor::Callback {
            label: label.into(),
            callback: Box::new(callback),
        }
    }

    /// The kind this descriptor is tracked under.
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceDescriptor::Process(_) => ResourceKind::Process,
            ResourceDescriptor::Memory { .. } => ResourceKind::Memory,
            ResourceDescriptor::File(_) => ResourceKind::File,
            ResourceDescriptor::Network(_) => ResourceKind::Network,
            ResourceDescriptor::Timer(_) => ResourceKind::Timer,
            ResourceDescriptor::Monitor(_) => ResourceKind::Monitor,
            ResourceDescriptor::Callback { .. } => ResourceKind::Callback,
        }
    }
}

impl std::fmt::Debug for ResourceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceDescriptor::Process(child) => {
                f.debug_tuple("Process").field(&child.id()).finish()
            }
            ResourceDescriptor::Memory { label, .. } => {
                f.debug_struct("Memory").field("label", label).finish()
            }
            ResourceDescriptor::File(path) => f.debug_tuple("File").field(path).finish(),
            ResourceDescriptor::Network(stream) => f
                .debug_tuple("Network")
                .field(&stream.peer_addr().ok())
                .finish(),
            ResourceDescriptor::Timer(handle) => f.debug_tuple("Timer").field(&handle.id()).finish(),
            ResourceDescriptor::Monitor(handle) => {
                f.debug_tuple("Monitor").field(&handle.id()).finish()
            }
            ResourceDescriptor::Callback { label, .. } => {
                f.debug_struct("Callback").field("label", label).finish()
            }
        }
    }
}

/// Resources tracked for one job, grouped by kind.
#[derive(Debug, Default)]
pub struct ResourceRegistry {
    entries: BTreeMap<ResourceKind, Vec<ResourceDescriptor>>,
}

impl ResourceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a descriptor under its kind.
    pub fn register(&mut self, descriptor: ResourceDescriptor) {
        self.entries
            .entry(descriptor.kind())
            .or_default()
            .push(descriptor);
    }

    /// Moves every tracked descriptor out, leaving the registry empty.
    ///
    /// A descriptor is handed out at most once, which keeps release idempotent.
    pub fn take(&mut self) -> ResourceRegistry {
        std::mem::take(self)
    }

    /// Number of descriptors per kind.
    pub fn counts(&self) -> BTreeMap<ResourceKind, usize> {
        self.entries
            .iter()
            .map(|(kind, items)| (*kind, items.len()))
            .collect()
    }

    /// Total number of descriptors.
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// Returns true if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consumes the registry, yielding groups in release order.
    pub fn into_groups(self) -> impl Iterator<Item = (ResourceKind, Vec<ResourceDescriptor>)> {
        self.entries.into_iter()
    }
}
