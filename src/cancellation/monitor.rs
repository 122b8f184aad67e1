//! System memory sampling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use sysinfo::{MemoryRefreshKind, RefreshKind, System};

/// One memory sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryUsage {
    pub used_bytes: u64,
    pub total_bytes: u64,
}

impl MemoryUsage {
    /// Used/total ratio in `0.0..=1.0`, or 0 when the total is unknown.
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.used_bytes as f64 / self.total_bytes as f64).clamp(0.0, 1.0)
    }
}

/// Source of memory usage samples.
pub trait MemoryProbe: Send + Sync {
    /// Takes a sample, or `None` if memory usage cannot be determined.
    fn sample(&self) -> Option<MemoryUsage>;
}

/// Samples whole-system memory through `sysinfo`.
pub struct SystemMemoryProbe {
    system: Mutex<System>,
}

impl SystemMemoryProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new_with_specifics(
                RefreshKind::nothing().with_memory(MemoryRefreshKind::everything()),
            )),
        }
    }
}

impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn sample(&self) -> Option<MemoryUsage> {
        let mut system = self.system.lock().ok()?;
        system.refresh_memory();
        let total_bytes = system.total_memory();
        if total_bytes == 0 {
            return None;
        }
        Some(MemoryUsage {
            used_bytes: system.used_memory(),
            total_bytes,
        })
    }
}

/// Probe reporting an adjustable fixed fraction. Useful in tests and dry runs.
#[derive(Debug)]
pub struct FixedMemoryProbe {
    fraction_bits: AtomicU64,
}

impl FixedMemoryProbe {
    pub fn new(fraction: f64) -> Self {
        Self {
            fraction_bits: AtomicU64::new(fraction.clamp(0.0, 1.0).to_bits()),
        }
    }

    /// Changes the reported fraction.
    pub fn set(&self, fraction: f64) {
        self.fraction_bits
            .store(fraction.clamp(0.0, 1.0).to_bits(), Ordering::SeqCst);
    }
}

impl MemoryProbe for FixedMemoryProbe {
    fn sample(&self) -> Option<MemoryUsage> {
        const TOTAL: u64 = 1 << 30;
        let fraction = f64::from_bits(self.fraction_bits.load(Ordering::SeqCst));
        Some(MemoryUsage {
            used_bytes: (TOTAL as f64 * fraction) as u64,
            total_bytes: TOTAL,
        })
    }
}
