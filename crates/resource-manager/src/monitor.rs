//! Host memory monitoring
//!
//! Sizes the default budget from physical memory and, optionally, polls
//! available memory to raise pressure signals on the memory manager.

use std::sync::Arc;
use std::time::Duration;
use parking_lot::Mutex;
use sysinfo::{System, SystemExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::utils::format_bytes;
use runtime_config::MemoryConfiguration;

use crate::memory::MemoryManager;

/// Source of host memory figures
pub trait MemoryProbe: Send + Sync {
    /// Total physical memory in bytes
    fn total_memory(&self) -> u64;

    /// Memory currently available to new allocations, in bytes
    fn available_memory(&self) -> u64;
}

/// Memory probe backed by `sysinfo`
pub struct SystemMemoryProbe {
    system: Mutex<System>,
}

impl SystemMemoryProbe {
    /// Creates a probe with a fresh memory snapshot
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn total_memory(&self) -> u64 {
        self.system.lock().total_memory()
    }

    fn available_memory(&self) -> u64 {
        let mut system = self.system.lock();
        system.refresh_memory();
        system.available_memory()
    }
}

/// Resolves the memory ceiling: the configured value, or a share of physical memory
pub fn resolve_ceiling(config: &MemoryConfiguration) -> u64 {
    resolve_ceiling_with(config, &SystemMemoryProbe::new())
}

/// Same as [`resolve_ceiling`] with an explicit probe
pub fn resolve_ceiling_with(config: &MemoryConfiguration, probe: &dyn MemoryProbe) -> u64 {
    if config.ceiling > 0 {
        return config.ceiling;
    }

    let total = probe.total_memory();
    let ceiling = (total as f64 * config.ceiling_percent.clamp(0.0, 100.0) / 100.0) as u64;
    info!(
        "Memory ceiling set to {} ({}% of {})",
        format_bytes(ceiling),
        config.ceiling_percent,
        format_bytes(total)
    );
    ceiling
}

/// Polls host memory and signals the manager when availability drops below a threshold
pub struct PressureWatch {
    probe: Arc<dyn MemoryProbe>,
    manager: MemoryManager,
    /// Available bytes below which a pressure signal is raised
    threshold: u64,
    interval: Duration,
}

impl PressureWatch {
    /// Creates a watch; nothing runs until [`PressureWatch::spawn`]
    pub fn new(probe: Arc<dyn MemoryProbe>, manager: MemoryManager, threshold: u64, interval: Duration) -> Self {
        Self {
            probe,
            manager,
            threshold,
            interval,
        }
    }

    /// Checks once, returning the evicted model ids
    pub fn check(&self) -> Vec<String> {
        let available = self.probe.available_memory();
        if available >= self.threshold {
            return Vec::new();
        }

        warn!(
            "Host memory low: {} available, threshold {}",
            format_bytes(available),
            format_bytes(self.threshold)
        );
        self.manager.on_pressure_signal()
    }

    /// Runs the polling loop until `shutdown` is cancelled
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Pressure watch stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.check();
                    }
                }
            }
        })
    }
}
