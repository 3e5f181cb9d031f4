//! Process memory sampling.
//!
//! [`MemoryMonitor`] reads this process's resident and virtual size plus host
//! memory totals through `sysinfo`. The periodic loop driving it is owned by
//! [`AppState`](crate::state::AppState) so it stops with the rest of the
//! background work on shutdown.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sysinfo::{Pid, ProcessExt, System, SystemExt};
use tracing::{info, warn};

use crate::metrics;

const MIB: u64 = 1024 * 1024;

/// One memory reading. All sizes are in bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemorySample {
    pub process_resident_bytes: u64,
    pub process_virtual_bytes: u64,
    pub system_used_bytes: u64,
    pub system_total_bytes: u64,
    pub sampled_at: DateTime<Utc>,
}

/// Stateful sampler; keeps the `sysinfo` handle between readings.
pub struct MemoryMonitor {
    system: System,
    pid: Option<Pid>,
}

impl MemoryMonitor {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!(error = %e, "Cannot determine own PID, process memory will read as zero");
                None
            }
        };

        Self {
            system: System::new(),
            pid,
        }
    }

    /// Take a reading without logging or publishing it.
    pub fn sample(&mut self) -> MemorySample {
        self.system.refresh_memory();

        let (resident, virtual_size) = match self.pid {
            Some(pid) if self.system.refresh_process(pid) => self
                .system
                .process(pid)
                .map(|p| (p.memory(), p.virtual_memory()))
                .unwrap_or_default(),
            _ => (0, 0),
        };

        MemorySample {
            process_resident_bytes: resident,
            process_virtual_bytes: virtual_size,
            system_used_bytes: self.system.used_memory(),
            system_total_bytes: self.system.total_memory(),
            sampled_at: Utc::now(),
        }
    }

    /// Take a reading, log it and update the memory gauges.
    pub fn record(&mut self) -> MemorySample {
        let sample = self.sample();

        info!(
            rss_mb = sample.process_resident_bytes / MIB,
            virtual_mb = sample.process_virtual_bytes / MIB,
            system_used_mb = sample.system_used_bytes / MIB,
            system_total_mb = sample.system_total_bytes / MIB,
            "Memory usage"
        );
        metrics::set_memory_gauges(&sample);

        sample
    }
}

impl Default for MemoryMonitor {
    fn default() -> Self {
        Self::new()
    }
}
