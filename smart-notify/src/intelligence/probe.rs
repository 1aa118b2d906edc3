//! Host resource sampling.

use parking_lot::Mutex;
use sysinfo::{CpuRefreshKind, Disks, MemoryRefreshKind, RefreshKind, System};

use super::state::SystemHealth;

/// Source of host health samples.
pub trait SystemProbe: Send + Sync {
    /// Current host usage. `last_check` is left for the caller to stamp.
    fn sample(&self) -> SystemHealth;
}

/// Reads CPU, memory and disk usage through `sysinfo`.
pub struct SysinfoProbe {
    system: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new_with_specifics(
                RefreshKind::nothing()
                    .with_cpu(CpuRefreshKind::everything())
                    .with_memory(MemoryRefreshKind::everything()),
            )),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProbe for SysinfoProbe {
    fn sample(&self) -> SystemHealth {
        let (cpu_usage, memory_usage) = {
            let mut system = self.system.lock();
            system.refresh_cpu_all();
            system.refresh_memory();

            let total = system.total_memory();
            let memory = if total > 0 {
                system.used_memory() as f64 / total as f64 * 100.0
            } else {
                0.0
            };
            (system.global_cpu_usage() as f64, memory)
        };

        SystemHealth {
            cpu_usage,
            memory_usage,
            disk_usage: fullest_disk_usage(),
            temperature: 0.0,
            load_average: System::load_average().one,
            uptime_secs: System::uptime(),
            last_check: None,
        }
    }
}

/// Usage percent of the fullest mounted disk.
fn fullest_disk_usage() -> f64 {
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| disk.total_space() > 0)
        .map(|disk| {
            let used = disk.total_space().saturating_sub(disk.available_space());
            used as f64 / disk.total_space() as f64 * 100.0
        })
        .fold(0.0, f64::max)
}
