//! Host load sampling for load-aware task admission

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::{Networks, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{debug, trace};

/// Busy thresholds in percent
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoadThresholds {
    pub cpu_percent: f32,
    pub memory_percent: f32,
}

impl Default for LoadThresholds {
    fn default() -> Self {
        Self {
            cpu_percent: 80.0,
            memory_percent: 85.0,
        }
    }
}

/// One observation of host load
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SystemLoadSample {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    /// Bytes read and written by this process
    pub disk_io_bytes: u64,
    /// Bytes received and transmitted across all interfaces
    pub network_io_bytes: u64,
}

impl SystemLoadSample {
    /// Moderate load reported where the host cannot be inspected
    pub const UNKNOWN: SystemLoadSample = SystemLoadSample {
        cpu_percent: 50.0,
        memory_percent: 50.0,
        disk_io_bytes: 0,
        network_io_bytes: 0,
    };

    pub fn exceeds(&self, thresholds: &LoadThresholds) -> bool {
        self.cpu_percent > thresholds.cpu_percent || self.memory_percent > thresholds.memory_percent
    }

    /// Fraction of headroom left on the more loaded of CPU and memory (0..=1)
    pub fn available_capacity(&self) -> f64 {
        let cpu_free = 1.0 - f64::from(self.cpu_percent) / 100.0;
        let mem_free = 1.0 - f64::from(self.memory_percent) / 100.0;
        cpu_free.min(mem_free).clamp(0.0, 1.0)
    }
}

enum Source {
    Host(Mutex<System>),
    Fixed(SystemLoadSample),
}

/// Reports current host load against busy thresholds
pub struct LoadMonitor {
    source: Source,
    thresholds: LoadThresholds,
}

impl LoadMonitor {
    /// Monitor backed by the real host
    pub fn new(thresholds: LoadThresholds) -> Self {
        let source = if sysinfo::IS_SUPPORTED_SYSTEM {
            let mut sys = System::new_all();
            sys.refresh_all();
            Source::Host(Mutex::new(sys))
        } else {
            debug!("Host load inspection unsupported, reporting moderate load");
            Source::Fixed(SystemLoadSample::UNKNOWN)
        };

        Self { source, thresholds }
    }

    /// Monitor that always reports `sample`
    pub fn fixed(sample: SystemLoadSample, thresholds: LoadThresholds) -> Self {
        Self {
            source: Source::Fixed(sample),
            thresholds,
        }
    }

    pub fn thresholds(&self) -> LoadThresholds {
        self.thresholds
    }

    /// Take a fresh sample
    pub fn sample(&self) -> SystemLoadSample {
        let sys = match &self.source {
            Source::Fixed(sample) => return *sample,
            Source::Host(sys) => sys,
        };

        let mut sys = sys.lock();
        sys.refresh_cpu_all();
        sys.refresh_memory();

        let memory_total = sys.total_memory();
        if memory_total == 0 {
            return SystemLoadSample::UNKNOWN;
        }
        let memory_percent = (sys.used_memory() as f64 / memory_total as f64 * 100.0) as f32;

        // Only this process, for its disk counters
        let disk_io_bytes = match sysinfo::get_current_pid() {
            Ok(pid) => {
                sys.refresh_processes_specifics(
                    ProcessesToUpdate::Some(&[pid]),
                    false,
                    ProcessRefreshKind::new().with_disk_usage(),
                );
                sys.process(pid)
                    .map(|process| {
                        let usage = process.disk_usage();
                        usage.total_read_bytes + usage.total_written_bytes
                    })
                    .unwrap_or(0)
            }
            Err(_) => 0,
        };

        let networks = Networks::new_with_refreshed_list();
        let network_io_bytes = networks
            .iter()
            .map(|(_, data)| data.total_received() + data.total_transmitted())
            .sum();

        let sample = SystemLoadSample {
            cpu_percent: sys.global_cpu_usage(),
            memory_percent,
            disk_io_bytes,
            network_io_bytes,
        };
        trace!(?sample, "Sampled host load");
        sample
    }

    /// CPU or memory above its threshold
    pub fn is_busy(&self) -> bool {
        self.sample().exceeds(&self.thresholds)
    }

    pub fn available_capacity(&self) -> f64 {
        self.sample().available_capacity()
    }
}
