//! Sources of raw metric values
use log::{debug, trace};
use std::sync::{Mutex, MutexGuard};
use sysinfo::{Pid, System};

use crate::error::{AgentError, Result};
use crate::metrics::{MetricSet, POLL_COUNT};

/// Gauge holding a fresh random number on every runtime sample
pub const RANDOM_VALUE: &str = "RandomValue";

/// Gauges written by [`Sampler::sample_runtime`], besides [`RANDOM_VALUE`]
pub const RUNTIME_GAUGES: [&str; 14] = [
    "ResidentMemory",
    "VirtualMemory",
    "ProcessCPUUsage",
    "RunTime",
    "StartTime",
    "DiskReadBytes",
    "DiskWrittenBytes",
    "TotalDiskReadBytes",
    "TotalDiskWrittenBytes",
    "ParentPID",
    "SystemUptime",
    "BootTime",
    "AvailableParallelism",
    "LastSampleTime",
];

// Leading entries of RUNTIME_GAUGES read from the process itself
const PROCESS_GAUGE_COUNT: usize = 10;

/// Host gauges written by [`Sampler::sample_additional`], besides the
/// per-CPU `CPUutilization{n}` gauges
pub const HOST_GAUGES: [&str; 11] = [
    "TotalMemory",
    "FreeMemory",
    "AvailableMemory",
    "UsedMemory",
    "TotalSwap",
    "FreeSwap",
    "LoadAverage1",
    "LoadAverage5",
    "LoadAverage15",
    "PhysicalCores",
    "LogicalCPUs",
];

/// Prefix of the per-CPU utilization gauges, numbered from 1
pub const CPU_UTILIZATION_PREFIX: &str = "CPUutilization";

/// Produces metric values from the runtime environment
pub trait Sampler: Send + Sync + 'static {
    /// Overwrite the runtime gauges and increment `PollCount` by one.
    fn sample_runtime(&self, metrics: &mut MetricSet);

    /// Overwrite the host gauges. On error nothing is written.
    fn sample_additional(&self, metrics: &mut MetricSet) -> Result<()>;
}

/// Sampler backed by `sysinfo`
pub struct SystemSampler {
    process: Mutex<System>,
    host: Mutex<System>,
    pid: Option<Pid>,
}

impl SystemSampler {
    /// Create a sampler for the current process and host
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                debug!("Cannot determine current pid, process gauges will be zero: {}", e);
                None
            }
        };

        Self {
            process: Mutex::new(System::new()),
            host: Mutex::new(System::new()),
            pid,
        }
    }

    fn process_values(&self) -> [f64; PROCESS_GAUGE_COUNT] {
        let Some(pid) = self.pid else {
            return [0.0; PROCESS_GAUGE_COUNT];
        };

        let mut sys = recover(self.process.lock());
        if !sys.refresh_process(pid) {
            trace!("Process {} not found during refresh", pid);
            return [0.0; PROCESS_GAUGE_COUNT];
        }

        match sys.process(pid) {
            Some(process) => {
                let disk = process.disk_usage();
                [
                    process.memory() as f64,
                    process.virtual_memory() as f64,
                    process.cpu_usage() as f64,
                    process.run_time() as f64,
                    process.start_time() as f64,
                    disk.read_bytes as f64,
                    disk.written_bytes as f64,
                    disk.total_read_bytes as f64,
                    disk.total_written_bytes as f64,
                    process.parent().map(|p| usize::from(p) as f64).unwrap_or(0.0),
                ]
            }
            None => [0.0; PROCESS_GAUGE_COUNT],
        }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Sampler for SystemSampler {
    fn sample_runtime(&self, metrics: &mut MetricSet) {
        let parallelism = std::thread::available_parallelism().map_or(0, |n| n.get());
        let process = self.process_values();
        let runtime = [
            System::uptime() as f64,
            System::boot_time() as f64,
            parallelism as f64,
            chrono::Utc::now().timestamp() as f64,
        ];

        for (name, value) in RUNTIME_GAUGES.iter().zip(process.into_iter().chain(runtime)) {
            metrics.set_gauge(*name, value);
        }
        metrics.set_gauge(RANDOM_VALUE, rand::random::<f64>());

        let count = metrics.increment_counter(POLL_COUNT, 1);
        trace!("Runtime metrics sampled, poll count {}", count);
    }

    fn sample_additional(&self, metrics: &mut MetricSet) -> Result<()> {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return Err(AgentError::Collection(
                "host metrics are not supported on this platform".to_string(),
            )
            .into());
        }

        let mut sys = recover(self.host.lock());
        sys.refresh_memory();
        sys.refresh_cpu();

        let cpus: Vec<f64> = sys.cpus().iter().map(|cpu| cpu.cpu_usage() as f64).collect();
        if cpus.is_empty() {
            return Err(AgentError::Collection("no CPUs reported".to_string()).into());
        }

        let load = System::load_average();
        let host = [
            sys.total_memory() as f64,
            sys.free_memory() as f64,
            sys.available_memory() as f64,
            sys.used_memory() as f64,
            sys.total_swap() as f64,
            sys.free_swap() as f64,
            load.one,
            load.five,
            load.fifteen,
            sys.physical_core_count().unwrap_or(0) as f64,
            cpus.len() as f64,
        ];

        for (name, value) in HOST_GAUGES.iter().zip(host) {
            metrics.set_gauge(*name, value);
        }
        for (i, usage) in cpus.into_iter().enumerate() {
            metrics.set_gauge(format!("{}{}", CPU_UTILIZATION_PREFIX, i + 1), usage);
        }

        Ok(())
    }
}

// Sampling never fails, so a poisoned lock just hands back the inner value
fn recover<'a>(
    result: std::result::Result<MutexGuard<'a, System>, std::sync::PoisonError<MutexGuard<'a, System>>>,
) -> MutexGuard<'a, System> {
    result.unwrap_or_else(|poisoned| poisoned.into_inner())
}
