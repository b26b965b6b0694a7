//! Host resource snapshots served by the worker's `/stats` endpoint and
//! consumed by the manager's schedulers.

use procfs::CurrentSI;
use serde::{Deserialize, Serialize};
use sysinfo::{Disks, System};

/// Memory counters in kilobytes.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MemInfo {
    pub total_kb: u64,
    pub available_kb: u64,
    pub used_kb: u64,
    pub used_percent: f64,
}

/// Root filesystem usage in bytes.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DiskInfo {
    pub total: u64,
    pub free: u64,
    pub used: u64,
}

/// Cumulative CPU time counters from `/proc/stat`, in clock ticks.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LoadAvg {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

/// A point-in-time snapshot of a worker host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stats {
    pub mem_stats: MemInfo,
    pub disk_stats: DiskInfo,
    pub cpu_stats: CpuTimes,
    pub load_stats: LoadAvg,
    /// Number of tasks running on the worker when the snapshot was taken.
    pub task_count: usize,
}

impl Stats {
    pub fn mem_used_kb(&self) -> u64 {
        self.mem_stats.used_kb
    }

    pub fn mem_available_kb(&self) -> u64 {
        self.mem_stats.available_kb
    }

    pub fn mem_total_kb(&self) -> u64 {
        self.mem_stats.total_kb
    }

    pub fn disk_total(&self) -> u64 {
        self.disk_stats.total
    }

    pub fn disk_free(&self) -> u64 {
        self.disk_stats.free
    }

    pub fn disk_used(&self) -> u64 {
        self.disk_stats.used
    }

    /// Returns `(usage_percent, idle, non_idle, total)`.
    ///
    /// Idle time includes iowait. Usage is 0 when the counters are empty.
    pub fn cpu_usage(&self) -> (f64, f64, f64, f64) {
        let c = &self.cpu_stats;
        let idle = (c.idle + c.iowait) as f64;
        let non_idle = (c.user + c.nice + c.system + c.irq + c.softirq + c.steal) as f64;
        let total = idle + non_idle;

        let usage_percent = if total > 0.0 { (total - idle) / total } else { 0.0 };
        (usage_percent, idle, non_idle, total)
    }

    /// Capture a fresh snapshot of this host, stamped with `task_count`.
    ///
    /// A section that cannot be read is logged and left zeroed rather than
    /// failing the whole snapshot.
    pub fn collect(task_count: usize) -> Self {
        Self {
            mem_stats: collect_memory(),
            disk_stats: collect_disk(),
            cpu_stats: collect_cpu_times(),
            load_stats: collect_load_avg(),
            task_count,
        }
    }
}

fn collect_memory() -> MemInfo {
    let mut sys = System::new();
    sys.refresh_memory();

    let total_kb = sys.total_memory() / 1024;
    let available_kb = sys.available_memory() / 1024;
    let used_kb = sys.used_memory() / 1024;
    let used_percent = if total_kb > 0 {
        used_kb as f64 / total_kb as f64 * 100.0
    } else {
        0.0
    };

    MemInfo {
        total_kb,
        available_kb,
        used_kb,
        used_percent,
    }
}

fn collect_disk() -> DiskInfo {
    let disks = Disks::new_with_refreshed_list();
    let root = disks
        .iter()
        .find(|d| d.mount_point() == std::path::Path::new("/"))
        .or_else(|| disks.iter().next());

    match root {
        Some(disk) => {
            let total = disk.total_space();
            let free = disk.available_space();
            DiskInfo {
                total,
                free,
                used: total.saturating_sub(free),
            }
        }
        None => {
            tracing::warn!("no disks found, reporting zeroed disk stats");
            DiskInfo::default()
        }
    }
}

fn collect_cpu_times() -> CpuTimes {
    match procfs::KernelStats::current() {
        Ok(stats) => {
            let t = stats.total;
            CpuTimes {
                user: t.user,
                nice: t.nice,
                system: t.system,
                idle: t.idle,
                iowait: t.iowait.unwrap_or(0),
                irq: t.irq.unwrap_or(0),
                softirq: t.softirq.unwrap_or(0),
                steal: t.steal.unwrap_or(0),
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "unable to read /proc/stat, reporting zeroed cpu stats");
            CpuTimes::default()
        }
    }
}

fn collect_load_avg() -> LoadAvg {
    let avg = System::load_average();
    LoadAvg {
        one: avg.one,
        five: avg.five,
        fifteen: avg.fifteen,
    }
}
