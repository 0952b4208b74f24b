use crate::collectors::ResourceSnapshot;
use std::time::{Duration, Instant};
use sysinfo::{CpuExt, DiskExt, NetworkExt, NetworksExt, System, SystemExt};

// CPU обновляем не чаще раза в ~2.5 секунды, остальное — на каждый запрос.
const CPU_CACHE_TTL: Duration = Duration::from_millis(2500);

pub struct SystemCollector {
    system: System,
    cpu_percent: f64,
    cpu_refreshed_at: Option<Instant>,
}

impl SystemCollector {
    pub fn new() -> Self {
        Self {
            system: System::new_all(),
            cpu_percent: 0.0,
            cpu_refreshed_at: None,
        }
    }

    pub fn snapshot(&mut self) -> ResourceSnapshot {
        let now = Instant::now();
        let cpu_stale = match self.cpu_refreshed_at {
            Some(at) => now.duration_since(at) >= CPU_CACHE_TTL,
            None => true,
        };
        if cpu_stale {
            self.system.refresh_cpu();
            self.cpu_percent = average_cpu_percent(&self.system);
            self.cpu_refreshed_at = Some(now);
        }

        self.system.refresh_memory();
        self.system.refresh_disks_list();
        self.system.refresh_disks();
        self.system.refresh_networks_list();
        self.system.refresh_networks();

        let mem_total_bytes = self.system.total_memory();
        let mem_used_bytes = self.system.used_memory();

        let (disk_used_bytes, disk_total_bytes) = root_disk(&self.system);

        let (net_recv_bytes, net_sent_bytes) = self
            .system
            .networks()
            .iter()
            .fold((0_u64, 0_u64), |acc, (_, data)| {
                (
                    acc.0.saturating_add(data.total_received()),
                    acc.1.saturating_add(data.total_transmitted()),
                )
            });

        let load = self.system.load_average();

        ResourceSnapshot {
            uptime_seconds: self.system.uptime(),
            cpu_percent: self.cpu_percent,
            load_avg: (load.one, load.five, load.fifteen),
            cpu_core_count: self.system.cpus().len(),
            mem_used_gb: bytes_to_gb(mem_used_bytes),
            mem_total_gb: bytes_to_gb(mem_total_bytes),
            mem_percent: percent(mem_used_bytes as f64, mem_total_bytes as f64),
            disk_used_gb: bytes_to_gb(disk_used_bytes),
            disk_total_gb: bytes_to_gb(disk_total_bytes),
            disk_percent: percent(disk_used_bytes as f64, disk_total_bytes as f64),
            net_recv_mb: bytes_to_mb(net_recv_bytes),
            net_sent_mb: bytes_to_mb(net_sent_bytes),
        }
    }
}

impl Default for SystemCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn average_cpu_percent(system: &System) -> f64 {
    let cpus = system.cpus();
    if cpus.is_empty() {
        return 0.0;
    }
    let sum: f32 = cpus.iter().map(|c| c.cpu_usage()).sum();
    (sum / cpus.len() as f32).max(0.0) as f64
}

// Корневой раздел; если "/" не найден — самый большой диск.
fn root_disk(system: &System) -> (u64, u64) {
    let disks = system.disks();
    let picked = disks
        .iter()
        .find(|d| d.mount_point().to_str() == Some("/"))
        .or_else(|| disks.iter().max_by_key(|d| d.total_space()));
    match picked {
        Some(d) => {
            let total = d.total_space();
            (total.saturating_sub(d.available_space()), total)
        }
        None => (0, 0),
    }
}

fn percent(used: f64, total: f64) -> f64 {
    if total <= 0.0 {
        0.0
    } else {
        (used / total) * 100.0
    }
}

fn bytes_to_gb(bytes: u64) -> f64 {
    bytes as f64 / 1024.0 / 1024.0 / 1024.0
}

fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / 1024.0 / 1024.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_value_is_cached_between_close_snapshots() {
        let mut collector = SystemCollector::new();
        let first = collector.snapshot();
        let refreshed_at = collector.cpu_refreshed_at;
        let second = collector.snapshot();
        // Второй снимок в пределах TTL не перечитывает CPU.
        assert_eq!(collector.cpu_refreshed_at, refreshed_at);
        assert_eq!(first.cpu_percent, second.cpu_percent);
    }

    #[test]
    fn percent_handles_zero_total() {
        assert_eq!(percent(10.0, 0.0), 0.0);
        assert!((percent(25.0, 100.0) - 25.0).abs() < f64::EPSILON);
    }
}
