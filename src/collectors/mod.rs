pub mod services;
pub mod system;

#[derive(Debug, Clone, Default)]
pub struct ResourceSnapshot {
    pub uptime_seconds: u64,
    pub cpu_percent: f64,
    pub load_avg: (f64, f64, f64),
    pub cpu_core_count: usize,
    pub mem_used_gb: f64,
    pub mem_total_gb: f64,
    pub mem_percent: f64,
    pub disk_used_gb: f64,
    pub disk_total_gb: f64,
    pub disk_percent: f64,
    pub net_recv_mb: f64,
    pub net_sent_mb: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub name: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub port: u16,
    pub address: String,
    pub process: String,
    pub pid: Option<i32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PingOutcome {
    Latency { min: f64, avg: f64, max: f64 },
    Reachable,
    Unreachable(String),
}
