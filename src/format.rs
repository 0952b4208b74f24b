use crate::collectors::{PingOutcome, PortInfo, ResourceSnapshot, ServiceInfo};
use crate::store::{DailyRecord, ServicesMode, Settings};

const DIVIDER: &str = "━━━━━━━━━━━━━━━━━━━━";

// Трёхступенчатый индикатор: <60 зелёный, <80 жёлтый, дальше красный.
pub fn severity_emoji(percent: f64) -> &'static str {
    if percent < 60.0 {
        "🟢"
    } else if percent < 80.0 {
        "🟡"
    } else {
        "🔴"
    }
}

pub fn human_uptime(total_seconds: u64) -> String {
    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{days}д"));
    }
    if hours > 0 {
        parts.push(format!("{hours}ч"));
    }
    parts.push(format!("{minutes}м"));
    parts.join(" ")
}

pub fn filter_services(services: &[ServiceInfo], settings: &Settings) -> Vec<ServiceInfo> {
    match settings.services_mode {
        ServicesMode::All => services.to_vec(),
        ServicesMode::Custom => services
            .iter()
            .filter(|s| settings.services_filter.contains(&s.name))
            .cloned()
            .collect(),
        ServicesMode::Filtered => services
            .iter()
            .filter(|s| !settings.services_blacklist.contains(&s.name))
            .cloned()
            .collect(),
    }
}

pub fn filter_ports(ports: &[PortInfo], settings: &Settings) -> Vec<PortInfo> {
    if !settings.ports_filter.is_empty() {
        ports
            .iter()
            .filter(|p| settings.ports_filter.contains(&p.port))
            .cloned()
            .collect()
    } else {
        ports
            .iter()
            .filter(|p| !settings.ports_blacklist.contains(&p.port))
            .cloned()
            .collect()
    }
}

fn services_mode_label(mode: &ServicesMode) -> &'static str {
    match mode {
        ServicesMode::All => "все",
        ServicesMode::Filtered => "без сист.",
        ServicesMode::Custom => "кастом",
    }
}

pub fn format_status(
    snapshot: &ResourceSnapshot,
    services: &[ServiceInfo],
    ports: &[PortInfo],
    settings: &Settings,
    timestamp: &str,
) -> String {
    let (l1, l5, l15) = snapshot.load_avg;
    let mut lines = vec![
        "🖥 <b>СТАТУС СЕРВЕРА</b>".to_string(),
        format!("🕐 <code>{timestamp}</code>"),
        format!("⏱ Аптайм: <code>{}</code>", human_uptime(snapshot.uptime_seconds)),
        String::new(),
        DIVIDER.to_string(),
        "📊 <b>РЕСУРСЫ</b>".to_string(),
        String::new(),
        format!(
            "{} <b>CPU:</b> <code>{:.1}%</code>  📈 Load: <code>{:.2} {:.2} {:.2}</code> (ядер: {})",
            severity_emoji(snapshot.cpu_percent),
            snapshot.cpu_percent,
            l1,
            l5,
            l15,
            snapshot.cpu_core_count
        ),
        format!(
            "{} <b>RAM:</b> <code>{:.1}%</code> ({:.1}/{:.1} GB)",
            severity_emoji(snapshot.mem_percent),
            snapshot.mem_percent,
            snapshot.mem_used_gb,
            snapshot.mem_total_gb
        ),
        format!(
            "{} <b>Disk:</b> <code>{:.1}%</code> ({:.1}/{:.1} GB)",
            severity_emoji(snapshot.disk_percent),
            snapshot.disk_percent,
            snapshot.disk_used_gb,
            snapshot.disk_total_gb
        ),
        format!(
            "🌐 <b>Net:</b> ↓<code>{:.1} MB</code>  ↑<code>{:.1} MB</code>",
            snapshot.net_recv_mb, snapshot.net_sent_mb
        ),
    ];

    if settings.show_services {
        let filtered = filter_services(services, settings);
        let shown = filtered.len().min(settings.max_services);
        lines.push(String::new());
        lines.push(DIVIDER.to_string());
        lines.push(format!(
            "🔧 <b>СЛУЖБЫ</b> ({shown}/{}) <i>{}</i>",
            filtered.len(),
            services_mode_label(&settings.services_mode)
        ));
        lines.push(String::new());
        for service in filtered.iter().take(settings.max_services) {
            lines.push(format!("✅ <code>{}</code>", service.name));
        }
        if filtered.len() > settings.max_services {
            lines.push(format!(
                "<i>...и ещё {}</i>",
                filtered.len() - settings.max_services
            ));
        }
    }

    if settings.show_ports {
        let filtered = filter_ports(ports, settings);
        lines.push(String::new());
        lines.push(DIVIDER.to_string());
        lines.push(format!("🔌 <b>ПОРТЫ</b> ({})", filtered.len()));
        lines.push(String::new());
        for port in filtered.iter().take(settings.max_ports) {
            lines.push(format!("• <code>{}</code> — {}", port.port, port.process));
        }
        if filtered.len() > settings.max_ports {
            lines.push(format!(
                "<i>...и ещё {}</i>",
                filtered.len() - settings.max_ports
            ));
        }
    }

    lines.join("\n")
}

pub fn format_services(services: &[ServiceInfo], settings: &Settings) -> String {
    let filtered = filter_services(services, settings);
    let mut lines = vec![format!("🔧 <b>СЛУЖБЫ</b> ({})", filtered.len()), String::new()];
    for service in &filtered {
        lines.push(format!("• <code>{}</code> — {}", service.name, service.status));
    }
    if filtered.is_empty() {
        lines.push("<i>Нет запущенных служб</i>".to_string());
    }
    lines.join("\n")
}

pub fn format_ports(ports: &[PortInfo]) -> String {
    let mut lines = vec![format!("🔌 <b>ОТКРЫТЫЕ ПОРТЫ</b> ({})", ports.len()), String::new()];
    for port in ports {
        let pid = port
            .pid
            .map(|pid| format!(" [PID:{pid}]"))
            .unwrap_or_default();
        lines.push(format!(
            "• <code>{}</code> ({}) — {}{}",
            port.port, port.address, port.process, pid
        ));
    }
    if ports.is_empty() {
        lines.push("<i>Нет открытых портов</i>".to_string());
    }
    lines.join("\n")
}

pub fn format_ping(host: &str, outcome: &PingOutcome) -> String {
    match outcome {
        PingOutcome::Latency { min, avg, max } => format!(
            "🟢 <b>Ping {host}</b>\n\n✅ Хост доступен\nMin: <code>{min:.2}ms</code> Avg: <code>{avg:.2}ms</code> Max: <code>{max:.2}ms</code>"
        ),
        PingOutcome::Reachable => format!("🟢 <b>Ping {host}</b>\n\n✅ Хост доступен"),
        PingOutcome::Unreachable(reason) => {
            format!("🔴 <b>Ping {host}</b>\n\n❌ {reason}")
        }
    }
}

pub fn format_alert(
    snapshot: &ResourceSnapshot,
    settings: &Settings,
    breaches: &std::collections::BTreeSet<String>,
) -> String {
    let mut lines = vec!["🚨 <b>ВНИМАНИЕ: превышены пороги</b>".to_string(), String::new()];
    for name in breaches {
        let (value, limit) = match name.as_str() {
            "CPU" => (snapshot.cpu_percent, settings.alert_cpu),
            "RAM" => (snapshot.mem_percent, settings.alert_ram),
            "Disk" => (snapshot.disk_percent, settings.alert_disk),
            _ => continue,
        };
        lines.push(format!("🔴 {name}: <code>{value:.1}%</code> (порог {limit}%)"));
    }
    lines.join("\n")
}

pub fn format_daily_report(date: &str, stats: Option<&DailyRecord>) -> String {
    let Some(stats) = stats else {
        return "📊 <b>Дневной отчёт</b>\n\nДанных пока нет.".to_string();
    };
    let recv = stats.net_recv_last - stats.net_recv_start;
    let sent = stats.net_sent_last - stats.net_sent_start;
    [
        format!("📊 <b>ДНЕВНОЙ ОТЧЁТ</b> {date}"),
        String::new(),
        format!("🔴 CPU макс: <code>{:.1}%</code>", stats.cpu_max),
        format!("💾 RAM макс: <code>{:.1}%</code>", stats.ram_max),
        format!("💿 Disk макс: <code>{:.1}%</code>", stats.disk_max),
        format!("🌐 Трафик: ↓<code>{recv:.1} MB</code>  ↑<code>{sent:.1} MB</code>"),
    ]
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(name: &str) -> ServiceInfo {
        ServiceInfo {
            name: name.to_string(),
            status: "running".to_string(),
        }
    }

    fn port(number: u16) -> PortInfo {
        PortInfo {
            port: number,
            address: "0.0.0.0".to_string(),
            process: "proc".to_string(),
            pid: Some(1),
        }
    }

    #[test]
    fn filtered_mode_drops_blacklisted() {
        let settings = Settings {
            services_mode: ServicesMode::Filtered,
            services_blacklist: ["cron".to_string()].into_iter().collect(),
            ..Settings::default()
        };
        let out = filter_services(&[service("cron"), service("nginx")], &settings);
        assert_eq!(out, vec![service("nginx")]);
    }

    #[test]
    fn custom_mode_keeps_only_whitelisted() {
        let settings = Settings {
            services_mode: ServicesMode::Custom,
            services_filter: ["nginx".to_string()].into_iter().collect(),
            ..Settings::default()
        };
        let out = filter_services(&[service("cron"), service("nginx")], &settings);
        assert_eq!(out, vec![service("nginx")]);
    }

    #[test]
    fn all_mode_passes_through() {
        let settings = Settings {
            services_mode: ServicesMode::All,
            services_blacklist: ["cron".to_string()].into_iter().collect(),
            ..Settings::default()
        };
        let out = filter_services(&[service("cron"), service("nginx")], &settings);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn ports_filter_wins_over_blacklist() {
        let settings = Settings {
            ports_filter: [22].into_iter().collect(),
            ports_blacklist: [22, 80].into_iter().collect(),
            ..Settings::default()
        };
        let out = filter_ports(&[port(22), port(80), port(443)], &settings);
        assert_eq!(out, vec![port(22)]);
    }

    #[test]
    fn empty_ports_filter_applies_blacklist() {
        let settings = Settings {
            ports_blacklist: [80].into_iter().collect(),
            ..Settings::default()
        };
        let out = filter_ports(&[port(22), port(80)], &settings);
        assert_eq!(out, vec![port(22)]);
    }

    #[test]
    fn status_truncates_services_with_suffix() {
        let settings = Settings {
            services_mode: ServicesMode::All,
            max_services: 2,
            show_ports: false,
            ..Settings::default()
        };
        let services = vec![service("a"), service("b"), service("c"), service("d")];
        let text = format_status(
            &ResourceSnapshot::default(),
            &services,
            &[],
            &settings,
            "2026-08-29 12:00:00",
        );
        assert!(text.contains("<code>a</code>"));
        assert!(text.contains("<code>b</code>"));
        assert!(!text.contains("<code>c</code>"));
        assert!(text.contains("...и ещё 2"));
    }

    #[test]
    fn severity_tiers() {
        assert_eq!(severity_emoji(0.0), "🟢");
        assert_eq!(severity_emoji(59.9), "🟢");
        assert_eq!(severity_emoji(60.0), "🟡");
        assert_eq!(severity_emoji(80.0), "🔴");
    }

    #[test]
    fn daily_report_computes_traffic_delta() {
        let stats = DailyRecord {
            cpu_max: 91.5,
            ram_max: 70.0,
            disk_max: 55.0,
            net_recv_start: 100.0,
            net_sent_start: 40.0,
            net_recv_last: 350.5,
            net_sent_last: 90.0,
        };
        let text = format_daily_report("2026-08-29", Some(&stats));
        assert!(text.contains("91.5%"));
        assert!(text.contains("↓<code>250.5 MB</code>"));
        assert!(text.contains("↑<code>50.0 MB</code>"));
    }

    #[test]
    fn daily_report_without_data() {
        let text = format_daily_report("2026-08-29", None);
        assert!(text.contains("Данных пока нет"));
    }

    #[test]
    fn ping_three_outcomes() {
        let ok = format_ping(
            "example.com",
            &PingOutcome::Latency {
                min: 1.0,
                avg: 2.0,
                max: 3.0,
            },
        );
        assert!(ok.contains("Avg: <code>2.00ms</code>"));
        assert!(format_ping("h", &PingOutcome::Reachable).contains("Хост доступен"));
        assert!(
            format_ping("h", &PingOutcome::Unreachable("Таймаут".to_string()))
                .contains("❌ Таймаут")
        );
    }

    #[test]
    fn uptime_formats() {
        assert_eq!(human_uptime(59), "0м");
        assert_eq!(human_uptime(3 * 3600 + 120), "3ч 2м");
        assert_eq!(human_uptime(2 * 86_400 + 3600), "2д 1ч 0м");
    }
}
