use crate::collectors::{PingOutcome, PortInfo, ServiceInfo};
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;
use tracing::warn;

const SERVICES_TIMEOUT: Duration = Duration::from_secs(8);
const PORTS_TIMEOUT: Duration = Duration::from_secs(8);
const PING_TIMEOUT: Duration = Duration::from_secs(10);
const LOGS_TIMEOUT: Duration = Duration::from_secs(10);

async fn run_command(program: &str, args: &[&str], timeout: Duration) -> Result<Output, String> {
    let child = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output();
    match tokio::time::timeout(timeout, child).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(err)) => Err(err.to_string()),
        Err(_) => Err(format!("таймаут {} сек", timeout.as_secs())),
    }
}

pub async fn running_services() -> Vec<ServiceInfo> {
    let result = run_command(
        "systemctl",
        &[
            "list-units",
            "--type=service",
            "--state=running",
            "--no-pager",
            "--no-legend",
            "--plain",
        ],
        SERVICES_TIMEOUT,
    )
    .await;
    match result {
        Ok(output) => parse_running_services(&String::from_utf8_lossy(&output.stdout)),
        Err(err) => {
            warn!(error = %err, "не удалось получить список служб");
            Vec::new()
        }
    }
}

pub fn parse_running_services(stdout: &str) -> Vec<ServiceInfo> {
    stdout
        .lines()
        .filter_map(|line| {
            let unit = line.split_whitespace().next()?;
            let name = unit.strip_suffix(".service")?;
            Some(ServiceInfo {
                name: name.to_string(),
                status: "running".to_string(),
            })
        })
        .collect()
}

pub async fn open_ports() -> Vec<PortInfo> {
    let result = run_command("ss", &["-H", "-tlnp"], PORTS_TIMEOUT).await;
    match result {
        Ok(output) => parse_open_ports(&String::from_utf8_lossy(&output.stdout)),
        Err(err) => {
            warn!(error = %err, "не удалось получить список портов");
            Vec::new()
        }
    }
}

// Строка ss: State Recv-Q Send-Q Local:Port Peer:Port [users:((...))]
pub fn parse_open_ports(stdout: &str) -> Vec<PortInfo> {
    let mut seen = std::collections::BTreeSet::new();
    let mut ports = Vec::new();
    for line in stdout.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }
        let local = fields[3];
        let Some((address, port_str)) = local.rsplit_once(':') else {
            continue;
        };
        let Ok(port) = port_str.parse::<u16>() else {
            continue;
        };
        if !seen.insert(port) {
            continue;
        }
        let (process, pid) = fields
            .get(5)
            .map(|raw| parse_ss_process(raw))
            .unwrap_or(("?".to_string(), None));
        ports.push(PortInfo {
            port,
            address: address.to_string(),
            process,
            pid,
        });
    }
    ports.sort_by_key(|p| p.port);
    ports
}

// users:(("sshd",pid=700,fd=3)) → ("sshd", Some(700))
fn parse_ss_process(raw: &str) -> (String, Option<i32>) {
    let name = raw
        .split('"')
        .nth(1)
        .map(str::to_string)
        .unwrap_or_else(|| "?".to_string());
    let pid = raw
        .split("pid=")
        .nth(1)
        .and_then(|rest| rest.split(|c: char| !c.is_ascii_digit()).next())
        .and_then(|digits| digits.parse().ok());
    (name, pid)
}

pub async fn ping_host(host: &str) -> PingOutcome {
    let result = run_command("ping", &["-c", "4", "-W", "2", host], PING_TIMEOUT).await;
    match result {
        Ok(output) if output.status.success() => {
            parse_ping_rtt(&String::from_utf8_lossy(&output.stdout))
        }
        Ok(_) => PingOutcome::Unreachable("Хост недоступен".to_string()),
        Err(err) => PingOutcome::Unreachable(err),
    }
}

// rtt min/avg/max/mdev = 0.045/0.056/0.069/0.010 ms
pub fn parse_ping_rtt(stdout: &str) -> PingOutcome {
    for line in stdout.lines() {
        if !line.contains("min/avg/max") && !line.contains("rtt") {
            continue;
        }
        let Some((_, values)) = line.rsplit_once('=') else {
            continue;
        };
        let parts: Vec<f64> = values
            .trim()
            .trim_end_matches(" ms")
            .split('/')
            .filter_map(|v| v.trim().parse().ok())
            .collect();
        if parts.len() >= 3 {
            return PingOutcome::Latency {
                min: parts[0],
                avg: parts[1],
                max: parts[2],
            };
        }
    }
    PingOutcome::Reachable
}

pub async fn service_logs(service: &str, lines: usize) -> String {
    let lines_arg = lines.to_string();
    let result = run_command(
        "journalctl",
        &["-u", service, "-n", &lines_arg, "--no-pager"],
        LOGS_TIMEOUT,
    )
    .await;
    match result {
        Ok(output) => {
            let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if text.is_empty() {
                format!("Нет логов для {service}")
            } else {
                text
            }
        }
        Err(err) => format!("Ошибка чтения логов {service}: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_systemctl_running_units() {
        let stdout = "\
cron.service      loaded active running Regular background program processing daemon
nginx.service     loaded active running A high performance web server
ssh.service       loaded active running OpenBSD Secure Shell server
";
        let services = parse_running_services(stdout);
        assert_eq!(services.len(), 3);
        assert_eq!(services[0].name, "cron");
        assert_eq!(services[1].name, "nginx");
        assert_eq!(services[2].status, "running");
    }

    #[test]
    fn parses_ss_listeners_dedup_and_sorted() {
        let stdout = "\
LISTEN 0      511          0.0.0.0:80        0.0.0.0:*    users:((\"nginx\",pid=1234,fd=6),(\"nginx\",pid=1235,fd=6))
LISTEN 0      128          0.0.0.0:22        0.0.0.0:*    users:((\"sshd\",pid=700,fd=3))
LISTEN 0      128             [::]:22           [::]:*    users:((\"sshd\",pid=700,fd=4))
LISTEN 0      4096       127.0.0.1:5432      0.0.0.0:*
";
        let ports = parse_open_ports(stdout);
        assert_eq!(ports.len(), 3);
        assert_eq!(ports[0].port, 22);
        assert_eq!(ports[0].process, "sshd");
        assert_eq!(ports[0].pid, Some(700));
        assert_eq!(ports[1].port, 80);
        assert_eq!(ports[1].process, "nginx");
        assert_eq!(ports[2].port, 5432);
        assert_eq!(ports[2].process, "?");
        assert_eq!(ports[2].pid, None);
    }

    #[test]
    fn parses_ping_rtt_line() {
        let stdout = "\
4 packets transmitted, 4 received, 0% packet loss, time 3004ms
rtt min/avg/max/mdev = 0.045/0.056/0.069/0.010 ms
";
        match parse_ping_rtt(stdout) {
            PingOutcome::Latency { min, avg, max } => {
                assert!((min - 0.045).abs() < 1e-9);
                assert!((avg - 0.056).abs() < 1e-9);
                assert!((max - 0.069).abs() < 1e-9);
            }
            other => panic!("ожидалась задержка, получено {:?}", other),
        }
    }

    #[test]
    fn ping_without_rtt_line_is_still_reachable() {
        assert_eq!(
            parse_ping_rtt("4 packets transmitted, 4 received"),
            PingOutcome::Reachable
        );
    }
}
