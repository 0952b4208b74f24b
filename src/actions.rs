use std::fmt;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;

const SERVICE_TIMEOUT: Duration = Duration::from_secs(30);
const JOURNAL_TIMEOUT: Duration = Duration::from_secs(60);
const LSOF_TIMEOUT: Duration = Duration::from_secs(10);
const KILL_TIMEOUT: Duration = Duration::from_secs(5);
const SSH_STATUS_TIMEOUT: Duration = Duration::from_secs(5);
const AUTOSTART_TIMEOUT: Duration = Duration::from_secs(15);

// Каждая привилегированная операция возвращает (успех, текст для чата),
// ошибки наружу не пробрасываются.
#[derive(Debug, Clone)]
pub struct ActionResult {
    pub ok: bool,
    pub message: String,
}

impl ActionResult {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
        }
    }

    fn fail(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Start,
    Stop,
    Restart,
}

impl ServiceAction {
    fn as_arg(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
        }
    }
}

impl fmt::Display for ServiceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_arg())
    }
}

async fn run(program: &str, args: &[&str], timeout: Duration) -> Result<Output, String> {
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

pub async fn service_action(action: ServiceAction, name: &str) -> ActionResult {
    match run("systemctl", &[action.as_arg(), name], SERVICE_TIMEOUT).await {
        Ok(output) if output.status.success() => {
            ActionResult::ok(format!("Сервис {name}: {action} выполнен"))
        }
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.is_empty() {
                ActionResult::fail(format!("Ошибка {action} {name}"))
            } else {
                ActionResult::fail(stderr)
            }
        }
        Err(err) => ActionResult::fail(err),
    }
}

// Перезагрузка планируется на стороне ОС с задержкой и не зависит от
// жизни этого процесса.
pub fn reboot_server() -> ActionResult {
    let spawned = Command::new("bash")
        .args(["-c", "sleep 5 && shutdown -r now"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();
    match spawned {
        Ok(_) => ActionResult::ok("Сервер уходит на перезагрузку через 5 сек"),
        Err(err) => ActionResult::fail(err.to_string()),
    }
}

pub async fn clear_journal() -> ActionResult {
    match run("journalctl", &["--vacuum-time=1d"], JOURNAL_TIMEOUT).await {
        Ok(output) => {
            let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if text.is_empty() {
                ActionResult::ok("Логи очищены")
            } else {
                ActionResult::ok(text)
            }
        }
        Err(err) => ActionResult::fail(err),
    }
}

pub async fn close_port(port: u16) -> ActionResult {
    let spec = format!(":{port}");
    let pids = match run("lsof", &["-ti", &spec], LSOF_TIMEOUT).await {
        Ok(output) => String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| l.trim().to_string())
            .collect::<Vec<_>>(),
        Err(err) => return ActionResult::fail(err),
    };
    if pids.is_empty() {
        return ActionResult::fail(format!("Порт {port} не используется"));
    }
    for pid in &pids {
        if let Err(err) = run("kill", &["-9", pid], KILL_TIMEOUT).await {
            return ActionResult::fail(format!("kill {pid}: {err}"));
        }
    }
    ActionResult::ok(format!("Порт {port} закрыт (процессов: {})", pids.len()))
}

pub async fn ssh_is_active() -> bool {
    match run("systemctl", &["is-active", "ssh"], SSH_STATUS_TIMEOUT).await {
        Ok(output) => String::from_utf8_lossy(&output.stdout).trim() == "active",
        Err(_) => false,
    }
}

pub async fn add_ssh_key(pubkey: &str) -> ActionResult {
    if !looks_like_ssh_key(pubkey) {
        return ActionResult::fail(
            "Неверный формат ключа: должен начинаться с ssh- или ecdsa-",
        );
    }
    let auth_file = "/root/.ssh/authorized_keys";
    let append = async {
        tokio::fs::create_dir_all("/root/.ssh").await?;
        let mut existing = tokio::fs::read_to_string(auth_file)
            .await
            .unwrap_or_default();
        if !existing.is_empty() && !existing.ends_with('\n') {
            existing.push('\n');
        }
        existing.push_str(pubkey.trim());
        existing.push('\n');
        tokio::fs::write(auth_file, existing).await
    };
    if let Err(err) = append.await {
        return ActionResult::fail(err.to_string());
    }
    let _ = run("chmod", &["600", auth_file], KILL_TIMEOUT).await;
    let _ = run("chmod", &["700", "/root/.ssh"], KILL_TIMEOUT).await;
    ActionResult::ok("SSH ключ добавлен")
}

pub fn looks_like_ssh_key(pubkey: &str) -> bool {
    let pubkey = pubkey.trim();
    pubkey.starts_with("ssh-") || pubkey.starts_with("ecdsa-")
}

pub async fn autostart_services() -> Vec<String> {
    let result = run(
        "systemctl",
        &[
            "list-unit-files",
            "--type=service",
            "--state=enabled",
            "--no-pager",
            "--no-legend",
        ],
        AUTOSTART_TIMEOUT,
    )
    .await;
    match result {
        Ok(output) => String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .map(|unit| unit.trim_end_matches(".service").to_string())
            .collect(),
        Err(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssh_key_format_check() {
        assert!(looks_like_ssh_key("ssh-ed25519 AAAA... user@host"));
        assert!(looks_like_ssh_key("  ecdsa-sha2-nistp256 AAAA..."));
        assert!(!looks_like_ssh_key("rsa AAAA..."));
        assert!(!looks_like_ssh_key(""));
    }

    #[test]
    fn service_action_args() {
        assert_eq!(ServiceAction::Start.as_arg(), "start");
        assert_eq!(ServiceAction::Stop.as_arg(), "stop");
        assert_eq!(ServiceAction::Restart.as_arg(), "restart");
    }
}
