use crate::actions::{self, ActionResult, ServiceAction};
use crate::collectors::services as probes;
use crate::format;
use crate::scheduler::parse_hh_mm;
use crate::state::AppState;
use crate::store::{ServicesMode, SettingsPatch};
use std::collections::HashSet;
use std::path::Path;
use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{
    CallbackQuery, ChatId, InlineKeyboardButton, InlineKeyboardMarkup, Message, MessageId,
    ParseMode, UserId,
};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

const LOG_REPLY_LIMIT: usize = 3500;
const DEFAULT_LOG_LINES: usize = 30;
const MAX_LOG_LINES: usize = 200;
const AUTOSTART_SHOWN: usize = 15;

#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("ошибка запроса Telegram: {0}")]
    Request(#[from] teloxide::RequestError),
}

#[derive(Clone)]
struct BotRuntime {
    state: AppState,
    admins: HashSet<u64>,
    bot_user_id: UserId,
}

impl BotRuntime {
    fn is_admin(&self, user_id: Option<u64>) -> bool {
        admin_allowed(&self.admins, user_id)
    }
}

// Пустой список администраторов означает, что админом считается любой
// отправитель. Поведение совместимости, подсвечивается предупреждением
// на старте.
fn admin_allowed(admins: &HashSet<u64>, user_id: Option<u64>) -> bool {
    if admins.is_empty() {
        return true;
    }
    match user_id {
        Some(id) => admins.contains(&id),
        None => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Menu,
    Status,
    Services,
    Ports,
    Ping(String),
    RestartService(String),
    StopService(String),
    Reboot,
    Logs { service: String, lines: usize },
    ClearLogs,
    ClosePort(u16),
    AddChannel,
    RemoveChannel,
    LinkChannel(i64),
    Broadcast(String),
    ShowBlacklist,
    SetBlacklist(Vec<String>),
    Report,
    SetReportTime(String),
    SetRebootTime(String),
    SetAlerts { cpu: u8, ram: u8, disk: u8 },
    AddSshKey(String),
    Upload,
    Help,
}

impl Command {
    fn requires_admin(&self) -> bool {
        !matches!(
            self,
            Self::Start
                | Self::Menu
                | Self::Status
                | Self::Services
                | Self::Ports
                | Self::Ping(_)
                | Self::ShowBlacklist
                | Self::Report
                | Self::Upload
                | Self::Help
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    Command(Command),
    Usage(&'static str),
    Unknown,
}

pub fn parse_command(text: &str) -> Parsed {
    let mut parts = text.split_whitespace();
    let Some(first) = parts.next() else {
        return Parsed::Unknown;
    };
    if !first.starts_with('/') {
        return Parsed::Unknown;
    }
    let verb = first.split('@').next().unwrap_or(first).to_lowercase();
    let rest: Vec<&str> = parts.collect();

    match verb.as_str() {
        "/start" => Parsed::Command(Command::Start),
        "/menu" => Parsed::Command(Command::Menu),
        "/status" => Parsed::Command(Command::Status),
        "/services" => Parsed::Command(Command::Services),
        "/ports" => Parsed::Command(Command::Ports),
        "/ping" => match rest.first() {
            Some(host) => Parsed::Command(Command::Ping(host.to_string())),
            None => Parsed::Usage("/ping <хост>"),
        },
        "/restart_service" => match rest.first() {
            Some(name) => Parsed::Command(Command::RestartService(name.to_string())),
            None => Parsed::Usage("/restart_service <служба>"),
        },
        "/stop_service" => match rest.first() {
            Some(name) => Parsed::Command(Command::StopService(name.to_string())),
            None => Parsed::Usage("/stop_service <служба>"),
        },
        "/reboot" => Parsed::Command(Command::Reboot),
        "/logs" => {
            let Some(service) = rest.first() else {
                return Parsed::Usage("/logs <служба> [строк]");
            };
            let lines = match rest.get(1) {
                Some(raw) => match raw.parse::<usize>() {
                    Ok(n) if (1..=MAX_LOG_LINES).contains(&n) => n,
                    _ => return Parsed::Usage("/logs <служба> [строк]"),
                },
                None => DEFAULT_LOG_LINES,
            };
            Parsed::Command(Command::Logs {
                service: service.to_string(),
                lines,
            })
        }
        "/clear_logs" => Parsed::Command(Command::ClearLogs),
        "/close_port" => match rest.first().and_then(|raw| raw.parse::<u16>().ok()) {
            Some(port) if port > 0 => Parsed::Command(Command::ClosePort(port)),
            _ => Parsed::Usage("/close_port <порт>"),
        },
        "/add_channel" => Parsed::Command(Command::AddChannel),
        "/remove_channel" => Parsed::Command(Command::RemoveChannel),
        "/link_channel" => match rest.first().and_then(|raw| raw.parse::<i64>().ok()) {
            Some(chat_id) => Parsed::Command(Command::LinkChannel(chat_id)),
            None => Parsed::Usage("/link_channel <chat_id>"),
        },
        "/broadcast" => {
            if rest.is_empty() {
                Parsed::Usage("/broadcast <текст>")
            } else {
                Parsed::Command(Command::Broadcast(rest.join(" ")))
            }
        }
        "/set_blacklist" => {
            if rest.is_empty() {
                // Без аргументов показываем текущий список.
                Parsed::Command(Command::ShowBlacklist)
            } else {
                Parsed::Command(Command::SetBlacklist(
                    rest.iter().map(|s| s.to_string()).collect(),
                ))
            }
        }
        "/report" => Parsed::Command(Command::Report),
        "/set_report_time" => match rest.first() {
            Some(raw) if parse_hh_mm(raw).is_some() => {
                Parsed::Command(Command::SetReportTime(raw.to_string()))
            }
            _ => Parsed::Usage("/set_report_time ЧЧ:ММ"),
        },
        "/set_reboot_time" => match rest.first() {
            Some(raw) if parse_hh_mm(raw).is_some() => {
                Parsed::Command(Command::SetRebootTime(raw.to_string()))
            }
            _ => Parsed::Usage("/set_reboot_time ЧЧ:ММ"),
        },
        "/set_alerts" => {
            let values: Vec<u8> = rest
                .iter()
                .filter_map(|raw| raw.parse::<u8>().ok())
                .filter(|v| *v <= 100)
                .collect();
            if values.len() == 3 && rest.len() == 3 {
                Parsed::Command(Command::SetAlerts {
                    cpu: values[0],
                    ram: values[1],
                    disk: values[2],
                })
            } else {
                Parsed::Usage("/set_alerts <cpu%> <ram%> <disk%>")
            }
        }
        "/add_ssh_key" => {
            if rest.is_empty() {
                Parsed::Usage("/add_ssh_key <публичный ключ>")
            } else {
                Parsed::Command(Command::AddSshKey(rest.join(" ")))
            }
        }
        "/upload" => Parsed::Command(Command::Upload),
        "/help" => Parsed::Command(Command::Help),
        _ => Parsed::Unknown,
    }
}

// Опасные операции идут через двухшаговое подтверждение: кнопка несёт
// закодированное действие целиком, нераспознанный токен игнорируется.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingAction {
    RestartService(String),
    StopService(String),
    RebootServer,
    ClearJournal,
    ClosePort(u16),
    DisableSsh,
}

impl PendingAction {
    pub fn encode(&self) -> String {
        match self {
            Self::RestartService(name) => format!("confirm:restart_service:{name}"),
            Self::StopService(name) => format!("confirm:stop_service:{name}"),
            Self::RebootServer => "confirm:reboot".to_string(),
            Self::ClearJournal => "confirm:clear_journal".to_string(),
            Self::ClosePort(port) => format!("confirm:close_port:{port}"),
            Self::DisableSsh => "confirm:disable_ssh".to_string(),
        }
    }

    pub fn decode(token: &str) -> Option<Self> {
        let rest = token.strip_prefix("confirm:")?;
        let (kind, arg) = match rest.split_once(':') {
            Some((kind, arg)) => (kind, Some(arg)),
            None => (rest, None),
        };
        match (kind, arg) {
            ("restart_service", Some(name)) if !name.is_empty() => {
                Some(Self::RestartService(name.to_string()))
            }
            ("stop_service", Some(name)) if !name.is_empty() => {
                Some(Self::StopService(name.to_string()))
            }
            ("reboot", None) => Some(Self::RebootServer),
            ("clear_journal", None) => Some(Self::ClearJournal),
            ("close_port", Some(port)) => port.parse().ok().map(Self::ClosePort),
            ("disable_ssh", None) => Some(Self::DisableSsh),
            _ => None,
        }
    }

    pub fn prompt(&self, bot_service_name: &str) -> String {
        let base = match self {
            Self::RestartService(name) => {
                format!("Перезапустить службу <code>{}</code>?", html_escape(name))
            }
            Self::StopService(name) => {
                format!("Остановить службу <code>{}</code>?", html_escape(name))
            }
            Self::RebootServer => "Перезагрузить сервер?".to_string(),
            Self::ClearJournal => "Очистить системные логи (journal старше суток)?".to_string(),
            Self::ClosePort(port) => {
                format!("Закрыть порт <code>{port}</code>, убив его процессы?")
            }
            Self::DisableSsh => {
                "Отключить SSH? Удалённый доступ по SSH станет недоступен.".to_string()
            }
        };
        let targets_self = matches!(
            self,
            Self::RestartService(name) | Self::StopService(name) if name == bot_service_name
        );
        if targets_self {
            format!("{base}\n\n⚠️ Это служба самого бота: после выполнения управление может прерваться!")
        } else {
            base
        }
    }

    async fn execute(&self) -> ActionResult {
        match self {
            Self::RestartService(name) => {
                actions::service_action(ServiceAction::Restart, name).await
            }
            Self::StopService(name) => actions::service_action(ServiceAction::Stop, name).await,
            Self::RebootServer => actions::reboot_server(),
            Self::ClearJournal => actions::clear_journal().await,
            Self::ClosePort(port) => actions::close_port(*port).await,
            Self::DisableSsh => actions::service_action(ServiceAction::Stop, "ssh").await,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CallbackAction {
    Menu,
    Status,
    Services,
    Ports,
    Report,
    Help,
    Settings,
    Security,
    SetServicesMode(ServicesMode),
    ToggleShowServices,
    ToggleShowPorts,
    ToggleAlerts,
    ToggleDailyReport,
    ToggleAutoReboot,
    SshEnable,
    LinkHere,
    UnlinkHere,
    Confirm(PendingAction),
    Cancel,
}

impl CallbackAction {
    fn from_data(data: &str) -> Option<Self> {
        if let Some(action) = PendingAction::decode(data) {
            return Some(Self::Confirm(action));
        }
        if let Some(mode) = data.strip_prefix("services_mode:") {
            return ServicesMode::parse(mode).map(Self::SetServicesMode);
        }
        match data {
            "menu" => Some(Self::Menu),
            "status" => Some(Self::Status),
            "services" => Some(Self::Services),
            "ports" => Some(Self::Ports),
            "report" => Some(Self::Report),
            "help" => Some(Self::Help),
            "settings" => Some(Self::Settings),
            "security" => Some(Self::Security),
            "toggle_services" => Some(Self::ToggleShowServices),
            "toggle_ports" => Some(Self::ToggleShowPorts),
            "toggle_alerts" => Some(Self::ToggleAlerts),
            "toggle_daily_report" => Some(Self::ToggleDailyReport),
            "toggle_auto_reboot" => Some(Self::ToggleAutoReboot),
            "ssh_enable" => Some(Self::SshEnable),
            "link_here" => Some(Self::LinkHere),
            "unlink_here" => Some(Self::UnlinkHere),
            "cancel" => Some(Self::Cancel),
            _ => None,
        }
    }

    fn requires_admin(&self) -> bool {
        !matches!(
            self,
            Self::Menu
                | Self::Status
                | Self::Services
                | Self::Ports
                | Self::Report
                | Self::Help
                | Self::Settings
                | Self::Security
                | Self::Cancel
        )
    }
}

pub async fn run_bot(
    bot: Bot,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), TelegramError> {
    let me = bot.get_me().await?;
    let runtime = BotRuntime {
        admins: state.cfg.telegram.admin_ids.iter().copied().collect(),
        bot_user_id: me.user.id,
        state,
    };

    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint(handle_message))
        .branch(Update::filter_callback_query().endpoint(handle_callback));

    let mut dispatcher = Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![runtime])
        .build();

    let mut dispatch_handle = tokio::spawn(async move {
        dispatcher.dispatch().await;
    });

    tokio::select! {
        _ = shutdown.changed() => {
            dispatch_handle.abort();
            let _ = (&mut dispatch_handle).await;
            info!("остановка Telegram-бота");
            Ok(())
        }
        result = &mut dispatch_handle => {
            match result {
                Ok(()) => Ok(()),
                Err(join_err) if join_err.is_cancelled() => Ok(()),
                Err(join_err) => {
                    warn!(error = %join_err, "задача Telegram завершилась с ошибкой");
                    Ok(())
                }
            }
        }
    }
}

async fn handle_message(bot: Bot, msg: Message, runtime: BotRuntime) -> ResponseResult<()> {
    if let Some(members) = msg.new_chat_members() {
        if members.iter().any(|user| user.id == runtime.bot_user_id) {
            if let Err(err) = link_chat(&bot, &runtime.state, msg.chat.id.0).await {
                warn!(chat_id = msg.chat.id.0, error = %err, "не удалось привязать новый чат");
            }
        }
        return Ok(());
    }

    if msg.document().is_some() {
        return handle_document(&bot, &msg, &runtime).await;
    }

    let Some(text) = msg.text() else {
        return Ok(());
    };
    let command = match parse_command(text) {
        Parsed::Command(command) => command,
        Parsed::Usage(hint) => {
            bot.send_message(msg.chat.id, format!("Использование: {hint}"))
                .await?;
            return Ok(());
        }
        Parsed::Unknown => return Ok(()),
    };

    let user_id = msg.from().map(|user| user.id.0);
    if command.requires_admin() && !runtime.is_admin(user_id) {
        bot.send_message(msg.chat.id, "❌ Нет прав").await?;
        return Ok(());
    }

    dispatch_command(&bot, &msg, &runtime, command).await
}

async fn dispatch_command(
    bot: &Bot,
    msg: &Message,
    runtime: &BotRuntime,
    command: Command,
) -> ResponseResult<()> {
    let chat_id = msg.chat.id;
    let state = &runtime.state;
    match command {
        Command::Start | Command::Menu => {
            send_view(bot, chat_id, &menu_text(), main_menu()).await?;
        }
        Command::Help => {
            send_view(bot, chat_id, &help_text(), main_menu()).await?;
        }
        Command::Status => {
            let text = state.build_status_text().await;
            send_view(bot, chat_id, &text, main_menu()).await?;
        }
        Command::Services => {
            let settings = state.settings().await;
            let services = probes::running_services().await;
            send_view(bot, chat_id, &format::format_services(&services, &settings), main_menu())
                .await?;
        }
        Command::Ports => {
            let settings = state.settings().await;
            let ports = format::filter_ports(&probes::open_ports().await, &settings);
            send_view(bot, chat_id, &format::format_ports(&ports), main_menu()).await?;
        }
        Command::Ping(host) => {
            let outcome = probes::ping_host(&host).await;
            send_view(bot, chat_id, &format::format_ping(&host, &outcome), main_menu()).await?;
        }
        Command::Logs { service, lines } => {
            let raw = probes::service_logs(&service, lines).await;
            let text = format!("<pre>{}</pre>", html_escape(&tail_chars(&raw, LOG_REPLY_LIMIT)));
            bot.send_message(chat_id, text)
                .parse_mode(ParseMode::Html)
                .await?;
        }
        Command::RestartService(name) => {
            send_confirm(bot, chat_id, runtime, PendingAction::RestartService(name)).await?;
        }
        Command::StopService(name) => {
            send_confirm(bot, chat_id, runtime, PendingAction::StopService(name)).await?;
        }
        Command::Reboot => {
            send_confirm(bot, chat_id, runtime, PendingAction::RebootServer).await?;
        }
        Command::ClearLogs => {
            send_confirm(bot, chat_id, runtime, PendingAction::ClearJournal).await?;
        }
        Command::ClosePort(port) => {
            send_confirm(bot, chat_id, runtime, PendingAction::ClosePort(port)).await?;
        }
        Command::AddChannel => match link_chat(bot, state, chat_id.0).await {
            Ok(()) => {
                bot.send_message(chat_id, "✅ Чат привязан к статусным рассылкам")
                    .await?;
            }
            Err(err) => {
                warn!(chat_id = chat_id.0, error = %err, "не удалось привязать чат");
                bot.send_message(chat_id, "❌ Не удалось привязать чат").await?;
            }
        },
        Command::RemoveChannel => {
            state.store.lock().await.remove_channel(chat_id.0);
            bot.send_message(chat_id, "Чат отвязан от рассылок").await?;
        }
        Command::LinkChannel(target) => match link_chat(bot, state, target).await {
            Ok(()) => {
                bot.send_message(chat_id, format!("✅ Чат {target} привязан"))
                    .await?;
            }
            Err(err) => {
                warn!(chat_id = target, error = %err, "не удалось привязать чат по id");
                bot.send_message(chat_id, format!("❌ Не удалось привязать чат {target}: {err}"))
                    .await?;
            }
        },
        Command::Broadcast(text) => {
            let sent = broadcast(bot, state, &html_escape(&text)).await;
            bot.send_message(chat_id, format!("📣 Отправлено в {sent} чатов"))
                .await?;
        }
        Command::ShowBlacklist => {
            let settings = state.settings().await;
            let listed = if settings.services_blacklist.is_empty() {
                "пуст".to_string()
            } else {
                settings
                    .services_blacklist
                    .iter()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            bot.send_message(chat_id, format!("Чёрный список служб: {listed}"))
                .await?;
        }
        Command::SetBlacklist(names) => {
            let listed = names.join(", ");
            state.store.lock().await.update_settings(SettingsPatch {
                services_blacklist: Some(names.into_iter().collect()),
                ..SettingsPatch::default()
            });
            bot.send_message(chat_id, format!("✅ Чёрный список служб: {listed}"))
                .await?;
        }
        Command::Report => {
            let date = chrono::Local::now().format("%Y-%m-%d").to_string();
            let stats = { state.store.lock().await.daily_stats(Some(&date)) };
            send_view(bot, chat_id, &format::format_daily_report(&date, stats.as_ref()), main_menu())
                .await?;
        }
        Command::SetReportTime(time) => {
            state.store.lock().await.update_settings(SettingsPatch {
                daily_report_time: Some(time.clone()),
                ..SettingsPatch::default()
            });
            bot.send_message(chat_id, format!("✅ Время дневного отчёта: {time}"))
                .await?;
        }
        Command::SetRebootTime(time) => {
            state.store.lock().await.update_settings(SettingsPatch {
                auto_reboot_time: Some(time.clone()),
                ..SettingsPatch::default()
            });
            bot.send_message(chat_id, format!("✅ Время автоперезагрузки: {time}"))
                .await?;
        }
        Command::SetAlerts { cpu, ram, disk } => {
            state.store.lock().await.update_settings(SettingsPatch {
                alert_cpu: Some(cpu),
                alert_ram: Some(ram),
                alert_disk: Some(disk),
                ..SettingsPatch::default()
            });
            bot.send_message(
                chat_id,
                format!("✅ Пороги алертов: CPU {cpu}% / RAM {ram}% / Disk {disk}%"),
            )
            .await?;
        }
        Command::AddSshKey(key) => {
            let result = actions::add_ssh_key(&key).await;
            bot.send_message(chat_id, action_reply(&result)).await?;
        }
        Command::Upload => {
            bot.send_message(chat_id, "Пришлите файл документом, он будет сохранён на сервере")
                .await?;
        }
    }
    Ok(())
}

async fn handle_callback(bot: Bot, q: CallbackQuery, runtime: BotRuntime) -> ResponseResult<()> {
    let Some(data) = q.data.as_deref() else {
        bot.answer_callback_query(q.id).await?;
        return Ok(());
    };
    // Нераспознанный токен — no-op.
    let Some(action) = CallbackAction::from_data(data) else {
        bot.answer_callback_query(q.id).await?;
        return Ok(());
    };
    let Some(message) = q.message.as_ref() else {
        bot.answer_callback_query(q.id).await?;
        return Ok(());
    };
    let chat_id = message.chat.id;
    let message_id = message.id;

    if action.requires_admin() && !runtime.is_admin(Some(q.from.id.0)) {
        bot.answer_callback_query(q.id).text("❌ Нет прав").await?;
        return Ok(());
    }
    bot.answer_callback_query(q.id).await?;

    let state = &runtime.state;
    let (text, keyboard) = match action {
        CallbackAction::Menu => (menu_text(), main_menu()),
        CallbackAction::Help => (help_text(), main_menu()),
        CallbackAction::Status => (state.build_status_text().await, main_menu()),
        CallbackAction::Services => {
            let settings = state.settings().await;
            let services = probes::running_services().await;
            (format::format_services(&services, &settings), main_menu())
        }
        CallbackAction::Ports => {
            let settings = state.settings().await;
            let ports = format::filter_ports(&probes::open_ports().await, &settings);
            (format::format_ports(&ports), main_menu())
        }
        CallbackAction::Report => {
            let date = chrono::Local::now().format("%Y-%m-%d").to_string();
            let stats = { state.store.lock().await.daily_stats(Some(&date)) };
            (format::format_daily_report(&date, stats.as_ref()), main_menu())
        }
        CallbackAction::Settings => settings_view(state).await,
        CallbackAction::Security => security_view().await,
        CallbackAction::SetServicesMode(mode) => {
            state.store.lock().await.update_settings(SettingsPatch {
                services_mode: Some(mode),
                ..SettingsPatch::default()
            });
            settings_view(state).await
        }
        CallbackAction::ToggleShowServices => {
            toggle_setting(state, |settings| SettingsPatch {
                show_services: Some(!settings.show_services),
                ..SettingsPatch::default()
            })
            .await;
            settings_view(state).await
        }
        CallbackAction::ToggleShowPorts => {
            toggle_setting(state, |settings| SettingsPatch {
                show_ports: Some(!settings.show_ports),
                ..SettingsPatch::default()
            })
            .await;
            settings_view(state).await
        }
        CallbackAction::ToggleAlerts => {
            toggle_setting(state, |settings| SettingsPatch {
                alerts_enabled: Some(!settings.alerts_enabled),
                ..SettingsPatch::default()
            })
            .await;
            settings_view(state).await
        }
        CallbackAction::ToggleDailyReport => {
            toggle_setting(state, |settings| SettingsPatch {
                daily_report_enabled: Some(!settings.daily_report_enabled),
                ..SettingsPatch::default()
            })
            .await;
            settings_view(state).await
        }
        CallbackAction::ToggleAutoReboot => {
            toggle_setting(state, |settings| SettingsPatch {
                auto_reboot_enabled: Some(!settings.auto_reboot_enabled),
                ..SettingsPatch::default()
            })
            .await;
            settings_view(state).await
        }
        CallbackAction::SshEnable => {
            let result = actions::service_action(ServiceAction::Start, "ssh").await;
            let (text, keyboard) = security_view().await;
            (format!("{}\n\n{text}", action_reply(&result)), keyboard)
        }
        CallbackAction::LinkHere => match link_chat(&bot, state, chat_id.0).await {
            Ok(()) => ("✅ Чат привязан к статусным рассылкам".to_string(), main_menu()),
            Err(err) => {
                warn!(chat_id = chat_id.0, error = %err, "не удалось привязать чат");
                ("❌ Не удалось привязать чат".to_string(), main_menu())
            }
        },
        CallbackAction::UnlinkHere => {
            state.store.lock().await.remove_channel(chat_id.0);
            ("Чат отвязан от рассылок".to_string(), main_menu())
        }
        CallbackAction::Confirm(pending) => {
            let result = pending.execute().await;
            (action_reply(&result), main_menu())
        }
        CallbackAction::Cancel => ("Действие отменено".to_string(), main_menu()),
    };

    edit_or_send(&bot, chat_id, Some(message_id), &text, keyboard).await
}

async fn handle_document(bot: &Bot, msg: &Message, runtime: &BotRuntime) -> ResponseResult<()> {
    let user_id = msg.from().map(|user| user.id.0);
    if !runtime.is_admin(user_id) {
        bot.send_message(msg.chat.id, "❌ Нет прав").await?;
        return Ok(());
    }
    let Some(doc) = msg.document() else {
        return Ok(());
    };

    let raw_name = doc
        .file_name
        .clone()
        .unwrap_or_else(|| format!("file_{}", doc.file.unique_id));
    // Берём только имя файла, без каталогов из присланного имени.
    let name = Path::new(&raw_name)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| format!("file_{}", doc.file.unique_id));
    let dir = &runtime.state.cfg.upload_dir;
    let dest = dir.join(&name);

    if let Err(err) = tokio::fs::create_dir_all(dir).await {
        warn!(error = %err, "не удалось создать каталог загрузок");
        bot.send_message(msg.chat.id, format!("❌ Ошибка сохранения: {err}"))
            .await?;
        return Ok(());
    }
    let file = bot.get_file(doc.file.id.clone()).await?;
    let mut out = match tokio::fs::File::create(&dest).await {
        Ok(out) => out,
        Err(err) => {
            bot.send_message(msg.chat.id, format!("❌ Ошибка сохранения: {err}"))
                .await?;
            return Ok(());
        }
    };
    if let Err(err) = bot.download_file(&file.path, &mut out).await {
        warn!(error = %err, "не удалось скачать файл из Telegram");
        bot.send_message(msg.chat.id, "❌ Не удалось скачать файл")
            .await?;
        return Ok(());
    }

    info!(path = %dest.display(), "файл загружен");
    bot.send_message(
        msg.chat.id,
        format!("📥 Файл сохранён: <code>{}</code>", html_escape(&dest.display().to_string())),
    )
    .parse_mode(ParseMode::Html)
    .await?;
    Ok(())
}

async fn toggle_setting(
    state: &AppState,
    patch_fn: impl FnOnce(&crate::store::Settings) -> SettingsPatch,
) {
    let mut store = state.store.lock().await;
    let current = store.settings();
    store.update_settings(patch_fn(&current));
}

// Привязка: шлём свежий статус и регистрируем его id как отслеживаемое сообщение.
pub async fn link_chat(
    bot: &Bot,
    state: &AppState,
    chat_id: i64,
) -> Result<(), teloxide::RequestError> {
    let text = state.build_status_text().await;
    let sent = bot
        .send_message(ChatId(chat_id), text)
        .parse_mode(ParseMode::Html)
        .await?;
    state.store.lock().await.add_channel(chat_id, sent.id.0);
    info!(chat_id, "чат привязан к статусным рассылкам");
    Ok(())
}

pub async fn push_status_to_channels(bot: &Bot, state: &AppState, text: &str) {
    let channels = { state.store.lock().await.channels() };
    for (chat_id, message_id) in channels {
        let result = bot
            .edit_message_text(ChatId(chat_id), MessageId(message_id), text)
            .parse_mode(ParseMode::Html)
            .await;
        let Err(err) = result else {
            continue;
        };
        let err_text = err.to_string();
        if err_text.contains("message is not modified") {
            continue;
        }
        if should_resend_status(&err_text) {
            // Самовосстановление: сообщение пропало или чат временно
            // недоступен, шлём новое и перепривязываем. Запись канала
            // не удаляем — отвязка только по явной команде.
            match bot
                .send_message(ChatId(chat_id), text)
                .parse_mode(ParseMode::Html)
                .await
            {
                Ok(sent) => {
                    state.store.lock().await.add_channel(chat_id, sent.id.0);
                    info!(chat_id, "статусное сообщение пересоздано");
                }
                Err(err) => {
                    warn!(chat_id, error = %err, "не удалось пересоздать статусное сообщение, повтор на следующем тике");
                }
            }
        } else {
            warn!(chat_id, error = %err, "не удалось обновить статус");
        }
    }
}

pub async fn broadcast(bot: &Bot, state: &AppState, text: &str) -> usize {
    let channels = { state.store.lock().await.channels() };
    let mut sent = 0;
    for (chat_id, _) in channels {
        match bot
            .send_message(ChatId(chat_id), text)
            .parse_mode(ParseMode::Html)
            .await
        {
            Ok(_) => sent += 1,
            Err(err) => {
                warn!(chat_id, error = %err, "не удалось отправить сообщение");
            }
        }
    }
    sent
}

// Любая «gone»-ошибка редактирования ведёт к пересозданию сообщения.
pub fn should_resend_status(err_text: &str) -> bool {
    is_message_gone(err_text) || is_chat_gone(err_text)
}

pub fn is_message_gone(err_text: &str) -> bool {
    err_text.contains("message to edit not found") || err_text.contains("message can't be edited")
}

pub fn is_chat_gone(err_text: &str) -> bool {
    err_text.contains("chat not found") || err_text.contains("bot was blocked")
}

pub fn html_escape(raw: &str) -> String {
    raw.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn tail_chars(raw: &str, limit: usize) -> String {
    let count = raw.chars().count();
    if count <= limit {
        raw.to_string()
    } else {
        raw.chars().skip(count - limit).collect()
    }
}

fn action_reply(result: &ActionResult) -> String {
    let mark = if result.ok { "✅" } else { "❌" };
    format!("{mark} {}", html_escape(&result.message))
}

async fn send_view(
    bot: &Bot,
    chat_id: ChatId,
    text: &str,
    keyboard: InlineKeyboardMarkup,
) -> ResponseResult<()> {
    bot.send_message(chat_id, text)
        .parse_mode(ParseMode::Html)
        .reply_markup(keyboard)
        .await?;
    Ok(())
}

async fn send_confirm(
    bot: &Bot,
    chat_id: ChatId,
    runtime: &BotRuntime,
    action: PendingAction,
) -> ResponseResult<()> {
    let text = action.prompt(&runtime.state.cfg.bot_service_name);
    let keyboard = confirm_keyboard(&action);
    bot.send_message(chat_id, text)
        .parse_mode(ParseMode::Html)
        .reply_markup(keyboard)
        .await?;
    Ok(())
}

async fn edit_or_send(
    bot: &Bot,
    chat_id: ChatId,
    message_id: Option<MessageId>,
    text: &str,
    keyboard: InlineKeyboardMarkup,
) -> ResponseResult<()> {
    if let Some(message_id) = message_id {
        match bot
            .edit_message_text(chat_id, message_id, text)
            .parse_mode(ParseMode::Html)
            .reply_markup(keyboard.clone())
            .await
        {
            Ok(_) => return Ok(()),
            Err(err) if err.to_string().contains("message is not modified") => return Ok(()),
            Err(_) => {}
        }
    }
    bot.send_message(chat_id, text)
        .parse_mode(ParseMode::Html)
        .reply_markup(keyboard)
        .await?;
    Ok(())
}

async fn settings_view(state: &AppState) -> (String, InlineKeyboardMarkup) {
    let settings = state.settings().await;
    let mark = |on: bool| if on { "✅" } else { "❌" };
    let mode_label = match settings.services_mode {
        ServicesMode::All => "все",
        ServicesMode::Filtered => "без системных",
        ServicesMode::Custom => "кастомный список",
    };
    let text = [
        "⚙️ <b>НАСТРОЙКИ</b>".to_string(),
        String::new(),
        format!("{} Службы в статусе (режим: {mode_label})", mark(settings.show_services)),
        format!("{} Порты в статусе", mark(settings.show_ports)),
        format!(
            "{} Алерты: CPU {}% / RAM {}% / Disk {}%",
            mark(settings.alerts_enabled),
            settings.alert_cpu,
            settings.alert_ram,
            settings.alert_disk
        ),
        format!(
            "{} Дневной отчёт в {}",
            mark(settings.daily_report_enabled),
            settings.daily_report_time
        ),
        format!(
            "{} Автоперезагрузка в {}",
            mark(settings.auto_reboot_enabled),
            settings.auto_reboot_time
        ),
        String::new(),
        format!(
            "Чёрный список служб: {}",
            if settings.services_blacklist.is_empty() {
                "пуст".to_string()
            } else {
                settings
                    .services_blacklist
                    .iter()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ")
            }
        ),
    ]
    .join("\n");

    let mode_button = |label: &str, mode: ServicesMode| {
        let marked = if settings.services_mode == mode {
            format!("• {label}")
        } else {
            label.to_string()
        };
        InlineKeyboardButton::callback(marked, format!("services_mode:{}", mode.as_str()))
    };

    let keyboard = InlineKeyboardMarkup::new(vec![
        vec![
            InlineKeyboardButton::callback(
                format!("{} Службы", mark(settings.show_services)),
                "toggle_services",
            ),
            InlineKeyboardButton::callback(
                format!("{} Порты", mark(settings.show_ports)),
                "toggle_ports",
            ),
        ],
        vec![
            mode_button("Все", ServicesMode::All),
            mode_button("Без сист.", ServicesMode::Filtered),
            mode_button("Кастом", ServicesMode::Custom),
        ],
        vec![InlineKeyboardButton::callback(
            format!("{} Алерты", mark(settings.alerts_enabled)),
            "toggle_alerts",
        )],
        vec![
            InlineKeyboardButton::callback(
                format!("{} Отчёт", mark(settings.daily_report_enabled)),
                "toggle_daily_report",
            ),
            InlineKeyboardButton::callback(
                format!("{} Авторебут", mark(settings.auto_reboot_enabled)),
                "toggle_auto_reboot",
            ),
        ],
        vec![
            InlineKeyboardButton::callback("🔗 Связать чат", "link_here"),
            InlineKeyboardButton::callback("Отвязать чат", "unlink_here"),
        ],
        vec![InlineKeyboardButton::callback("⬅ Меню", "menu")],
    ]);

    (text, keyboard)
}

async fn security_view() -> (String, InlineKeyboardMarkup) {
    let ssh_active = actions::ssh_is_active().await;
    let autostart = actions::autostart_services().await;

    let mut lines = vec![
        "🔒 <b>БЕЗОПАСНОСТЬ</b>".to_string(),
        String::new(),
        format!("SSH: {}", if ssh_active { "🟢 активен" } else { "🔴 неактивен" }),
        String::new(),
        format!("Автозапуск служб ({}):", autostart.len()),
    ];
    for name in autostart.iter().take(AUTOSTART_SHOWN) {
        lines.push(format!("• <code>{}</code>", html_escape(name)));
    }
    if autostart.len() > AUTOSTART_SHOWN {
        lines.push(format!("<i>...и ещё {}</i>", autostart.len() - AUTOSTART_SHOWN));
    }

    let keyboard = InlineKeyboardMarkup::new(vec![
        vec![
            InlineKeyboardButton::callback("🟢 Включить SSH", "ssh_enable"),
            InlineKeyboardButton::callback(
                "🔴 Отключить SSH",
                PendingAction::DisableSsh.encode(),
            ),
        ],
        vec![InlineKeyboardButton::callback("⬅ Меню", "menu")],
    ]);

    (lines.join("\n"), keyboard)
}

fn confirm_keyboard(action: &PendingAction) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![
        InlineKeyboardButton::callback("✅ Подтвердить", action.encode()),
        InlineKeyboardButton::callback("❌ Отмена", "cancel"),
    ]])
}

fn main_menu() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![
        vec![
            InlineKeyboardButton::callback("📊 Статус", "status"),
            InlineKeyboardButton::callback("🔧 Службы", "services"),
            InlineKeyboardButton::callback("🔌 Порты", "ports"),
        ],
        vec![
            InlineKeyboardButton::callback("⚙️ Настройки", "settings"),
            InlineKeyboardButton::callback("🔒 Безопасность", "security"),
        ],
        vec![
            InlineKeyboardButton::callback("📈 Отчёт", "report"),
            InlineKeyboardButton::callback("ℹ️ Помощь", "help"),
        ],
    ])
}

fn menu_text() -> String {
    "🤖 <b>Панель управления сервером</b>\n\nВыберите раздел:".to_string()
}

fn help_text() -> String {
    [
        "<b>Команды</b>",
        "• /status - статус сервера",
        "• /services - запущенные службы",
        "• /ports - открытые порты",
        "• /ping хост - проверить доступность",
        "• /logs служба [строк] - последние логи",
        "• /restart_service служба - перезапуск (с подтверждением)",
        "• /stop_service служба - остановка (с подтверждением)",
        "• /reboot - перезагрузка сервера (с подтверждением)",
        "• /clear_logs - очистить журнал (с подтверждением)",
        "• /close_port порт - закрыть порт (с подтверждением)",
        "• /add_channel, /remove_channel - привязка этого чата",
        "• /link_channel id - привязать чат по id",
        "• /broadcast текст - сообщение во все чаты",
        "• /report - дневной отчёт",
        "• /set_report_time ЧЧ:ММ, /set_reboot_time ЧЧ:ММ",
        "• /set_alerts cpu ram disk - пороги алертов",
        "• /set_blacklist [имена] - чёрный список служб",
        "• /add_ssh_key ключ - добавить SSH ключ",
        "• /upload - загрузка файла на сервер",
    ]
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_action_tokens_round_trip() {
        let actions = [
            PendingAction::RestartService("nginx".to_string()),
            PendingAction::StopService("cron".to_string()),
            PendingAction::RebootServer,
            PendingAction::ClearJournal,
            PendingAction::ClosePort(8080),
            PendingAction::DisableSsh,
        ];
        for action in actions {
            let token = action.encode();
            assert_eq!(PendingAction::decode(&token), Some(action), "токен {token}");
        }
    }

    #[test]
    fn unknown_tokens_are_noop() {
        for token in [
            "",
            "confirm",
            "confirm:",
            "confirm:unknown",
            "confirm:restart_service:",
            "confirm:close_port:abc",
            "confirm:reboot:extra",
            "что-то",
        ] {
            assert_eq!(PendingAction::decode(token), None, "токен {token:?}");
        }
        assert_eq!(CallbackAction::from_data("garbage"), None);
    }

    #[test]
    fn callback_data_maps_to_actions() {
        assert_eq!(CallbackAction::from_data("menu"), Some(CallbackAction::Menu));
        assert_eq!(
            CallbackAction::from_data("services_mode:custom"),
            Some(CallbackAction::SetServicesMode(ServicesMode::Custom))
        );
        assert_eq!(
            CallbackAction::from_data("confirm:close_port:22"),
            Some(CallbackAction::Confirm(PendingAction::ClosePort(22)))
        );
        assert_eq!(CallbackAction::from_data("cancel"), Some(CallbackAction::Cancel));
    }

    #[test]
    fn empty_admin_list_treats_everyone_as_admin() {
        // Поведение совместимости с исходной конфигурацией: пустой список
        // означает полное отсутствие ограничений. Де-факто это дыра в
        // провижининге, на старте пишется предупреждение.
        let admins = HashSet::new();
        assert!(admin_allowed(&admins, Some(1)));
        assert!(admin_allowed(&admins, None));
    }

    #[test]
    fn non_empty_admin_list_filters_callers() {
        let admins: HashSet<u64> = [42].into_iter().collect();
        assert!(admin_allowed(&admins, Some(42)));
        assert!(!admin_allowed(&admins, Some(7)));
        assert!(!admin_allowed(&admins, None));
    }

    #[test]
    fn parses_commands_with_arguments() {
        assert_eq!(parse_command("/status"), Parsed::Command(Command::Status));
        assert_eq!(
            parse_command("/status@my_bot"),
            Parsed::Command(Command::Status)
        );
        assert_eq!(
            parse_command("/ping example.com"),
            Parsed::Command(Command::Ping("example.com".to_string()))
        );
        assert_eq!(
            parse_command("/close_port 8080"),
            Parsed::Command(Command::ClosePort(8080))
        );
        assert_eq!(
            parse_command("/logs nginx 50"),
            Parsed::Command(Command::Logs {
                service: "nginx".to_string(),
                lines: 50,
            })
        );
        assert_eq!(
            parse_command("/set_alerts 70 80 90"),
            Parsed::Command(Command::SetAlerts {
                cpu: 70,
                ram: 80,
                disk: 90,
            })
        );
    }

    #[test]
    fn malformed_arguments_return_usage_hint() {
        assert!(matches!(parse_command("/ping"), Parsed::Usage(_)));
        assert!(matches!(parse_command("/close_port abc"), Parsed::Usage(_)));
        assert!(matches!(parse_command("/close_port 0"), Parsed::Usage(_)));
        assert!(matches!(parse_command("/set_alerts 70 80"), Parsed::Usage(_)));
        assert!(matches!(parse_command("/set_alerts 70 80 120"), Parsed::Usage(_)));
        assert!(matches!(parse_command("/set_report_time 25:00"), Parsed::Usage(_)));
        assert!(matches!(parse_command("/logs nginx 0"), Parsed::Usage(_)));
    }

    #[test]
    fn unknown_text_is_ignored() {
        assert_eq!(parse_command("/whatever"), Parsed::Unknown);
        assert_eq!(parse_command("привет"), Parsed::Unknown);
        assert_eq!(parse_command(""), Parsed::Unknown);
    }

    #[test]
    fn gone_error_classification() {
        assert!(is_message_gone("Bad Request: message to edit not found"));
        assert!(is_message_gone("Bad Request: message can't be edited"));
        assert!(!is_message_gone("Bad Request: chat not found"));

        assert!(is_chat_gone("Bad Request: chat not found"));
        assert!(is_chat_gone("Forbidden: bot was blocked by the user"));
        assert!(!is_chat_gone("Bad Request: message to edit not found"));
    }

    #[test]
    fn blocked_chat_falls_back_to_resend() {
        // Заблокированный или пропавший чат не отвязывается, а идёт на
        // пересоздание статусного сообщения.
        assert!(should_resend_status("Forbidden: bot was blocked by the user"));
        assert!(should_resend_status("Bad Request: chat not found"));
        assert!(should_resend_status("Bad Request: message to edit not found"));
        assert!(should_resend_status("Bad Request: message can't be edited"));
        assert!(!should_resend_status("Bad Request: message is not modified"));
    }

    #[test]
    fn logs_command_requires_admin() {
        let logs = Command::Logs {
            service: "nginx".to_string(),
            lines: 30,
        };
        assert!(logs.requires_admin());
        assert!(!Command::Status.requires_admin());
        assert!(!Command::ShowBlacklist.requires_admin());
    }

    #[test]
    fn bare_set_blacklist_shows_current_list() {
        assert_eq!(
            parse_command("/set_blacklist"),
            Parsed::Command(Command::ShowBlacklist)
        );
        assert_eq!(
            parse_command("/set_blacklist snapd cron"),
            Parsed::Command(Command::SetBlacklist(vec![
                "snapd".to_string(),
                "cron".to_string(),
            ]))
        );
    }

    #[test]
    fn self_service_prompt_carries_extra_warning() {
        let action = PendingAction::RestartService("tg-control-agent".to_string());
        let prompt = action.prompt("tg-control-agent");
        assert!(prompt.contains("служба самого бота"));

        let other = PendingAction::RestartService("nginx".to_string());
        assert!(!other.prompt("tg-control-agent").contains("служба самого бота"));
    }

    #[test]
    fn escapes_html_in_log_output() {
        assert_eq!(html_escape("a<b>&c"), "a&lt;b&gt;&amp;c");
    }

    #[test]
    fn tail_keeps_last_chars() {
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("abc", 10), "abc");
    }
}
