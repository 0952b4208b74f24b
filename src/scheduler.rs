use crate::actions;
use crate::collectors::ResourceSnapshot;
use crate::format;
use crate::state::AppState;
use crate::store::Settings;
use crate::telegram;
use std::collections::BTreeSet;
use std::time::Duration;
use teloxide::Bot;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{info, warn};

const STATUS_FIRST_DELAY: Duration = Duration::from_secs(15);
const ALERT_FIRST_DELAY: Duration = Duration::from_secs(30);
const ALERT_PERIOD: Duration = Duration::from_secs(60);
const CLOCK_PERIOD: Duration = Duration::from_secs(60);
const STARTUP_DELAY: Duration = Duration::from_secs(10);

pub async fn run(bot: Bot, state: AppState, shutdown: watch::Receiver<bool>) {
    tokio::join!(
        status_push_loop(bot.clone(), state.clone(), shutdown.clone()),
        alerts_loop(bot.clone(), state.clone(), shutdown.clone()),
        daily_report_loop(bot.clone(), state.clone(), shutdown.clone()),
        auto_reboot_loop(bot.clone(), state.clone(), shutdown.clone()),
        startup_notice(bot, state, shutdown),
    );
}

pub fn breached_metrics(snapshot: &ResourceSnapshot, settings: &Settings) -> BTreeSet<String> {
    let mut breaches = BTreeSet::new();
    if snapshot.cpu_percent > settings.alert_cpu as f64 {
        breaches.insert("CPU".to_string());
    }
    if snapshot.mem_percent > settings.alert_ram as f64 {
        breaches.insert("RAM".to_string());
    }
    if snapshot.disk_percent > settings.alert_disk as f64 {
        breaches.insert("Disk".to_string());
    }
    breaches
}

// Подавление повторов: неизменившийся набор нарушений не шлётся заново,
// пустой набор сбрасывает подпись и разрешает повторный алерт.
#[derive(Debug, Default)]
pub struct AlertTracker {
    active: BTreeSet<String>,
}

impl AlertTracker {
    pub fn update(&mut self, breaches: BTreeSet<String>) -> Option<BTreeSet<String>> {
        if breaches == self.active {
            return None;
        }
        self.active = breaches.clone();
        if breaches.is_empty() {
            None
        } else {
            Some(breaches)
        }
    }
}

// Срабатывает не чаще раза за конкретную минуту конкретной даты,
// поэтому на следующий день в то же время сработает снова.
#[derive(Debug, Default)]
pub struct MinuteLatch {
    fired_at: Option<String>,
}

impl MinuteLatch {
    pub fn should_fire(&mut self, date: &str, now_hm: &str, configured: &str) -> bool {
        if now_hm != configured {
            return false;
        }
        let key = format!("{date} {now_hm}");
        if self.fired_at.as_deref() == Some(key.as_str()) {
            return false;
        }
        self.fired_at = Some(key);
        true
    }
}

pub fn parse_hh_mm(raw: &str) -> Option<(u8, u8)> {
    let (hours, minutes) = raw.split_once(':')?;
    if hours.len() != 2 || minutes.len() != 2 {
        return None;
    }
    let hours: u8 = hours.parse().ok()?;
    let minutes: u8 = minutes.parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    Some((hours, minutes))
}

async fn status_push_loop(bot: Bot, state: AppState, mut shutdown: watch::Receiver<bool>) {
    let period = Duration::from_secs(state.cfg.interval_secs.max(1));
    let mut ticker = interval_at(Instant::now() + STATUS_FIRST_DELAY, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                // Статистика пишется на каждом тике, даже без привязанных чатов.
                let snapshot = state.record_tick().await;
                let has_channels = { !state.store.lock().await.channels().is_empty() };
                if !has_channels {
                    continue;
                }
                let text = state.render_status(&snapshot).await;
                telegram::push_status_to_channels(&bot, &state, &text).await;
            }
        }
    }
    info!("остановка задачи статуса");
}

async fn alerts_loop(bot: Bot, state: AppState, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval_at(Instant::now() + ALERT_FIRST_DELAY, ALERT_PERIOD);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut tracker = AlertTracker::default();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let settings = state.settings().await;
                if !settings.alerts_enabled {
                    continue;
                }
                let snapshot = state.snapshot().await;
                let breaches = breached_metrics(&snapshot, &settings);
                if let Some(breaches) = tracker.update(breaches) {
                    let text = format::format_alert(&snapshot, &settings, &breaches);
                    telegram::broadcast(&bot, &state, &text).await;
                }
            }
        }
    }
    info!("остановка задачи алертов");
}

async fn daily_report_loop(bot: Bot, state: AppState, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval_at(Instant::now() + CLOCK_PERIOD, CLOCK_PERIOD);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut latch = MinuteLatch::default();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let settings = state.settings().await;
                if !settings.daily_report_enabled {
                    continue;
                }
                let now = chrono::Local::now();
                let date = now.format("%Y-%m-%d").to_string();
                let now_hm = now.format("%H:%M").to_string();
                if !latch.should_fire(&date, &now_hm, &settings.daily_report_time) {
                    continue;
                }
                let stats = { state.store.lock().await.daily_stats(Some(&date)) };
                let text = format::format_daily_report(&date, stats.as_ref());
                telegram::broadcast(&bot, &state, &text).await;
                info!(date = %date, "дневной отчёт отправлен");
            }
        }
    }
    info!("остановка задачи дневного отчёта");
}

async fn auto_reboot_loop(bot: Bot, state: AppState, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval_at(Instant::now() + CLOCK_PERIOD, CLOCK_PERIOD);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut latch = MinuteLatch::default();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let settings = state.settings().await;
                if !settings.auto_reboot_enabled {
                    continue;
                }
                let now = chrono::Local::now();
                let date = now.format("%Y-%m-%d").to_string();
                let now_hm = now.format("%H:%M").to_string();
                if !latch.should_fire(&date, &now_hm, &settings.auto_reboot_time) {
                    continue;
                }
                // Уведомление best-effort: перезагрузка не зависит от доставки.
                telegram::broadcast(
                    &bot,
                    &state,
                    "⚠️ <b>Автоперезагрузка</b>: сервер будет перезагружен через 5 секунд",
                )
                .await;
                let result = actions::reboot_server();
                if result.ok {
                    info!("автоперезагрузка запущена");
                } else {
                    warn!(error = %result.message, "автоперезагрузка не запустилась");
                }
            }
        }
    }
    info!("остановка задачи автоперезагрузки");
}

async fn startup_notice(bot: Bot, state: AppState, mut shutdown: watch::Receiver<bool>) {
    tokio::select! {
        _ = shutdown.changed() => return,
        _ = tokio::time::sleep(STARTUP_DELAY) => {}
    }
    let has_channels = { !state.store.lock().await.channels().is_empty() };
    if !has_channels {
        return;
    }
    let sent = telegram::broadcast(&bot, &state, "🚀 Бот снова онлайн и следит за сервером").await;
    info!(chats = sent, "отправлено уведомление о старте");
}
