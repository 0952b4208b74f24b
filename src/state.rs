use crate::collectors::services as probes;
use crate::collectors::system::SystemCollector;
use crate::collectors::ResourceSnapshot;
use crate::config::Config;
use crate::format;
use crate::store::{Settings, StatusStore};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub store: Arc<Mutex<StatusStore>>,
    pub collector: Arc<Mutex<SystemCollector>>,
}

impl AppState {
    pub fn new(cfg: Config, store: StatusStore) -> Self {
        Self {
            cfg: Arc::new(cfg),
            store: Arc::new(Mutex::new(store)),
            collector: Arc::new(Mutex::new(SystemCollector::new())),
        }
    }

    pub async fn settings(&self) -> Settings {
        self.store.lock().await.settings()
    }

    pub async fn snapshot(&self) -> ResourceSnapshot {
        self.collector.lock().await.snapshot()
    }

    // Снимок метрик с записью в дневную статистику; выполняется на каждом
    // тике независимо от наличия привязанных чатов.
    pub async fn record_tick(&self) -> ResourceSnapshot {
        let snapshot = self.snapshot().await;
        {
            let mut store = self.store.lock().await;
            store.record_stats(
                snapshot.cpu_percent,
                snapshot.mem_percent,
                snapshot.disk_percent,
                snapshot.net_recv_mb,
                snapshot.net_sent_mb,
            );
        }
        snapshot
    }

    // Текст статуса по готовому снимку: списки служб и портов
    // по текущим настройкам.
    pub async fn render_status(&self, snapshot: &ResourceSnapshot) -> String {
        let settings = self.settings().await;

        let services = if settings.show_services {
            probes::running_services().await
        } else {
            Vec::new()
        };
        let ports = if settings.show_ports {
            probes::open_ports().await
        } else {
            Vec::new()
        };

        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        format::format_status(snapshot, &services, &ports, &settings, &timestamp)
    }

    pub async fn build_status_text(&self) -> String {
        let snapshot = self.record_tick().await;
        self.render_status(&snapshot).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tick_records_daily_stats_without_linked_chats() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cfg = Config::default();
        cfg.store_path = dir.path().join("status_messages.json");
        let store = StatusStore::load(&cfg.store_path);
        assert!(store.channels().is_empty());

        let state = AppState::new(cfg, store);
        state.record_tick().await;

        let today = chrono::Local::now().format("%Y-%m-%d").to_string();
        assert!(state.store.lock().await.daily_stats(Some(&today)).is_some());
    }
}
