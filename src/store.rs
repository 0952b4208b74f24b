use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServicesMode {
    All,
    Filtered,
    Custom,
}

impl Default for ServicesMode {
    fn default() -> Self {
        Self::Filtered
    }
}

impl ServicesMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "all" => Some(Self::All),
            "filtered" => Some(Self::Filtered),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Filtered => "filtered",
            Self::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub show_services: bool,
    pub show_ports: bool,
    pub services_mode: ServicesMode,
    pub services_blacklist: BTreeSet<String>,
    pub services_filter: BTreeSet<String>,
    pub ports_blacklist: BTreeSet<u16>,
    pub ports_filter: BTreeSet<u16>,
    pub max_services: usize,
    pub max_ports: usize,
    pub alerts_enabled: bool,
    pub alert_cpu: u8,
    pub alert_ram: u8,
    pub alert_disk: u8,
    pub daily_report_enabled: bool,
    pub daily_report_time: String,
    pub auto_reboot_enabled: bool,
    pub auto_reboot_time: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            show_services: true,
            show_ports: true,
            services_mode: ServicesMode::Filtered,
            services_blacklist: default_services_blacklist(),
            services_filter: BTreeSet::new(),
            ports_blacklist: BTreeSet::new(),
            ports_filter: BTreeSet::new(),
            max_services: 10,
            max_ports: 15,
            alerts_enabled: false,
            alert_cpu: 80,
            alert_ram: 85,
            alert_disk: 90,
            daily_report_enabled: false,
            daily_report_time: "09:00".to_string(),
            auto_reboot_enabled: false,
            auto_reboot_time: "04:00".to_string(),
        }
    }
}

fn default_services_blacklist() -> BTreeSet<String> {
    [
        "getty@tty1",
        "serial-getty@ttyS0",
        "ModemManager",
        "multipathd",
        "osconfig",
        "packagekit",
        "qemu-guest-agent",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

// Частичное обновление настроек: None — поле не трогаем.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SettingsPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub show_services: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub show_ports: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub services_mode: Option<ServicesMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub services_blacklist: Option<BTreeSet<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub services_filter: Option<BTreeSet<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ports_blacklist: Option<BTreeSet<u16>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ports_filter: Option<BTreeSet<u16>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_services: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_ports: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alerts_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert_cpu: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert_ram: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert_disk: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_report_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_report_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_reboot_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_reboot_time: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DailyRecord {
    pub cpu_max: f64,
    pub ram_max: f64,
    pub disk_max: f64,
    pub net_recv_start: f64,
    pub net_sent_start: f64,
    pub net_recv_last: f64,
    pub net_sent_last: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreDoc {
    #[serde(default)]
    channels: BTreeMap<String, i32>,
    #[serde(default)]
    settings: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    daily_stats: BTreeMap<String, DailyRecord>,
}

const DAILY_STATS_RETENTION: usize = 7;

#[derive(Debug)]
pub struct StatusStore {
    path: PathBuf,
    doc: StoreDoc,
}

impl StatusStore {
    // Битый или отсутствующий файл даёт пустой документ, без ошибок.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let doc = match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(doc) => doc,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "хранилище не разобрано, начинаю с пустого");
                    StoreDoc::default()
                }
            },
            Err(_) => StoreDoc::default(),
        };
        Self { path, doc }
    }

    // Запись через временный файл и rename; при сбое продолжаем работать в памяти.
    fn save(&self) {
        let tmp = self.path.with_extension("json.tmp");
        let text = match serde_json::to_string_pretty(&self.doc) {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "не удалось сериализовать хранилище");
                return;
            }
        };
        if let Err(err) = fs::write(&tmp, text).and_then(|()| fs::rename(&tmp, &self.path)) {
            warn!(path = %self.path.display(), error = %err, "не удалось сохранить хранилище, работаю в памяти");
        }
    }

    pub fn settings(&self) -> Settings {
        let value = serde_json::Value::Object(self.doc.settings.clone());
        serde_json::from_value(value).unwrap_or_default()
    }

    pub fn update_settings(&mut self, patch: SettingsPatch) {
        if let Ok(serde_json::Value::Object(map)) = serde_json::to_value(&patch) {
            for (key, value) in map {
                self.doc.settings.insert(key, value);
            }
        }
        self.save();
    }

    pub fn add_channel(&mut self, chat_id: i64, message_id: i32) {
        self.doc.channels.insert(chat_id.to_string(), message_id);
        self.save();
    }

    pub fn remove_channel(&mut self, chat_id: i64) {
        if self.doc.channels.remove(&chat_id.to_string()).is_some() {
            self.save();
        }
    }

    pub fn channels(&self) -> Vec<(i64, i32)> {
        self.doc
            .channels
            .iter()
            .filter_map(|(k, v)| k.parse::<i64>().ok().map(|id| (id, *v)))
            .collect()
    }

    pub fn record_stats(&mut self, cpu: f64, ram: f64, disk: f64, net_recv: f64, net_sent: f64) {
        let today = chrono::Local::now().format("%Y-%m-%d").to_string();
        self.record_stats_on(&today, cpu, ram, disk, net_recv, net_sent);
    }

    pub fn record_stats_on(
        &mut self,
        date: &str,
        cpu: f64,
        ram: f64,
        disk: f64,
        net_recv: f64,
        net_sent: f64,
    ) {
        let record = self
            .doc
            .daily_stats
            .entry(date.to_string())
            .or_insert_with(|| DailyRecord {
                net_recv_start: net_recv,
                net_sent_start: net_sent,
                ..DailyRecord::default()
            });
        record.cpu_max = record.cpu_max.max(cpu);
        record.ram_max = record.ram_max.max(ram);
        record.disk_max = record.disk_max.max(disk);
        record.net_recv_last = net_recv;
        record.net_sent_last = net_sent;

        while self.doc.daily_stats.len() > DAILY_STATS_RETENTION {
            // BTreeMap отсортирован по датам, первый ключ — самый старый.
            let oldest = match self.doc.daily_stats.keys().next() {
                Some(key) => key.clone(),
                None => break,
            };
            self.doc.daily_stats.remove(&oldest);
        }
        self.save();
    }

    pub fn daily_stats(&self, date: Option<&str>) -> Option<DailyRecord> {
        let today;
        let key = match date {
            Some(date) => date,
            None => {
                today = chrono::Local::now().format("%Y-%m-%d").to_string();
                &today
            }
        };
        self.doc.daily_stats.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> StatusStore {
        StatusStore::load(dir.path().join("status_messages.json"))
    }

    #[test]
    fn settings_merge_keeps_defaults_for_missing_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = store_in(&dir);
        store.update_settings(SettingsPatch {
            alert_cpu: Some(70),
            ..SettingsPatch::default()
        });

        let s = store.settings();
        assert_eq!(s.alert_cpu, 70);
        // Остальные поля — из дефолтов.
        assert_eq!(s.alert_ram, 85);
        assert_eq!(s.max_services, 10);
        assert_eq!(s.services_mode, ServicesMode::Filtered);
        assert!(s.services_blacklist.contains("ModemManager"));
    }

    #[test]
    fn settings_survive_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("status_messages.json");
        {
            let mut store = StatusStore::load(&path);
            store.update_settings(SettingsPatch {
                services_mode: Some(ServicesMode::Custom),
                daily_report_time: Some("10:30".to_string()),
                ..SettingsPatch::default()
            });
        }
        let reloaded = StatusStore::load(&path);
        let s = reloaded.settings();
        assert_eq!(s.services_mode, ServicesMode::Custom);
        assert_eq!(s.daily_report_time, "10:30");
        assert_eq!(s.alert_disk, 90);
    }

    #[test]
    fn corrupt_file_fails_open_to_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("status_messages.json");
        fs::write(&path, "{ это не json").expect("write");
        let store = StatusStore::load(&path);
        assert!(store.channels().is_empty());
        assert_eq!(store.settings().alert_cpu, 80);
    }

    #[test]
    fn add_channel_is_idempotent_last_message_wins() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = store_in(&dir);
        store.add_channel(-100123, 10);
        store.add_channel(-100123, 42);
        assert_eq!(store.channels(), vec![(-100123, 42)]);
    }

    #[test]
    fn remove_channel_unlinks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = store_in(&dir);
        store.add_channel(5, 1);
        store.add_channel(6, 2);
        store.remove_channel(5);
        assert_eq!(store.channels(), vec![(6, 2)]);
    }

    #[test]
    fn daily_stats_pruned_to_seven_most_recent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = store_in(&dir);
        for day in 1..=10 {
            let date = format!("2026-08-{:02}", day);
            store.record_stats_on(&date, 50.0, 50.0, 50.0, 100.0, 100.0);
        }
        assert!(store.daily_stats(Some("2026-08-03")).is_none());
        assert!(store.daily_stats(Some("2026-08-04")).is_some());
        assert!(store.daily_stats(Some("2026-08-10")).is_some());
    }

    #[test]
    fn daily_record_max_is_monotone_and_start_is_seeded_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = store_in(&dir);
        store.record_stats_on("2026-08-29", 40.0, 60.0, 70.0, 100.0, 10.0);
        store.record_stats_on("2026-08-29", 90.0, 50.0, 70.0, 250.0, 30.0);
        store.record_stats_on("2026-08-29", 20.0, 20.0, 20.0, 300.0, 40.0);

        let rec = store.daily_stats(Some("2026-08-29")).expect("запись за день");
        assert_eq!(rec.cpu_max, 90.0);
        assert_eq!(rec.ram_max, 60.0);
        assert_eq!(rec.disk_max, 70.0);
        assert_eq!(rec.net_recv_start, 100.0);
        assert_eq!(rec.net_sent_start, 10.0);
        assert_eq!(rec.net_recv_last, 300.0);
        assert_eq!(rec.net_sent_last, 40.0);
    }

    #[test]
    fn settings_round_trip_after_save() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("status_messages.json");
        let before;
        {
            let mut store = StatusStore::load(&path);
            store.update_settings(SettingsPatch {
                ports_filter: Some([22, 80, 443].into_iter().collect()),
                show_ports: Some(false),
                ..SettingsPatch::default()
            });
            before = store.settings();
        }
        let after = StatusStore::load(&path).settings();
        assert_eq!(
            serde_json::to_value(&before).expect("json"),
            serde_json::to_value(&after).expect("json")
        );
    }
}
