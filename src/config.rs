use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub interval_secs: u64,
    pub store_path: PathBuf,
    pub upload_dir: PathBuf,
    pub bot_service_name: String,
    pub telegram: TelegramConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub bot_token_env: String,
    pub bot_token: Option<String>,
    pub admin_ids: Vec<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            store_path: default_store_path(),
            upload_dir: default_upload_dir(),
            bot_service_name: default_bot_service_name(),
            telegram: TelegramConfig::default(),
        }
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token_env: default_bot_token_env(),
            bot_token: None,
            admin_ids: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("не удалось прочитать файл конфигурации {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось разобрать YAML в {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("ошибка валидации конфигурации: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_secs < 1 {
            return Err(ConfigError::Validation(
                "interval_secs должно быть >= 1".to_string(),
            ));
        }
        if self.store_path.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "store_path не должен быть пустым".to_string(),
            ));
        }
        if self.upload_dir.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "upload_dir не должен быть пустым".to_string(),
            ));
        }
        if self.bot_service_name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "bot_service_name не должен быть пустым".to_string(),
            ));
        }
        if self.telegram.bot_token_env.trim().is_empty() {
            return Err(ConfigError::Validation(
                "telegram.bot_token_env не должен быть пустым".to_string(),
            ));
        }
        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

impl TelegramConfig {
    // Переменная окружения приоритетнее токена из файла.
    pub fn resolve_token(&self) -> Result<String, String> {
        if let Ok(value) = std::env::var(&self.bot_token_env) {
            if !value.trim().is_empty() {
                return Ok(value);
            }
        }
        if let Some(token) = self.bot_token.as_ref() {
            if !token.trim().is_empty() {
                return Ok(token.trim().to_string());
            }
        }
        Err(format!(
            "не найден токен Telegram: задайте '{}' в окружении или telegram.bot_token в config",
            self.bot_token_env
        ))
    }
}

fn default_interval_secs() -> u64 {
    300
}

fn default_store_path() -> PathBuf {
    PathBuf::from("status_messages.json")
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("/root/uploads")
}

fn default_bot_service_name() -> String {
    "tg-control-agent".to_string()
}

fn default_bot_token_env() -> String {
    "TELEGRAM_BOT_TOKEN".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_yaml_parses_and_validates() {
        let cfg: Config = serde_yaml::from_str(Config::example_yaml()).expect("разбор примера");
        cfg.validate().expect("валидация примера");
    }

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let cfg: Config = serde_yaml::from_str("interval_secs: 60\n").expect("разбор");
        assert_eq!(cfg.interval_secs, 60);
        assert_eq!(cfg.store_path, PathBuf::from("status_messages.json"));
        assert_eq!(cfg.telegram.bot_token_env, "TELEGRAM_BOT_TOKEN");
        assert!(cfg.telegram.admin_ids.is_empty());
    }

    #[test]
    fn zero_interval_is_rejected() {
        let mut cfg = Config::default();
        cfg.interval_secs = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn empty_admin_ids_pass_validation() {
        // Пустой список разрешён: поведение совместимости, проверяется на старте.
        let cfg = Config::default();
        assert!(cfg.telegram.admin_ids.is_empty());
        cfg.validate().expect("валидация");
    }
}
