use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub listen: String,
    #[serde(default = "default_stale_threshold_secs")]
    pub stale_threshold_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub server_url: String,
    pub api_key: String,
    pub report_interval_secs: u64,
    pub log_file: Option<String>,
    pub sessions_file: Option<String>,
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
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation(
                "поле listen обязательно".to_string(),
            ));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "поле listen должно быть корректным адресом host:port".to_string(),
            ));
        }
        if self.stale_threshold_secs < 1 {
            return Err(ConfigError::Validation(
                "stale_threshold_secs должно быть >= 1".to_string(),
            ));
        }
        if self.sweep_interval_secs < 1 {
            return Err(ConfigError::Validation(
                "sweep_interval_secs должно быть >= 1".to_string(),
            ));
        }

        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

impl AgentConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let server_url = env_nonempty("FLEETWATCH_SERVER_URL").unwrap_or_else(default_server_url);
        let api_key = env_nonempty("FLEETWATCH_API_KEY").ok_or_else(|| {
            ConfigError::Validation(
                "переменная окружения FLEETWATCH_API_KEY обязательна".to_string(),
            )
        })?;

        let report_interval_secs = match env_nonempty("FLEETWATCH_REPORT_INTERVAL") {
            Some(raw) => raw.parse::<u64>().map_err(|_| {
                ConfigError::Validation(
                    "FLEETWATCH_REPORT_INTERVAL должно быть целым числом секунд".to_string(),
                )
            })?,
            None => default_report_interval_secs(),
        };
        if report_interval_secs < 1 {
            return Err(ConfigError::Validation(
                "FLEETWATCH_REPORT_INTERVAL должно быть >= 1".to_string(),
            ));
        }

        Ok(Self {
            server_url: server_url.trim_end_matches('/').to_string(),
            api_key,
            report_interval_secs,
            log_file: env_nonempty("FLEETWATCH_LOG_FILE"),
            sessions_file: env_nonempty("FLEETWATCH_SESSIONS_FILE"),
        })
    }
}

fn env_nonempty(name: &str) -> Option<String> {
    if let Ok(v) = std::env::var(name) {
        if !v.trim().is_empty() {
            return Some(v);
        }
    }
    None
}

fn default_server_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

const fn default_stale_threshold_secs() -> u64 {
    300
}

const fn default_sweep_interval_secs() -> u64 {
    60
}

const fn default_report_interval_secs() -> u64 {
    30
}
