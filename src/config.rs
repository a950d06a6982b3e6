use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub tuya: TuyaConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub history: HistoryConfig,
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            Self::from_file(path)?
        } else {
            let default_path = PathBuf::from("meter.toml");
            if default_path.exists() {
                Self::from_file(&default_path)?
            } else {
                Self::default()
            }
        };

        config.apply_env_overrides()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self =
            toml::from_str(&contents).with_context(|| "failed to parse configuration TOML")?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(key) = env::var("TUYA_ACCESS_KEY") {
            self.tuya.access_key = key;
        }
        if let Ok(secret) = env::var("TUYA_SECRET_KEY") {
            self.tuya.secret_key = secret;
        }
        if let Ok(base_url) = env::var("TUYA_BASE_URL") {
            self.tuya.base_url = base_url;
        }
        if let Ok(device_id) = env::var("TUYA_DEVICE_ID") {
            self.tuya.device_id = device_id;
        }
        if let Ok(addr) = env::var("METER_LISTEN_ADDR") {
            self.server.listen_addr = addr;
        }
        if let Ok(db_path) = env::var("METER_DB_PATH") {
            self.storage.database_path = PathBuf::from(db_path);
        }
        if let Ok(interval) = env::var("METER_POLL_INTERVAL_SECS") {
            let secs = interval
                .parse::<u64>()
                .with_context(|| format!("invalid METER_POLL_INTERVAL_SECS: {interval}"))?;
            self.poller.interval_secs = Some(secs);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.tuya.access_key.trim().is_empty() {
            bail!("tuya.access_key is not configured (set it in the config file or TUYA_ACCESS_KEY)");
        }
        if self.tuya.secret_key.trim().is_empty() {
            bail!("tuya.secret_key is not configured (set it in the config file or TUYA_SECRET_KEY)");
        }
        if self.tuya.device_id.trim().is_empty() {
            bail!("tuya.device_id is not configured (set it in the config file or TUYA_DEVICE_ID)");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TuyaConfig {
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for TuyaConfig {
    fn default() -> Self {
        Self {
            access_key: String::new(),
            secret_key: String::new(),
            base_url: default_base_url(),
            device_id: String::new(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl TuyaConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PollerConfig {
    #[serde(default)]
    pub interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_window_days")]
    pub default_window_days: u32,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            default_window_days: default_window_days(),
        }
    }
}

fn default_base_url() -> String {
    "https://openapi.tuyaeu.com".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("meter.db")
}

fn default_window_days() -> u32 {
    30
}
