//! Herald configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{HeraldError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HeraldConfig {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

/// Telegram Bot API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Bot token. May also come from `HERALD_BOT_TOKEN`.
    #[serde(default)]
    pub bot_token: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

fn default_api_base() -> String {
    "https://api.telegram.org".into()
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            api_base: default_api_base(),
        }
    }
}

/// Poller cadence and send-pacing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between poll ticks.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Max due items examined per tick (bounds tick latency under backlog).
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Default timezone for cron evaluation when an item has none.
    #[serde(default = "default_tz")]
    pub tz: String,
    /// Minimum milliseconds between provider calls within one pipeline.
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
}

fn default_poll_interval() -> u64 {
    5
}
fn default_batch_size() -> u32 {
    25
}
fn default_tz() -> String {
    "UTC".into()
}
fn default_min_delay_ms() -> u64 {
    350
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            batch_size: default_batch_size(),
            tz: default_tz(),
            min_delay_ms: default_min_delay_ms(),
        }
    }
}

/// SQLite store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String {
    HeraldConfig::home_dir()
        .join("herald.db")
        .to_string_lossy()
        .into_owned()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl HeraldConfig {
    /// Load config from the default path (~/.herald/config.toml), falling
    /// back to defaults when it does not exist. The bot token may always be
    /// overridden via `HERALD_BOT_TOKEN`.
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            Self::default()
        };
        if let Ok(token) = std::env::var("HERALD_BOT_TOKEN") {
            if !token.is_empty() {
                config.telegram.bot_token = token;
            }
        }
        Ok(config)
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| HeraldError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| HeraldError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| HeraldError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Herald home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".herald")
    }
}
