//! Server configuration loaded from a TOML file with environment overrides.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use log::info;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub moderation: ModerationConfig,
    #[serde(default)]
    pub calls: CallConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    /// When present the server tries HTTPS/WSS first.
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file. `None` keeps everything in memory.
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Outbound frames buffered per connection before it counts as a slow consumer.
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollConfig {
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModerationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Media awaiting a verdict is shown to everyone, not just its owner.
    #[serde(default = "default_true")]
    pub pending_visible: bool,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallConfig {
    /// Seconds an unanswered call rings before it is marked missed. 0 disables.
    #[serde(default = "default_ring_timeout_secs")]
    pub ring_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// env_logger filter string, e.g. "info" or "room_chat=debug,warn".
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    2052
}

fn default_outbound_capacity() -> usize {
    64
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_close_timeout_ms() -> u64 {
    500
}

fn default_batch_limit() -> usize {
    200
}

fn default_true() -> bool {
    true
}

fn default_queue_capacity() -> usize {
    256
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    2_000
}

fn default_ring_timeout_secs() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            tls: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: default_outbound_capacity(),
            idle_timeout_secs: default_idle_timeout_secs(),
            close_timeout_ms: default_close_timeout_ms(),
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            batch_limit: default_batch_limit(),
        }
    }
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pending_visible: true,
            queue_capacity: default_queue_capacity(),
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout_secs: default_ring_timeout_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value {value:?} for {name}")]
    InvalidEnv { name: &'static str, value: String },
}

/// Loads configuration from a TOML file, falling back to defaults when the
/// file does not exist.
///
/// Environment overrides: `ROOM_CHAT_HOST`, `ROOM_CHAT_PORT`,
/// `ROOM_CHAT_DB_PATH`, `ROOM_CHAT_LOG_LEVEL`.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("Config file {} not found, using defaults", p);
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
    Ok(config)
}

/// Runs before logging is set up; unparseable values are errors.
fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
    if let Some(host) = var("ROOM_CHAT_HOST") {
        config.server.host = host.parse().map_err(|_| ConfigError::InvalidEnv {
            name: "ROOM_CHAT_HOST",
            value: host,
        })?;
    }
    if let Some(port) = var("ROOM_CHAT_PORT") {
        config.server.port = port.parse().map_err(|_| ConfigError::InvalidEnv {
            name: "ROOM_CHAT_PORT",
            value: port,
        })?;
    }
    if let Some(db_path) = var("ROOM_CHAT_DB_PATH") {
        config.storage.path = if db_path.is_empty() { None } else { Some(db_path) };
    }
    if let Some(level) = var("ROOM_CHAT_LOG_LEVEL") {
        config.logging.level = level;
    }
    Ok(())
}
