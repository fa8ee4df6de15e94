use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_TICK_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_STARTUP_DELAY_SECS: u64 = 2; // let the DB and transport settle first
pub const DEFAULT_SEND_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_LEASE_TTL_SECS: u64 = 600;
pub const DEFAULT_SMTP_PORT: u16 = 587;

/// Top-level config (mailcast.toml + MAILCAST_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MailcastConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    /// Outgoing mail server. Without it every send is recorded as a failure.
    #[serde(default)]
    pub smtp: Option<SmtpConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Cadence of the background dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Seconds between two ticks (lifecycle sweep + dispatch sweep).
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    /// Delay before the very first tick after startup.
    #[serde(default = "default_startup_delay")]
    pub startup_delay_secs: u64,
    /// Upper bound for a single delivery call.
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,
    /// How long a tick's database lease stays valid without renewal. Bounds
    /// how long a crashed process can block other dispatchers.
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: DEFAULT_TICK_INTERVAL_SECS,
            startup_delay_secs: DEFAULT_STARTUP_DELAY_SECS,
            send_timeout_secs: DEFAULT_SEND_TIMEOUT_SECS,
            lease_ttl_secs: DEFAULT_LEASE_TTL_SECS,
        }
    }
}

impl DispatcherConfig {
    /// Tick interval as a `Duration`, never shorter than one second.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_secs)
    }

    /// Send timeout as a `Duration`, never shorter than one second.
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs.max(1))
    }

    /// Lease TTL, never shorter than one send timeout plus a second.
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs.max(self.send_timeout().as_secs() + 1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Sender address used in the `From` header.
    pub from: String,
    /// Upgrade the connection with STARTTLS (default: true).
    /// Set to false only for local relays such as MailHog.
    #[serde(default = "bool_true")]
    pub starttls: bool,
}

fn bool_true() -> bool {
    true
}
fn default_tick_interval() -> u64 {
    DEFAULT_TICK_INTERVAL_SECS
}
fn default_startup_delay() -> u64 {
    DEFAULT_STARTUP_DELAY_SECS
}
fn default_send_timeout() -> u64 {
    DEFAULT_SEND_TIMEOUT_SECS
}
fn default_lease_ttl() -> u64 {
    DEFAULT_LEASE_TTL_SECS
}
fn default_smtp_port() -> u16 {
    DEFAULT_SMTP_PORT
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.mailcast/mailcast.db", home)
}

impl MailcastConfig {
    /// Load config from a TOML file with MAILCAST_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.mailcast/mailcast.toml
    ///
    /// Nested keys are separated by a double underscore, e.g.
    /// `MAILCAST_DISPATCHER__TICK_INTERVAL_SECS=30`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: MailcastConfig = Figment::from(Serialized::defaults(MailcastConfig::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed("MAILCAST_").split("__"))
            .extract()
            .map_err(|e| crate::error::MailcastError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.mailcast/mailcast.toml", home)
}
