//! Configuration types, built from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Bridge service configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Path to the libSQL database file.
    pub db_path: PathBuf,
    /// Durable attachment storage (digest attachments live here until SENT).
    pub media_dir: PathBuf,
    /// Scratch area for transient attachments (instant mode, poller downloads).
    pub temp_dir: PathBuf,
    /// Mailbox poll cadence. One global interval, not per account.
    pub poll_interval: Duration,
    /// Long-poll timeout handed to the push transport.
    pub push_poll_timeout: Duration,
    /// Base URL of the push-messaging gateway.
    pub push_gateway_url: String,
    /// Directory for the rolling file log.
    pub log_dir: PathBuf,
}

impl BridgeConfig {
    /// Build config from environment variables, with defaults for everything
    /// except values that have no sensible fallback.
    pub fn from_env() -> Result<Self, ConfigError> {
        let db_path = std::env::var("MSGBRIDGE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/msgbridge.db"));

        let data_dir = std::env::var("MSGBRIDGE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));

        let poll_interval_secs: u64 = parse_env("MSGBRIDGE_POLL_INTERVAL_SECS", 60)?;
        let push_poll_timeout_secs: u64 = parse_env("MSGBRIDGE_PUSH_POLL_TIMEOUT_SECS", 30)?;

        let push_gateway_url = std::env::var("MSGBRIDGE_PUSH_GATEWAY_URL")
            .unwrap_or_else(|_| "https://gateway.example.invalid".to_string());

        Ok(Self {
            db_path,
            media_dir: data_dir.join("media"),
            temp_dir: data_dir.join("temp"),
            poll_interval: Duration::from_secs(poll_interval_secs),
            push_poll_timeout: Duration::from_secs(push_poll_timeout_secs),
            push_gateway_url,
            log_dir: data_dir.join("logs"),
        })
    }
}

fn parse_env(key: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected an integer, got {raw:?}"),
        }),
    }
}

/// Mail-relay and push-protocol credentials, read from the settings store.
///
/// Owned by the out-of-scope settings CRUD; the engine only reads these.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_username: String,
    pub smtp_password: SecretString,
    /// Push-protocol app credentials handed to the transport.
    pub push_api_id: Option<String>,
    pub push_api_hash: Option<SecretString>,
}
