//! Configuration management for the client.

use std::env;

/// Client configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the local SQLite database file
    pub database_path: String,
    /// Remote backend, absent when running purely local
    pub remote: Option<RemoteConfig>,
    /// Site this device is scoped to, when multi-site filtering applies
    pub site_id: Option<String>,
    /// Seconds between automatic sync passes
    pub sync_interval_secs: u64,
}

/// Remote backend connection settings.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Base URL of the backend
    pub base_url: String,
    /// API key sent with every request
    pub api_key: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_path =
            env::var("SATCHEL_DB_PATH").unwrap_or_else(|_| "satchel.db".to_string());

        let sync_interval_secs = env::var("SATCHEL_SYNC_INTERVAL_SECS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidSyncInterval)?;

        let remote = match (env::var("SATCHEL_REMOTE_URL"), env::var("SATCHEL_API_KEY")) {
            (Ok(base_url), Ok(api_key)) => Some(RemoteConfig { base_url, api_key }),
            (Ok(_), Err(_)) => return Err(ConfigError::MissingApiKey),
            _ => None,
        };

        let site_id = env::var("SATCHEL_SITE_ID").ok();

        Ok(Self {
            database_path,
            remote,
            site_id,
            sync_interval_secs,
        })
    }

    /// Whether a remote backend is configured.
    pub fn is_remote_configured(&self) -> bool {
        self.remote.is_some()
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("SATCHEL_API_KEY is required when SATCHEL_REMOTE_URL is set")]
    MissingApiKey,

    #[error("Invalid SATCHEL_SYNC_INTERVAL_SECS value")]
    InvalidSyncInterval,
}
