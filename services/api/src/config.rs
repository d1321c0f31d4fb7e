//! services/api/src/config.rs
//!
//! Defines the application's configuration structure and loading logic.
//!
//! All configuration is loaded from environment variables at startup. The `.env`
//! file is used for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;
use url::Url;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing the environment variable {0}")]
    MissingVar(String),
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    /// Without a database the service keeps its records in memory.
    pub database_url: Option<String>,
    pub log_level: Level,
    pub provider_base_url: Url,
    /// Public origin of the learning app; callback URLs are built on it.
    pub callback_origin: Url,
    pub offline_queue_dir: PathBuf,
    pub queue_process_interval: Duration,
    pub connectivity_probe_interval: Duration,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// It will look for a `.env` file in the current directory for development,
    /// but this is skipped in test environments to ensure tests are hermetic.
    pub fn from_env() -> Result<Self, ConfigError> {
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key/value source.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        // --- Server and Storage ---
        let bind_address_str = var("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:3000".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let database_url = var("DATABASE_URL").filter(|url| !url.trim().is_empty());

        let log_level_str = var("RUST_LOG").unwrap_or_else(|| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let offline_queue_dir = var("OFFLINE_QUEUE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data"));

        // --- Conversation Provider ---
        let provider_base_url = parse_url(
            "PROVIDER_BASE_URL",
            &var("PROVIDER_BASE_URL").unwrap_or_else(|| "https://tavusapi.com/v2".to_string()),
        )?;
        let callback_origin = parse_url(
            "CALLBACK_ORIGIN",
            &var("CALLBACK_ORIGIN").ok_or_else(|| ConfigError::MissingVar("CALLBACK_ORIGIN".to_string()))?,
        )?;

        // --- Background Tasks ---
        let queue_process_interval = parse_secs("QUEUE_PROCESS_INTERVAL_SECS", var("QUEUE_PROCESS_INTERVAL_SECS"), 30)?;
        let connectivity_probe_interval = parse_secs("CONNECTIVITY_PROBE_SECS", var("CONNECTIVITY_PROBE_SECS"), 15)?;

        Ok(Self {
            bind_address,
            database_url,
            log_level,
            provider_base_url,
            callback_origin,
            offline_queue_dir,
            queue_process_interval,
            connectivity_probe_interval,
        })
    }
}

fn parse_url(key: &str, value: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(value).map_err(|e| ConfigError::InvalidValue(key.to_string(), e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidValue(
            key.to_string(),
            format!("'{value}' is not an http(s) URL"),
        ));
    }
    Ok(url)
}

fn parse_secs(key: &str, value: Option<String>, default: u64) -> Result<Duration, ConfigError> {
    let secs = match value {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .ok()
            .filter(|secs| *secs > 0)
            .ok_or_else(|| ConfigError::InvalidValue(key.to_string(), format!("'{raw}' is not a positive number of seconds")))?,
        None => default,
    };
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_only_the_origin_is_set() {
        let config = Config::from_lookup(lookup(&[("CALLBACK_ORIGIN", "https://learn.example.com")])).unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:3000".parse().unwrap());
        assert!(config.database_url.is_none());
        assert_eq!(config.provider_base_url.as_str(), "https://tavusapi.com/v2");
        assert_eq!(config.offline_queue_dir, PathBuf::from("./data"));
        assert_eq!(config.queue_process_interval, Duration::from_secs(30));
        assert_eq!(config.connectivity_probe_interval, Duration::from_secs(15));
        assert_eq!(config.log_level, Level::INFO);
    }

    #[test]
    fn callback_origin_is_required() {
        let err = Config::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar(key) if key == "CALLBACK_ORIGIN"));
    }

    #[test]
    fn bad_values_are_reported_with_their_key() {
        let err = Config::from_lookup(lookup(&[
            ("CALLBACK_ORIGIN", "https://learn.example.com"),
            ("QUEUE_PROCESS_INTERVAL_SECS", "0"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("QUEUE_PROCESS_INTERVAL_SECS"));

        let err = Config::from_lookup(lookup(&[("CALLBACK_ORIGIN", "ftp://files.example.com")])).unwrap_err();
        assert!(err.to_string().contains("CALLBACK_ORIGIN"));
    }
}
