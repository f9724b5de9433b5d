//! Configuration file support

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use tether_client::{ClientConfig, RetryConfig};

/// Default duplex channel endpoint
pub const DEFAULT_SERVER_URL: &str = "ws://localhost:3001/ws";
/// Default REST endpoint
pub const DEFAULT_API_URL: &str = "http://localhost:3001";

/// Configuration for tether
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// WebSocket URL of the bridge service
    pub server_url: Option<String>,
    /// Base URL of the REST API
    pub api_url: Option<String>,
    /// Project whose room is joined on connect
    pub project: Option<String>,
    pub reconnect: ReconnectSettings,
    pub timeouts: TimeoutSettings,
}

/// Reconnect backoff
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    pub max_attempts: Option<u32>,
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
}

/// Timeouts, in seconds
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub connect: Option<u64>,
    pub request: Option<u64>,
    pub session_init: Option<u64>,
    pub prompt_ack: Option<u64>,
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tether")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("TETHER_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load config from file
    pub fn load() -> Self {
        let path = Self::config_path();
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(&path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Warning: Failed to parse config file: {}", e);
                    Self::default()
                }
            },
            Err(e) => {
                eprintln!("Warning: Failed to read config file: {}", e);
                Self::default()
            }
        }
    }

    /// Save config to file
    pub fn save(&self) -> std::io::Result<()> {
        let path = Self::config_path();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let content = toml::to_string_pretty(self).map_err(std::io::Error::other)?;
        fs::write(path, content)
    }

    /// Create a default config file if it doesn't exist
    pub fn init() -> std::io::Result<PathBuf> {
        let path = Self::config_path();
        if path.exists() {
            return Ok(path);
        }

        let default_config = Config {
            server_url: Some(DEFAULT_SERVER_URL.to_string()),
            api_url: Some(DEFAULT_API_URL.to_string()),
            ..Config::default()
        };

        default_config.save()?;
        Ok(path)
    }

    /// Build the client configuration, filling gaps with library defaults
    pub fn client_config(&self) -> ClientConfig {
        let defaults = RetryConfig::default();
        let retry = RetryConfig {
            max_attempts: self.reconnect.max_attempts.unwrap_or(defaults.max_attempts),
            initial_delay: self
                .reconnect
                .initial_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.initial_delay),
            max_delay: self
                .reconnect
                .max_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
            backoff_multiplier: defaults.backoff_multiplier,
        };

        let mut config = ClientConfig::default().with_retry_config(retry);
        if let Some(secs) = self.timeouts.connect {
            config = config.with_connect_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.timeouts.request {
            config = config.with_request_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.timeouts.session_init {
            config = config.with_init_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.timeouts.prompt_ack {
            config = config.with_ack_timeout(Duration::from_secs(secs));
        }
        config
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# tether configuration file
# Place at ~/.config/tether/config.toml (Linux/Mac) or %APPDATA%\tether\config.toml (Windows)

# Bridge service endpoints
server_url = "ws://localhost:3001/ws"
api_url = "http://localhost:3001"

# Project to subscribe to (optional)
# project = "my-project"

[reconnect]
# max_attempts = 8
# initial_delay_ms = 1000
# max_delay_ms = 30000

[timeouts]
# Seconds
# connect = 10
# request = 600
# session_init = 60
# prompt_ack = 30
"#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_config_parses() {
        let config: Config = toml::from_str(example_config()).unwrap();
        assert_eq!(config.server_url.as_deref(), Some(DEFAULT_SERVER_URL));
        assert_eq!(config.api_url.as_deref(), Some(DEFAULT_API_URL));
        assert!(config.project.is_none());
    }

    #[test]
    fn test_overrides_reach_client_config() {
        let config: Config = toml::from_str(
            r#"
            [reconnect]
            max_attempts = 3
            initial_delay_ms = 250

            [timeouts]
            request = 30
            session_init = 5
            prompt_ack = 12
            "#,
        )
        .unwrap();

        let client = config.client_config();
        assert_eq!(client.channel.retry.max_attempts, 3);
        assert_eq!(client.channel.retry.initial_delay, Duration::from_millis(250));
        assert_eq!(client.channel.retry.max_delay, Duration::from_secs(30));
        assert_eq!(client.channel.connect_timeout, Duration::from_secs(10));
        assert_eq!(client.request_timeout, Duration::from_secs(30));
        assert_eq!(client.init_timeout, Duration::from_secs(5));
        assert_eq!(client.ack_timeout, Duration::from_secs(12));
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let client = Config::default().client_config();
        assert_eq!(client.channel.retry.max_attempts, 8);
        assert_eq!(client.request_timeout, Duration::from_secs(600));
        assert_eq!(client.init_timeout, Duration::from_secs(60));
    }
}
