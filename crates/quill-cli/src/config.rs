//! Configuration file support

use quill_agent::ReconnectPolicy;
use quill_wire::{
    ApiConfig,
    client::{DEFAULT_API_URL, DEFAULT_API_VERSION},
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for quill
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backend origin (default: http://localhost:9000)
    pub api_url: Option<String>,
    /// API version segment (default: v1)
    pub api_version: Option<String>,
    /// Bearer token (alternative to QUILL_ACCESS_TOKEN)
    pub access_token: Option<String>,
    /// Feed events kept per resource
    pub feed_history: Option<usize>,
    /// Live feed reconnection
    #[serde(default)]
    pub reconnect: ReconnectSettings,
}

/// Reconnect settings for live feeds
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    pub enabled: Option<bool>,
    pub max_attempts: Option<u32>,
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub multiplier: Option<f64>,
}

impl ReconnectSettings {
    pub fn enabled(&self) -> bool {
        self.enabled.unwrap_or(false)
    }

    /// Build a policy, filling unset fields from the defaults
    pub fn policy(&self) -> ReconnectPolicy {
        let defaults = ReconnectPolicy::default();
        ReconnectPolicy {
            max_attempts: self.max_attempts.or(defaults.max_attempts),
            initial_delay: self
                .initial_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.initial_delay),
            max_delay: self
                .max_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
            backoff_multiplier: self.multiplier.unwrap_or(defaults.backoff_multiplier),
        }
    }
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("quill")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("QUILL_CONFIG_PATH") {
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
            Ok(content) => Self::parse(&content).unwrap_or_else(|e| {
                eprintln!("Warning: Failed to parse config file: {}", e);
                Self::default()
            }),
            Err(e) => {
                eprintln!("Warning: Failed to read config file: {}", e);
                Self::default()
            }
        }
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
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
            api_url: Some(DEFAULT_API_URL.to_string()),
            api_version: Some(DEFAULT_API_VERSION.to_string()),
            access_token: None,
            feed_history: Some(quill_agent::feed::DEFAULT_HISTORY_LIMIT),
            reconnect: ReconnectSettings {
                enabled: Some(false),
                ..Default::default()
            },
        };

        default_config.save()?;
        Ok(path)
    }

    /// Access token from config, falling back to QUILL_ACCESS_TOKEN
    pub fn access_token(&self) -> Option<String> {
        self.access_token
            .clone()
            .filter(|t| !t.is_empty())
            .or_else(|| std::env::var("QUILL_ACCESS_TOKEN").ok())
            .filter(|t| !t.is_empty())
    }

    /// Connection settings, with `api_url` overriding the file when given
    pub fn api_config(&self, api_url: Option<String>) -> ApiConfig {
        ApiConfig {
            api_url: api_url
                .or_else(|| self.api_url.clone())
                .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            api_version: self
                .api_version
                .clone()
                .unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
            access_token: self.access_token(),
        }
    }

    pub fn feed_history(&self) -> usize {
        self.feed_history
            .unwrap_or(quill_agent::feed::DEFAULT_HISTORY_LIMIT)
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# quill configuration file
# Place at ~/.config/quill/config.toml (Linux/Mac) or %APPDATA%\quill\config.toml (Windows)

# Backend origin
api_url = "http://localhost:9000"

# API version segment
api_version = "v1"

# Bearer token (optional - can also use QUILL_ACCESS_TOKEN)
# access_token = "..."

# Live feed events kept per resource
feed_history = 50

# Reopen dropped live feeds with exponential backoff
[reconnect]
enabled = false
# max_attempts = 5
# initial_delay_ms = 1000
# max_delay_ms = 30000
# multiplier = 2.0
"#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_config_parses() {
        let config = Config::parse(example_config()).unwrap();
        assert_eq!(config.api_url.as_deref(), Some("http://localhost:9000"));
        assert_eq!(config.feed_history(), 50);
        assert!(!config.reconnect.enabled());
    }

    #[test]
    fn test_reconnect_policy_fills_defaults() {
        let config = Config::parse(
            r#"
            [reconnect]
            enabled = true
            max_attempts = 3
            initial_delay_ms = 250
            "#,
        )
        .unwrap();
        assert!(config.reconnect.enabled());
        let policy = config.reconnect.policy();
        assert_eq!(policy.max_attempts, Some(3));
        assert_eq!(policy.initial_delay, Duration::from_millis(250));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
        assert_eq!(policy.backoff_multiplier, 2.0);
    }

    #[test]
    fn test_api_config_prefers_flag() {
        let config = Config {
            api_url: Some("http://files.example".into()),
            api_version: Some("v2".into()),
            access_token: Some("token".into()),
            ..Default::default()
        };
        let api = config.api_config(Some("http://flag.example".into()));
        assert_eq!(api.api_url, "http://flag.example");
        assert_eq!(api.api_version, "v2");
        assert_eq!(api.access_token.as_deref(), Some("token"));

        let api = config.api_config(None);
        assert_eq!(api.api_url, "http://files.example");
    }
}
