//! Gear configuration.
//!
//! Every field has a sensible default pointing at the public platform, so
//! `GearConfig::default()` is all a typical device needs. Fields can be
//! overridden individually, with the builder helpers, or loaded from a TOML
//! file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Client protocol revision tag, sent with every request-token exchange.
pub const MGREV: &str = "RS1a";

/// Configuration for a gear instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GearConfig {
    /// Platform API host for token exchange and endpoint lookup
    #[serde(default = "default_api_address")]
    pub api_address: String,
    /// Plain HTTP port of the platform API
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    /// TLS port of the platform API
    #[serde(default = "default_api_secure_port")]
    pub api_secure_port: u16,
    /// Plain broker port
    #[serde(default = "default_broker_port")]
    pub broker_port: u16,
    /// TLS broker port
    #[serde(default = "default_broker_secure_port")]
    pub broker_secure_port: u16,
    /// Use TLS for both the API and the broker connection
    #[serde(default)]
    pub secure: bool,
    /// OAuth scope requested with the request token
    #[serde(default)]
    pub scope: String,
    /// Broker keep-alive interval in seconds
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Floor of the token retry backoff in milliseconds
    #[serde(default = "default_min_token_delay_ms")]
    pub min_token_delay_ms: u64,
    /// Ceiling of the token retry backoff in milliseconds
    #[serde(default = "default_max_token_delay_ms")]
    pub max_token_delay_ms: u64,
    /// Delay before restarting the full connection cycle after a broker
    /// rejection, in milliseconds
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    /// Pause between broker redial attempts on transient transport errors,
    /// in milliseconds
    #[serde(default = "default_reconnect_pause_ms")]
    pub reconnect_pause_ms: u64,
    /// Directory holding the credential cache file
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Explicit cache file path; overrides `cache_dir` when set. Sharing one
    /// file across identities is what makes key rotation detectable.
    #[serde(default)]
    pub cache_file: Option<PathBuf>,
}

fn default_api_address() -> String {
    "ga.netpie.io".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_api_secure_port() -> u16 {
    8081
}

fn default_broker_port() -> u16 {
    1883
}

fn default_broker_secure_port() -> u16 {
    8883
}

fn default_keep_alive_secs() -> u64 {
    10
}

fn default_min_token_delay_ms() -> u64 {
    100
}

fn default_max_token_delay_ms() -> u64 {
    30_000
}

fn default_retry_interval_ms() -> u64 {
    5_000
}

fn default_reconnect_pause_ms() -> u64 {
    1_000
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Default for GearConfig {
    fn default() -> Self {
        Self {
            api_address: default_api_address(),
            api_port: default_api_port(),
            api_secure_port: default_api_secure_port(),
            broker_port: default_broker_port(),
            broker_secure_port: default_broker_secure_port(),
            secure: false,
            scope: String::new(),
            keep_alive_secs: default_keep_alive_secs(),
            min_token_delay_ms: default_min_token_delay_ms(),
            max_token_delay_ms: default_max_token_delay_ms(),
            retry_interval_ms: default_retry_interval_ms(),
            reconnect_pause_ms: default_reconnect_pause_ms(),
            cache_dir: default_cache_dir(),
            cache_file: None,
        }
    }
}

impl GearConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Enable or disable TLS for the API and broker connections
    pub fn with_tls(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Override the directory holding the credential cache file
    pub fn with_cache_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.cache_dir = dir.into();
        self
    }

    /// Pin the credential cache to an explicit file path
    pub fn with_cache_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.cache_file = Some(path.into());
        self
    }

    /// Set the OAuth scope requested with the request token
    pub fn with_scope<S: Into<String>>(mut self, scope: S) -> Self {
        self.scope = scope.into();
        self
    }

    /// Base URL of the platform API for the configured security mode
    pub fn api_base_url(&self) -> String {
        if self.secure {
            format!("https://{}:{}", self.api_address, self.api_secure_port)
        } else {
            format!("http://{}:{}", self.api_address, self.api_port)
        }
    }

    /// Broker port for the configured security mode
    pub fn active_broker_port(&self) -> u16 {
        if self.secure {
            self.broker_secure_port
        } else {
            self.broker_port
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = GearConfig::default();
        assert_eq!(config.api_address, "ga.netpie.io");
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.api_secure_port, 8081);
        assert_eq!(config.broker_port, 1883);
        assert_eq!(config.broker_secure_port, 8883);
        assert!(!config.secure);
        assert_eq!(config.min_token_delay_ms, 100);
        assert_eq!(config.max_token_delay_ms, 30_000);
        assert_eq!(config.retry_interval_ms, 5_000);
        assert_eq!(config.cache_file, None);
    }

    #[test]
    fn test_api_base_url_plain_and_secure() {
        let config = GearConfig::default();
        assert_eq!(config.api_base_url(), "http://ga.netpie.io:8080");

        let secure = config.with_tls(true);
        assert_eq!(secure.api_base_url(), "https://ga.netpie.io:8081");
        assert_eq!(secure.active_broker_port(), 8883);
    }

    #[test]
    fn test_builder_helpers() {
        let config = GearConfig::default()
            .with_cache_dir("/tmp/gears")
            .with_scope("readwrite");
        assert_eq!(config.cache_dir, PathBuf::from("/tmp/gears"));
        assert_eq!(config.scope, "readwrite");
    }

    #[test]
    fn test_from_file_partial_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "api_address = \"api.example.com\"\nsecure = true\nmax_token_delay_ms = 60000"
        )
        .unwrap();

        let config = GearConfig::from_file(file.path()).unwrap();
        assert_eq!(config.api_address, "api.example.com");
        assert!(config.secure);
        assert_eq!(config.max_token_delay_ms, 60_000);
        // untouched fields keep their defaults
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.min_token_delay_ms, 100);
    }

    #[test]
    fn test_from_file_missing() {
        let result = GearConfig::from_file("/nonexistent/gearlink.toml");
        assert!(matches!(result, Err(ConfigError::FileRead(_))));
    }

    #[test]
    fn test_from_file_invalid_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "api_port = \"not a number\"").unwrap();

        let result = GearConfig::from_file(file.path());
        assert!(matches!(result, Err(ConfigError::TomlParse(_))));
    }
}
