//! Configuration
//!
//! TOML-based configuration with `EMBERLINK_*` environment overrides and
//! `${VAR}` / `${VAR:-default}` substitution inside the file. The file
//! structure converts into the broker's [`Options`].

use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::broker::{Capabilities, Compatibilities, Options};

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading the config file
    Io(std::io::Error),
    /// Config parse/merge error
    Config(config::ConfigError),
    /// Semantic validation error
    Validation(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "io error: {}", e),
            ConfigError::Config(e) => write!(f, "config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Substitute `${VAR}` and `${VAR:-default}` in the raw file content.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("static pattern");
    re.replace_all(content, |caps: &regex::Captures| {
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(&caps[1]).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Root configuration file structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub server: ServerConfig,
    pub capabilities: Capabilities,
    pub compatibilities: Compatibilities,
    pub housekeeping: HousekeepingConfig,
    /// Client ids refused at connect
    pub blacklist: Vec<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP bind address
    pub bind: SocketAddr,
    /// Node name used in device event topics
    pub node_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:1883".parse().expect("static address"),
            node_name: "single".to_string(),
        }
    }
}

/// Sweep intervals for the housekeeping loop.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HousekeepingConfig {
    #[serde(with = "humantime_serde")]
    pub sys_topic_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub client_expiry_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub inflight_expiry_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub retained_expiry_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub delayed_will_interval: Duration,
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            sys_topic_interval: Duration::from_secs(1),
            client_expiry_interval: Duration::from_secs(10),
            inflight_expiry_interval: Duration::from_secs(10),
            retained_expiry_interval: Duration::from_secs(30),
            delayed_will_interval: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Load a TOML file, apply env substitution and `EMBERLINK_*` overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let substituted = substitute_env_vars(&raw);
        Self::from_toml(&substituted)
    }

    /// Build straight from env overrides and defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_toml("")
    }

    fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let cfg: Config = config::Config::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .add_source(Environment::with_prefix("EMBERLINK").separator("__"))
            .build()?
            .try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.capabilities.maximum_qos > 2 {
            return Err(ConfigError::Validation(
                "capabilities.maximum_qos must be 0, 1 or 2".into(),
            ));
        }
        if !(3..=5).contains(&self.capabilities.minimum_protocol_version) {
            return Err(ConfigError::Validation(
                "capabilities.minimum_protocol_version must be 3, 4 or 5".into(),
            ));
        }
        if self.capabilities.receive_maximum == 0 {
            return Err(ConfigError::Validation(
                "capabilities.receive_maximum must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// The broker options this file describes.
    pub fn to_options(&self) -> Options {
        Options {
            capabilities: self.capabilities.clone(),
            compatibilities: self.compatibilities.clone(),
            sys_topic_interval: self.housekeeping.sys_topic_interval,
            client_expiry_interval: self.housekeeping.client_expiry_interval,
            inflight_expiry_interval: self.housekeeping.inflight_expiry_interval,
            retained_expiry_interval: self.housekeeping.retained_expiry_interval,
            delayed_will_interval: self.housekeeping.delayed_will_interval,
            blacklist: self.blacklist.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let cfg = Config::default();
        assert_eq!(cfg.capabilities.receive_maximum, 1024);
        assert_eq!(cfg.capabilities.maximum_qos, 2);
        assert_eq!(cfg.housekeeping.sys_topic_interval, Duration::from_secs(1));
    }

    #[test]
    fn parse_with_overrides() {
        let cfg = Config::from_toml(
            r#"
            blacklist = ["evil-device"]

            [server]
            bind = "127.0.0.1:2883"

            [capabilities]
            maximum_qos = 1
            receive_maximum = 16

            [housekeeping]
            retained_expiry_interval = "45s"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.server.bind.port(), 2883);
        assert_eq!(cfg.capabilities.maximum_qos, 1);
        assert_eq!(cfg.capabilities.receive_maximum, 16);
        assert_eq!(
            cfg.housekeeping.retained_expiry_interval,
            Duration::from_secs(45)
        );
        assert_eq!(cfg.blacklist, vec!["evil-device".to_string()]);
    }

    #[test]
    fn invalid_qos_rejected() {
        let result = Config::from_toml("[capabilities]\nmaximum_qos = 3\n");
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn env_substitution_with_default() {
        let content = "value = \"${EMBERLINK_TEST_UNSET_VAR:-fallback}\"";
        assert_eq!(substitute_env_vars(content), "value = \"fallback\"");
    }
}
