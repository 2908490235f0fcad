//! Quota configuration
//!
//! TOML-deserializable defaults for [`Quota`], the per-principal resource
//! caps named in the data model. The core never loads a file itself — that
//! is an external collaborator's job — but an `Authenticator` implementation
//! wiring up `Principal`s from a config file needs somewhere to parse the
//! defaults from: a manual `Display`/`std::error::Error` error enum and a
//! `#[serde(default)]` struct with per-field default functions.

use std::time::Duration;

use serde::Deserialize;

use crate::quota::Quota;

/// Error parsing or validating a [`QuotaConfig`].
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "parse error: {}", e),
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

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// TOML-deserializable mirror of [`Quota`], with the same defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    #[serde(default = "default_idle_ttl_secs")]
    pub max_idle_session_ttl_secs: u64,
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: u32,
    #[serde(default = "default_max_packet_identifiers")]
    pub max_packet_identifiers: u16,
    #[serde(default = "default_queue_size")]
    pub max_queue_size_qos0: usize,
    #[serde(default = "default_queue_size")]
    pub max_queue_size_qos1: usize,
    #[serde(default = "default_queue_size")]
    pub max_queue_size_qos2: usize,
}

fn default_idle_ttl_secs() -> u64 {
    3600
}
fn default_max_packet_size() -> u32 {
    256 * 1024
}
fn default_max_packet_identifiers() -> u16 {
    64
}
fn default_queue_size() -> usize {
    1000
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            max_idle_session_ttl_secs: default_idle_ttl_secs(),
            max_packet_size: default_max_packet_size(),
            max_packet_identifiers: default_max_packet_identifiers(),
            max_queue_size_qos0: default_queue_size(),
            max_queue_size_qos1: default_queue_size(),
            max_queue_size_qos2: default_queue_size(),
        }
    }
}

impl QuotaConfig {
    /// Parse a TOML fragment, applying defaults to any field left unset.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: QuotaConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_packet_identifiers == 0 {
            return Err(ConfigError::Validation(
                "max_packet_identifiers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_quota(&self) -> Quota {
        Quota {
            max_idle_session_ttl: Duration::from_secs(self.max_idle_session_ttl_secs),
            max_packet_size: self.max_packet_size,
            max_packet_identifiers: self.max_packet_identifiers,
            max_queue_size_qos0: self.max_queue_size_qos0,
            max_queue_size_qos1: self.max_queue_size_qos1,
            max_queue_size_qos2: self.max_queue_size_qos2,
        }
    }
}
