//! Configuration loading and management.
//!
//! Structured TOML configuration for parleyd: server identity, database
//! location, authenticator settings, credential-validator blocks with their
//! per-auth-level requirements, and the reserved tag namespace.

mod defaults;
mod types;

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

pub use types::{
    AuthConfig, BasicAuthConfig, DatabaseConfig, ServerConfig, TagConfig, TokenAuthConfig,
    ValidatorBlock,
};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Server identity.
    #[serde(default)]
    pub server: ServerConfig,
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Authenticator settings.
    #[serde(default)]
    pub auth: AuthConfig,
    /// Credential validator blocks by method name.
    #[serde(default)]
    pub validator: HashMap<String, ValidatorBlock>,
    /// Tag settings, including the reserved namespace.
    #[serde(default)]
    pub tags: TagConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.token.key.len() < 16 {
            return Err(ConfigError::Invalid(
                "auth.token.key must be at least 16 bytes".to_string(),
            ));
        }
        for (name, block) in &self.validator {
            for level in &block.required {
                if crate::auth::AuthLevel::parse(level).is_none() {
                    return Err(ConfigError::Invalid(format!(
                        "validator.{name}.required contains unknown auth level '{level}'"
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            auth: AuthConfig::default(),
            validator: HashMap::new(),
            tags: TagConfig::default(),
        }
    }
}
