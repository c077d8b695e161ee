//! Configuration type definitions.

use super::defaults;
use serde::Deserialize;

/// Server identity.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Server name used in logs.
    #[serde(default = "defaults::server_name")]
    pub name: String,
    /// Language assumed for sessions that do not state one.
    #[serde(default = "defaults::default_lang")]
    pub default_lang: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            name: defaults::server_name(),
            default_lang: defaults::default_lang(),
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite path; `":memory:"` for an in-memory database.
    #[serde(default = "defaults::database_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            path: defaults::database_path(),
        }
    }
}

/// Authenticator settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub basic: BasicAuthConfig,
    #[serde(default)]
    pub token: TokenAuthConfig,
    /// Logical scheme aliases, e.g. `rest = "basic"`.
    #[serde(default)]
    pub aliases: std::collections::HashMap<String, String>,
}

/// The `basic` scheme.
#[derive(Debug, Clone, Deserialize)]
pub struct BasicAuthConfig {
    /// Validity of stored records in seconds; 0 means no expiration.
    #[serde(default)]
    pub lifetime_secs: i64,
}

impl Default for BasicAuthConfig {
    fn default() -> Self {
        BasicAuthConfig { lifetime_secs: 0 }
    }
}

/// The `token` scheme.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenAuthConfig {
    /// HMAC key material, at least 16 bytes.
    #[serde(default = "defaults::token_key")]
    pub key: String,
    /// Validity of issued login tokens in seconds.
    #[serde(default = "defaults::token_lifetime_secs")]
    pub lifetime_secs: i64,
}

impl Default for TokenAuthConfig {
    fn default() -> Self {
        TokenAuthConfig {
            key: defaults::token_key(),
            lifetime_secs: defaults::token_lifetime_secs(),
        }
    }
}

/// A credential validator block.
#[derive(Debug, Clone, Deserialize)]
pub struct ValidatorBlock {
    /// Auth levels whose accounts must hold a validated credential of this
    /// method.
    #[serde(default)]
    pub required: Vec<String>,
    /// Confirmed credentials become `method:value` tags.
    #[serde(default)]
    pub add_to_tags: bool,
    /// Response accepted in place of the real code, for staging and tests.
    #[serde(default)]
    pub debug_response: Option<String>,
    /// Confirmation attempts allowed before the credential is locked.
    #[serde(default = "defaults::max_retries")]
    pub max_retries: i64,
}

impl Default for ValidatorBlock {
    fn default() -> Self {
        ValidatorBlock {
            required: Vec::new(),
            add_to_tags: false,
            debug_response: None,
            max_retries: defaults::max_retries(),
        }
    }
}

/// Tag settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TagConfig {
    /// Namespace prefixes clients may not assign directly.
    #[serde(default = "defaults::restricted_tags")]
    pub restricted: Vec<String>,
}

impl Default for TagConfig {
    fn default() -> Self {
        TagConfig {
            restricted: defaults::restricted_tags(),
        }
    }
}
