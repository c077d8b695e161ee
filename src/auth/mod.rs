//! Authentication schemes and their registry.
//!
//! Each scheme (basic, token, ...) implements the [`Authenticator`] contract
//! and owns its persisted records. A logical alias map routes scheme names so
//! configuration can redirect e.g. `rest` to another handler. The registry is
//! populated at startup and immutable afterwards.

mod basic;
mod token;

pub use basic::BasicAuth;
pub use token::TokenAuth;

use crate::error::StoreError;
use crate::state::uid::Uid;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Coarse authorization tier of a session or record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthLevel {
    None,
    Anon,
    Auth,
    Root,
}

impl AuthLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthLevel::None => "",
            AuthLevel::Anon => "anon",
            AuthLevel::Auth => "auth",
            AuthLevel::Root => "root",
        }
    }

    pub fn parse(s: &str) -> Option<AuthLevel> {
        match s {
            "" => Some(AuthLevel::None),
            "anon" => Some(AuthLevel::Anon),
            "auth" => Some(AuthLevel::Auth),
            "root" => Some(AuthLevel::Root),
            _ => None,
        }
    }

    /// Numeric form used inside token payloads.
    pub fn as_u8(&self) -> u8 {
        match self {
            AuthLevel::None => 0,
            AuthLevel::Anon => 10,
            AuthLevel::Auth => 20,
            AuthLevel::Root => 30,
        }
    }

    pub fn from_u8(v: u8) -> Option<AuthLevel> {
        match v {
            0 => Some(AuthLevel::None),
            10 => Some(AuthLevel::Anon),
            20 => Some(AuthLevel::Auth),
            30 => Some(AuthLevel::Root),
            _ => None,
        }
    }
}

/// Feature bits attached to an auth record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Features(u16);

impl Features {
    pub const NONE: Features = Features(0);
    /// The secret may be used for credential validation but not for login.
    pub const NO_LOGIN: Features = Features(0x01);
    /// The record was issued against a validated account.
    pub const VALIDATED: Features = Features(0x02);

    pub fn bits(&self) -> u16 {
        self.0
    }

    pub fn from_bits(v: u16) -> Features {
        Features(v & 0x03)
    }

    pub fn contains(&self, other: Features) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: Features) -> Features {
        Features(self.0 | other.0)
    }
}

/// The result of authenticating or registering a secret.
#[derive(Debug, Clone)]
pub struct AuthRecord {
    pub uid: Uid,
    pub auth_level: AuthLevel,
    /// How long a generated secret stays valid.
    pub lifetime: Option<Duration>,
    pub features: Features,
    /// Tags derived from the login; the caller must persist them.
    pub tags: Vec<String>,
}

impl AuthRecord {
    pub fn new(uid: Uid) -> AuthRecord {
        AuthRecord {
            uid,
            auth_level: AuthLevel::None,
            lifetime: None,
            features: Features::NONE,
            tags: Vec::new(),
        }
    }
}

/// Contract implemented by every authentication scheme.
#[async_trait]
pub trait Authenticator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Verify that no existing record claims this secret.
    async fn is_unique(&self, secret: &[u8]) -> Result<(), StoreError>;

    /// Create a record for the secret. May rewrite `rec.tags` to reflect
    /// login-derived tags; the caller must persist the returned tags.
    async fn add_record(&self, rec: &AuthRecord, secret: &[u8]) -> Result<AuthRecord, StoreError>;

    /// Replace the secret of an existing record. Tag rewriting as in
    /// [`Authenticator::add_record`].
    async fn update_record(
        &self,
        rec: &AuthRecord,
        secret: &[u8],
    ) -> Result<AuthRecord, StoreError>;

    /// Authenticate a secret, returning the record it proves.
    async fn authenticate(&self, secret: &[u8]) -> Result<AuthRecord, StoreError>;

    /// Generate a new secret for the record, with its expiration time.
    fn gen_secret(&self, rec: &AuthRecord) -> Result<(Vec<u8>, DateTime<Utc>), StoreError>;

    /// Delete all records of the given user.
    async fn del_records(&self, uid: Uid) -> Result<(), StoreError>;
}

/// Named authenticators with logical-name routing.
pub struct AuthRegistry {
    handlers: HashMap<String, Arc<dyn Authenticator>>,
    aliases: HashMap<String, String>,
}

impl AuthRegistry {
    pub fn new() -> AuthRegistry {
        AuthRegistry {
            handlers: HashMap::new(),
            aliases: HashMap::new(),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn Authenticator>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    /// Route `logical` to the handler registered as `real`.
    pub fn alias(&mut self, logical: &str, real: &str) {
        self.aliases.insert(logical.to_string(), real.to_string());
    }

    /// Look up a handler by its logical name.
    pub fn get(&self, scheme: &str) -> Option<Arc<dyn Authenticator>> {
        let real = self.aliases.get(scheme).map(String::as_str).unwrap_or(scheme);
        self.handlers.get(real).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }
}

impl Default for AuthRegistry {
    fn default() -> Self {
        Self::new()
    }
}
