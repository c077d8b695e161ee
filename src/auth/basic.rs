//! The `basic` authentication scheme: `login:password` secrets.
//!
//! Passwords are stored as Argon2 hashes. The login doubles as the scheme's
//! uniqueness key and is surfaced to the caller as a `basic:<login>` tag.

use super::{AuthLevel, AuthRecord, Authenticator, Features};
use crate::error::StoreError;
use crate::state::uid::Uid;
use crate::store::types::{time_now, StoredAuthRecord};
use crate::store::UserPersistence;
use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use async_trait::async_trait;
use chrono::Duration;
use std::sync::Arc;

const SCHEME: &str = "basic";

/// Minimum login length accepted at registration.
const MIN_LOGIN_LENGTH: usize = 2;
/// Maximum login length accepted at registration.
const MAX_LOGIN_LENGTH: usize = 32;

pub struct BasicAuth {
    store: Arc<dyn UserPersistence>,
    /// Validity of newly added records; `None` means no expiration.
    lifetime: Option<Duration>,
}

impl BasicAuth {
    pub fn new(store: Arc<dyn UserPersistence>, lifetime: Option<Duration>) -> BasicAuth {
        BasicAuth { store, lifetime }
    }

    /// Split `login:password`, validating the login shape.
    fn parse_secret(secret: &[u8]) -> Result<(String, String), StoreError> {
        let text = std::str::from_utf8(secret).map_err(|_| StoreError::Malformed)?;
        let (login, password) = text.split_once(':').ok_or(StoreError::Malformed)?;
        let login = login.trim().to_lowercase();
        if login.len() < MIN_LOGIN_LENGTH || login.len() > MAX_LOGIN_LENGTH {
            return Err(StoreError::Policy);
        }
        if password.is_empty() {
            return Err(StoreError::Malformed);
        }
        Ok((login, password.to_string()))
    }

    fn hash_password(password: &str) -> Result<String, StoreError> {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(|e| StoreError::Internal(e.to_string()))
    }

    fn verify_password(password: &str, hash: &str) -> Result<(), StoreError> {
        let parsed = PasswordHash::new(hash).map_err(|e| StoreError::Internal(e.to_string()))?;
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .map_err(|_| StoreError::Credentials)
    }

    fn login_tag(login: &str) -> String {
        format!("{SCHEME}:{login}")
    }
}

#[async_trait]
impl Authenticator for BasicAuth {
    fn name(&self) -> &'static str {
        SCHEME
    }

    async fn is_unique(&self, secret: &[u8]) -> Result<(), StoreError> {
        let (login, _) = Self::parse_secret(secret)?;
        if self.store.get_auth_record(SCHEME, &login).await?.is_some() {
            return Err(StoreError::Duplicate);
        }
        Ok(())
    }

    async fn add_record(&self, rec: &AuthRecord, secret: &[u8]) -> Result<AuthRecord, StoreError> {
        let (login, password) = Self::parse_secret(secret)?;
        let hash = Self::hash_password(&password)?;

        let auth_level = if rec.auth_level == AuthLevel::None {
            AuthLevel::Auth
        } else {
            rec.auth_level
        };
        let expires = self.lifetime.map(|lt| time_now() + lt);

        self.store
            .add_auth_record(&StoredAuthRecord {
                uid: rec.uid,
                scheme: SCHEME.to_string(),
                unique: login.clone(),
                secret: hash.into_bytes(),
                auth_level,
                expires,
            })
            .await?;

        let mut out = rec.clone();
        out.auth_level = auth_level;
        out.lifetime = self.lifetime;
        // The login becomes a discoverable tag.
        let tag = Self::login_tag(&login);
        if !out.tags.contains(&tag) {
            out.tags.push(tag);
        }
        Ok(out)
    }

    async fn update_record(
        &self,
        rec: &AuthRecord,
        secret: &[u8],
    ) -> Result<AuthRecord, StoreError> {
        let (login, password) = Self::parse_secret(secret)?;

        // The new login must not belong to someone else.
        if let Some(existing) = self.store.get_auth_record(SCHEME, &login).await? {
            if existing.uid != rec.uid {
                return Err(StoreError::Duplicate);
            }
        }

        let hash = Self::hash_password(&password)?;
        let auth_level = if rec.auth_level == AuthLevel::None {
            AuthLevel::Auth
        } else {
            rec.auth_level
        };
        self.store
            .update_auth_record(&StoredAuthRecord {
                uid: rec.uid,
                scheme: SCHEME.to_string(),
                unique: login.clone(),
                secret: hash.into_bytes(),
                auth_level,
                expires: self.lifetime.map(|lt| time_now() + lt),
            })
            .await?;

        let mut out = rec.clone();
        out.auth_level = auth_level;
        // Strip stale login tags, then add the current one.
        out.tags.retain(|t| !t.starts_with("basic:"));
        out.tags.push(Self::login_tag(&login));
        Ok(out)
    }

    async fn authenticate(&self, secret: &[u8]) -> Result<AuthRecord, StoreError> {
        let (login, password) = Self::parse_secret(secret)?;
        let stored = self
            .store
            .get_auth_record(SCHEME, &login)
            .await?
            .ok_or(StoreError::Credentials)?;

        if let Some(expires) = stored.expires {
            if expires < time_now() {
                return Err(StoreError::Credentials);
            }
        }

        let hash = std::str::from_utf8(&stored.secret)
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Self::verify_password(&password, hash)?;

        Ok(AuthRecord {
            uid: stored.uid,
            auth_level: stored.auth_level,
            lifetime: None,
            features: Features::NONE,
            tags: Vec::new(),
        })
    }

    fn gen_secret(&self, _rec: &AuthRecord) -> Result<(Vec<u8>, chrono::DateTime<chrono::Utc>), StoreError> {
        // Secrets are chosen by the user, never issued by the server.
        Err(StoreError::Unsupported)
    }

    async fn del_records(&self, uid: Uid) -> Result<(), StoreError> {
        self.store.del_auth_records(uid, Some(SCHEME)).await
    }
}
