//! The `token` authentication scheme.
//!
//! Tokens are self-contained: an HMAC-SHA256-signed payload carrying the uid,
//! auth level, feature bits and expiration time. Nothing is persisted, so
//! `is_unique` and `del_records` do not apply.

use super::{AuthLevel, AuthRecord, Authenticator, Features};
use crate::error::StoreError;
use crate::state::uid::Uid;
use crate::store::types::time_now;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use ring::hmac;

const SCHEME: &str = "token";

/// uid (8) + auth level (1) + features (2) + expires millis (8).
const PAYLOAD_LEN: usize = 19;
/// HMAC-SHA256 output length.
const TAG_LEN: usize = 32;

pub struct TokenAuth {
    key: hmac::Key,
    /// Default validity of issued tokens.
    lifetime: Duration,
}

impl TokenAuth {
    pub fn new(key_material: &[u8], lifetime: Duration) -> Result<TokenAuth, StoreError> {
        if key_material.len() < 16 {
            return Err(StoreError::Malformed);
        }
        Ok(TokenAuth {
            key: hmac::Key::new(hmac::HMAC_SHA256, key_material),
            lifetime,
        })
    }

    fn encode(&self, rec: &AuthRecord, expires: DateTime<Utc>) -> Vec<u8> {
        let mut payload = Vec::with_capacity(PAYLOAD_LEN + TAG_LEN);
        payload.extend_from_slice(&rec.uid.to_bytes());
        payload.push(rec.auth_level.as_u8());
        payload.extend_from_slice(&rec.features.bits().to_le_bytes());
        payload.extend_from_slice(&expires.timestamp_millis().to_le_bytes());
        let tag = hmac::sign(&self.key, &payload);
        payload.extend_from_slice(tag.as_ref());
        payload
    }

    fn decode(&self, secret: &[u8]) -> Result<(AuthRecord, DateTime<Utc>), StoreError> {
        if secret.len() != PAYLOAD_LEN + TAG_LEN {
            return Err(StoreError::Malformed);
        }
        let (payload, tag) = secret.split_at(PAYLOAD_LEN);
        hmac::verify(&self.key, payload, tag).map_err(|_| StoreError::Credentials)?;

        let mut uid_bytes = [0u8; 8];
        uid_bytes.copy_from_slice(&payload[..8]);
        let uid = Uid::from_bytes(uid_bytes);
        let auth_level = AuthLevel::from_u8(payload[8]).ok_or(StoreError::Malformed)?;
        let mut feature_bytes = [0u8; 2];
        feature_bytes.copy_from_slice(&payload[9..11]);
        let features = Features::from_bits(u16::from_le_bytes(feature_bytes));
        let mut millis_bytes = [0u8; 8];
        millis_bytes.copy_from_slice(&payload[11..19]);
        let millis = i64::from_le_bytes(millis_bytes);
        let expires = DateTime::from_timestamp_millis(millis).ok_or(StoreError::Malformed)?;

        let mut rec = AuthRecord::new(uid);
        rec.auth_level = auth_level;
        rec.features = features;
        Ok((rec, expires))
    }
}

#[async_trait]
impl Authenticator for TokenAuth {
    fn name(&self) -> &'static str {
        SCHEME
    }

    async fn is_unique(&self, _secret: &[u8]) -> Result<(), StoreError> {
        // Tokens cannot name a new account.
        Err(StoreError::Unsupported)
    }

    async fn add_record(&self, _rec: &AuthRecord, _secret: &[u8]) -> Result<AuthRecord, StoreError> {
        Err(StoreError::Unsupported)
    }

    async fn update_record(
        &self,
        _rec: &AuthRecord,
        _secret: &[u8],
    ) -> Result<AuthRecord, StoreError> {
        Err(StoreError::Unsupported)
    }

    async fn authenticate(&self, secret: &[u8]) -> Result<AuthRecord, StoreError> {
        let (rec, expires) = self.decode(secret)?;
        if expires < time_now() {
            return Err(StoreError::Credentials);
        }
        if rec.features.contains(Features::NO_LOGIN) {
            return Err(StoreError::Unsupported);
        }
        Ok(rec)
    }

    fn gen_secret(&self, rec: &AuthRecord) -> Result<(Vec<u8>, DateTime<Utc>), StoreError> {
        if rec.uid.is_zero() {
            return Err(StoreError::Malformed);
        }
        let lifetime = rec.lifetime.unwrap_or(self.lifetime);
        let expires = time_now() + lifetime;
        Ok((self.encode(rec, expires), expires))
    }

    async fn del_records(&self, _uid: Uid) -> Result<(), StoreError> {
        // Nothing persisted.
        Ok(())
    }
}
