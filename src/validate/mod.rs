//! Credential validators and their registry.
//!
//! A validator proves possession of a contact handle (email address, phone
//! number) through a challenge-response exchange. Each registered validator
//! carries an `add_to_tags` flag: when set, a confirmed credential also
//! becomes a `method:value` tag on the account. The registry additionally
//! knows which methods each auth level requires; it is populated from
//! configuration at startup and immutable afterwards.

mod email;
mod tel;

pub use email::EmailValidator;
pub use tel::TelValidator;

use crate::auth::AuthLevel;
use crate::error::StoreError;
use crate::state::uid::Uid;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Contract implemented by every credential validator.
#[async_trait]
pub trait Validator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Syntactic validation of the value and client parameters. No side
    /// effects.
    async fn pre_check(&self, value: &str, params: Option<&Value>) -> Result<(), StoreError>;

    /// Record the credential and send the confirmation challenge. When
    /// `response` is non-empty the challenge is considered immediately
    /// answered: a matching response validates the credential in place and
    /// no message is sent. Returns whether a challenge was sent.
    async fn request(
        &self,
        uid: Uid,
        value: &str,
        lang: &str,
        response: &str,
        tmp_token: &[u8],
    ) -> Result<bool, StoreError>;

    /// Send secret-reset instructions through this channel.
    async fn reset_secret(
        &self,
        value: &str,
        scheme: &str,
        lang: &str,
        tmp_token: &[u8],
    ) -> Result<(), StoreError>;

    /// Verify a response to a previously requested challenge. On success
    /// returns the credential value so tags can be updated; returns the
    /// empty string when the credential has been removed meanwhile.
    async fn check(&self, uid: Uid, response: &str) -> Result<String, StoreError>;

    /// Remove the given credential value.
    async fn remove(&self, uid: Uid, value: &str) -> Result<(), StoreError>;

    /// Remove all of the user's credentials for this method.
    async fn delete(&self, uid: Uid) -> Result<(), StoreError>;
}

/// A registered validator with its registration-time settings.
#[derive(Clone)]
pub struct ValidatorEntry {
    pub validator: Arc<dyn Validator>,
    /// Confirmed credentials become `method:value` tags.
    pub add_to_tags: bool,
}

/// Named validators plus the per-auth-level requirement sets.
pub struct ValidatorRegistry {
    entries: HashMap<String, ValidatorEntry>,
    required: HashMap<AuthLevel, Vec<String>>,
}

impl ValidatorRegistry {
    pub fn new() -> ValidatorRegistry {
        ValidatorRegistry {
            entries: HashMap::new(),
            required: HashMap::new(),
        }
    }

    pub fn register(&mut self, validator: Arc<dyn Validator>, add_to_tags: bool) {
        self.entries.insert(
            validator.name().to_string(),
            ValidatorEntry {
                validator,
                add_to_tags,
            },
        );
    }

    /// Declare the method required for accounts of the given level.
    pub fn require(&mut self, level: AuthLevel, method: &str) {
        let methods = self.required.entry(level).or_default();
        if !methods.iter().any(|m| m == method) {
            methods.push(method.to_string());
        }
    }

    pub fn get(&self, method: &str) -> Option<&ValidatorEntry> {
        self.entries.get(method)
    }

    pub fn validator(&self, method: &str) -> Option<Arc<dyn Validator>> {
        self.entries.get(method).map(|e| e.validator.clone())
    }

    /// Methods that must have at least one validated credential at the
    /// given auth level.
    pub fn required_for(&self, level: AuthLevel) -> &[String] {
        self.required.get(&level).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}

impl Default for ValidatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Generate a numeric confirmation code of the given number of digits.
pub(crate) fn challenge_code(digits: u32) -> String {
    use rand::Rng;
    let cap = 10u64.pow(digits);
    format!("{:0width$}", rand::thread_rng().gen_range(0..cap), width = digits as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_code_shape() {
        for _ in 0..32 {
            let code = challenge_code(6);
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn required_sets_deduplicate() {
        let mut reg = ValidatorRegistry::new();
        reg.require(AuthLevel::Auth, "email");
        reg.require(AuthLevel::Auth, "email");
        reg.require(AuthLevel::Auth, "tel");
        assert_eq!(reg.required_for(AuthLevel::Auth), &["email", "tel"]);
        assert!(reg.required_for(AuthLevel::Anon).is_empty());
    }
}
