//! Phone-number credential validator.
//!
//! Same challenge-response shape as the email validator; the outgoing SMS or
//! voice call is a collaborator concern. Numbers are expected in E.164 form.

use super::{challenge_code, Validator};
use crate::error::StoreError;
use crate::state::uid::Uid;
use crate::store::types::Credential;
use crate::store::UserPersistence;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

const METHOD: &str = "tel";
const CODE_DIGITS: u32 = 6;

/// E.164: up to 15 digits after the '+'.
const MAX_DIGITS: usize = 15;

pub struct TelValidator {
    store: Arc<dyn UserPersistence>,
    max_retries: i64,
    debug_response: Option<String>,
}

impl TelValidator {
    pub fn new(
        store: Arc<dyn UserPersistence>,
        max_retries: i64,
        debug_response: Option<String>,
    ) -> TelValidator {
        TelValidator {
            store,
            max_retries,
            debug_response,
        }
    }

    fn response_matches(&self, expected: &str, resp: &str) -> bool {
        resp == expected || self.debug_response.as_deref() == Some(resp)
    }
}

#[async_trait]
impl Validator for TelValidator {
    fn name(&self) -> &'static str {
        METHOD
    }

    async fn pre_check(&self, value: &str, _params: Option<&Value>) -> Result<(), StoreError> {
        let digits = value.strip_prefix('+').ok_or(StoreError::Malformed)?;
        if digits.is_empty()
            || digits.len() > MAX_DIGITS
            || !digits.chars().all(|c| c.is_ascii_digit())
        {
            return Err(StoreError::Malformed);
        }
        Ok(())
    }

    async fn request(
        &self,
        uid: Uid,
        value: &str,
        lang: &str,
        response: &str,
        _tmp_token: &[u8],
    ) -> Result<bool, StoreError> {
        if !response.is_empty() {
            // The challenge is considered immediately answered: the caller
            // vouches for the response, so the credential validates in place.
            self.store
                .upsert_cred(&Credential::new(uid, METHOD, value, response))
                .await?;
            self.store.confirm_cred(uid, METHOD).await?;
            return Ok(false);
        }

        let code = challenge_code(CODE_DIGITS);
        self.store
            .upsert_cred(&Credential::new(uid, METHOD, value, &code))
            .await?;
        // SMS delivery is the collaborator's job.
        debug!(user = %uid.user_id(), tel = %value, lang = %lang, "confirmation code issued");
        Ok(true)
    }

    async fn reset_secret(
        &self,
        value: &str,
        scheme: &str,
        lang: &str,
        _tmp_token: &[u8],
    ) -> Result<(), StoreError> {
        debug!(tel = %value, scheme = %scheme, lang = %lang, "secret reset message issued");
        Ok(())
    }

    async fn check(&self, uid: Uid, resp: &str) -> Result<String, StoreError> {
        let cred = match self.store.get_active_cred(uid, METHOD).await? {
            Some(cred) => cred,
            None => return Ok(String::new()),
        };

        if cred.retries > self.max_retries {
            return Err(StoreError::Policy);
        }
        if resp.is_empty() {
            return Err(StoreError::Credentials);
        }
        if self.response_matches(&cred.response, resp) {
            self.store.confirm_cred(uid, METHOD).await?;
            return Ok(cred.value);
        }

        let _ = self.store.fail_cred(uid, METHOD).await;
        Err(StoreError::Credentials)
    }

    async fn remove(&self, uid: Uid, value: &str) -> Result<(), StoreError> {
        self.store.del_cred(uid, METHOD, Some(value)).await
    }

    async fn delete(&self, uid: Uid) -> Result<(), StoreError> {
        self.store.del_cred(uid, METHOD, None).await
    }
}
