//! Persistence contract.
//!
//! The core consumes this narrow surface instead of a SQL interface; the
//! concrete adapter is pluggable. Every operation returns a typed error from
//! the closed [`StoreError`] set.

mod sqlite;
pub mod types;

pub use sqlite::Database;

use crate::error::StoreError;
use crate::state::uid::Uid;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use types::{Credential, StoredAuthRecord, StoredMessage, Subscription, TopicRecord, User};

/// Operations the coordination core requires from durable storage.
#[async_trait]
pub trait UserPersistence: Send + Sync {
    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    /// Persist a new user together with the private blob of its own `me`
    /// subscription.
    async fn create_user(&self, user: &User, private: Option<&Value>) -> Result<(), StoreError>;

    async fn get_user(&self, uid: Uid) -> Result<Option<User>, StoreError>;

    async fn get_users(&self, uids: &[Uid]) -> Result<Vec<User>, StoreError>;

    /// Users soft-deleted before the given time, candidates for hard
    /// deletion by a maintenance sweep.
    async fn get_disabled_users(&self, before: DateTime<Utc>) -> Result<Vec<Uid>, StoreError>;

    /// Find the owner of a validated credential.
    async fn get_user_by_cred(&self, method: &str, value: &str) -> Result<Option<Uid>, StoreError>;

    /// Soft-delete (mark) or hard-delete (purge) a user.
    async fn delete_user(&self, uid: Uid, hard: bool) -> Result<(), StoreError>;

    /// Mutate the user's tag set. `reset` replaces the whole set; otherwise
    /// `add` and `remove` apply incrementally. Returns the resulting tags.
    async fn update_tags(
        &self,
        uid: Uid,
        add: &[String],
        remove: &[String],
        reset: Option<&[String]>,
    ) -> Result<Vec<String>, StoreError>;

    /// The user's subscriptions.
    async fn get_subs(&self, uid: Uid) -> Result<Vec<Subscription>, StoreError>;

    /// Names of group topics owned by the user.
    async fn get_own_topics(&self, uid: Uid) -> Result<Vec<String>, StoreError>;

    /// Total unread count across the user's subscriptions.
    async fn get_unread_count(&self, uid: Uid) -> Result<i64, StoreError>;

    // ------------------------------------------------------------------
    // Credentials
    // ------------------------------------------------------------------

    /// Insert or refresh a credential. Returns `true` when a new row was
    /// inserted, `false` when an existing unconfirmed row was refreshed.
    /// A duplicate *validated* credential is rejected with `Duplicate`.
    async fn upsert_cred(&self, cred: &Credential) -> Result<bool, StoreError>;

    async fn get_all_creds(
        &self,
        uid: Uid,
        validated_only: bool,
    ) -> Result<Vec<Credential>, StoreError>;

    /// The credential currently awaiting confirmation for the method.
    async fn get_active_cred(
        &self,
        uid: Uid,
        method: &str,
    ) -> Result<Option<Credential>, StoreError>;

    /// Mark the active credential of the method as validated.
    async fn confirm_cred(&self, uid: Uid, method: &str) -> Result<(), StoreError>;

    /// Count a failed confirmation attempt against the active credential.
    async fn fail_cred(&self, uid: Uid, method: &str) -> Result<(), StoreError>;

    /// Delete credentials of the method; all of them when `value` is `None`.
    async fn del_cred(&self, uid: Uid, method: &str, value: Option<&str>) -> Result<(), StoreError>;

    // ------------------------------------------------------------------
    // Authentication records
    // ------------------------------------------------------------------

    async fn add_auth_record(&self, rec: &StoredAuthRecord) -> Result<(), StoreError>;

    async fn get_auth_record(
        &self,
        scheme: &str,
        unique: &str,
    ) -> Result<Option<StoredAuthRecord>, StoreError>;

    async fn update_auth_record(&self, rec: &StoredAuthRecord) -> Result<(), StoreError>;

    /// Delete the user's auth records; all schemes when `scheme` is `None`.
    async fn del_auth_records(&self, uid: Uid, scheme: Option<&str>) -> Result<(), StoreError>;

    // ------------------------------------------------------------------
    // Topics, subscriptions, messages
    // ------------------------------------------------------------------

    async fn create_topic(&self, topic: &TopicRecord) -> Result<(), StoreError>;

    async fn get_topic(&self, name: &str) -> Result<Option<TopicRecord>, StoreError>;

    async fn add_subscription(&self, sub: &Subscription) -> Result<(), StoreError>;

    /// Subscriptions attached to the topic, for deletion fan-out.
    async fn get_topic_subs(&self, topic: &str) -> Result<Vec<Subscription>, StoreError>;

    /// Persist a message and advance the topic's sequence id.
    async fn save_message(&self, msg: &StoredMessage) -> Result<(), StoreError>;

    async fn delete_topic(&self, name: &str, hard: bool) -> Result<(), StoreError>;
}
