//! Records exchanged across the persistence contract.

use crate::state::access::{AccessMode, DefaultAccess};
use crate::state::uid::Uid;
use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Current wall time in UTC rounded to milliseconds, the resolution every
/// stored timestamp carries.
pub fn time_now() -> DateTime<Utc> {
    Utc::now()
        .duration_round(TimeDelta::milliseconds(1))
        .unwrap_or_else(|_| Utc::now())
}

/// Account state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserState {
    Ok,
    Suspended,
    Deleted,
}

impl UserState {
    pub fn as_i64(self) -> i64 {
        match self {
            UserState::Ok => 0,
            UserState::Suspended => 10,
            UserState::Deleted => 20,
        }
    }

    pub fn from_i64(v: i64) -> UserState {
        match v {
            10 => UserState::Suspended,
            20 => UserState::Deleted,
            _ => UserState::Ok,
        }
    }
}

/// A stored user account.
#[derive(Debug, Clone)]
pub struct User {
    pub id: Uid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub state: UserState,
    /// Default access granted to others on the p2p topic with this user.
    pub access: DefaultAccess,
    /// Client-opaque profile blob.
    pub public: Option<Value>,
    /// Unique indexed tags, including the credential-derived ones.
    pub tags: Vec<String>,
    /// Known devices by device id, used for push notifications.
    pub devices: HashMap<String, DeviceDef>,
}

impl User {
    pub fn new(id: Uid) -> User {
        let now = time_now();
        User {
            id,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            state: UserState::Ok,
            access: DefaultAccess::default(),
            public: None,
            tags: Vec::new(),
            devices: HashMap::new(),
        }
    }
}

/// Data provided by a connected device, primarily for push notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDef {
    pub device_id: String,
    pub platform: String,
    pub last_seen: DateTime<Utc>,
    pub lang: String,
}

/// A user-controlled contact handle going through challenge-response
/// confirmation.
#[derive(Debug, Clone)]
pub struct Credential {
    pub user_id: Uid,
    pub method: String,
    pub value: String,
    /// The expected challenge response.
    pub response: String,
    pub done: bool,
    pub retries: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(user_id: Uid, method: &str, value: &str, response: &str) -> Credential {
        let now = time_now();
        Credential {
            user_id,
            method: method.to_string(),
            value: value.to_string(),
            response: response.to_string(),
            done: false,
            retries: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A user's relationship with a topic.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub user_id: Uid,
    pub topic: String,
    pub created_at: DateTime<Utc>,
    pub mode_want: AccessMode,
    pub mode_given: AccessMode,
    pub private: Option<Value>,
    /// Last message id the user reported read.
    pub read_seq_id: i64,
    /// Last message id received by at least one of the user's sessions.
    pub recv_seq_id: i64,
}

/// A stored topic record.
#[derive(Debug, Clone)]
pub struct TopicRecord {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub owner: Uid,
    /// Server-issued sequential id of the latest message.
    pub seq_id: i64,
    pub access: DefaultAccess,
    pub public: Option<Value>,
    pub tags: Vec<String>,
}

/// A durable `{data}` message. Replacement messages for call-state
/// bookkeeping carry `head.replace = ":<seq>"` pointing at the anchor.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub topic: String,
    pub seq_id: i64,
    pub created_at: DateTime<Utc>,
    pub from: Uid,
    pub head: Option<HashMap<String, Value>>,
    pub content: Value,
}

/// A persisted authentication record, owned by a named authenticator.
#[derive(Debug, Clone)]
pub struct StoredAuthRecord {
    pub uid: Uid,
    pub scheme: String,
    /// Uniqueness key within the scheme, e.g. the login for `basic`.
    pub unique: String,
    /// Scheme-specific secret material (a password hash for `basic`).
    pub secret: Vec<u8>,
    pub auth_level: crate::auth::AuthLevel,
    pub expires: Option<DateTime<Utc>>,
}
