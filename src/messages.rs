//! Client and server message shapes.
//!
//! Wire framing and serialization live in the transport layer; these are the
//! decoded forms the coordination core consumes and produces. Ctrl replies
//! use HTTP-flavored codes with a short text, and `decode_store_error` maps
//! the closed store-error set onto them.

use crate::error::StoreError;
use crate::store::types::time_now;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Account create/update request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientAcc {
    /// Message id echoed in the reply.
    #[serde(default)]
    pub id: String,
    /// `"new"` to create, a `usr` id for root edits, empty for self.
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub scheme: String,
    #[serde(default)]
    pub secret: Vec<u8>,
    /// Authenticate the session with the new account.
    #[serde(default)]
    pub login: bool,
    /// Auth level override, root only.
    #[serde(default)]
    pub auth_level: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub desc: Option<SetDesc>,
    #[serde(default)]
    pub cred: Vec<ClientCred>,
}

/// Topic or account description update.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SetDesc {
    pub default_acs: Option<DefaultAcsText>,
    pub public: Option<Value>,
    pub private: Option<Value>,
}

/// Textual default-access pair as supplied by clients.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DefaultAcsText {
    #[serde(default)]
    pub auth: String,
    #[serde(default)]
    pub anon: String,
}

/// A credential being added, confirmed, or removed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientCred {
    pub method: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub response: String,
    pub params: Option<Value>,
}

/// Account deletion request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientDel {
    #[serde(default)]
    pub id: String,
    /// Empty or own id for self-deletion; another id for root.
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub hard: bool,
}

/// Publish request addressed to a topic.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientPub {
    #[serde(default)]
    pub id: String,
    pub topic: String,
    pub head: Option<HashMap<String, Value>>,
    #[serde(default)]
    pub content: Value,
}

/// Call-signaling note addressed to a topic.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientNote {
    pub topic: String,
    /// Always `"call"` for the events this layer consumes.
    #[serde(default)]
    pub what: String,
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub seq: i64,
    pub payload: Option<Value>,
}

/// Server-to-client message.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerMsg {
    Ctrl(Ctrl),
    Data(Box<Data>),
    Info(Info),
    Pres(Pres),
}

/// Control reply to a specific client request.
#[derive(Debug, Clone, Serialize)]
pub struct Ctrl {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub topic: String,
    pub code: u16,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    pub ts: DateTime<Utc>,
}

/// A `{data}` message delivered to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct Data {
    pub topic: String,
    pub from: String,
    pub seq: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head: Option<HashMap<String, Value>>,
    pub content: Value,
    pub ts: DateTime<Utc>,
}

/// Ephemeral notification, not stored.
#[derive(Debug, Clone, Serialize)]
pub struct Info {
    pub topic: String,
    pub from: String,
    pub what: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub event: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub seq: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

/// Presence update.
#[derive(Debug, Clone, Serialize)]
pub struct Pres {
    pub topic: String,
    pub src: String,
    pub what: String,
}

impl ServerMsg {
    pub fn as_ctrl(&self) -> Option<&Ctrl> {
        match self {
            ServerMsg::Ctrl(c) => Some(c),
            _ => None,
        }
    }
}

fn ctrl(code: u16, text: &str, id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMsg {
    ServerMsg::Ctrl(Ctrl {
        id: id.to_string(),
        topic: topic.to_string(),
        code,
        text: text.to_string(),
        params: None,
        ts,
    })
}

fn ctrl_params(
    code: u16,
    text: &str,
    id: &str,
    topic: &str,
    ts: DateTime<Utc>,
    params: Value,
) -> ServerMsg {
    ServerMsg::Ctrl(Ctrl {
        id: id.to_string(),
        topic: topic.to_string(),
        code,
        text: text.to_string(),
        params: Some(params),
        ts,
    })
}

pub fn no_err(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMsg {
    ctrl(200, "ok", id, topic, ts)
}

pub fn no_err_params(id: &str, topic: &str, ts: DateTime<Utc>, params: Value) -> ServerMsg {
    ctrl_params(200, "ok", id, topic, ts, params)
}

pub fn no_err_created(id: &str, topic: &str, ts: DateTime<Utc>, params: Value) -> ServerMsg {
    ctrl_params(201, "created", id, topic, ts, params)
}

pub fn no_err_evicted(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMsg {
    ctrl(205, "evicted", id, topic, ts)
}

pub fn err_malformed(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMsg {
    ctrl(400, "malformed", id, topic, ts)
}

pub fn err_auth_required(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMsg {
    ctrl(401, "authentication required", id, topic, ts)
}

pub fn err_auth_failed(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMsg {
    ctrl(401, "authentication failed", id, topic, ts)
}

pub fn err_permission_denied(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMsg {
    ctrl(403, "permission denied", id, topic, ts)
}

pub fn err_not_found(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMsg {
    ctrl(404, "not found", id, topic, ts)
}

pub fn err_already_authenticated(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMsg {
    ctrl(409, "already authenticated", id, topic, ts)
}

pub fn err_duplicate(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMsg {
    ctrl(409, "duplicate value", id, topic, ts)
}

pub fn err_policy(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMsg {
    ctrl(422, "policy violation", id, topic, ts)
}

pub fn err_call_busy(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMsg {
    ctrl(486, "busy here", id, topic, ts)
}

pub fn err_unsupported(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMsg {
    ctrl(501, "not implemented", id, topic, ts)
}

pub fn err_internal(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMsg {
    ctrl(500, "internal error", id, topic, ts)
}

/// Map a store error onto a ctrl reply, optionally attaching params.
pub fn decode_store_error(
    err: &StoreError,
    id: &str,
    topic: &str,
    ts: DateTime<Utc>,
    params: Option<Value>,
) -> ServerMsg {
    let mut msg = match err {
        StoreError::NotFound => err_not_found(id, topic, ts),
        StoreError::Duplicate => err_duplicate(id, topic, ts),
        StoreError::Credentials => err_auth_failed(id, topic, ts),
        StoreError::Policy => err_policy(id, topic, ts),
        StoreError::Malformed => err_malformed(id, topic, ts),
        StoreError::Unsupported => err_unsupported(id, topic, ts),
        StoreError::Internal(_) => err_internal(id, topic, ts),
    };
    if let (ServerMsg::Ctrl(c), Some(p)) = (&mut msg, params) {
        c.params = Some(p);
    }
    msg
}

/// A client-supplied field is "null" when it carries the distinguished
/// clear-this-field sentinel rather than a value to set.
pub fn is_null_value(v: &Value) -> bool {
    matches!(v, Value::String(s) if s == "\u{2421}")
}

/// Convenience for handler replies that need no params.
pub fn reply_ts() -> DateTime<Utc> {
    time_now()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_store_error_codes() {
        let ts = time_now();
        let cases = [
            (StoreError::NotFound, 404),
            (StoreError::Duplicate, 409),
            (StoreError::Credentials, 401),
            (StoreError::Policy, 422),
            (StoreError::Malformed, 400),
            (StoreError::Unsupported, 501),
            (StoreError::Internal("x".into()), 500),
        ];
        for (err, code) in cases {
            let msg = decode_store_error(&err, "1", "", ts, None);
            assert_eq!(msg.as_ctrl().unwrap().code, code);
        }
    }

    #[test]
    fn params_are_attached() {
        let msg = decode_store_error(
            &StoreError::Policy,
            "2",
            "",
            time_now(),
            Some(json!({"creds": ["tel"]})),
        );
        let ctrl = msg.as_ctrl().unwrap();
        assert_eq!(ctrl.code, 422);
        assert_eq!(ctrl.params.as_ref().unwrap()["creds"][0], "tel");
    }

    #[test]
    fn null_sentinel() {
        assert!(is_null_value(&json!("\u{2421}")));
        assert!(!is_null_value(&json!("plain")));
        assert!(!is_null_value(&json!(null)));
    }
}
