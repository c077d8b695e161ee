//! Push-notification receipts and the delivery boundary.
//!
//! The core enriches receipts with per-recipient unread counts and hands them
//! to a [`Pusher`]; actual delivery (FCM, APNs, ...) is a collaborator.

use crate::state::uid::Uid;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

/// What happened, for rendering the notification.
#[derive(Debug, Clone)]
pub struct PushPayload {
    pub topic: String,
    pub from: String,
    pub seq: i64,
    pub ts: DateTime<Utc>,
    pub content: Value,
}

/// Per-recipient delivery data, annotated with the unread count by the
/// user-cache enrichment stage.
#[derive(Debug, Clone, Default)]
pub struct PushRecipient {
    /// Number of sessions the message was already delivered to; the push
    /// service may skip recipients with live deliveries.
    pub delivered: u32,
    /// Unread count after this message, or -1 when unknown.
    pub unread: i64,
}

impl PushRecipient {
    pub fn new(delivered: u32) -> PushRecipient {
        PushRecipient {
            delivered,
            unread: -1,
        }
    }
}

/// A notification receipt addressed to a set of users.
#[derive(Debug, Clone)]
pub struct PushReceipt {
    pub payload: PushPayload,
    pub to: HashMap<Uid, PushRecipient>,
}

impl PushReceipt {
    pub fn new(payload: PushPayload) -> PushReceipt {
        PushReceipt {
            payload,
            to: HashMap::new(),
        }
    }

    pub fn add_recipient(&mut self, uid: Uid, delivered: u32) {
        self.to.insert(uid, PushRecipient::new(delivered));
    }
}

/// Delivery backend boundary.
#[async_trait]
pub trait Pusher: Send + Sync {
    async fn push(&self, rcpt: &PushReceipt);
}

/// Default backend: logs the receipt. Stands in until a real delivery
/// backend is wired up.
pub struct LogPusher;

#[async_trait]
impl Pusher for LogPusher {
    async fn push(&self, rcpt: &PushReceipt) {
        for (uid, recipient) in &rcpt.to {
            debug!(
                user = %uid.user_id(),
                topic = %rcpt.payload.topic,
                seq = rcpt.payload.seq,
                unread = recipient.unread,
                "push receipt"
            );
        }
    }
}
