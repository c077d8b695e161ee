//! Per-topic runtime.
//!
//! Each loaded topic runs as an isolated task owning all of its state: the
//! per-user access map, the attached sessions, the message sequence and the
//! current video call. All interactions arrive as [`TopicEvent`] messages on
//! the actor's mailbox, so there is no lock contention on the message path.

mod calls;

pub use calls::{
    VideoCall, CALL_EVENT_ACCEPT, CALL_EVENT_ANSWER, CALL_EVENT_HANG_UP, CALL_EVENT_ICE_CANDIDATE,
    CALL_EVENT_INVITE, CALL_EVENT_OFFER, CALL_EVENT_RINGING, CALL_MSG_ACCEPTED, CALL_MSG_DISCONNECTED,
    CALL_MSG_FINISHED, VIDEO_CALL_MIME_TYPE,
};

use crate::messages::{
    err_permission_denied, no_err_params, ClientNote, ClientPub, Data, ServerMsg,
};
use crate::metrics;
use crate::presence;
use crate::push::{PushPayload, PushReceipt};
use crate::state::access::AccessMode;
use crate::state::cache::UserCache;
use crate::state::session::{Session, SessionStore};
use crate::state::uid::{parse_p2p, TopicCat, Uid};
use crate::store::types::{time_now, StoredMessage, Subscription, TopicRecord};
use crate::store::UserPersistence;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, warn};

/// Mailbox depth of a topic actor.
const MAILBOX_CAPACITY: usize = 256;

/// Access state of one subscriber.
#[derive(Debug, Clone)]
pub struct PerUserData {
    pub want: AccessMode,
    pub given: AccessMode,
    pub private: Option<serde_json::Value>,
}

impl PerUserData {
    /// Effective mode: the intersection of requested and granted.
    pub fn mode(&self) -> AccessMode {
        self.want & self.given
    }
}

/// A session currently attached to the topic.
struct OnlineSession {
    uid: Uid,
    sess: Arc<Session>,
}

/// Events a topic actor consumes.
pub enum TopicEvent {
    /// A session attached to the topic.
    Attach { uid: Uid, sess: Arc<Session> },
    /// A session detached.
    Detach { sid: String },
    /// Publish a `{data}` message. A message whose head carries the video
    /// call mime type doubles as a call invite.
    Publish {
        msg: ClientPub,
        from: Uid,
        sess: Arc<Session>,
    },
    /// A call-signaling `{note}`.
    CallNote {
        note: ClientNote,
        from: Uid,
        sess: Arc<Session>,
    },
    /// The call-establishment deadline fired.
    CallTimeout { seq: i64 },
    /// Server-initiated call termination.
    TerminateCall,
    /// Suspend or resume event processing for calls.
    SetPaused(bool),
    /// Stop the actor. The optional channel is signalled once the actor has
    /// cleaned up, which the account-deletion flow waits on.
    Shutdown {
        done: Option<oneshot::Sender<()>>,
    },
}

/// The topic actor. Owns the state of a single topic and processes events
/// sequentially.
pub struct TopicActor {
    pub name: String,
    pub cat: TopicCat,
    seq_id: i64,
    owner: Uid,
    per_user: HashMap<Uid, PerUserData>,
    online: HashMap<String, OnlineSession>,
    current_call: Option<VideoCall>,
    paused: bool,

    store: Arc<dyn UserPersistence>,
    sessions: Arc<SessionStore>,
    cache: UserCache,
    /// The actor's own mailbox, for timer callbacks.
    self_tx: mpsc::Sender<TopicEvent>,
}

impl TopicActor {
    /// Spawn a topic actor from its stored record and subscriptions.
    pub fn spawn(
        record: TopicRecord,
        subs: Vec<Subscription>,
        store: Arc<dyn UserPersistence>,
        sessions: Arc<SessionStore>,
        cache: UserCache,
    ) -> mpsc::Sender<TopicEvent> {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);

        let cat = TopicCat::from_name(&record.name).unwrap_or(TopicCat::Grp);
        let per_user: HashMap<Uid, PerUserData> = subs
            .into_iter()
            .map(|s| {
                (
                    s.user_id,
                    PerUserData {
                        want: s.mode_want,
                        given: s.mode_given,
                        private: s.private,
                    },
                )
            })
            .collect();

        let actor = TopicActor {
            name: record.name,
            cat,
            seq_id: record.seq_id,
            owner: record.owner,
            per_user,
            online: HashMap::new(),
            current_call: None,
            paused: false,
            store,
            sessions,
            cache,
            self_tx: tx.clone(),
        };

        tokio::spawn(actor.run(rx));
        tx
    }

    async fn run(mut self, mut rx: mpsc::Receiver<TopicEvent>) {
        metrics::ACTIVE_TOPICS.inc();
        // Account the subscribers as members of a running topic.
        self.cache
            .register_topic_users(self.per_user.keys().copied().collect(), true);

        while let Some(event) = rx.recv().await {
            match event {
                TopicEvent::Attach { uid, sess } => {
                    self.online.insert(sess.sid.clone(), OnlineSession { uid, sess });
                }
                TopicEvent::Detach { sid } => {
                    self.online.remove(&sid);
                }
                TopicEvent::Publish { msg, from, sess } => {
                    self.handle_publish(msg, from, sess).await;
                }
                TopicEvent::CallNote { note, from, sess } => {
                    self.handle_call_event(note, from, sess).await;
                }
                TopicEvent::CallTimeout { seq } => {
                    if self.current_call.as_ref().map(|c| c.seq) == Some(seq) {
                        self.handle_call_timeout().await;
                    }
                }
                TopicEvent::TerminateCall => {
                    self.terminate_call_in_progress().await;
                }
                TopicEvent::SetPaused(paused) => {
                    self.paused = paused;
                }
                TopicEvent::Shutdown { done } => {
                    self.terminate_call_in_progress().await;
                    if let Some(done) = done {
                        let _ = done.send(());
                    }
                    break;
                }
            }
        }

        self.cache
            .register_topic_users(self.per_user.keys().copied().collect(), false);
        metrics::ACTIVE_TOPICS.dec();
        tracing::info!(topic = %self.name, owner = %self.owner.user_id(), "topic stopped");
    }

    /// The other party of a p2p topic.
    pub(crate) fn p2p_other_user(&self, uid: Uid) -> Uid {
        match parse_p2p(&self.name) {
            Ok((a, b)) if a == uid => b,
            Ok((a, _)) => a,
            Err(_) => Uid::ZERO,
        }
    }

    /// The topic name as the given user addresses it: for p2p topics that is
    /// the peer's user id, otherwise the topic's own name.
    pub(crate) fn topic_for_user(&self, uid: Uid) -> String {
        if self.cat == TopicCat::P2P {
            let other = self.p2p_other_user(uid);
            if !other.is_zero() {
                return other.user_id();
            }
        }
        self.name.clone()
    }

    async fn handle_publish(&mut self, msg: ClientPub, from: Uid, sess: Arc<Session>) {
        let now = time_now();
        let writable = self
            .per_user
            .get(&from)
            .map(|pud| pud.mode().is_writer())
            .unwrap_or(false);
        if !writable {
            sess.queue_out(err_permission_denied(&msg.id, &msg.topic, now));
            return;
        }

        let is_call_invite = msg
            .head
            .as_ref()
            .and_then(|h| h.get("mime"))
            .and_then(|v| v.as_str())
            == Some(VIDEO_CALL_MIME_TYPE);

        if is_call_invite {
            // Reject before anything is persisted.
            if !self.call_invite_preconditions(&msg, &sess) {
                return;
            }
        }

        let seq = match self
            .save_and_broadcast(from, msg.head.clone(), msg.content.clone())
            .await
        {
            Ok(seq) => seq,
            Err(e) => {
                error!(topic = %self.name, error = %e, "failed to save message");
                sess.queue_out(crate::messages::decode_store_error(
                    &e, &msg.id, &msg.topic, now, None,
                ));
                return;
            }
        };

        sess.queue_out(no_err_params(&msg.id, &msg.topic, now, json!({ "seq": seq })));

        if is_call_invite {
            self.start_call(from, &sess).await;
        } else {
            self.send_push_receipt(from, seq, msg.content);
        }
    }

    /// Persist a `{data}` message under the next sequence id and broadcast it
    /// to the attached sessions. Returns the assigned id.
    pub(crate) async fn save_and_broadcast(
        &mut self,
        from: Uid,
        head: Option<HashMap<String, serde_json::Value>>,
        content: serde_json::Value,
    ) -> Result<i64, crate::error::StoreError> {
        let now = time_now();
        let seq = self.seq_id + 1;
        self.store
            .save_message(&StoredMessage {
                topic: self.name.clone(),
                seq_id: seq,
                created_at: now,
                from,
                head: head.clone(),
                content: content.clone(),
            })
            .await?;
        self.seq_id = seq;

        let data = ServerMsg::Data(Box::new(Data {
            topic: self.name.clone(),
            from: from.user_id(),
            seq,
            head,
            content,
            ts: now,
        }));
        self.broadcast_to_sessions(data, None);
        Ok(seq)
    }

    /// Queue a message to every attached session, except `exclude_sid` when
    /// given. Readers only.
    pub(crate) fn broadcast_to_sessions(&self, msg: ServerMsg, exclude_sid: Option<&str>) {
        for (sid, online) in &self.online {
            if exclude_sid == Some(sid.as_str()) {
                continue;
            }
            let readable = self
                .per_user
                .get(&online.uid)
                .map(|pud| pud.mode().is_reader())
                .unwrap_or(false);
            if readable {
                online.sess.queue_out(msg.clone());
            }
        }
    }

    fn send_push_receipt(&self, from: Uid, seq: i64, content: serde_json::Value) {
        let mut rcpt = PushReceipt::new(PushPayload {
            topic: self.name.clone(),
            from: from.user_id(),
            seq,
            ts: time_now(),
            content,
        });
        for (&uid, pud) in &self.per_user {
            if uid == from || !pud.mode().is_reader() {
                continue;
            }
            let delivered = self.online.values().filter(|o| o.uid == uid).count() as u32;
            rcpt.add_recipient(uid, delivered);
        }
        if !rcpt.to.is_empty() {
            self.cache.push(rcpt);
        }
    }

    /// Offline fan-out of a call event to every session of `target` except
    /// the excluded one.
    pub(crate) fn info_call_subs_offline(
        &self,
        from: Uid,
        target: Uid,
        event: &str,
        seq: i64,
        payload: Option<serde_json::Value>,
        exclude_sid: &str,
        is_final: bool,
    ) {
        presence::info_call_subs_offline(
            &self.sessions,
            &self.topic_for_user(target),
            &from.user_id(),
            target,
            event,
            seq,
            payload,
            exclude_sid,
            is_final,
        );
    }

    fn warn_unexpected(&self, what: &str) {
        let seq = self.current_call.as_ref().map(|c| c.seq).unwrap_or(0);
        warn!(topic = %self.name, seq, "video call: {}", what);
    }
}
