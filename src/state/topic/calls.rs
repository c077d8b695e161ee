//! Video-call signaling.
//!
//! The server only signals: media flows peer-to-peer. A call is anchored to
//! the `{data}` message that carried the invite; its lifecycle is recorded by
//! replacement messages pointing back at that anchor, and live events are
//! forwarded between the two party sessions as `{info}` messages.

use super::TopicActor;
use crate::messages::{err_call_busy, err_permission_denied, ClientNote, ClientPub, Info, ServerMsg};
use crate::metrics;
use crate::state::session::Session;
use crate::state::uid::{TopicCat, Uid};
use crate::store::types::time_now;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::error;

/// Call started, caller is dialing.
pub const CALL_EVENT_INVITE: &str = "invite";
/// Callee has received the call but hasn't picked it up yet.
pub const CALL_EVENT_RINGING: &str = "ringing";
/// Callee has accepted the call.
pub const CALL_EVENT_ACCEPT: &str = "accept";
/// WebRTC SDP & ICE exchange events.
pub const CALL_EVENT_OFFER: &str = "offer";
pub const CALL_EVENT_ANSWER: &str = "answer";
pub const CALL_EVENT_ICE_CANDIDATE: &str = "ice-candidate";
/// Call finished by either side or by the server.
pub const CALL_EVENT_HANG_UP: &str = "hang-up";

/// Replacement-message bodies recording call states.
pub const CALL_MSG_ACCEPTED: &str = "accepted";
pub const CALL_MSG_FINISHED: &str = "finished";
pub const CALL_MSG_DISCONNECTED: &str = "disconnected";

/// How long the server waits for call establishment before dropping it.
pub const CALL_ESTABLISHMENT_TIMEOUT: Duration = Duration::from_secs(15);
/// Mime type marking a `{pub}` as a call invite.
pub const VIDEO_CALL_MIME_TYPE: &str = "application/x-tinode-webrtc";

/// One side of a call.
pub struct CallParty {
    pub uid: Uid,
    pub is_originator: bool,
    sess: Arc<Session>,
}

/// A video call being established or in progress. At most one per topic.
pub struct VideoCall {
    /// Participating sessions by session id.
    parties: HashMap<String, CallParty>,
    /// The message id anchoring the call.
    pub seq: i64,
    /// Establishment deadline, armed while the call is unanswered.
    timer: Option<JoinHandle<()>>,
}

impl VideoCall {
    /// Head of a replacement message recording a call state.
    fn message_head(&self) -> HashMap<String, Value> {
        let mut head = HashMap::new();
        head.insert("mime".to_string(), json!(VIDEO_CALL_MIME_TYPE));
        head.insert("replace".to_string(), json!(format!(":{}", self.seq)));
        head
    }

    fn originator(&self) -> Option<(&String, &CallParty)> {
        self.parties.iter().find(|(_, p)| p.is_originator)
    }

    fn stop_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl TopicActor {
    /// Info-message template for a call event on this topic, addressed as
    /// `target` sees it.
    fn call_info(&self, target: Uid, from: Uid, event: &str, seq: i64, payload: Option<Value>) -> ServerMsg {
        ServerMsg::Info(Info {
            topic: self.topic_for_user(target),
            from: from.user_id(),
            what: "call".to_string(),
            event: event.to_string(),
            seq,
            payload,
        })
    }

    /// Checks performed before the invite message is persisted. Replies on
    /// the inviting session when an invite is rejected.
    pub(crate) fn call_invite_preconditions(&self, msg: &ClientPub, sess: &Arc<Session>) -> bool {
        let now = time_now();
        if self.current_call.is_some() {
            // There's already another call in progress.
            sess.queue_out(err_call_busy(&msg.id, &msg.topic, now));
            return false;
        }
        if self.cat != TopicCat::P2P {
            sess.queue_out(err_permission_denied(&msg.id, &msg.topic, now));
            return false;
        }
        true
    }

    /// Begin call establishment. The invite message has just been saved
    /// under the current sequence id, which becomes the call's anchor.
    pub(crate) async fn start_call(&mut self, from: Uid, sess: &Arc<Session>) {
        let seq = self.seq_id;
        let target = self.p2p_other_user(from);
        self.info_call_subs_offline(from, target, CALL_EVENT_INVITE, seq, None, &sess.sid, false);

        let mut parties = HashMap::new();
        parties.insert(
            sess.sid.clone(),
            CallParty {
                uid: from,
                is_originator: true,
                sess: sess.clone(),
            },
        );

        // Wait for the callee to pick up; the timeout event is ignored if it
        // arrives for a stale call.
        let self_tx = self.self_tx.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(CALL_ESTABLISHMENT_TIMEOUT).await;
            let _ = self_tx.send(super::TopicEvent::CallTimeout { seq }).await;
        });

        self.current_call = Some(VideoCall {
            parties,
            seq,
            timer: Some(timer),
        });
        metrics::LIVE_CALLS.inc();
    }

    /// Handle an event on an existing call: acceptance, metadata exchange or
    /// termination. Events that do not fit the current call state are
    /// silently dropped; the transport has already acknowledged the note.
    pub(crate) async fn handle_call_event(&mut self, note: ClientNote, from: Uid, sess: Arc<Session>) {
        let Some(call) = self.current_call.as_ref() else {
            // Must initiate a call first.
            return;
        };
        if self.paused {
            // Topic is paused or being deleted.
            return;
        }
        if call.seq != note.seq {
            // Call not found.
            return;
        }
        if !self.per_user.contains_key(&from) {
            // Not a subscriber.
            return;
        }

        match note.event.as_str() {
            CALL_EVENT_RINGING | CALL_EVENT_ACCEPT => {
                self.handle_call_answer(note, from, sess).await;
            }
            CALL_EVENT_OFFER | CALL_EVENT_ANSWER | CALL_EVENT_ICE_CANDIDATE => {
                // Either side may send these; forward to the other session.
                let other = call
                    .parties
                    .iter()
                    .find(|(sid, _)| *sid != &sess.sid)
                    .map(|(_, p)| (p.uid, p.sess.clone()));
                let Some((other_uid, other_sess)) = other else {
                    return;
                };
                let forward = self.call_info(other_uid, from, &note.event, call.seq, note.payload);
                other_sess.queue_out(forward);
            }
            CALL_EVENT_HANG_UP => {
                self.maybe_end_call_in_progress(Some(from)).await;
            }
            _ => {
                self.warn_unexpected("unexpected call event");
            }
        }
    }

    /// Ringing and accept, valid only from the callee while the call is
    /// unanswered.
    async fn handle_call_answer(&mut self, note: ClientNote, from: Uid, sess: Arc<Session>) {
        let call = match self.current_call.as_ref() {
            Some(call) if call.parties.len() == 1 => call,
            // The call is already established or in teardown.
            _ => return,
        };

        let Some((orig_sid, orig)) = call.originator() else {
            self.warn_unexpected("call has no originator, terminating");
            self.terminate_call_in_progress().await;
            return;
        };
        // These events may only arrive from the callee.
        if orig_sid == &sess.sid || orig.uid == from {
            return;
        }
        let orig_uid = orig.uid;
        let orig_sess = orig.sess.clone();
        let call_seq = call.seq;
        let head = call.message_head();

        let accepted = note.event == CALL_EVENT_ACCEPT;
        if accepted {
            // Record the established call with a replacement message.
            if let Err(e) = self
                .save_and_broadcast(orig_uid, Some(head), json!(CALL_MSG_ACCEPTED))
                .await
            {
                error!(topic = %self.name, seq = call_seq, error = %e,
                    "failed to write call acceptance message");
                return;
            }
            let seq_now = self.seq_id;
            if let Some(call) = self.current_call.as_mut() {
                call.parties.insert(
                    sess.sid.clone(),
                    CallParty {
                        uid: from,
                        is_originator: false,
                        sess: sess.clone(),
                    },
                );
                call.stop_timer();
            }
            // Let the callee's other sessions know the call was picked up.
            self.info_call_subs_offline(
                from,
                from,
                CALL_EVENT_ACCEPT,
                seq_now,
                note.payload.clone(),
                &sess.sid,
                false,
            );
        }

        let forward = self.call_info(orig_uid, from, &note.event, call_seq, None);
        orig_sess.queue_out(forward);
    }

    /// The establishment deadline fired before the callee answered.
    pub(crate) async fn handle_call_timeout(&mut self) {
        // Synthesized hangup from the server: the call never established.
        self.maybe_end_call_in_progress(None).await;
    }

    /// End the current call. `from` is the hanging-up user for a
    /// client-initiated hangup, `None` for server-initiated termination.
    pub(crate) async fn maybe_end_call_in_progress(&mut self, from: Option<Uid>) {
        let Some(mut call) = self.current_call.take() else {
            return;
        };
        call.stop_timer();
        metrics::LIVE_CALLS.dec();

        let orig_uid = call.originator().map(|(_, p)| p.uid).unwrap_or(Uid::ZERO);
        let replace_with = if from.is_some() && call.parties.len() == 2 {
            // A call in progress ended normally.
            CALL_MSG_FINISHED
        } else {
            // The call never established.
            CALL_MSG_DISCONNECTED
        };

        let head = call.message_head();
        if let Err(e) = self
            .save_and_broadcast(orig_uid, Some(head), json!(replace_with))
            .await
        {
            error!(topic = %self.name, seq = call.seq, error = %e,
                "failed to write finalizing message for call");
        }

        // Hang-up info to the attached sessions.
        let resp = self.call_info(orig_uid, orig_uid, CALL_EVENT_HANG_UP, call.seq, None);
        self.broadcast_to_sessions(resp, None);

        // Let all other sessions know the call is over.
        let from_uid = from.unwrap_or(Uid::ZERO);
        let targets: Vec<Uid> = self.per_user.keys().copied().collect();
        for target in targets {
            self.info_call_subs_offline(from_uid, target, CALL_EVENT_HANG_UP, call.seq, None, "", true);
        }
    }

    /// Server-initiated call termination, synthesizing a hangup from the
    /// originator.
    pub(crate) async fn terminate_call_in_progress(&mut self) {
        let Some(call) = self.current_call.as_ref() else {
            return;
        };
        if call.originator().is_none() {
            self.warn_unexpected("call has no originator, terminating");
            if let Some(mut call) = self.current_call.take() {
                call.stop_timer();
            }
            metrics::LIVE_CALLS.dec();
            return;
        }
        self.maybe_end_call_in_progress(None).await;
    }
}
