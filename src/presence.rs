//! Presence and notification fan-out.
//!
//! Best-effort delivery to sessions that are not attached to the affected
//! topic: failures log and never abort the primary operation.

use crate::messages::{Info, Pres, ServerMsg};
use crate::state::session::SessionStore;
use crate::state::uid::{parse_p2p, Uid};
use crate::store::types::Subscription;
use serde_json::Value;
use tracing::debug;

/// Notify the users whose subscriptions the given user affected that the
/// user is gone (account deleted or disabled). The interested parties are
/// the other ends of the user's p2p topics.
pub fn pres_users_of_interest_offline(
    sessions: &SessionStore,
    uid: Uid,
    subs: &[Subscription],
    what: &str,
) {
    let mut interested: Vec<Uid> = subs
        .iter()
        .filter_map(|sub| parse_p2p(&sub.topic).ok())
        .map(|(a, b)| if a == uid { b } else { a })
        .filter(|other| !other.is_zero() && *other != uid)
        .collect();
    interested.sort();
    interested.dedup();

    for target in interested {
        for sess in sessions.sessions_of(target) {
            sess.queue_out(ServerMsg::Pres(Pres {
                topic: "me".to_string(),
                src: uid.user_id(),
                what: what.to_string(),
            }));
        }
    }
    debug!(user = %uid.user_id(), what = %what, "presence fan-out to users of interest");
}

/// Notify subscribers of a topic that it is gone, excluding the initiating
/// session.
pub fn pres_topic_gone(
    sessions: &SessionStore,
    topic: &str,
    subs: &[Subscription],
    what: &str,
    exclude_sid: &str,
) {
    for sub in subs {
        for sess in sessions.sessions_of(sub.user_id) {
            if sess.sid == exclude_sid {
                continue;
            }
            sess.queue_out(ServerMsg::Pres(Pres {
                topic: topic.to_string(),
                src: topic.to_string(),
                what: what.to_string(),
            }));
        }
    }
}

/// Broadcast a call-lifecycle event to every session of `target` except the
/// one identified by `exclude_sid`. `is_final` marks events that end the
/// call, letting secondary devices stop alerting even when they ignore
/// intermediate events.
#[allow(clippy::too_many_arguments)]
pub fn info_call_subs_offline(
    sessions: &SessionStore,
    topic: &str,
    from: &str,
    target: Uid,
    event: &str,
    seq: i64,
    payload: Option<Value>,
    exclude_sid: &str,
    is_final: bool,
) {
    for sess in sessions.sessions_of(target) {
        if sess.sid == exclude_sid {
            continue;
        }
        sess.queue_out(ServerMsg::Info(Info {
            topic: topic.to_string(),
            from: from.to_string(),
            what: "call".to_string(),
            event: event.to_string(),
            seq,
            payload: payload.clone(),
        }));
    }
    debug!(
        target = %target.user_id(),
        event = %event,
        seq,
        is_final,
        "call event fan-out"
    );
}
