//! Session abstraction and the session store.
//!
//! A session represents one client connection as the coordination layer sees
//! it: an authenticated identity, a bounded outbound queue, and a terminal
//! stop channel that carries an optional farewell message. The transport
//! layer owns the socket; it drains the outbound queue and honors the stop
//! signal.

use crate::auth::AuthLevel;
use crate::messages::ServerMsg;
use crate::metrics;
use crate::state::uid::Uid;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;
use uuid::Uuid;

/// Outbound queue depth. Overflow drops with a logged warning; the transport
/// is expected to drain faster than the core produces.
const SEND_QUEUE_CAPACITY: usize = 128;
/// The stop channel holds at most the farewell.
const STOP_CAPACITY: usize = 1;

#[derive(Debug, Clone, Copy)]
struct SessionIdentity {
    uid: Uid,
    auth_lvl: AuthLevel,
}

/// One client connection.
pub struct Session {
    /// Opaque session id, used to scope notifications and exclude the
    /// initiator from broadcasts.
    pub sid: String,
    /// Language of the client, for validator messages.
    pub lang: String,
    identity: RwLock<SessionIdentity>,
    out_tx: mpsc::Sender<ServerMsg>,
    stop_tx: mpsc::Sender<Option<ServerMsg>>,
}

impl Session {
    /// Create a session. The returned receivers belong to the transport:
    /// one drains outbound messages, the other waits for the stop signal.
    pub fn new(
        lang: &str,
    ) -> (
        Arc<Session>,
        mpsc::Receiver<ServerMsg>,
        mpsc::Receiver<Option<ServerMsg>>,
    ) {
        let (out_tx, out_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let (stop_tx, stop_rx) = mpsc::channel(STOP_CAPACITY);
        let session = Arc::new(Session {
            sid: Uuid::new_v4().simple().to_string(),
            lang: lang.to_string(),
            identity: RwLock::new(SessionIdentity {
                uid: Uid::ZERO,
                auth_lvl: AuthLevel::None,
            }),
            out_tx,
            stop_tx,
        });
        (session, out_rx, stop_rx)
    }

    pub fn uid(&self) -> Uid {
        self.identity.read().expect("identity lock poisoned").uid
    }

    pub fn auth_lvl(&self) -> AuthLevel {
        self.identity.read().expect("identity lock poisoned").auth_lvl
    }

    pub fn is_authenticated(&self) -> bool {
        !self.uid().is_zero()
    }

    /// Assign the authenticated identity after a successful login.
    pub fn set_identity(&self, uid: Uid, auth_lvl: AuthLevel) {
        let mut identity = self.identity.write().expect("identity lock poisoned");
        identity.uid = uid;
        identity.auth_lvl = auth_lvl;
    }

    /// Non-blocking enqueue of an outbound message. Overflow drops the
    /// message; per-session ordering of queued messages is preserved.
    pub fn queue_out(&self, msg: ServerMsg) {
        match self.out_tx.try_send(msg) {
            Ok(()) => {
                metrics::MESSAGES_SENT.inc();
            }
            Err(TrySendError::Full(_)) => {
                metrics::OUTBOUND_DROPPED.inc();
                warn!(sid = %self.sid, "outbound queue full, dropping message");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Signal the session to terminate, delivering the farewell first if one
    /// is given. The transport drains the outbound queue, sends the farewell
    /// and closes the connection.
    pub fn stop(&self, farewell: Option<ServerMsg>) {
        let _ = self.stop_tx.try_send(farewell);
    }
}

/// All live sessions keyed by session id.
pub struct SessionStore {
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionStore {
    pub fn new() -> SessionStore {
        SessionStore {
            sessions: DashMap::new(),
        }
    }

    pub fn add(&self, session: Arc<Session>) {
        self.sessions.insert(session.sid.clone(), session);
        metrics::SESSIONS_ONLINE.set(self.sessions.len() as i64);
    }

    pub fn remove(&self, sid: &str) {
        self.sessions.remove(sid);
        metrics::SESSIONS_ONLINE.set(self.sessions.len() as i64);
    }

    pub fn get(&self, sid: &str) -> Option<Arc<Session>> {
        self.sessions.get(sid).map(|s| s.clone())
    }

    /// Sessions authenticated as the given user.
    pub fn sessions_of(&self, uid: Uid) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().uid() == uid)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Evict all sessions of a user except `skip_sid`, delivering the
    /// farewell on each evicted session's stop channel.
    pub fn evict_user(&self, uid: Uid, skip_sid: &str, farewell: ServerMsg) {
        for session in self.sessions_of(uid) {
            if session.sid == skip_sid {
                continue;
            }
            session.stop(Some(farewell.clone()));
            self.sessions.remove(&session.sid);
        }
        metrics::SESSIONS_ONLINE.set(self.sessions.len() as i64);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}
