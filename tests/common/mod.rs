//! Integration test common infrastructure.
//!
//! Builds a full runtime (in-memory store, registries, hub, cache) and
//! session fixtures, and provides helpers for asserting on the message flow.

use parleyd::auth::AuthLevel;
use parleyd::config::Config;
use parleyd::messages::{Ctrl, ServerMsg};
use parleyd::state::access::AccessMode;
use parleyd::state::session::Session;
use parleyd::state::switchboard::Switchboard;
use parleyd::state::uid::Uid;
use parleyd::store::types::{time_now, Subscription, TopicRecord};
use parleyd::store::{Database, UserPersistence};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

/// A runtime over an in-memory database, plus the concrete database handle
/// for direct assertions.
pub struct TestServer {
    pub sb: Arc<Switchboard>,
    pub db: Arc<Database>,
}

impl TestServer {
    /// Spawn a runtime whose `email` validator is required for `auth`
    /// accounts.
    #[allow(dead_code)]
    pub async fn spawn() -> TestServer {
        Self::spawn_with_required(&["email"]).await
    }

    /// Spawn a runtime requiring the given validated methods for `auth`
    /// accounts. Both validators accept the debug response `123456`.
    pub async fn spawn_with_required(required: &[&str]) -> TestServer {
        let email_required = required.contains(&"email");
        let tel_required = required.contains(&"tel");
        let raw = format!(
            r#"
            [server]
            name = "test.parley"

            [auth.token]
            key = "0123456789abcdef0123456789abcdef"

            [validator.email]
            required = {email}
            add_to_tags = true
            debug_response = "123456"

            [validator.tel]
            required = {tel}
            add_to_tags = true
            debug_response = "123456"

            [tags]
            restricted = ["basic", "email", "tel"]
            "#,
            email = if email_required { r#"["auth"]"# } else { "[]" },
            tel = if tel_required { r#"["auth"]"# } else { "[]" },
        );
        let config: Config = toml::from_str(&raw).expect("test config");
        let db = Arc::new(Database::open(":memory:").await.expect("in-memory database"));
        let sb = Switchboard::new(config, db.clone()).expect("switchboard");
        TestServer { sb, db }
    }

    /// A connected, unauthenticated session registered with the store.
    pub fn session(&self) -> TestClient {
        let (sess, out_rx, stop_rx) = Session::new("en");
        self.sb.sessions.add(sess.clone());
        TestClient {
            sess,
            out_rx,
            stop_rx,
        }
    }

    /// A session already authenticated as the given user.
    #[allow(dead_code)]
    pub fn session_as(&self, uid: Uid, lvl: AuthLevel) -> TestClient {
        let client = self.session();
        client.sess.set_identity(uid, lvl);
        client
    }

    /// Insert a user row directly, bypassing the account handlers.
    #[allow(dead_code)]
    pub async fn seed_user(&self, uid: Uid) {
        let mut user = parleyd::store::types::User::new(uid);
        user.access.auth = AccessMode::C_P2P;
        self.db.create_user(&user, None).await.expect("seed user");
    }

    /// Insert a p2p topic between the two users with full p2p access on
    /// both sides. Returns the topic name.
    #[allow(dead_code)]
    pub async fn seed_p2p(&self, a: Uid, b: Uid) -> String {
        let name = a.p2p_name(b).expect("p2p name");
        let now = time_now();
        self.db
            .create_topic(&TopicRecord {
                name: name.clone(),
                created_at: now,
                updated_at: now,
                owner: Uid::ZERO,
                seq_id: 0,
                access: Default::default(),
                public: None,
                tags: Vec::new(),
            })
            .await
            .expect("seed topic");
        for uid in [a, b] {
            self.db
                .add_subscription(&Subscription {
                    user_id: uid,
                    topic: name.clone(),
                    created_at: now,
                    mode_want: AccessMode::C_P2P,
                    mode_given: AccessMode::C_P2P,
                    private: None,
                    read_seq_id: 0,
                    recv_seq_id: 0,
                })
                .await
                .expect("seed subscription");
        }
        name
    }
}

/// A session under test with its transport-side receivers.
pub struct TestClient {
    pub sess: Arc<Session>,
    pub out_rx: mpsc::Receiver<ServerMsg>,
    pub stop_rx: mpsc::Receiver<Option<ServerMsg>>,
}

impl TestClient {
    /// Next outbound message, within a generous deadline.
    pub async fn recv(&mut self) -> ServerMsg {
        timeout(Duration::from_secs(5), self.out_rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("session channel closed")
    }

    /// Skip messages until one satisfies the predicate.
    pub async fn recv_until<F>(&mut self, mut pred: F) -> ServerMsg
    where
        F: FnMut(&ServerMsg) -> bool,
    {
        loop {
            let msg = self.recv().await;
            if pred(&msg) {
                return msg;
            }
        }
    }

    /// Next ctrl reply, skipping data/info/pres traffic.
    pub async fn recv_ctrl(&mut self) -> Ctrl {
        let msg = self.recv_until(|m| matches!(m, ServerMsg::Ctrl(_))).await;
        match msg {
            ServerMsg::Ctrl(ctrl) => ctrl,
            _ => unreachable!(),
        }
    }

    /// True when nothing is queued right now.
    #[allow(dead_code)]
    pub fn idle(&mut self) -> bool {
        self.out_rx.try_recv().is_err()
    }
}
