//! Topic registry and lifecycle.
//!
//! The hub owns the map of running topic actors and processes unregister
//! requests on a dedicated loop. Account deletion sends a synchronous
//! `TopicUnreg` carrying a completion channel: the only blocking rendezvous
//! in the system, acceptable because the requester is itself waiting for the
//! reply.

use crate::error::StoreError;
use crate::state::cache::UserCache;
use crate::state::session::SessionStore;
use crate::state::topic::{TopicActor, TopicEvent};
use crate::state::uid::{parse_p2p, TopicCat, Uid};
use crate::store::UserPersistence;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Unregister request processed by the hub loop.
pub struct TopicUnreg {
    /// Stop all topics the user participates in (p2p) or owns (group).
    pub for_user: Option<Uid>,
    /// Stop a single topic.
    pub topic: Option<String>,
    /// Also delete the stopped topics from storage.
    pub del: bool,
    /// Signalled when the request has been fully processed.
    pub done: Option<oneshot::Sender<()>>,
}

pub struct Hub {
    topics: DashMap<String, mpsc::Sender<TopicEvent>>,
    unreg_tx: mpsc::Sender<TopicUnreg>,
    store: Arc<dyn UserPersistence>,
    sessions: Arc<SessionStore>,
    cache: UserCache,
}

impl Hub {
    pub fn spawn(
        store: Arc<dyn UserPersistence>,
        sessions: Arc<SessionStore>,
        cache: UserCache,
    ) -> (Arc<Hub>, JoinHandle<()>) {
        let (unreg_tx, unreg_rx) = mpsc::channel(64);
        let hub = Arc::new(Hub {
            topics: DashMap::new(),
            unreg_tx,
            store,
            sessions,
            cache,
        });
        let handle = tokio::spawn(Arc::clone(&hub).run(unreg_rx));
        (hub, handle)
    }

    async fn run(self: Arc<Hub>, mut unreg_rx: mpsc::Receiver<TopicUnreg>) {
        while let Some(unreg) = unreg_rx.recv().await {
            if let Some(uid) = unreg.for_user {
                self.unreg_for_user(uid, unreg.del).await;
            } else if let Some(name) = &unreg.topic {
                self.stop_topic(name, unreg.del).await;
            }
            if let Some(done) = unreg.done {
                let _ = done.send(());
            }
        }
        info!("hub: shutdown");
    }

    /// Running topic by name.
    pub fn get(&self, name: &str) -> Option<mpsc::Sender<TopicEvent>> {
        self.topics.get(name).map(|t| t.clone())
    }

    /// Running topic by name, loading it from storage when necessary.
    pub async fn get_or_spawn(&self, name: &str) -> Result<mpsc::Sender<TopicEvent>, StoreError> {
        if let Some(tx) = self.get(name) {
            return Ok(tx);
        }
        let record = self.store.get_topic(name).await?.ok_or(StoreError::NotFound)?;
        let subs = self.store.get_topic_subs(name).await?;
        let tx = TopicActor::spawn(
            record,
            subs,
            Arc::clone(&self.store),
            Arc::clone(&self.sessions),
            self.cache.clone(),
        );
        self.topics.insert(name.to_string(), tx.clone());
        Ok(tx)
    }

    /// Stop every topic the user participates in or owns, waiting for each
    /// actor to wind down. Called from the hub loop.
    async fn unreg_for_user(&self, uid: Uid, del: bool) {
        let mut names: Vec<String> = self
            .topics
            .iter()
            .filter(|entry| match TopicCat::from_name(entry.key()) {
                Ok(TopicCat::P2P) => parse_p2p(entry.key())
                    .map(|(a, b)| a == uid || b == uid)
                    .unwrap_or(false),
                _ => false,
            })
            .map(|entry| entry.key().clone())
            .collect();

        match self.store.get_own_topics(uid).await {
            Ok(owned) => names.extend(owned),
            Err(e) => warn!(user = %uid.user_id(), error = %e, "failed to list owned topics"),
        }
        names.sort();
        names.dedup();

        for name in names {
            self.stop_topic(&name, del).await;
        }
    }

    async fn stop_topic(&self, name: &str, del: bool) {
        if let Some((_, tx)) = self.topics.remove(name) {
            let (done_tx, done_rx) = oneshot::channel();
            if tx
                .send(TopicEvent::Shutdown {
                    done: Some(done_tx),
                })
                .await
                .is_ok()
            {
                let _ = done_rx.await;
            }
        }
        if del {
            if let Err(e) = self.store.delete_topic(name, true).await {
                warn!(topic = %name, error = %e, "failed to delete topic");
            }
        }
    }

    /// Synchronous unregister used by the account-deletion flow: stops the
    /// user's topics and returns once they are gone.
    pub async fn unreg_user_sync(&self, uid: Uid, del: bool) {
        let (done_tx, done_rx) = oneshot::channel();
        let sent = self
            .unreg_tx
            .send(TopicUnreg {
                for_user: Some(uid),
                topic: None,
                del,
                done: Some(done_tx),
            })
            .await
            .is_ok();
        if sent {
            let _ = done_rx.await;
        }
    }

    /// Stop all topics, for process shutdown.
    pub async fn shutdown(&self) {
        let names: Vec<String> = self.topics.iter().map(|e| e.key().clone()).collect();
        for name in names {
            self.stop_topic(&name, false).await;
        }
    }
}
