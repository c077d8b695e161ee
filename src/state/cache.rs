//! Single-writer user cache.
//!
//! One task owns the map of per-user unread and topic-membership counts; all
//! mutations arrive as messages on its update channel. The enqueue path is
//! non-blocking and drops on overflow — the cache is advisory — with the
//! exception of shutdown, which is awaited.
//!
//! An unread count of -1 means "not loaded"; the first update against such an
//! entry loads the real count from storage before applying.

use crate::metrics;
use crate::push::{Pusher, PushReceipt};
use crate::state::uid::Uid;
use crate::store::UserPersistence;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Buffered updates before the enqueue path starts dropping.
const UPDATE_QUEUE_CAPACITY: usize = 1024;

/// Cache state of one user. The entry exists iff the user participates in at
/// least one running topic, except transiently during push processing.
#[derive(Debug, Clone, Copy)]
struct UserCacheEntry {
    /// Unread message count, -1 when not yet loaded.
    unread: i64,
    /// Number of running topics the user participates in.
    topics: u32,
}

/// An update to the cache.
pub enum CacheUpdate {
    /// Set the unread count to an absolute value.
    UnreadAbs { uid: Uid, value: i64 },
    /// Add to the unread count.
    UnreadDelta { uid: Uid, delta: i64 },
    /// Users joined (`add`) or left a running topic.
    TopicMembership { uids: Vec<Uid>, add: bool },
    /// Enrich the receipt with unread counts and forward it to the push
    /// backend.
    Push(Box<PushReceipt>),
    /// Terminate the update loop.
    Shutdown,
}

/// Handle for enqueueing cache updates.
#[derive(Clone)]
pub struct UserCache {
    tx: mpsc::Sender<CacheUpdate>,
}

impl UserCache {
    /// Spawn the updater task.
    pub fn spawn(
        store: Arc<dyn UserPersistence>,
        pusher: Arc<dyn Pusher>,
    ) -> (UserCache, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(UPDATE_QUEUE_CAPACITY);
        let updater = Updater {
            store,
            pusher,
            cache: HashMap::new(),
        };
        let handle = tokio::spawn(updater.run(rx));
        (UserCache { tx }, handle)
    }

    fn enqueue(&self, update: CacheUpdate) {
        if self.tx.try_send(update).is_err() {
            metrics::CACHE_UPDATES_DROPPED.inc();
        }
    }

    /// Update the unread count. A zero delta is a no-op.
    pub fn update_unread(&self, uid: Uid, value: i64, inc: bool) {
        if inc {
            if value != 0 {
                self.enqueue(CacheUpdate::UnreadDelta { uid, delta: value });
            }
        } else {
            self.enqueue(CacheUpdate::UnreadAbs { uid, value });
        }
    }

    /// Account users as members of a running topic.
    pub fn register_topic_users(&self, uids: Vec<Uid>, add: bool) {
        if uids.is_empty() {
            return;
        }
        self.enqueue(CacheUpdate::TopicMembership { uids, add });
    }

    /// Queue a push receipt for unread enrichment and delivery.
    pub fn push(&self, rcpt: PushReceipt) {
        self.enqueue(CacheUpdate::Push(Box::new(rcpt)));
    }

    /// Stop the updater. Awaited, unlike the regular enqueue path.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(CacheUpdate::Shutdown).await;
    }
}

struct Updater {
    store: Arc<dyn UserPersistence>,
    pusher: Arc<dyn Pusher>,
    cache: HashMap<Uid, UserCacheEntry>,
}

impl Updater {
    async fn run(mut self, mut rx: mpsc::Receiver<CacheUpdate>) {
        while let Some(update) = rx.recv().await {
            match update {
                CacheUpdate::UnreadAbs { uid, value } => {
                    self.apply_unread(uid, value, false).await;
                }
                CacheUpdate::UnreadDelta { uid, delta } => {
                    self.apply_unread(uid, delta, true).await;
                }
                CacheUpdate::TopicMembership { uids, add } => {
                    self.apply_membership(&uids, add);
                }
                CacheUpdate::Push(mut rcpt) => {
                    for (uid, recipient) in rcpt.to.iter_mut() {
                        let unread = self.apply_unread(*uid, 1, true).await;
                        if unread >= 0 {
                            recipient.unread = unread;
                        }
                    }
                    self.pusher.push(&rcpt).await;
                }
                CacheUpdate::Shutdown => break,
            }
        }
        info!("user cache: shutdown");
    }

    /// Apply an unread update, lazily loading the stored count the first
    /// time. Returns the resulting count, or -1 when the load failed.
    async fn apply_unread(&mut self, uid: Uid, value: i64, inc: bool) -> i64 {
        let entry = match self.cache.get_mut(&uid) {
            Some(entry) => entry,
            // Receiving an unread update for a user that no running topic
            // registered is a programming error.
            None => panic!("unread update for user not in cache: {}", uid.user_id()),
        };

        if entry.unread < 0 {
            match self.store.get_unread_count(uid).await {
                Ok(count) => entry.unread = count,
                Err(e) => {
                    error!(user = %uid.user_id(), error = %e, "failed to load unread count");
                    return -1;
                }
            }
        } else if inc {
            entry.unread += value;
        } else {
            entry.unread = value;
        }
        entry.unread
    }

    fn apply_membership(&mut self, uids: &[Uid], add: bool) {
        for &uid in uids {
            if add {
                let entry = self.cache.entry(uid).or_insert(UserCacheEntry {
                    unread: -1,
                    topics: 0,
                });
                entry.topics += 1;
            } else {
                match self.cache.get_mut(&uid) {
                    Some(entry) if entry.topics > 1 => entry.topics -= 1,
                    Some(_) => {
                        self.cache.remove(&uid);
                    }
                    // Unregistering a user that was never registered is a
                    // programming error.
                    None => panic!(
                        "topic unregister for user not in cache: {}",
                        uid.user_id()
                    ),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push::PushPayload;
    use crate::state::access::{AccessMode, DefaultAccess};
    use crate::store::types::{time_now, Subscription, TopicRecord, User};
    use crate::store::Database;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::time::{sleep, Duration};

    async fn store_with_unread(uid: Uid, unread: i64) -> Arc<Database> {
        let db = Arc::new(Database::open(":memory:").await.expect("db"));
        db.create_user(&User::new(uid), None).await.unwrap();
        let now = time_now();
        db.create_topic(&TopicRecord {
            name: "grpAAAAAAAAB".into(),
            created_at: now,
            updated_at: now,
            owner: uid,
            seq_id: unread,
            access: DefaultAccess::default(),
            public: None,
            tags: Vec::new(),
        })
        .await
        .unwrap();
        db.add_subscription(&Subscription {
            user_id: uid,
            topic: "grpAAAAAAAAB".into(),
            created_at: now,
            mode_want: AccessMode::C_PUBLIC,
            mode_given: AccessMode::C_PUBLIC,
            private: None,
            read_seq_id: 0,
            recv_seq_id: 0,
        })
        .await
        .unwrap();
        db
    }

    struct CapturePusher {
        seen: Mutex<Vec<PushReceipt>>,
    }

    #[async_trait::async_trait]
    impl Pusher for CapturePusher {
        async fn push(&self, rcpt: &PushReceipt) {
            self.seen.lock().unwrap().push(rcpt.clone());
        }
    }

    #[tokio::test]
    async fn membership_refcount_and_lazy_unread() {
        let uid = Uid::new(21);
        let db = store_with_unread(uid, 5).await;
        let pusher = Arc::new(CapturePusher { seen: Mutex::new(Vec::new()) });
        let (cache, handle) = UserCache::spawn(db, pusher.clone());

        cache.register_topic_users(vec![uid], true);
        cache.register_topic_users(vec![uid], true);

        // First unread touch loads from storage (5), enrichment adds one.
        let mut rcpt = PushReceipt::new(PushPayload {
            topic: "grpAAAAAAAAB".into(),
            from: uid.user_id(),
            seq: 6,
            ts: time_now(),
            content: json!("hello"),
        });
        rcpt.add_recipient(uid, 0);
        cache.push(rcpt);

        sleep(Duration::from_millis(50)).await;
        {
            let seen = pusher.seen.lock().unwrap();
            assert_eq!(seen.len(), 1);
            // The lazy load absorbs the first delta: the stored count wins.
            assert_eq!(seen[0].to[&uid].unread, 5);
        }

        // The second delta increments the now-loaded count.
        let mut rcpt = PushReceipt::new(PushPayload {
            topic: "grpAAAAAAAAB".into(),
            from: uid.user_id(),
            seq: 7,
            ts: time_now(),
            content: json!("again"),
        });
        rcpt.add_recipient(uid, 0);
        cache.push(rcpt);

        sleep(Duration::from_millis(50)).await;
        {
            let seen = pusher.seen.lock().unwrap();
            assert_eq!(seen[1].to[&uid].unread, 6);
        }

        // Two registrations, two deregistrations; entry survives the first.
        cache.register_topic_users(vec![uid], false);
        cache.register_topic_users(vec![uid], false);

        cache.shutdown().await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn absolute_update_overrides() {
        let uid = Uid::new(22);
        let db = store_with_unread(uid, 3).await;
        let pusher = Arc::new(CapturePusher { seen: Mutex::new(Vec::new()) });
        let (cache, handle) = UserCache::spawn(db, pusher.clone());

        cache.register_topic_users(vec![uid], true);
        // Loads 3 from storage.
        cache.update_unread(uid, 1, true);
        // Absolute set.
        cache.update_unread(uid, 10, false);

        let mut rcpt = PushReceipt::new(PushPayload {
            topic: "grpAAAAAAAAB".into(),
            from: uid.user_id(),
            seq: 4,
            ts: time_now(),
            content: json!("x"),
        });
        rcpt.add_recipient(uid, 0);
        cache.push(rcpt);

        sleep(Duration::from_millis(50)).await;
        assert_eq!(pusher.seen.lock().unwrap()[0].to[&uid].unread, 11);

        cache.shutdown().await;
        handle.await.unwrap();
    }
}
