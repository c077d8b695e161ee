//! SQLite adapter for the persistence contract.
//!
//! Backed by an async SQLx pool. Timestamps are stored as UTC milliseconds,
//! access modes in their textual form, opaque blobs and tag lists as JSON.

use super::types::{
    time_now, Credential, StoredAuthRecord, StoredMessage, Subscription, TopicRecord, User,
    UserState,
};
use super::UserPersistence;
use crate::auth::AuthLevel;
use crate::error::StoreError;
use crate::state::access::{AccessMode, DefaultAccess};
use crate::state::uid::Uid;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Database handle with connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connection acquire timeout - prevents connection storms from blocking
    /// indefinitely.
    const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

    /// Maximum time a connection can remain idle before being closed.
    const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Open the database, running migrations if needed. `":memory:"` opens a
    /// private in-memory database suitable for tests.
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let options = if path == ":memory:" {
            // Each open gets its own namespace; the pool's connections share
            // it, other opens in the same process do not.
            use std::sync::atomic::{AtomicU64, Ordering};
            static MEM_DB_SEQ: AtomicU64 = AtomicU64::new(0);
            let name = format!(
                "sqlite:file:parleymem{}?mode=memory&cache=shared",
                MEM_DB_SEQ.fetch_add(1, Ordering::Relaxed)
            );
            name.parse::<SqliteConnectOptions>()
                .map_err(|e| StoreError::Internal(e.to_string()))?
                .shared_cache(true)
                .create_if_missing(true)
        } else {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    if let Err(e) = std::fs::create_dir_all(parent) {
                        tracing::warn!(path = %parent.display(), error = %e, "failed to create database directory");
                    }
                }
            }
            SqliteConnectOptions::new().filename(path).create_if_missing(true)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            // An in-memory database lives only as long as one connection
            // holds it open.
            .min_connections(1)
            .acquire_timeout(Self::ACQUIRE_TIMEOUT)
            .idle_timeout(Some(Self::IDLE_TIMEOUT))
            .test_before_acquire(true)
            .connect_with(options)
            .await?;

        info!(path = %path, "database connected");

        Self::run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn run_migrations(pool: &SqlitePool) -> Result<(), StoreError> {
        let already = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='users')",
        )
        .fetch_one(pool)
        .await
        .unwrap_or(false);

        Self::run_migration_file(pool, include_str!("../../migrations/001_init.sql")).await;

        if already {
            info!("database already initialized");
        } else {
            info!("database migrations applied (001_init)");
        }
        Ok(())
    }

    /// Run a single migration file, executing each statement.
    async fn run_migration_file(pool: &SqlitePool, migration: &str) {
        for statement in migration.split(';') {
            let sql: Vec<&str> = statement
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with("--"))
                .collect();
            if sql.is_empty() {
                continue;
            }
            let sql = sql.join("\n");
            if let Err(e) = sqlx::query(&sql).execute(pool).await {
                let err = e.to_string();
                if !err.contains("already exists") {
                    tracing::warn!(sql = %sql, error = %err, "migration statement failed");
                }
            }
        }
    }
}

fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn uid_to_db(uid: Uid) -> i64 {
    uid.value() as i64
}

fn uid_from_db(v: i64) -> Uid {
    Uid::new(v as u64)
}

fn mode_from_db(s: &str) -> AccessMode {
    AccessMode::parse(s).unwrap_or(AccessMode::NONE)
}

fn json_to_db(v: Option<&Value>) -> Option<String> {
    v.map(|v| v.to_string())
}

fn json_from_db(s: Option<String>) -> Option<Value> {
    s.and_then(|s| serde_json::from_str(&s).ok())
}

fn tags_to_db(tags: &[String]) -> String {
    serde_json::to_string(tags).unwrap_or_else(|_| "[]".to_string())
}

fn tags_from_db(s: &str) -> Vec<String> {
    serde_json::from_str(s).unwrap_or_default()
}

type UserRow = (
    i64,            // id
    i64,            // created_at
    i64,            // updated_at
    Option<i64>,    // deleted_at
    i64,            // state
    String,         // access_auth
    String,         // access_anon
    Option<String>, // public
    String,         // tags
    String,         // devices
);

fn user_from_row(row: UserRow) -> User {
    let (id, created, updated, deleted, state, auth, anon, public, tags, devices) = row;
    User {
        id: uid_from_db(id),
        created_at: from_millis(created),
        updated_at: from_millis(updated),
        deleted_at: deleted.map(from_millis),
        state: UserState::from_i64(state),
        access: DefaultAccess {
            auth: mode_from_db(&auth),
            anon: mode_from_db(&anon),
        },
        public: json_from_db(public),
        tags: tags_from_db(&tags),
        devices: serde_json::from_str(&devices).unwrap_or_default(),
    }
}

const USER_COLUMNS: &str =
    "id, created_at, updated_at, deleted_at, state, access_auth, access_anon, public, tags, devices";

type CredRow = (i64, String, String, String, i64, i64, i64, i64);

fn cred_from_row(row: CredRow) -> Credential {
    let (user_id, method, value, response, done, retries, created, updated) = row;
    Credential {
        user_id: uid_from_db(user_id),
        method,
        value,
        response,
        done: done != 0,
        retries,
        created_at: from_millis(created),
        updated_at: from_millis(updated),
    }
}

const CRED_COLUMNS: &str = "user_id, method, value, response, done, retries, created_at, updated_at";

type SubRow = (i64, String, i64, String, String, Option<String>, i64, i64);

fn sub_from_row(row: SubRow) -> Subscription {
    let (user_id, topic, created, want, given, private, read_seq, recv_seq) = row;
    Subscription {
        user_id: uid_from_db(user_id),
        topic,
        created_at: from_millis(created),
        mode_want: mode_from_db(&want),
        mode_given: mode_from_db(&given),
        private: json_from_db(private),
        read_seq_id: read_seq,
        recv_seq_id: recv_seq,
    }
}

const SUB_COLUMNS: &str =
    "user_id, topic, created_at, mode_want, mode_given, private, read_seq_id, recv_seq_id";

#[async_trait]
impl UserPersistence for Database {
    async fn create_user(&self, user: &User, private: Option<&Value>) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO users (id, created_at, updated_at, state, access_auth, access_anon, public, tags, devices)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(uid_to_db(user.id))
        .bind(to_millis(user.created_at))
        .bind(to_millis(user.updated_at))
        .bind(user.state.as_i64())
        .bind(user.access.auth.to_string())
        .bind(user.access.anon.to_string())
        .bind(json_to_db(user.public.as_ref()))
        .bind(tags_to_db(&user.tags))
        .bind(serde_json::to_string(&user.devices).unwrap_or_else(|_| "{}".into()))
        .execute(&mut *tx)
        .await?;

        // The user's own 'me' subscription carries the private blob.
        sqlx::query(
            "INSERT INTO subscriptions (user_id, topic, created_at, mode_want, mode_given, private)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(uid_to_db(user.id))
        .bind(user.id.user_id())
        .bind(to_millis(user.created_at))
        .bind(AccessMode::C_READONLY.to_string())
        .bind(AccessMode::C_READONLY.to_string())
        .bind(json_to_db(private))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_user(&self, uid: Uid) -> Result<Option<User>, StoreError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = ? AND deleted_at IS NULL"
        ))
        .bind(uid_to_db(uid))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(user_from_row))
    }

    async fn get_users(&self, uids: &[Uid]) -> Result<Vec<User>, StoreError> {
        let mut out = Vec::with_capacity(uids.len());
        for &uid in uids {
            if let Some(user) = self.get_user(uid).await? {
                out.push(user);
            }
        }
        Ok(out)
    }

    async fn get_disabled_users(&self, before: DateTime<Utc>) -> Result<Vec<Uid>, StoreError> {
        let rows = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM users WHERE deleted_at IS NOT NULL AND deleted_at < ?",
        )
        .bind(to_millis(before))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(uid_from_db).collect())
    }

    async fn get_user_by_cred(&self, method: &str, value: &str) -> Result<Option<Uid>, StoreError> {
        let row = sqlx::query_scalar::<_, i64>(
            "SELECT user_id FROM credentials WHERE method = ? AND value = ? AND done = 1",
        )
        .bind(method)
        .bind(value)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(uid_from_db))
    }

    async fn delete_user(&self, uid: Uid, hard: bool) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let id = uid_to_db(uid);
        if hard {
            sqlx::query("DELETE FROM messages WHERE topic IN (SELECT name FROM topics WHERE owner = ?)")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                "DELETE FROM subscriptions WHERE topic IN (SELECT name FROM topics WHERE owner = ?)",
            )
            .bind(id)
            .execute(&mut *tx)
            .await?;
            sqlx::query("DELETE FROM topics WHERE owner = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM subscriptions WHERE user_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM credentials WHERE user_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM users WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        } else {
            let now = to_millis(time_now());
            sqlx::query("UPDATE users SET deleted_at = ?, updated_at = ?, state = ? WHERE id = ?")
                .bind(now)
                .bind(now)
                .bind(UserState::Deleted.as_i64())
                .bind(id)
                .execute(&mut *tx)
                .await?;
            // Validated credentials stop counting toward uniqueness.
            sqlx::query("UPDATE credentials SET done = 0 WHERE user_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn update_tags(
        &self,
        uid: Uid,
        add: &[String],
        remove: &[String],
        reset: Option<&[String]>,
    ) -> Result<Vec<String>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let current = sqlx::query_scalar::<_, String>("SELECT tags FROM users WHERE id = ?")
            .bind(uid_to_db(uid))
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound)?;

        let mut tags = match reset {
            Some(reset) => reset.to_vec(),
            None => tags_from_db(&current),
        };
        for t in add {
            if !tags.contains(t) {
                tags.push(t.clone());
            }
        }
        tags.retain(|t| !remove.contains(t));

        sqlx::query("UPDATE users SET tags = ?, updated_at = ? WHERE id = ?")
            .bind(tags_to_db(&tags))
            .bind(to_millis(time_now()))
            .bind(uid_to_db(uid))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(tags)
    }

    async fn get_subs(&self, uid: Uid) -> Result<Vec<Subscription>, StoreError> {
        let rows = sqlx::query_as::<_, SubRow>(&format!(
            "SELECT {SUB_COLUMNS} FROM subscriptions WHERE user_id = ?"
        ))
        .bind(uid_to_db(uid))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(sub_from_row).collect())
    }

    async fn get_own_topics(&self, uid: Uid) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query_scalar::<_, String>(
            "SELECT name FROM topics WHERE owner = ? AND deleted_at IS NULL",
        )
        .bind(uid_to_db(uid))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn get_unread_count(&self, uid: Uid) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(SUM(t.seq_id - s.read_seq_id), 0)
             FROM subscriptions s JOIN topics t ON t.name = s.topic
             WHERE s.user_id = ? AND t.deleted_at IS NULL",
        )
        .bind(uid_to_db(uid))
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0))
    }

    async fn upsert_cred(&self, cred: &Credential) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let taken = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM credentials WHERE method = ? AND value = ? AND done = 1",
        )
        .bind(&cred.method)
        .bind(&cred.value)
        .fetch_one(&mut *tx)
        .await?;
        if taken > 0 {
            return Err(StoreError::Duplicate);
        }

        let now = to_millis(time_now());
        let updated = sqlx::query(
            "UPDATE credentials SET response = ?, retries = 0, updated_at = ?
             WHERE user_id = ? AND method = ? AND value = ? AND done = 0",
        )
        .bind(&cred.response)
        .bind(now)
        .bind(uid_to_db(cred.user_id))
        .bind(&cred.method)
        .bind(&cred.value)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let inserted = if updated == 0 {
            sqlx::query(
                "INSERT INTO credentials (user_id, method, value, response, done, retries, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, 0, ?, ?)",
            )
            .bind(uid_to_db(cred.user_id))
            .bind(&cred.method)
            .bind(&cred.value)
            .bind(&cred.response)
            .bind(cred.done as i64)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            true
        } else {
            false
        };

        tx.commit().await?;
        Ok(inserted)
    }

    async fn get_all_creds(
        &self,
        uid: Uid,
        validated_only: bool,
    ) -> Result<Vec<Credential>, StoreError> {
        let sql = if validated_only {
            format!("SELECT {CRED_COLUMNS} FROM credentials WHERE user_id = ? AND done = 1")
        } else {
            format!("SELECT {CRED_COLUMNS} FROM credentials WHERE user_id = ?")
        };
        let rows = sqlx::query_as::<_, CredRow>(&sql)
            .bind(uid_to_db(uid))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(cred_from_row).collect())
    }

    async fn get_active_cred(
        &self,
        uid: Uid,
        method: &str,
    ) -> Result<Option<Credential>, StoreError> {
        let row = sqlx::query_as::<_, CredRow>(&format!(
            "SELECT {CRED_COLUMNS} FROM credentials
             WHERE user_id = ? AND method = ? AND done = 0
             ORDER BY updated_at DESC LIMIT 1"
        ))
        .bind(uid_to_db(uid))
        .bind(method)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(cred_from_row))
    }

    async fn confirm_cred(&self, uid: Uid, method: &str) -> Result<(), StoreError> {
        let affected = sqlx::query(
            "UPDATE credentials SET done = 1, updated_at = ?
             WHERE user_id = ? AND method = ? AND done = 0",
        )
        .bind(to_millis(time_now()))
        .bind(uid_to_db(uid))
        .bind(method)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn fail_cred(&self, uid: Uid, method: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE credentials SET retries = retries + 1, updated_at = ?
             WHERE user_id = ? AND method = ? AND done = 0",
        )
        .bind(to_millis(time_now()))
        .bind(uid_to_db(uid))
        .bind(method)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn del_cred(&self, uid: Uid, method: &str, value: Option<&str>) -> Result<(), StoreError> {
        match value {
            Some(value) => {
                sqlx::query(
                    "DELETE FROM credentials WHERE user_id = ? AND method = ? AND value = ?",
                )
                .bind(uid_to_db(uid))
                .bind(method)
                .bind(value)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query("DELETE FROM credentials WHERE user_id = ? AND method = ?")
                    .bind(uid_to_db(uid))
                    .bind(method)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    async fn add_auth_record(&self, rec: &StoredAuthRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO auth_records (uid, scheme, unique_key, secret, auth_level, expires)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(uid_to_db(rec.uid))
        .bind(&rec.scheme)
        .bind(&rec.unique)
        .bind(&rec.secret)
        .bind(rec.auth_level.as_str())
        .bind(rec.expires.map(to_millis))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_auth_record(
        &self,
        scheme: &str,
        unique: &str,
    ) -> Result<Option<StoredAuthRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT uid, scheme, unique_key, secret, auth_level, expires
             FROM auth_records WHERE scheme = ? AND unique_key = ?",
        )
        .bind(scheme)
        .bind(unique)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| StoredAuthRecord {
            uid: uid_from_db(row.get::<i64, _>(0)),
            scheme: row.get(1),
            unique: row.get(2),
            secret: row.get(3),
            auth_level: AuthLevel::parse(&row.get::<String, _>(4)).unwrap_or(AuthLevel::None),
            expires: row.get::<Option<i64>, _>(5).map(from_millis),
        }))
    }

    async fn update_auth_record(&self, rec: &StoredAuthRecord) -> Result<(), StoreError> {
        let affected = sqlx::query(
            "UPDATE auth_records SET unique_key = ?, secret = ?, auth_level = ?, expires = ?
             WHERE uid = ? AND scheme = ?",
        )
        .bind(&rec.unique)
        .bind(&rec.secret)
        .bind(rec.auth_level.as_str())
        .bind(rec.expires.map(to_millis))
        .bind(uid_to_db(rec.uid))
        .bind(&rec.scheme)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn del_auth_records(&self, uid: Uid, scheme: Option<&str>) -> Result<(), StoreError> {
        match scheme {
            Some(scheme) => {
                sqlx::query("DELETE FROM auth_records WHERE uid = ? AND scheme = ?")
                    .bind(uid_to_db(uid))
                    .bind(scheme)
                    .execute(&self.pool)
                    .await?;
            }
            None => {
                sqlx::query("DELETE FROM auth_records WHERE uid = ?")
                    .bind(uid_to_db(uid))
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    async fn create_topic(&self, topic: &TopicRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO topics (name, created_at, updated_at, owner, seq_id, access_auth, access_anon, public, tags)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&topic.name)
        .bind(to_millis(topic.created_at))
        .bind(to_millis(topic.updated_at))
        .bind(uid_to_db(topic.owner))
        .bind(topic.seq_id)
        .bind(topic.access.auth.to_string())
        .bind(topic.access.anon.to_string())
        .bind(json_to_db(topic.public.as_ref()))
        .bind(tags_to_db(&topic.tags))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_topic(&self, name: &str) -> Result<Option<TopicRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT name, created_at, updated_at, owner, seq_id, access_auth, access_anon, public, tags
             FROM topics WHERE name = ? AND deleted_at IS NULL",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| TopicRecord {
            name: row.get(0),
            created_at: from_millis(row.get(1)),
            updated_at: from_millis(row.get(2)),
            owner: uid_from_db(row.get(3)),
            seq_id: row.get(4),
            access: DefaultAccess {
                auth: mode_from_db(&row.get::<String, _>(5)),
                anon: mode_from_db(&row.get::<String, _>(6)),
            },
            public: json_from_db(row.get(7)),
            tags: tags_from_db(&row.get::<String, _>(8)),
        }))
    }

    async fn add_subscription(&self, sub: &Subscription) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO subscriptions (user_id, topic, created_at, mode_want, mode_given, private, read_seq_id, recv_seq_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(uid_to_db(sub.user_id))
        .bind(&sub.topic)
        .bind(to_millis(sub.created_at))
        .bind(sub.mode_want.to_string())
        .bind(sub.mode_given.to_string())
        .bind(json_to_db(sub.private.as_ref()))
        .bind(sub.read_seq_id)
        .bind(sub.recv_seq_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_topic_subs(&self, topic: &str) -> Result<Vec<Subscription>, StoreError> {
        let rows = sqlx::query_as::<_, SubRow>(&format!(
            "SELECT {SUB_COLUMNS} FROM subscriptions WHERE topic = ?"
        ))
        .bind(topic)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(sub_from_row).collect())
    }

    async fn save_message(&self, msg: &StoredMessage) -> Result<(), StoreError> {
        let head = msg
            .head
            .as_ref()
            .map(|h| serde_json::to_string(h).unwrap_or_else(|_| "{}".into()));

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO messages (topic, seq_id, created_at, from_uid, head, content)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&msg.topic)
        .bind(msg.seq_id)
        .bind(to_millis(msg.created_at))
        .bind(uid_to_db(msg.from))
        .bind(head)
        .bind(msg.content.to_string())
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE topics SET seq_id = MAX(seq_id, ?), updated_at = ? WHERE name = ?")
            .bind(msg.seq_id)
            .bind(to_millis(msg.created_at))
            .bind(&msg.topic)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete_topic(&self, name: &str, hard: bool) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        if hard {
            sqlx::query("DELETE FROM messages WHERE topic = ?")
                .bind(name)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM subscriptions WHERE topic = ?")
                .bind(name)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM topics WHERE name = ?")
                .bind(name)
                .execute(&mut *tx)
                .await?;
        } else {
            sqlx::query("UPDATE topics SET deleted_at = ? WHERE name = ?")
                .bind(to_millis(time_now()))
                .bind(name)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn mem_db() -> Database {
        Database::open(":memory:").await.expect("in-memory database")
    }

    #[tokio::test]
    async fn create_and_fetch_user() {
        let db = mem_db().await;
        let mut user = User::new(Uid::new(42));
        user.tags = vec!["alice".to_string()];
        user.access.auth = AccessMode::C_P2P;
        db.create_user(&user, None).await.unwrap();

        let got = db.get_user(Uid::new(42)).await.unwrap().expect("user");
        assert_eq!(got.tags, vec!["alice".to_string()]);
        assert_eq!(got.access.auth, AccessMode::C_P2P);

        // The 'me' subscription was created alongside.
        let subs = db.get_subs(Uid::new(42)).await.unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].topic, Uid::new(42).user_id());
    }

    #[tokio::test]
    async fn duplicate_validated_cred_rejected() {
        let db = mem_db().await;
        db.create_user(&User::new(Uid::new(1)), None).await.unwrap();
        db.create_user(&User::new(Uid::new(2)), None).await.unwrap();

        let mut cred = Credential::new(Uid::new(1), "email", "a@example.com", "123456");
        assert!(db.upsert_cred(&cred).await.unwrap());
        db.confirm_cred(Uid::new(1), "email").await.unwrap();

        cred.user_id = Uid::new(2);
        assert_eq!(db.upsert_cred(&cred).await, Err(StoreError::Duplicate));
    }

    #[tokio::test]
    async fn upsert_refreshes_pending_cred() {
        let db = mem_db().await;
        db.create_user(&User::new(Uid::new(1)), None).await.unwrap();

        let cred = Credential::new(Uid::new(1), "email", "a@example.com", "111111");
        assert!(db.upsert_cred(&cred).await.unwrap());
        let again = Credential::new(Uid::new(1), "email", "a@example.com", "222222");
        assert!(!db.upsert_cred(&again).await.unwrap());

        let active = db
            .get_active_cred(Uid::new(1), "email")
            .await
            .unwrap()
            .expect("active cred");
        assert_eq!(active.response, "222222");
        assert_eq!(active.retries, 0);
    }

    #[tokio::test]
    async fn unread_count_sums_topic_deltas() {
        let db = mem_db().await;
        let uid = Uid::new(7);
        db.create_user(&User::new(uid), None).await.unwrap();

        let now = time_now();
        db.create_topic(&TopicRecord {
            name: "grpAAAAAAAAB".into(),
            created_at: now,
            updated_at: now,
            owner: uid,
            seq_id: 10,
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
            read_seq_id: 4,
            recv_seq_id: 6,
        })
        .await
        .unwrap();

        assert_eq!(db.get_unread_count(uid).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn tag_updates() {
        let db = mem_db().await;
        let uid = Uid::new(3);
        let mut user = User::new(uid);
        user.tags = vec!["alice".into()];
        db.create_user(&user, None).await.unwrap();

        let tags = db
            .update_tags(uid, &["email:a@x".into()], &[], None)
            .await
            .unwrap();
        assert_eq!(tags, vec!["alice".to_string(), "email:a@x".to_string()]);

        let tags = db
            .update_tags(uid, &[], &["alice".into()], None)
            .await
            .unwrap();
        assert_eq!(tags, vec!["email:a@x".to_string()]);

        let tags = db
            .update_tags(uid, &[], &[], Some(&["basic:alice".into()]))
            .await
            .unwrap();
        assert_eq!(tags, vec!["basic:alice".to_string()]);
    }
}
