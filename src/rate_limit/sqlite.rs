//! SQLite Bucket Store
//!
//! Bucket state shared by every process pointing at the same database file.
//! Each mutation runs in a `BEGIN IMMEDIATE` transaction: the write lock is
//! taken before the row is read, so concurrent workers serialize per call and
//! never both observe the last unit of capacity.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

use super::bucket::{Bucket, BucketDefaults, ConsumeOutcome, RateLimitSnapshot};
use super::store::BucketStore;
use crate::error::{RelayError, Result};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS buckets (
    bucket_id      TEXT PRIMARY KEY,
    bucket_limit   INTEGER NOT NULL,
    remaining      INTEGER NOT NULL,
    reset_at_ms    INTEGER NOT NULL,
    window_ms      INTEGER NOT NULL,
    updated_at_ms  INTEGER NOT NULL
);
"#;

/// SQLite-backed bucket store
#[derive(Debug, Clone)]
pub struct SqliteBucketStore {
    conn: Arc<Mutex<Connection>>,
    defaults: BucketDefaults,
}

impl SqliteBucketStore {
    /// Open (or create) the bucket database at `path`
    pub fn open<P: AsRef<Path>>(
        path: P,
        defaults: BucketDefaults,
        busy_timeout: Duration,
    ) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        // WAL lets readers proceed while another process holds the write lock
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        conn.execute_batch(SCHEMA)?;
        info!("Opened bucket store at {:?}", path);
        Ok(Self::from_connection(conn, defaults))
    }

    /// Open a private in-memory database (tests and single-process use)
    pub fn open_in_memory(defaults: BucketDefaults) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self::from_connection(conn, defaults))
    }

    fn from_connection(conn: Connection, defaults: BucketDefaults) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            defaults,
        }
    }

    /// Run `f` inside an immediate transaction on the blocking pool
    async fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Transaction<'_>, BucketDefaults) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let defaults = self.defaults;
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| RelayError::Store("connection mutex poisoned".into()))?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let value = f(&tx, defaults)?;
            tx.commit()?;
            Ok(value)
        })
        .await
        .map_err(|e| RelayError::Store(format!("store task failed: {}", e)))?
    }
}

fn load_bucket(conn: &Connection, bucket_id: &str) -> Result<Option<Bucket>> {
    let row = conn
        .query_row(
            "SELECT bucket_limit, remaining, reset_at_ms, window_ms, updated_at_ms
             FROM buckets WHERE bucket_id = ?1",
            params![bucket_id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            },
        )
        .optional()?;

    row.map(|(limit, remaining, reset_at_ms, window_ms, updated_at_ms)| {
        Ok(Bucket {
            bucket_id: bucket_id.to_string(),
            limit: limit as u32,
            remaining: remaining as u32,
            reset_at: from_millis(reset_at_ms)?,
            window: Duration::from_millis(window_ms as u64),
            updated_at: from_millis(updated_at_ms)?,
        })
    })
    .transpose()
}

fn save_bucket(conn: &Connection, bucket: &Bucket) -> Result<()> {
    conn.execute(
        "INSERT INTO buckets (bucket_id, bucket_limit, remaining, reset_at_ms, window_ms, updated_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(bucket_id) DO UPDATE SET
            bucket_limit = excluded.bucket_limit,
            remaining = excluded.remaining,
            reset_at_ms = excluded.reset_at_ms,
            window_ms = excluded.window_ms,
            updated_at_ms = excluded.updated_at_ms",
        params![
            bucket.bucket_id,
            bucket.limit as i64,
            bucket.remaining as i64,
            bucket.reset_at.timestamp_millis(),
            bucket.window.as_millis() as i64,
            bucket.updated_at.timestamp_millis(),
        ],
    )?;
    Ok(())
}

fn load_or_new(
    conn: &Connection,
    bucket_id: &str,
    defaults: BucketDefaults,
    now: DateTime<Utc>,
) -> Result<Bucket> {
    match load_bucket(conn, bucket_id)? {
        Some(bucket) => Ok(bucket),
        None => {
            let bucket = Bucket::new(bucket_id, defaults, now);
            save_bucket(conn, &bucket)?;
            Ok(bucket)
        }
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| RelayError::Store(format!("timestamp out of range: {}", ms)))
}

#[async_trait]
impl BucketStore for SqliteBucketStore {
    async fn get_or_create(&self, bucket_id: &str) -> Result<Bucket> {
        let bucket_id = bucket_id.to_string();
        self.with_transaction(move |tx, defaults| load_or_new(tx, &bucket_id, defaults, Utc::now()))
            .await
    }

    async fn try_consume(&self, bucket_id: &str, cost: u32) -> Result<ConsumeOutcome> {
        let bucket_id = bucket_id.to_string();
        self.with_transaction(move |tx, defaults| {
            let now = Utc::now();
            let mut bucket = load_or_new(tx, &bucket_id, defaults, now)?;
            let before = bucket.clone();
            let outcome = bucket.consume(cost, now);
            if bucket != before {
                save_bucket(tx, &bucket)?;
            }
            Ok(outcome)
        })
        .await
    }

    async fn apply_authoritative_limits(
        &self,
        bucket_id: &str,
        snapshot: &RateLimitSnapshot,
    ) -> Result<()> {
        let bucket_id = bucket_id.to_string();
        let snapshot = snapshot.clone();
        self.with_transaction(move |tx, defaults| {
            let now = Utc::now();
            let mut bucket = load_or_new(tx, &bucket_id, defaults, now)?;
            bucket.apply_snapshot(&snapshot, now);
            save_bucket(tx, &bucket)
        })
        .await
    }

    async fn list(&self) -> Result<Vec<Bucket>> {
        self.with_transaction(|tx, _| {
            let mut stmt = tx.prepare("SELECT bucket_id FROM buckets ORDER BY bucket_id")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let mut buckets = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(bucket) = load_bucket(tx, &id)? {
                    buckets.push(bucket);
                }
            }
            Ok(buckets)
        })
        .await
    }
}
