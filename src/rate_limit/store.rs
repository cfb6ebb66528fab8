//! Bucket Store
//!
//! Transactional record of remaining quota per rate-limit bucket. Every
//! backend runs `try_consume` as one all-or-nothing unit of work (read,
//! decide, write, commit), so two callers racing for the last unit of a
//! bucket can never both be granted.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::bucket::{Bucket, BucketDefaults, ConsumeOutcome, RateLimitSnapshot};
use crate::error::Result;
use crate::metrics;

/// Persistent store of bucket quota state
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Get a bucket, creating it with default limits if unseen
    async fn get_or_create(&self, bucket_id: &str) -> Result<Bucket>;

    /// Atomically take `cost` units from a bucket
    ///
    /// Rolls the window over first if `reset_at` has passed.
    async fn try_consume(&self, bucket_id: &str, cost: u32) -> Result<ConsumeOutcome>;

    /// Overwrite a bucket with limits reported by the remote API
    async fn apply_authoritative_limits(
        &self,
        bucket_id: &str,
        snapshot: &RateLimitSnapshot,
    ) -> Result<()>;

    /// All known buckets
    async fn list(&self) -> Result<Vec<Bucket>>;
}

/// Feed remote limits back into the store without failing the caller
///
/// Correction failures are logged and counted, never propagated.
pub async fn apply_limits_best_effort(
    store: &dyn BucketStore,
    bucket_id: &str,
    snapshot: &RateLimitSnapshot,
) -> bool {
    match store.apply_authoritative_limits(bucket_id, snapshot).await {
        Ok(()) => {
            debug!(
                "Corrected bucket {}: limit={} remaining={} reset_at={}",
                bucket_id, snapshot.limit, snapshot.remaining, snapshot.reset_at
            );
            true
        }
        Err(e) => {
            warn!("Failed to apply authoritative limits to bucket {}: {}", bucket_id, e);
            metrics::BUCKET_CORRECTION_FAILURES_TOTAL.inc();
            false
        }
    }
}

/// In-memory bucket store
///
/// Only consistent within one process; the mutex is the transaction
/// boundary. Use [`super::SqliteBucketStore`] when several processes share
/// buckets.
#[derive(Debug, Clone)]
pub struct MemoryBucketStore {
    /// Bucket storage
    buckets: Arc<Mutex<HashMap<String, Bucket>>>,

    /// Limits for lazily created buckets
    defaults: BucketDefaults,
}

impl MemoryBucketStore {
    /// Create a new store using `defaults` for unseen buckets
    pub fn new(defaults: BucketDefaults) -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            defaults,
        }
    }

    /// Number of buckets
    pub async fn count(&self) -> usize {
        self.buckets.lock().await.len()
    }
}

impl Default for MemoryBucketStore {
    fn default() -> Self {
        Self::new(BucketDefaults::default())
    }
}

#[async_trait]
impl BucketStore for MemoryBucketStore {
    async fn get_or_create(&self, bucket_id: &str) -> Result<Bucket> {
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry(bucket_id.to_string())
            .or_insert_with(|| Bucket::new(bucket_id, self.defaults, Utc::now()));
        Ok(bucket.clone())
    }

    async fn try_consume(&self, bucket_id: &str, cost: u32) -> Result<ConsumeOutcome> {
        let now = Utc::now();
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry(bucket_id.to_string())
            .or_insert_with(|| Bucket::new(bucket_id, self.defaults, now));
        Ok(bucket.consume(cost, now))
    }

    async fn apply_authoritative_limits(
        &self,
        bucket_id: &str,
        snapshot: &RateLimitSnapshot,
    ) -> Result<()> {
        let now = Utc::now();
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry(bucket_id.to_string())
            .or_insert_with(|| Bucket::new(bucket_id, self.defaults, now));
        bucket.apply_snapshot(snapshot, now);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Bucket>> {
        let buckets = self.buckets.lock().await;
        let mut all: Vec<Bucket> = buckets.values().cloned().collect();
        all.sort_by(|a, b| a.bucket_id.cmp(&b.bucket_id));
        Ok(all)
    }
}
