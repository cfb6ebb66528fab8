//! Admission Controller
//!
//! Gates sends on bucket capacity. A caller waits cooperatively (no busy
//! loop, no dedicated thread) until the store grants a unit, sleeping a
//! jittered backoff bounded by the store's `retry_after` hint between
//! attempts. Cancellation is observed at every retry boundary.

use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::backoff::BackoffConfig;
use super::bucket::ConsumeOutcome;
use super::store::BucketStore;
use crate::error::{RelayError, Result};
use crate::metrics;

/// Proof that a request was admitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionGrant {
    /// Bucket the unit was taken from
    pub bucket_id: String,

    /// Remaining capacity after the grant
    pub remaining: u32,

    /// Number of denials observed before the grant
    pub denials: u32,
}

/// Admission controller
#[derive(Clone)]
pub struct AdmissionController {
    /// Bucket store
    store: Arc<dyn BucketStore>,

    /// Retry backoff
    backoff: BackoffConfig,
}

impl AdmissionController {
    /// Create a new admission controller
    pub fn new(store: Arc<dyn BucketStore>, backoff: BackoffConfig) -> Self {
        Self { store, backoff }
    }

    /// Bucket store backing this controller
    pub fn store(&self) -> &Arc<dyn BucketStore> {
        &self.store
    }

    /// Wait until one unit of `bucket_id` is granted
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Cancelled`] if `cancel` fires before a grant,
    /// or [`RelayError::Store`] if the bucket store fails.
    pub async fn await_admission(
        &self,
        bucket_id: &str,
        cancel: &CancellationToken,
    ) -> Result<AdmissionGrant> {
        // Without a deadline the loop only ends on a grant, an error or cancellation
        self.admit(bucket_id, None, cancel)
            .await?
            .ok_or(RelayError::Cancelled)
    }

    /// Wait for a grant, giving up once `deadline` passes
    ///
    /// Returns `Ok(None)` if the deadline passes first. The deadline is only
    /// checked between store calls, so a transaction in flight always
    /// completes and its outcome is reported.
    pub async fn await_admission_until(
        &self,
        bucket_id: &str,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Option<AdmissionGrant>> {
        self.admit(bucket_id, Some(deadline), cancel).await
    }

    async fn admit(
        &self,
        bucket_id: &str,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<Option<AdmissionGrant>> {
        let mut denials = 0u32;

        loop {
            if cancel.is_cancelled() {
                debug!("Admission for bucket {} cancelled after {} denials", bucket_id, denials);
                return Err(RelayError::Cancelled);
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                debug!("Admission deadline for bucket {} passed after {} denials", bucket_id, denials);
                return Ok(None);
            }

            match self.store.try_consume(bucket_id, 1).await? {
                ConsumeOutcome::Allowed { remaining } => {
                    trace!("Admitted on bucket {} ({} remaining)", bucket_id, remaining);
                    metrics::ADMISSION_GRANTED_TOTAL.inc();
                    return Ok(Some(AdmissionGrant {
                        bucket_id: bucket_id.to_string(),
                        remaining,
                        denials,
                    }));
                }
                ConsumeOutcome::Denied { retry_after } => {
                    metrics::ADMISSION_DENIED_TOTAL
                        .with_label_values(&[bucket_id])
                        .inc();
                    let delay = self.backoff.delay(denials, retry_after);
                    denials = denials.saturating_add(1);
                    debug!(
                        "Rate limited on bucket {} (denial {}), retry_after={:?}, sleeping {:?}",
                        bucket_id, denials, retry_after, delay
                    );

                    let wake = match deadline {
                        Some(deadline) => (Instant::now() + delay).min(deadline),
                        None => Instant::now() + delay,
                    };
                    if !self.sleep_or_cancel(wake, cancel).await {
                        debug!("Admission for bucket {} cancelled while backing off", bucket_id);
                        return Err(RelayError::Cancelled);
                    }
                }
            }
        }
    }

    /// Returns false if cancelled before `wake`
    async fn sleep_or_cancel(&self, wake: Instant, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep_until(wake) => true,
        }
    }
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::bucket::BucketDefaults;
    use crate::rate_limit::store::MemoryBucketStore;
    use std::time::Duration;

    fn controller(limit: u32, window_ms: u64) -> AdmissionController {
        let store = MemoryBucketStore::new(BucketDefaults {
            limit,
            window: Duration::from_millis(window_ms),
        });
        AdmissionController::new(
            Arc::new(store),
            BackoffConfig::new().base_delay(Duration::from_millis(5)),
        )
    }

    #[tokio::test]
    async fn test_immediate_grant() {
        let admission = controller(2, 1000);
        let grant = admission
            .await_admission("b", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(grant.remaining, 1);
        assert_eq!(grant.denials, 0);
    }

    #[tokio::test]
    async fn test_waits_for_window_reset() {
        let admission = controller(1, 80);
        let cancel = CancellationToken::new();
        admission.await_admission("b", &cancel).await.unwrap();

        let start = std::time::Instant::now();
        let grant = admission.await_admission("b", &cancel).await.unwrap();
        assert!(grant.denials >= 1);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_cancel_mid_wait() {
        let admission = controller(1, 60_000);
        let cancel = CancellationToken::new();
        admission.await_admission("b", &cancel).await.unwrap();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result = admission.await_admission("b", &cancel).await;
        assert!(matches!(result, Err(RelayError::Cancelled)));
    }

    #[tokio::test]
    async fn test_deadline_bounds_backoff() {
        let admission = controller(1, 60_000);
        let cancel = CancellationToken::new();
        admission.await_admission("b", &cancel).await.unwrap();

        let start = Instant::now();
        let grant = admission
            .await_admission_until("b", start + Duration::from_millis(40), &cancel)
            .await
            .unwrap();
        assert!(grant.is_none());
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert!(start.elapsed() < Duration::from_secs(1));

        let bucket = admission.store().get_or_create("b").await.unwrap();
        assert_eq!(bucket.remaining, 0);
    }

    #[tokio::test]
    async fn test_grant_before_deadline() {
        let admission = controller(2, 60_000);
        let deadline = Instant::now() + Duration::from_secs(5);
        let grant = admission
            .await_admission_until("b", deadline, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(grant.remaining, 1);
    }

    #[tokio::test]
    async fn test_already_cancelled_never_consumes() {
        let admission = controller(1, 60_000);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = admission.await_admission("b", &cancel).await;
        assert!(matches!(result, Err(RelayError::Cancelled)));

        let bucket = admission.store().get_or_create("b").await.unwrap();
        assert_eq!(bucket.remaining, 1);
    }
}
