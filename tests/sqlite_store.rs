//! SQLite bucket store shared by several connections (stand-ins for processes)

use chrono::Utc;
use quota_relay::rate_limit::{
    AdmissionController, BackoffConfig, BucketDefaults, BucketStore, RateLimitSnapshot,
    SqliteBucketStore,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn open(dir: &TempDir, limit: u32, window: Duration) -> SqliteBucketStore {
    SqliteBucketStore::open(
        dir.path().join("buckets.db"),
        BucketDefaults { limit, window },
        Duration::from_secs(5),
    )
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_connections_never_overgrant() {
    let dir = TempDir::new().unwrap();
    let stores: Vec<Arc<SqliteBucketStore>> = (0..4)
        .map(|_| Arc::new(open(&dir, 10, Duration::from_secs(60))))
        .collect();

    let mut handles = Vec::new();
    for i in 0..40 {
        let store = stores[i % stores.len()].clone();
        handles.push(tokio::spawn(async move {
            store.try_consume("POST /channels/1/messages", 1).await
        }));
    }

    let mut allowed = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap().is_allowed() {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 10);

    let bucket = stores[0]
        .get_or_create("POST /channels/1/messages")
        .await
        .unwrap();
    assert_eq!(bucket.remaining, 0);
}

#[tokio::test]
async fn test_denied_retry_after_bounded_by_reset() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir, 1, Duration::from_secs(30));

    assert!(store.try_consume("b", 1).await.unwrap().is_allowed());
    let reset_at = store.get_or_create("b").await.unwrap().reset_at;

    match store.try_consume("b", 1).await.unwrap() {
        quota_relay::rate_limit::ConsumeOutcome::Denied { retry_after } => {
            let bound = (reset_at - Utc::now()).to_std().unwrap_or_default();
            assert!(retry_after <= bound + Duration::from_millis(5));
        }
        other => panic!("expected denial, got {:?}", other),
    }
}

#[tokio::test]
async fn test_correction_visible_to_other_connection() {
    let dir = TempDir::new().unwrap();
    let writer = open(&dir, 5, Duration::from_secs(60));
    let reader = open(&dir, 5, Duration::from_secs(60));

    let reset_at = Utc::now() + chrono::Duration::seconds(60);
    writer
        .apply_authoritative_limits(
            "GET /guilds/1",
            &RateLimitSnapshot {
                limit: 5,
                remaining: 0,
                reset_at,
            },
        )
        .await
        .unwrap();

    assert!(!reader.try_consume("GET /guilds/1", 1).await.unwrap().is_allowed());
}

#[tokio::test]
async fn test_state_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let store = open(&dir, 3, Duration::from_secs(60));
        store.try_consume("b", 1).await.unwrap();
    }
    let store = open(&dir, 3, Duration::from_secs(60));
    assert_eq!(store.get_or_create("b").await.unwrap().remaining, 2);
    assert_eq!(store.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_admission_over_sqlite_waits_for_rollover() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(open(&dir, 1, Duration::from_millis(100)));
    let admission = AdmissionController::new(
        store,
        BackoffConfig::new().base_delay(Duration::from_millis(5)),
    );
    let cancel = CancellationToken::new();

    admission.await_admission("b", &cancel).await.unwrap();
    let grant = admission.await_admission("b", &cancel).await.unwrap();
    assert!(grant.denials >= 1);
}
