//! Fault-injection tests for provisioning, timeouts and the LMDB backend.

use std::sync::Arc;
use std::time::Duration;

use knockrd_core::{ManualClock, RetryPolicy, StoreError};
use knockrd_storage::{
    AccessBackend, AccessCache, AccessStore, ExpiryBackend, LmdbExpiryBackend,
};
use knockrd_test_utils::assertions::assert_store_transient;
use knockrd_test_utils::doubles::FaultyBackend;

fn policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        min_delay_ms: 500,
        max_delay_ms: 3000,
        max_attempts,
    }
}

#[tokio::test(start_paused = true)]
async fn test_provision_retries_transient_failures() {
    let backend = Arc::new(FaultyBackend::new());
    backend.fail_next(3);
    let store = AccessStore::new(backend.clone(), "knockrd");

    store.provision(&policy(10)).await.expect("provision");

    let meta = backend
        .inner()
        .describe("knockrd")
        .await
        .expect("describe")
        .expect("collection exists");
    assert_eq!(meta.expiry_attribute.as_deref(), Some("expires"));
    // Three failures, then ensure_collection and enable_expiry.
    assert_eq!(backend.calls(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_provision_gives_up_after_max_attempts() {
    let backend = Arc::new(FaultyBackend::new());
    backend.fail_next(100);
    let store = AccessStore::new(backend.clone(), "knockrd");

    let err = store.provision(&policy(3)).await.expect_err("exhausted");
    assert!(matches!(err, StoreError::Provisioning { ref collection, .. } if collection == "knockrd"));
    assert!(!err.is_transient());
    assert_eq!(backend.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_backend_times_out() {
    let backend = Arc::new(FaultyBackend::new());
    let store = AccessStore::new(backend.clone(), "knockrd")
        .with_timeout(Duration::from_millis(200));
    store.provision(&policy(1)).await.expect("provision");

    backend.stall(Duration::from_secs(5));
    let result = store.get("198.51.100.1").await;
    assert_store_transient(&result);
    assert!(matches!(result, Err(StoreError::Timeout { operation: "get", .. })));
}

#[tokio::test]
async fn test_unavailable_store_propagates_through_cache() {
    let backend = Arc::new(FaultyBackend::new());
    let store = Arc::new(AccessStore::new(backend.clone(), "knockrd"));
    store.provision(&policy(1)).await.expect("provision");
    let cache = AccessCache::new(store, Duration::from_secs(10), Duration::from_secs(5));

    backend.fail_next(1);
    assert_store_transient(&cache.get("198.51.100.1").await);
    // Nothing was cached for the failed lookup.
    assert!(cache.peek("198.51.100.1").is_none());
    assert!(!cache.get("198.51.100.1").await.expect("get"));
}

#[tokio::test]
async fn test_lmdb_store_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = Arc::new(ManualClock::at_epoch_2024());

    {
        let backend = Arc::new(LmdbExpiryBackend::open(dir.path(), 16).expect("open"));
        let store = AccessStore::new(backend, "knockrd").with_clock(clock.clone());
        store.provision(&policy(1)).await.expect("provision");
        store.set("2001:db8::1").await.expect("set");
    }

    let backend = Arc::new(LmdbExpiryBackend::open(dir.path(), 16).expect("reopen"));
    let store = AccessStore::new(backend, "knockrd").with_clock(clock.clone());
    store.provision(&policy(1)).await.expect("provision again");
    assert!(store.get("2001:db8::1").await.expect("get"));

    clock.advance(Duration::from_secs(3600));
    assert!(!store.get("2001:db8::1").await.expect("get after expiry"));
    assert_eq!(store.reclaim_expired().await.expect("reclaim"), 1);
}
