//! Property-Based Tests for the Access Store and Cache
//!
//! Property: for any interleaving of Set, Get, Delete and clock advances,
//! the store answers Get exactly as a model of per-key expiry times does,
//! and a cache in front of it never contradicts the caller's own writes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use knockrd_core::{Clock, ManualClock, RetryPolicy};
use knockrd_storage::{AccessBackend, AccessCache, AccessStore, InMemoryExpiryBackend};
use proptest::prelude::*;

const TTL_SECS: u64 = 60;

#[derive(Debug, Clone)]
enum Op {
    Set(usize),
    Get(usize),
    Delete(usize),
    Advance(u64),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0usize..4).prop_map(Op::Set),
        4 => (0usize..4).prop_map(Op::Get),
        1 => (0usize..4).prop_map(Op::Delete),
        2 => (1u64..90).prop_map(Op::Advance),
    ]
}

fn key(i: usize) -> String {
    format!("198.51.100.{}", i + 1)
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("runtime")
}

async fn store(clock: Arc<ManualClock>) -> AccessStore<InMemoryExpiryBackend> {
    let store = AccessStore::new(Arc::new(InMemoryExpiryBackend::new()), "knockrd")
        .with_ttl(Duration::from_secs(TTL_SECS))
        .with_clock(clock);
    store
        .provision(&RetryPolicy::default())
        .await
        .expect("provision");
    store
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn prop_store_matches_expiry_model(ops in prop::collection::vec(arb_op(), 1..60)) {
        let rt = runtime();
        rt.block_on(async {
            let clock = Arc::new(ManualClock::at_epoch_2024());
            let store = store(clock.clone()).await;
            let mut model: HashMap<String, DateTime<Utc>> = HashMap::new();

            for op in ops {
                match op {
                    Op::Set(i) => {
                        store.set(&key(i)).await.expect("set");
                        let expires = clock.now() + chrono::Duration::seconds(TTL_SECS as i64);
                        model.insert(key(i), expires);
                    }
                    Op::Delete(i) => {
                        store.delete(&key(i)).await.expect("delete");
                        model.remove(&key(i));
                    }
                    Op::Get(i) => {
                        let expected = model
                            .get(&key(i))
                            .map(|expires| clock.now() < *expires)
                            .unwrap_or(false);
                        let actual = store.get(&key(i)).await.expect("get");
                        assert_eq!(actual, expected, "get({}) at {}", key(i), clock.now());
                    }
                    Op::Advance(secs) => clock.advance(Duration::from_secs(secs)),
                }
            }
        });
    }

    #[test]
    fn prop_cache_reads_own_writes(ops in prop::collection::vec(arb_op(), 1..60)) {
        let rt = runtime();
        rt.block_on(async {
            let clock = Arc::new(ManualClock::at_epoch_2024());
            let store = Arc::new(store(clock.clone()).await);
            let cache = AccessCache::new(store, Duration::from_secs(10), Duration::from_secs(5))
                .with_clock(clock.clone());

            for op in ops {
                match op {
                    Op::Set(i) => {
                        cache.set(&key(i)).await.expect("set");
                        assert!(cache.get(&key(i)).await.expect("get"));
                    }
                    Op::Delete(i) => {
                        cache.delete(&key(i)).await.expect("delete");
                        assert!(!cache.get(&key(i)).await.expect("get"));
                    }
                    Op::Get(i) => {
                        cache.get(&key(i)).await.expect("get");
                    }
                    Op::Advance(secs) => clock.advance(Duration::from_secs(secs)),
                }
            }
        });
    }
}
