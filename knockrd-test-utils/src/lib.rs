//! knockrd Test Utilities
//!
//! Shared test infrastructure for the knockrd workspace:
//! - Proptest generators for addresses, mutation records and batches
//! - Fixtures for the canonical example batch and configuration
//! - Test doubles that fail, stall or record calls at each remote boundary
//! - Assertions for knockrd error shapes

pub use knockrd_core::{
    Action, AddressFamily, ChangeEvent, Clock, ConfigError, FamilyEvents, KnockConfig,
    KnockError, KnockResult, ManualClock, MutationKind, MutationRecord, RuleTarget, SinkError,
    StoreError,
};
pub use knockrd_events::{StreamBatch, StreamRecord};

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

// ============================================================================
// GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for knockrd inputs.

    use super::*;
    use proptest::prelude::*;

    /// Any IPv4 address.
    pub fn arb_ipv4() -> impl Strategy<Value = Ipv4Addr> {
        any::<[u8; 4]>().prop_map(Ipv4Addr::from)
    }

    /// Any IPv6 address that is not a v4-mapped address (those fold to v4).
    pub fn arb_ipv6() -> impl Strategy<Value = Ipv6Addr> {
        any::<[u16; 8]>()
            .prop_map(Ipv6Addr::from)
            .prop_filter("v4-mapped", |a| a.to_ipv4_mapped().is_none())
    }

    pub fn arb_ip() -> impl Strategy<Value = IpAddr> {
        prop_oneof![
            arb_ipv4().prop_map(IpAddr::V4),
            arb_ipv6().prop_map(IpAddr::V6),
        ]
    }

    /// A small pool of addresses, so generated batches repeat keys.
    pub fn arb_pooled_ip() -> impl Strategy<Value = IpAddr> {
        prop_oneof![
            (1u8..8).prop_map(|n| IpAddr::V4(Ipv4Addr::new(198, 51, 100, n))),
            (1u16..8).prop_map(|n| IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, n))),
        ]
    }

    /// Keys the store may hold that are not addresses (session tokens and
    /// the like).
    pub fn arb_non_address_key() -> impl Strategy<Value = String> {
        "[g-z][a-z0-9_-]{0,15}"
    }

    pub fn arb_mutation_kind() -> impl Strategy<Value = MutationKind> {
        prop_oneof![
            3 => Just(MutationKind::Insert),
            2 => Just(MutationKind::Modify),
            3 => Just(MutationKind::Remove),
            1 => "[A-Z]{3,8}"
                .prop_filter("known kind", |s| {
                    matches!(MutationKind::parse(s), MutationKind::Other(_))
                })
                .prop_map(MutationKind::Other),
        ]
    }

    /// Mostly address keys, some non-address keys.
    pub fn arb_mutation_record() -> impl Strategy<Value = MutationRecord> {
        let key = prop_oneof![
            4 => arb_ip().prop_map(|a| a.to_string()),
            1 => arb_non_address_key(),
        ];
        (key, arb_mutation_kind()).prop_map(|(key, kind)| MutationRecord::new(key, kind))
    }

    pub fn arb_records(max: usize) -> impl Strategy<Value = Vec<MutationRecord>> {
        prop::collection::vec(arb_mutation_record(), 0..=max)
    }

    pub fn arb_action() -> impl Strategy<Value = Action> {
        prop_oneof![Just(Action::Add), Just(Action::Delete)]
    }

    pub fn arb_change_event() -> impl Strategy<Value = ChangeEvent> {
        (arb_pooled_ip(), arb_action()).prop_map(|(ip, action)| ChangeEvent::new(ip, action))
    }

    pub fn arb_family_events(max: usize) -> impl Strategy<Value = FamilyEvents> {
        prop::collection::vec(arb_change_event(), 0..=max)
            .prop_map(|events| events.into_iter().collect())
    }

    /// Wire batches with known and unknown event names.
    pub fn arb_stream_batch(max: usize) -> impl Strategy<Value = StreamBatch> {
        let name = prop_oneof![
            Just("INSERT".to_string()),
            Just("MODIFY".to_string()),
            Just("REMOVE".to_string()),
            "[A-Z]{3,8}",
        ];
        let key = prop_oneof![
            4 => arb_pooled_ip().prop_map(|a| a.to_string()),
            1 => arb_non_address_key(),
        ];
        prop::collection::vec((key, name), 0..=max).prop_map(|pairs| {
            StreamBatch::from_pairs(pairs.iter().map(|(k, n)| (k.as_str(), n.as_str())))
        })
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built inputs for common scenarios.

    use super::*;
    use knockrd_core::{ConsulConfig, IpSetConfig, ListScope, ListTarget};

    /// Mutation-log batch covering add, modify, remove and a non-address key.
    pub const EXAMPLE_BATCH_JSON: &str = r#"{
        "Records": [
            {"eventID": "1", "eventName": "INSERT", "dynamodb": {"Keys": {"Key": {"S": "198.51.100.1"}}}},
            {"eventID": "2", "eventName": "MODIFY", "dynamodb": {"Keys": {"Key": {"S": "2001:db8::1"}}}},
            {"eventID": "3", "eventName": "REMOVE", "dynamodb": {"Keys": {"Key": {"S": "198.51.100.1"}}}},
            {"eventID": "4", "eventName": "INSERT", "dynamodb": {"Keys": {"Key": {"S": "not-an-ip"}}}}
        ]
    }"#;

    /// Configuration naming one target of every sink kind.
    pub const SAMPLE_CONFIG_YAML: &str = r#"
table_name: knockrd-test
ttl_secs: 60
cache_ttl_secs: 10
negative_cache_ttl_secs: 5
sink_timeout_ms: 2000
ip_set:
  v4:
    id: allow-v4
    name: knockrd-v4
    scope: REGIONAL
  v6:
    id: allow-v6
    name: knockrd-v6
    scope: REGIONAL
security_groups:
  - id: sg-0123
    from_port: 22
    to_port: 22
    protocol: tcp
consul:
  address: 127.0.0.1:8500
  kv_path: knockrd/allowed
"#;

    pub fn example_records() -> Vec<MutationRecord> {
        vec![
            MutationRecord::new("198.51.100.1", MutationKind::Insert),
            MutationRecord::new("2001:db8::1", MutationKind::Modify),
            MutationRecord::new("198.51.100.1", MutationKind::Remove),
            MutationRecord::new("not-an-ip", MutationKind::Insert),
        ]
    }

    pub fn example_batch() -> StreamBatch {
        StreamBatch::from_pairs([
            ("198.51.100.1", "INSERT"),
            ("2001:db8::1", "MODIFY"),
            ("198.51.100.1", "REMOVE"),
            ("not-an-ip", "INSERT"),
        ])
    }

    pub fn list_target(id: &str) -> ListTarget {
        ListTarget {
            id: id.to_string(),
            name: format!("knockrd-{}", id),
            scope: ListScope::Regional,
        }
    }

    pub fn rule_target(id: &str, port: i64) -> RuleTarget {
        RuleTarget {
            id: id.to_string(),
            from_port: port,
            to_port: port,
            protocol: "tcp".to_string(),
        }
    }

    /// In-memory store with every sink kind configured.
    pub fn full_config() -> KnockConfig {
        KnockConfig {
            ttl_secs: 60,
            ip_set: Some(IpSetConfig {
                v4: Some(list_target("allow-v4")),
                v6: Some(list_target("allow-v6")),
            }),
            security_groups: vec![rule_target("sg-0123", 22)],
            consul: Some(ConsulConfig::new("127.0.0.1:8500")),
            ..Default::default()
        }
    }

    pub fn manual_clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::at_epoch_2024())
    }
}

// ============================================================================
// TEST DOUBLES
// ============================================================================

pub mod doubles {
    //! Remote-boundary doubles that fail, stall or record.

    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use knockrd_core::{AccessEntry, ListTarget};
    use knockrd_storage::{
        CollectionMeta, CollectionSpec, EnsureOutcome, ExpiryBackend, InMemoryExpiryBackend,
    };
    use knockrd_sync::{
        IngressClient, InMemoryIpSet, InMemoryKv, IpSetClient, IpSetSnapshot, KvClient, RangeSet,
    };
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn unavailable() -> StoreError {
        StoreError::Unavailable {
            reason: "injected failure".to_string(),
        }
    }

    /// [`ExpiryBackend`] over the in-memory backend that can fail the next
    /// N calls or delay every call.
    #[derive(Debug, Default)]
    pub struct FaultyBackend {
        inner: InMemoryExpiryBackend,
        failures_left: AtomicU32,
        delay: Mutex<Option<Duration>>,
        calls: AtomicUsize,
    }

    impl FaultyBackend {
        pub fn new() -> Self {
            Self::default()
        }

        /// Fail the next `n` calls with [`StoreError::Unavailable`].
        pub fn fail_next(&self, n: u32) {
            self.failures_left.store(n, Ordering::SeqCst);
        }

        /// Sleep for `delay` before every call.
        pub fn stall(&self, delay: Duration) {
            *self.delay.lock().unwrap_or_else(|e| e.into_inner()) = Some(delay);
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn inner(&self) -> &InMemoryExpiryBackend {
            &self.inner
        }

        async fn gate(&self) -> Result<(), StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let delay = *self.delay.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let failed = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                return Err(unavailable());
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ExpiryBackend for FaultyBackend {
        fn name(&self) -> &'static str {
            "faulty"
        }

        async fn ensure_collection(
            &self,
            spec: &CollectionSpec,
        ) -> Result<EnsureOutcome, StoreError> {
            self.gate().await?;
            self.inner.ensure_collection(spec).await
        }

        async fn enable_expiry(&self, collection: &str, attribute: &str) -> Result<(), StoreError> {
            self.gate().await?;
            self.inner.enable_expiry(collection, attribute).await
        }

        async fn describe(&self, collection: &str) -> Result<Option<CollectionMeta>, StoreError> {
            self.gate().await?;
            self.inner.describe(collection).await
        }

        async fn get_item(
            &self,
            collection: &str,
            key: &str,
        ) -> Result<Option<AccessEntry>, StoreError> {
            self.gate().await?;
            self.inner.get_item(collection, key).await
        }

        async fn put_item(&self, collection: &str, entry: &AccessEntry) -> Result<(), StoreError> {
            self.gate().await?;
            self.inner.put_item(collection, entry).await
        }

        async fn delete_item(&self, collection: &str, key: &str) -> Result<(), StoreError> {
            self.gate().await?;
            self.inner.delete_item(collection, key).await
        }

        async fn reclaim_expired(
            &self,
            collection: &str,
            now: DateTime<Utc>,
        ) -> Result<u64, StoreError> {
            self.gate().await?;
            self.inner.reclaim_expired(collection, now).await
        }
    }

    /// One recorded ingress call.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct IngressCall {
        pub target: String,
        pub cidrs: Vec<String>,
    }

    /// [`IngressClient`] that accepts everything and records each call.
    #[derive(Debug, Default)]
    pub struct RecordingIngress {
        authorized: Mutex<Vec<IngressCall>>,
        revoked: Mutex<Vec<IngressCall>>,
    }

    impl RecordingIngress {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn authorize_calls(&self) -> Vec<IngressCall> {
            self.authorized
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
        }

        pub fn revoke_calls(&self) -> Vec<IngressCall> {
            self.revoked
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
        }
    }

    #[async_trait]
    impl IngressClient for RecordingIngress {
        async fn authorize_ingress(
            &self,
            target: &RuleTarget,
            ranges: &RangeSet,
        ) -> Result<(), SinkError> {
            self.authorized
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(IngressCall {
                    target: target.id.clone(),
                    cidrs: ranges.cidrs(),
                });
            Ok(())
        }

        async fn revoke_ingress(
            &self,
            target: &RuleTarget,
            ranges: &RangeSet,
        ) -> Result<(), SinkError> {
            self.revoked
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(IngressCall {
                    target: target.id.clone(),
                    cidrs: ranges.cidrs(),
                });
            Ok(())
        }
    }

    /// [`KvClient`] over [`InMemoryKv`] that fails the Nth call (0-based)
    /// or stalls every call.
    #[derive(Debug, Default)]
    pub struct FaultyKv {
        inner: InMemoryKv,
        fail_at: Mutex<Option<usize>>,
        delay: Mutex<Option<Duration>>,
        calls: AtomicUsize,
    }

    impl FaultyKv {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fail_at(&self, call: usize) {
            *self.fail_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(call);
        }

        pub fn stall(&self, delay: Duration) {
            *self.delay.lock().unwrap_or_else(|e| e.into_inner()) = Some(delay);
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn inner(&self) -> &InMemoryKv {
            &self.inner
        }

        async fn gate(&self) -> Result<(), SinkError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let delay = *self.delay.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let fail_at = *self.fail_at.lock().unwrap_or_else(|e| e.into_inner());
            if fail_at == Some(call) {
                return Err(SinkError::Transport {
                    sink: "faulty-kv",
                    reason: "injected failure".to_string(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl KvClient for FaultyKv {
        fn name(&self) -> &'static str {
            "faulty-kv"
        }

        async fn put(&self, key: &str, value: &str) -> Result<(), SinkError> {
            self.gate().await?;
            self.inner.put(key, value).await
        }

        async fn delete(&self, key: &str) -> Result<(), SinkError> {
            self.gate().await?;
            self.inner.delete(key).await
        }
    }

    /// [`IpSetClient`] that lets a concurrent writer in between every read
    /// and the following write, so every write presents a stale token.
    #[derive(Debug, Clone)]
    pub struct RacingIpSet {
        inner: Arc<InMemoryIpSet>,
    }

    impl RacingIpSet {
        pub fn new(inner: Arc<InMemoryIpSet>) -> Self {
            Self { inner }
        }
    }

    #[async_trait]
    impl IpSetClient for RacingIpSet {
        async fn read_set(&self, target: &ListTarget) -> Result<IpSetSnapshot, SinkError> {
            let snapshot = self.inner.read_set(target).await?;
            self.inner.bump_token(&target.id);
            Ok(snapshot)
        }

        async fn write_set(
            &self,
            target: &ListTarget,
            members: &[String],
            token: &str,
        ) -> Result<(), SinkError> {
            self.inner.write_set(target, members, token).await
        }
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for knockrd error shapes.

    use super::*;

    /// Assert that a KnockResult is a Config error.
    #[track_caller]
    pub fn assert_config_error<T: std::fmt::Debug>(result: &KnockResult<T>) {
        match result {
            Err(KnockError::Config(_)) => {}
            other => panic!("Expected Config error, got: {:?}", other),
        }
    }

    /// Assert that a store call failed transiently.
    #[track_caller]
    pub fn assert_store_transient<T: std::fmt::Debug>(result: &Result<T, StoreError>) {
        match result {
            Err(e) if e.is_transient() => {}
            other => panic!("Expected transient store error, got: {:?}", other),
        }
    }

    /// Assert that an event sequence holds exactly these `(cidr, action)`
    /// pairs, in order.
    #[track_caller]
    pub fn assert_events(events: &[ChangeEvent], expected: &[(&str, Action)]) {
        let actual: Vec<(String, Action)> =
            events.iter().map(|e| (e.cidr(), e.action())).collect();
        let expected: Vec<(String, Action)> = expected
            .iter()
            .map(|(cidr, action)| (cidr.to_string(), *action))
            .collect();
        assert_eq!(actual, expected, "event sequence mismatch");
    }
}

// ============================================================================
// TESTS
// ============================================================================
