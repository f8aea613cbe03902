//! Key-value sink: one mirrored key per allowed address.
//!
//! Events are applied one call each, v4 before v6, each family in input
//! order. The first failed call aborts the rest of the invocation for this
//! sink, since consumers enumerate the namespace and expect it complete.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use knockrd_core::{FamilyEvents, KvTarget, SinkError};

use crate::sink::{bounded, Sink, SinkFailure, SinkKind};

/// Remote boundary of a key-value sink.
#[async_trait]
pub trait KvClient: Send + Sync {
    /// Short client name for logs and errors.
    fn name(&self) -> &'static str;

    /// Create or overwrite `key`.
    async fn put(&self, key: &str, value: &str) -> Result<(), SinkError>;

    /// Remove `key`. Removing an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<(), SinkError>;
}

pub struct KvSink {
    client: Arc<dyn KvClient>,
    target: KvTarget,
    timeout: Duration,
}

impl std::fmt::Debug for KvSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvSink")
            .field("client", &self.client.name())
            .field("target", &self.target)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl KvSink {
    pub fn new(client: Arc<dyn KvClient>, target: KvTarget, timeout: Duration) -> Self {
        Self {
            client,
            target,
            timeout,
        }
    }

    pub fn target(&self) -> &KvTarget {
        &self.target
    }
}

#[async_trait]
impl Sink for KvSink {
    fn kind(&self) -> SinkKind {
        SinkKind::KeyValue
    }

    fn targets(&self) -> Vec<String> {
        vec![self.target.prefix.clone()]
    }

    async fn apply(&self, events: &FamilyEvents) -> Result<(), Vec<SinkFailure>> {
        let sink = self.client.name();
        for event in events.iter() {
            let key = self.target.key_for(&event.address());
            let result = if event.is_add() {
                bounded(
                    sink,
                    "put",
                    self.timeout,
                    self.client.put(&key, &event.cidr()),
                )
                .await
            } else {
                bounded(sink, "delete", self.timeout, self.client.delete(&key)).await
            };

            if let Err(e) = result {
                tracing::warn!(key = %key, error = %e, "Key-value update failed, aborting remaining events");
                return Err(vec![SinkFailure::new(SinkKind::KeyValue, key, e)]);
            }
            tracing::info!(key = %key, action = ?event.action(), "Updated key-value mirror");
        }
        Ok(())
    }
}

// ============================================================================
// IN-MEMORY IMPLEMENTATION
// ============================================================================

/// [`KvClient`] over a local ordered map.
#[derive(Debug, Default)]
pub struct InMemoryKv {
    entries: Mutex<BTreeMap<String, String>>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every key and value.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Keys under `prefix`, sorted.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl KvClient for InMemoryKv {
    fn name(&self) -> &'static str {
        "memory-kv"
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), SinkError> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), SinkError> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use knockrd_core::{Action, ChangeEvent, DEFAULT_KV_PREFIX};
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn events(items: &[(&str, Action)]) -> FamilyEvents {
        items
            .iter()
            .map(|(addr, action)| ChangeEvent::new(addr.parse::<IpAddr>().expect("ip"), *action))
            .collect()
    }

    fn sink(client: Arc<dyn KvClient>) -> KvSink {
        KvSink::new(client, KvTarget::new(DEFAULT_KV_PREFIX), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_put_and_delete() {
        let kv = Arc::new(InMemoryKv::new());
        let sink = sink(kv.clone());
        sink.apply(&events(&[
            ("198.51.100.1", Action::Add),
            ("2001:db8::1", Action::Add),
        ]))
        .await
        .expect("apply");

        let snapshot = kv.snapshot();
        assert_eq!(
            snapshot.get("knockrd/allowed/198.51.100.1").map(String::as_str),
            Some("198.51.100.1/32")
        );
        assert_eq!(
            snapshot.get("knockrd/allowed/2001%3Adb8%3A%3A1").map(String::as_str),
            Some("2001:db8::1/128")
        );

        sink.apply(&events(&[("198.51.100.1", Action::Delete)]))
            .await
            .expect("apply");
        assert_eq!(
            kv.keys_with_prefix(DEFAULT_KV_PREFIX),
            vec!["knockrd/allowed/2001%3Adb8%3A%3A1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let kv = Arc::new(InMemoryKv::new());
        let sink = sink(kv.clone());
        let batch = events(&[
            ("198.51.100.1", Action::Add),
            ("198.51.100.2", Action::Add),
            ("198.51.100.1", Action::Delete),
        ]);
        sink.apply(&batch).await.expect("first");
        let first = kv.snapshot();
        sink.apply(&batch).await.expect("replay");
        assert_eq!(kv.snapshot(), first);
        assert_eq!(first.len(), 1);
    }

    /// Fails the second call it receives.
    #[derive(Default)]
    struct FailSecond {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl KvClient for FailSecond {
        fn name(&self) -> &'static str {
            "fail-second"
        }

        async fn put(&self, _key: &str, _value: &str) -> Result<(), SinkError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 1 {
                return Err(SinkError::Transport {
                    sink: "fail-second",
                    reason: "connection reset".to_string(),
                });
            }
            Ok(())
        }

        async fn delete(&self, _key: &str) -> Result<(), SinkError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_first_failure_aborts_remaining() {
        let client = Arc::new(FailSecond::default());
        let failures = sink(client.clone())
            .apply(&events(&[
                ("198.51.100.1", Action::Add),
                ("198.51.100.2", Action::Add),
                ("198.51.100.3", Action::Add),
            ]))
            .await
            .expect_err("second put fails");

        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].target, "knockrd/allowed/198.51.100.2");
        assert!(failures[0].error.is_transient());
    }
}
