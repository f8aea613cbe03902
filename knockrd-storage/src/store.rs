//! Authoritative TTL access store.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use knockrd_core::{AccessEntry, Clock, RetryPolicy, StoreError, SystemClock, EXPIRY_ATTRIBUTE};

use crate::backend::{CollectionSpec, EnsureOutcome, ExpiryBackend};
use crate::retry::retry_with_backoff;

/// Default lifetime of a granted entry.
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// Default bound on every store call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Set/Get/Delete surface shared by the store and the cache in front of it.
///
/// This is all the request path needs: the caller does not know whether a
/// cache sits in front of the store.
#[async_trait]
pub trait AccessBackend: Send + Sync {
    /// Grant access to `key` for [`ttl`](Self::ttl) from now.
    async fn set(&self, key: &str) -> Result<(), StoreError>;

    /// True iff `key` holds a live grant.
    async fn get(&self, key: &str) -> Result<bool, StoreError>;

    /// Revoke access. Revoking an unknown key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    fn ttl(&self) -> Duration;
}

#[async_trait]
impl<T: AccessBackend + ?Sized> AccessBackend for Arc<T> {
    async fn set(&self, key: &str) -> Result<(), StoreError> {
        (**self).set(key).await
    }

    async fn get(&self, key: &str) -> Result<bool, StoreError> {
        (**self).get(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        (**self).delete(key).await
    }

    fn ttl(&self) -> Duration {
        (**self).ttl()
    }
}

/// TTL-keyed existence store over an [`ExpiryBackend`].
///
/// Freshness is recomputed from the stored expiry on every read, so entries
/// the backend has not reclaimed yet still read as absent once expired.
pub struct AccessStore<B: ExpiryBackend + ?Sized = dyn ExpiryBackend> {
    backend: Arc<B>,
    collection: String,
    ttl: Duration,
    timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl<B: ExpiryBackend + ?Sized> std::fmt::Debug for AccessStore<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessStore")
            .field("backend", &self.backend.name())
            .field("collection", &self.collection)
            .field("ttl", &self.ttl)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl<B: ExpiryBackend + ?Sized> AccessStore<B> {
    pub fn new(backend: Arc<B>, collection: impl Into<String>) -> Self {
        Self {
            backend,
            collection: collection.into(),
            ttl: DEFAULT_TTL,
            timeout: DEFAULT_TIMEOUT,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Make sure the collection exists and has TTL expiry enabled on the
    /// expiry attribute, retrying each step with `policy`.
    ///
    /// Failure after the last attempt is fatal to startup.
    pub async fn provision(&self, policy: &RetryPolicy) -> Result<(), StoreError> {
        let spec = CollectionSpec::on_demand(self.collection.clone());
        let provisioning_err = |e: StoreError| StoreError::Provisioning {
            collection: self.collection.clone(),
            reason: e.to_string(),
        };

        let outcome = retry_with_backoff(policy, "ensure_collection", || {
            self.bounded("ensure_collection", self.backend.ensure_collection(&spec))
        })
        .await
        .map_err(provisioning_err)?;

        if outcome == EnsureOutcome::Created {
            tracing::info!(
                backend = self.backend.name(),
                collection = %self.collection,
                "Created access collection"
            );
        }

        retry_with_backoff(policy, "enable_expiry", || {
            self.bounded(
                "enable_expiry",
                self.backend.enable_expiry(&self.collection, EXPIRY_ATTRIBUTE),
            )
        })
        .await
        .map_err(provisioning_err)?;

        tracing::info!(
            backend = self.backend.name(),
            collection = %self.collection,
            attribute = EXPIRY_ATTRIBUTE,
            "Expiry enabled on access collection"
        );
        Ok(())
    }

    /// Physically drop expired entries. Returns the number removed.
    pub async fn reclaim_expired(&self) -> Result<u64, StoreError> {
        let now = self.clock.now();
        self.bounded(
            "reclaim_expired",
            self.backend.reclaim_expired(&self.collection, now),
        )
        .await
    }

    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    operation = operation,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Store call timed out"
                );
                Err(StoreError::Timeout {
                    operation,
                    after: self.timeout,
                })
            }
        }
    }
}

#[async_trait]
impl<B: ExpiryBackend + ?Sized> AccessBackend for AccessStore<B> {
    async fn set(&self, key: &str) -> Result<(), StoreError> {
        let entry = AccessEntry::expiring_after(key, self.clock.now(), self.ttl);
        self.bounded("set", self.backend.put_item(&self.collection, &entry))
            .await?;
        tracing::debug!(key = %key, expires_at = %entry.expires_at, "Stored access entry");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<bool, StoreError> {
        let entry = self
            .bounded("get", self.backend.get_item(&self.collection, key))
            .await?;
        let live = entry
            .map(|e| e.is_live_at(self.clock.now()))
            .unwrap_or(false);
        tracing::debug!(key = %key, live = live, "Looked up access entry");
        Ok(live)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.bounded("delete", self.backend.delete_item(&self.collection, key))
            .await?;
        tracing::debug!(key = %key, "Deleted access entry");
        Ok(())
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryExpiryBackend;
    use chrono::{DateTime, Utc};
    use knockrd_core::ManualClock;

    async fn provisioned_store(clock: Arc<ManualClock>) -> AccessStore<InMemoryExpiryBackend> {
        let store = AccessStore::new(Arc::new(InMemoryExpiryBackend::new()), "knockrd")
            .with_ttl(Duration::from_secs(60))
            .with_clock(clock);
        store
            .provision(&RetryPolicy::default())
            .await
            .expect("provision");
        store
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let clock = Arc::new(ManualClock::at_epoch_2024());
        let store = provisioned_store(clock).await;
        store.set("198.51.100.1").await.expect("set");
        assert!(store.get("198.51.100.1").await.expect("get"));
        assert!(!store.get("198.51.100.2").await.expect("get"));
    }

    #[tokio::test]
    async fn test_expiry_boundary() {
        let clock = Arc::new(ManualClock::at_epoch_2024());
        let store = provisioned_store(clock.clone()).await;
        store.set("k").await.expect("set");

        clock.advance(Duration::from_secs(59));
        assert!(store.get("k").await.expect("get"));

        clock.advance(Duration::from_secs(1));
        assert!(!store.get("k").await.expect("get at exactly ttl"));
    }

    #[tokio::test]
    async fn test_set_refreshes_expiry() {
        let clock = Arc::new(ManualClock::at_epoch_2024());
        let store = provisioned_store(clock.clone()).await;
        store.set("k").await.expect("set");
        clock.advance(Duration::from_secs(45));
        store.set("k").await.expect("set again");
        clock.advance(Duration::from_secs(45));
        assert!(store.get("k").await.expect("get"));
    }

    #[tokio::test]
    async fn test_expired_entry_still_present_reads_false() {
        let clock = Arc::new(ManualClock::at_epoch_2024());
        let store = provisioned_store(clock.clone()).await;
        store.set("k").await.expect("set");
        clock.advance(Duration::from_secs(120));

        assert_eq!(store.backend().item_count("knockrd").await, 1);
        assert!(!store.get("k").await.expect("get"));

        assert_eq!(store.reclaim_expired().await.expect("reclaim"), 1);
        assert_eq!(store.backend().item_count("knockrd").await, 0);
    }

    #[tokio::test]
    async fn test_delete_absent_is_ok() {
        let clock = Arc::new(ManualClock::at_epoch_2024());
        let store = provisioned_store(clock).await;
        store.delete("never-set").await.expect("delete");
        store.set("k").await.expect("set");
        store.delete("k").await.expect("delete");
        assert!(!store.get("k").await.expect("get"));
    }

    #[tokio::test]
    async fn test_provision_is_idempotent() {
        let clock = Arc::new(ManualClock::at_epoch_2024());
        let store = provisioned_store(clock).await;
        store
            .provision(&RetryPolicy::default())
            .await
            .expect("second provision");
        let meta = store
            .backend()
            .describe("knockrd")
            .await
            .expect("describe")
            .expect("exists");
        assert_eq!(meta.expiry_attribute.as_deref(), Some(EXPIRY_ATTRIBUTE));
    }

    #[tokio::test]
    async fn test_unprovisioned_store_surfaces_unavailable() {
        let store = AccessStore::new(Arc::new(InMemoryExpiryBackend::new()), "knockrd");
        let err = store.get("k").await.expect_err("no collection");
        assert!(err.is_transient());
    }

    struct StalledBackend;

    #[async_trait]
    impl ExpiryBackend for StalledBackend {
        fn name(&self) -> &'static str {
            "stalled"
        }

        async fn ensure_collection(
            &self,
            _spec: &CollectionSpec,
        ) -> Result<EnsureOutcome, StoreError> {
            std::future::pending().await
        }

        async fn enable_expiry(&self, _c: &str, _a: &str) -> Result<(), StoreError> {
            std::future::pending().await
        }

        async fn describe(
            &self,
            _c: &str,
        ) -> Result<Option<crate::backend::CollectionMeta>, StoreError> {
            Ok(None)
        }

        async fn get_item(&self, _c: &str, _k: &str) -> Result<Option<AccessEntry>, StoreError> {
            std::future::pending().await
        }

        async fn put_item(&self, _c: &str, _e: &AccessEntry) -> Result<(), StoreError> {
            std::future::pending().await
        }

        async fn delete_item(&self, _c: &str, _k: &str) -> Result<(), StoreError> {
            std::future::pending().await
        }

        async fn reclaim_expired(&self, _c: &str, _n: DateTime<Utc>) -> Result<u64, StoreError> {
            Ok(0)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_calls_time_out() {
        let store = AccessStore::new(Arc::new(StalledBackend), "knockrd")
            .with_timeout(Duration::from_millis(250));

        let err = store.get("k").await.expect_err("timeout");
        assert_eq!(
            err,
            StoreError::Timeout {
                operation: "get",
                after: Duration::from_millis(250),
            }
        );
        assert!(err.is_transient());
        assert!(matches!(
            store.set("k").await,
            Err(StoreError::Timeout { operation: "set", .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_provision_failure_is_fatal() {
        let store = AccessStore::new(Arc::new(StalledBackend), "knockrd")
            .with_timeout(Duration::from_millis(100));
        let policy = RetryPolicy {
            min_delay_ms: 1,
            max_delay_ms: 5,
            max_attempts: 3,
        };
        let err = store.provision(&policy).await.expect_err("never provisions");
        assert!(matches!(err, StoreError::Provisioning { ref collection, .. } if collection == "knockrd"));
    }

    #[test]
    fn test_debug_omits_clock() {
        let store = AccessStore::new(Arc::new(InMemoryExpiryBackend::new()), "knockrd");
        let rendered = format!("{:?}", store);
        assert!(rendered.contains("memory"));
        assert!(rendered.contains("knockrd"));
    }
}
