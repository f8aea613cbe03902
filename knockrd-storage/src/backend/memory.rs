//! In-memory expiry backend for local runs and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use knockrd_core::{AccessEntry, StoreError};
use tokio::sync::RwLock;

use super::{
    missing_collection, CollectionMeta, CollectionSpec, EnsureOutcome, ExpiryBackend,
};

#[derive(Debug)]
struct Collection {
    meta: CollectionMeta,
    items: HashMap<String, AccessEntry>,
}

/// [`ExpiryBackend`] holding every collection in a lock-protected map.
///
/// Uses tokio::sync::RwLock for safe async access.
#[derive(Debug, Default)]
pub struct InMemoryExpiryBackend {
    collections: RwLock<HashMap<String, Collection>>,
}

impl InMemoryExpiryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of physically present entries, expired or not.
    pub async fn item_count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map(|c| c.items.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl ExpiryBackend for InMemoryExpiryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn ensure_collection(&self, spec: &CollectionSpec) -> Result<EnsureOutcome, StoreError> {
        let mut collections = self.collections.write().await;
        if collections.contains_key(&spec.name) {
            return Ok(EnsureOutcome::AlreadyExists);
        }
        collections.insert(
            spec.name.clone(),
            Collection {
                meta: CollectionMeta {
                    capacity: spec.capacity,
                    expiry_attribute: None,
                },
                items: HashMap::new(),
            },
        );
        Ok(EnsureOutcome::Created)
    }

    async fn enable_expiry(&self, collection: &str, attribute: &str) -> Result<(), StoreError> {
        let mut collections = self.collections.write().await;
        let state = collections
            .get_mut(collection)
            .ok_or_else(|| missing_collection(collection))?;
        state.meta.expiry_attribute = Some(attribute.to_string());
        Ok(())
    }

    async fn describe(&self, collection: &str) -> Result<Option<CollectionMeta>, StoreError> {
        Ok(self
            .collections
            .read()
            .await
            .get(collection)
            .map(|c| c.meta.clone()))
    }

    async fn get_item(
        &self,
        collection: &str,
        key: &str,
    ) -> Result<Option<AccessEntry>, StoreError> {
        let collections = self.collections.read().await;
        let state = collections
            .get(collection)
            .ok_or_else(|| missing_collection(collection))?;
        Ok(state.items.get(key).cloned())
    }

    async fn put_item(&self, collection: &str, entry: &AccessEntry) -> Result<(), StoreError> {
        let mut collections = self.collections.write().await;
        let state = collections
            .get_mut(collection)
            .ok_or_else(|| missing_collection(collection))?;
        state.items.insert(entry.key.clone(), entry.clone());
        Ok(())
    }

    async fn delete_item(&self, collection: &str, key: &str) -> Result<(), StoreError> {
        let mut collections = self.collections.write().await;
        let state = collections
            .get_mut(collection)
            .ok_or_else(|| missing_collection(collection))?;
        state.items.remove(key);
        Ok(())
    }

    async fn reclaim_expired(
        &self,
        collection: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut collections = self.collections.write().await;
        let state = collections
            .get_mut(collection)
            .ok_or_else(|| missing_collection(collection))?;
        if state.meta.expiry_attribute.is_none() {
            return Ok(0);
        }
        let before = state.items.len();
        state.items.retain(|_, entry| entry.is_live_at(now));
        Ok((before - state.items.len()) as u64)
    }
}
