//! Expiry backends: the item-level and administrative boundary the access
//! store talks to.
//!
//! A backend holds named collections of [`AccessEntry`] items. Provisioning
//! calls (`ensure_collection`, `enable_expiry`) are idempotent: a collection
//! or expiry setting that already exists is success.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use knockrd_core::{AccessEntry, StoreError};
use serde::{Deserialize, Serialize};

pub mod lmdb;
pub mod memory;

pub use lmdb::{LmdbExpiryBackend, LmdbStoreError};
pub use memory::InMemoryExpiryBackend;

/// How capacity is provisioned for a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CapacityMode {
    #[default]
    OnDemand,
    Provisioned,
}

/// Requested shape of a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSpec {
    pub name: String,
    pub capacity: CapacityMode,
}

impl CollectionSpec {
    pub fn on_demand(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capacity: CapacityMode::OnDemand,
        }
    }
}

/// Metadata a backend records per collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionMeta {
    pub capacity: CapacityMode,
    /// Attribute TTL reclamation is enabled on, if any.
    pub expiry_attribute: Option<String>,
}

/// Outcome of [`ExpiryBackend::ensure_collection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    Created,
    AlreadyExists,
}

#[async_trait]
pub trait ExpiryBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Create the collection if it does not exist.
    async fn ensure_collection(&self, spec: &CollectionSpec) -> Result<EnsureOutcome, StoreError>;

    /// Enable TTL reclamation on `attribute`. Enabling the same attribute
    /// twice is a no-op.
    async fn enable_expiry(&self, collection: &str, attribute: &str) -> Result<(), StoreError>;

    /// Recorded metadata, or `None` when the collection does not exist.
    async fn describe(&self, collection: &str) -> Result<Option<CollectionMeta>, StoreError>;

    /// The stored entry, whether or not it is past expiry.
    async fn get_item(&self, collection: &str, key: &str)
        -> Result<Option<AccessEntry>, StoreError>;

    async fn put_item(&self, collection: &str, entry: &AccessEntry) -> Result<(), StoreError>;

    /// Deleting an absent key succeeds.
    async fn delete_item(&self, collection: &str, key: &str) -> Result<(), StoreError>;

    /// Physically remove entries past expiry in collections with expiry
    /// enabled. Returns the number removed. Reads never depend on this
    /// having run.
    async fn reclaim_expired(&self, collection: &str, now: DateTime<Utc>)
        -> Result<u64, StoreError>;
}

pub(crate) fn missing_collection(collection: &str) -> StoreError {
    StoreError::Unavailable {
        reason: format!("collection {} does not exist", collection),
    }
}
