//! knockrd Storage - Access State
//!
//! The authoritative TTL store for allow-list entries, the expiry backends it
//! runs on, and the positive/negative cache the request path reads through.
//!
//! Request path: caller → [`AccessCache`] → [`AccessStore`] → [`ExpiryBackend`].
//! Both the cache and the store implement [`AccessBackend`], so callers can be
//! handed either one.

pub mod backend;
pub mod cache;
pub mod retry;
pub mod store;

pub use backend::{
    CapacityMode, CollectionMeta, CollectionSpec, EnsureOutcome, ExpiryBackend,
    InMemoryExpiryBackend, LmdbExpiryBackend, LmdbStoreError,
};
pub use cache::{AccessCache, CacheEntry, CacheState, CacheStats, DEFAULT_PURGE_INTERVAL};
pub use retry::retry_with_backoff;
pub use store::{AccessBackend, AccessStore, DEFAULT_TIMEOUT, DEFAULT_TTL};
