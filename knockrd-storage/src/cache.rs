//! Positive/negative lookup cache in front of the access store.
//!
//! # Semantics
//!
//! - `get` answers from a fresh cache entry when one exists. Hits never
//!   extend an entry's lifetime.
//! - On a miss the store is consulted and the answer cached: positive
//!   answers for the positive TTL, negative answers for the (shorter)
//!   negative TTL.
//! - `set` writes through. A failed store write purges the key so an
//!   unconfirmed positive is never served.
//! - `delete` purges the key before deleting from the store.
//! - A positive answer cached on a miss can outlive the stored record by up
//!   to the positive TTL, since the store does not report remaining
//!   lifetime. Keep the positive TTL well below the access TTL.
//!
//! Entries live in a sharded concurrent map; there is no cross-key lock and
//! no background refresh. Every [`DEFAULT_PURGE_INTERVAL`] inserts the map is
//! swept for expired entries, so keys that are never looked up again do not
//! accumulate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use knockrd_core::{Clock, StoreError, SystemClock};

use crate::store::AccessBackend;

/// Inserts between sweeps of expired entries.
pub const DEFAULT_PURGE_INTERVAL: u64 = 1024;

/// Cached answer for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Positive,
    Negative,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub state: CacheState,
    pub cached_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn expires_at(&self) -> DateTime<Utc> {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        self.cached_at
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at()
    }
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Fresh positive entries served.
    pub hits: u64,
    /// Fresh negative entries served.
    pub negative_hits: u64,
    /// Lookups that went to the store.
    pub misses: u64,
    /// Entries currently held, fresh or not.
    pub entry_count: u64,
    /// Entries dropped because they had expired.
    pub evictions: u64,
}

impl CacheStats {
    /// Fraction of lookups answered from cache (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let answered = self.hits + self.negative_hits;
        let total = answered + self.misses;
        if total == 0 {
            0.0
        } else {
            answered as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    negative_hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    inserts: AtomicU64,
}

/// Caching decorator over any [`AccessBackend`], usually an
/// [`AccessStore`](crate::AccessStore).
pub struct AccessCache<S: AccessBackend + ?Sized = dyn AccessBackend> {
    inner: Arc<S>,
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
    negative_ttl: Duration,
    purge_interval: u64,
    clock: Arc<dyn Clock>,
    counters: Counters,
}

impl<S: AccessBackend + ?Sized> std::fmt::Debug for AccessCache<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessCache")
            .field("entries", &self.entries.len())
            .field("ttl", &self.ttl)
            .field("negative_ttl", &self.negative_ttl)
            .finish()
    }
}

impl<S: AccessBackend + ?Sized> AccessCache<S> {
    pub fn new(inner: Arc<S>, ttl: Duration, negative_ttl: Duration) -> Self {
        Self {
            inner,
            entries: DashMap::new(),
            ttl,
            negative_ttl,
            purge_interval: DEFAULT_PURGE_INTERVAL,
            clock: Arc::new(SystemClock),
            counters: Counters::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sweep expired entries every `interval` inserts. Zero disables the sweep.
    pub fn with_purge_interval(mut self, interval: u64) -> Self {
        self.purge_interval = interval;
        self
    }

    pub fn inner(&self) -> &Arc<S> {
        &self.inner
    }

    pub fn cache_ttl(&self) -> Duration {
        self.ttl
    }

    pub fn negative_ttl(&self) -> Duration {
        self.negative_ttl
    }

    /// The cached entry for `key`, fresh or not.
    pub fn peek(&self, key: &str) -> Option<CacheEntry> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    /// Drop every expired entry. Returns the number dropped.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_fresh_at(now));
        let purged = before.saturating_sub(self.entries.len());
        self.counters
            .evictions
            .fetch_add(purged as u64, Ordering::Relaxed);
        purged
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            negative_hits: self.counters.negative_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            entry_count: self.entries.len() as u64,
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }

    /// Fresh cached answer, if any. Expired entries are dropped on sight.
    fn lookup(&self, key: &str, now: DateTime<Utc>) -> Option<CacheState> {
        let state = {
            let entry = self.entries.get(key)?;
            entry.is_fresh_at(now).then_some(entry.state)
        };
        if state.is_none()
            && self
                .entries
                .remove_if(key, |_, e| !e.is_fresh_at(now))
                .is_some()
        {
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        }
        state
    }

    fn remember(&self, key: &str, state: CacheState, now: DateTime<Utc>) {
        let ttl = match state {
            CacheState::Positive => self.ttl,
            CacheState::Negative => self.negative_ttl,
        };
        if ttl.is_zero() {
            return;
        }
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                state,
                cached_at: now,
                ttl,
            },
        );

        let inserted = self.counters.inserts.fetch_add(1, Ordering::Relaxed) + 1;
        if self.purge_interval > 0 && inserted % self.purge_interval == 0 {
            let purged = self.purge_expired();
            if purged > 0 {
                tracing::debug!(purged, remaining = self.entries.len(), "Swept expired cache entries");
            }
        }
    }
}

#[async_trait]
impl<S: AccessBackend + ?Sized> AccessBackend for AccessCache<S> {
    async fn set(&self, key: &str) -> Result<(), StoreError> {
        if let Err(e) = self.inner.set(key).await {
            self.entries.remove(key);
            tracing::debug!(key = %key, error = %e, "Store write failed, purged cache entry");
            return Err(e);
        }
        self.remember(key, CacheState::Positive, self.clock.now());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<bool, StoreError> {
        match self.lookup(key, self.clock.now()) {
            Some(CacheState::Positive) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %key, "Cache hit");
                return Ok(true);
            }
            Some(CacheState::Negative) => {
                self.counters.negative_hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %key, "Negative cache hit");
                return Ok(false);
            }
            None => {}
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(key = %key, "Cache miss");
        let allowed = self.inner.get(key).await?;
        let state = if allowed {
            CacheState::Positive
        } else {
            CacheState::Negative
        };
        self.remember(key, state, self.clock.now());
        Ok(allowed)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        self.inner.delete(key).await
    }

    fn ttl(&self) -> Duration {
        self.inner.ttl()
    }
}
