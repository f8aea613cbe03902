//! Allow-list entries held by the access store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Name of the attribute that carries the expiry timestamp.
///
/// Backends enable TTL-based reclamation on this attribute when the
/// collection is provisioned.
pub const EXPIRY_ATTRIBUTE: &str = "expires";

/// A key granting access until `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessEntry {
    pub key: String,
    /// Expiry as Unix epoch milliseconds on the wire.
    #[serde(rename = "expires", with = "chrono::serde::ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
}

impl AccessEntry {
    pub fn new(key: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            expires_at,
        }
    }

    /// Build an entry that expires `ttl` after `now`.
    pub fn expiring_after(key: impl Into<String>, now: DateTime<Utc>, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let expires_at = now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self::new(key, expires_at)
    }

    /// True while `now` is strictly before the expiry.
    ///
    /// Freshness is always recomputed from the stored timestamp; an entry
    /// that is still physically present after its expiry is not live.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// Remaining lifetime at `now`, or `None` once expired.
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Option<Duration> {
        if !self.is_live_at(now) {
            return None;
        }
        (self.expires_at - now).to_std().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn epoch(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("valid timestamp")
    }

    #[test]
    fn test_live_strictly_before_expiry() {
        let entry = AccessEntry::expiring_after("198.51.100.1", epoch(1_000), Duration::from_secs(60));
        assert!(entry.is_live_at(epoch(1_000)));
        assert!(entry.is_live_at(epoch(1_059)));
        assert!(!entry.is_live_at(epoch(1_060)));
        assert!(!entry.is_live_at(epoch(2_000)));
    }

    #[test]
    fn test_remaining() {
        let entry = AccessEntry::new("k", epoch(100));
        assert_eq!(entry.remaining_at(epoch(40)), Some(Duration::from_secs(60)));
        assert_eq!(entry.remaining_at(epoch(100)), None);
    }

    #[test]
    fn test_serialized_expiry_attribute() {
        let entry = AccessEntry::new("k", epoch(1_700_000_000));
        let json = serde_json::to_value(&entry).expect("serialize");
        assert_eq!(json[EXPIRY_ATTRIBUTE], 1_700_000_000_000i64);

        let back: AccessEntry = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, entry);
    }

    #[test]
    fn test_huge_ttl_saturates() {
        let entry = AccessEntry::expiring_after("k", epoch(0), Duration::MAX);
        assert!(entry.is_live_at(epoch(4_000_000_000)));
    }
}
