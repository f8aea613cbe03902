//! List-based sink: membership sets guarded by an optimistic version token.
//!
//! Each invocation reads the current members and token, computes the full
//! updated set, and writes it back once presenting the same token. A stale
//! token rejects the write and the set is left as it was; the next delivery
//! re-converges. There is no in-invocation retry.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use knockrd_core::{
    normalize_cidr, AddressFamily, ChangeEvent, FamilyEvents, ListTarget, SinkError,
};

use crate::sink::{bounded, Sink, SinkFailure, SinkKind};

const SINK_NAME: &str = "ipset";

/// Members and version token as read from the remote set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpSetSnapshot {
    pub members: Vec<String>,
    pub token: String,
}

/// Remote boundary of a list-based sink.
#[async_trait]
pub trait IpSetClient: Send + Sync {
    async fn read_set(&self, target: &ListTarget) -> Result<IpSetSnapshot, SinkError>;

    /// Replace the members. Fails with [`SinkError::Conflict`] when `token`
    /// is no longer current.
    async fn write_set(
        &self,
        target: &ListTarget,
        members: &[String],
        token: &str,
    ) -> Result<(), SinkError>;
}

/// Compute the updated member set.
///
/// Current members are normalized so they compare equal to event ranges;
/// members that do not parse are kept verbatim. Events are applied in order,
/// so the last event for an address wins.
pub fn updated_members(current: &[String], events: &[ChangeEvent]) -> Vec<String> {
    let mut members: BTreeSet<String> = current
        .iter()
        .map(|m| normalize_cidr(m).unwrap_or_else(|| m.clone()))
        .collect();
    for event in events {
        if event.is_add() {
            members.insert(event.cidr());
        } else {
            members.remove(&event.cidr());
        }
    }
    members.into_iter().collect()
}

/// Synchronizes per-family events into per-family list targets.
pub struct ListSink {
    client: Arc<dyn IpSetClient>,
    v4: Option<ListTarget>,
    v6: Option<ListTarget>,
    timeout: Duration,
}

impl std::fmt::Debug for ListSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListSink")
            .field("v4", &self.v4)
            .field("v6", &self.v6)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ListSink {
    pub fn new(
        client: Arc<dyn IpSetClient>,
        v4: Option<ListTarget>,
        v6: Option<ListTarget>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            v4,
            v6,
            timeout,
        }
    }

    fn target(&self, family: AddressFamily) -> Option<&ListTarget> {
        match family {
            AddressFamily::V4 => self.v4.as_ref(),
            AddressFamily::V6 => self.v6.as_ref(),
        }
    }

    async fn sync_family(
        &self,
        family: AddressFamily,
        events: &[ChangeEvent],
    ) -> Result<(), SinkFailure> {
        let Some(target) = self.target(family) else {
            if !events.is_empty() {
                tracing::debug!(family = %family, events = events.len(), "No list target for family");
            }
            return Ok(());
        };
        if events.is_empty() {
            return Ok(());
        }
        let fail = |error: SinkError| SinkFailure::new(SinkKind::List, target.id.clone(), error);

        let snapshot = bounded(
            SINK_NAME,
            "read_set",
            self.timeout,
            self.client.read_set(target),
        )
        .await
        .map_err(fail)?;

        let members = updated_members(&snapshot.members, events);

        bounded(
            SINK_NAME,
            "write_set",
            self.timeout,
            self.client.write_set(target, &members, &snapshot.token),
        )
        .await
        .map_err(fail)?;

        tracing::info!(
            target = %target.name,
            scope = %target.scope,
            family = %family,
            members = members.len(),
            "Updated IP set"
        );
        Ok(())
    }
}

#[async_trait]
impl Sink for ListSink {
    fn kind(&self) -> SinkKind {
        SinkKind::List
    }

    fn targets(&self) -> Vec<String> {
        self.v4
            .iter()
            .chain(self.v6.iter())
            .map(|t| t.id.clone())
            .collect()
    }

    async fn apply(&self, events: &FamilyEvents) -> Result<(), Vec<SinkFailure>> {
        let (v4, v6) = futures_util::join!(
            self.sync_family(AddressFamily::V4, &events.v4),
            self.sync_family(AddressFamily::V6, &events.v6),
        );
        let failures: Vec<SinkFailure> = [v4, v6].into_iter().filter_map(Result::err).collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures)
        }
    }
}

// ============================================================================
// IN-MEMORY IMPLEMENTATION
// ============================================================================

#[derive(Debug, Clone)]
struct StoredSet {
    members: Vec<String>,
    token: String,
}

/// [`IpSetClient`] over a local map, with the same optimistic-lock
/// behaviour as a remote set.
#[derive(Debug, Default)]
pub struct InMemoryIpSet {
    sets: Mutex<HashMap<String, StoredSet>>,
}

impl InMemoryIpSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace a set, issuing a fresh token.
    pub fn insert_set(&self, id: &str, members: &[&str]) {
        let mut sets = self.sets.lock().unwrap_or_else(|e| e.into_inner());
        sets.insert(
            id.to_string(),
            StoredSet {
                members: members.iter().map(|m| m.to_string()).collect(),
                token: new_token(),
            },
        );
    }

    /// Current members, sorted.
    pub fn members(&self, id: &str) -> Option<Vec<String>> {
        let sets = self.sets.lock().unwrap_or_else(|e| e.into_inner());
        sets.get(id).map(|s| {
            let mut members = s.members.clone();
            members.sort();
            members
        })
    }

    /// Issue a new token without changing members, as a concurrent writer
    /// would.
    pub fn bump_token(&self, id: &str) {
        let mut sets = self.sets.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(set) = sets.get_mut(id) {
            set.token = new_token();
        }
    }
}

fn new_token() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn nonexistent(target: &ListTarget) -> SinkError {
    SinkError::Rejected {
        sink: SINK_NAME,
        status: 404,
        reason: format!("IP set {} does not exist", target.id),
    }
}

#[async_trait]
impl IpSetClient for InMemoryIpSet {
    async fn read_set(&self, target: &ListTarget) -> Result<IpSetSnapshot, SinkError> {
        let sets = self.sets.lock().unwrap_or_else(|e| e.into_inner());
        let set = sets.get(&target.id).ok_or_else(|| nonexistent(target))?;
        Ok(IpSetSnapshot {
            members: set.members.clone(),
            token: set.token.clone(),
        })
    }

    async fn write_set(
        &self,
        target: &ListTarget,
        members: &[String],
        token: &str,
    ) -> Result<(), SinkError> {
        let mut sets = self.sets.lock().unwrap_or_else(|e| e.into_inner());
        let set = sets.get_mut(&target.id).ok_or_else(|| nonexistent(target))?;
        if set.token != token {
            return Err(SinkError::Conflict {
                target: target.id.clone(),
            });
        }
        set.members = members.to_vec();
        set.token = new_token();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use knockrd_core::{Action, ListScope};
    use std::net::IpAddr;

    fn target(id: &str) -> ListTarget {
        ListTarget {
            id: id.to_string(),
            name: format!("{}-name", id),
            scope: ListScope::Regional,
        }
    }

    fn event(addr: &str, action: Action) -> ChangeEvent {
        ChangeEvent::new(addr.parse::<IpAddr>().expect("ip"), action)
    }

    fn sink(client: Arc<InMemoryIpSet>) -> ListSink {
        ListSink::new(
            client,
            Some(target("v4")),
            Some(target("v6")),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_updated_members() {
        let current = vec!["203.0.113.0/32".to_string()];
        let events = vec![
            event("198.51.100.1", Action::Add),
            event("203.0.113.0", Action::Delete),
        ];
        assert_eq!(
            updated_members(&current, &events),
            vec!["198.51.100.1/32".to_string()]
        );
    }

    #[test]
    fn test_updated_members_normalizes_and_keeps_unparseable() {
        let current = vec![
            "2001:0db8::0001/128".to_string(),
            "garbage".to_string(),
        ];
        let events = vec![event("2001:db8::1", Action::Delete)];
        assert_eq!(updated_members(&current, &events), vec!["garbage".to_string()]);
    }

    #[test]
    fn test_updated_members_last_event_wins() {
        let events = vec![
            event("198.51.100.1", Action::Add),
            event("198.51.100.1", Action::Delete),
            event("198.51.100.2", Action::Delete),
            event("198.51.100.2", Action::Add),
        ];
        assert_eq!(
            updated_members(&[], &events),
            vec!["198.51.100.2/32".to_string()]
        );
    }

    #[tokio::test]
    async fn test_apply_routes_families() {
        let client = Arc::new(InMemoryIpSet::new());
        client.insert_set("v4", &["203.0.113.0/32"]);
        client.insert_set("v6", &[]);
        let events: FamilyEvents = vec![
            event("198.51.100.1", Action::Add),
            event("203.0.113.0", Action::Delete),
            event("2001:db8::1", Action::Add),
        ]
        .into_iter()
        .collect();

        sink(client.clone()).apply(&events).await.expect("apply");

        assert_eq!(client.members("v4"), Some(vec!["198.51.100.1/32".to_string()]));
        assert_eq!(client.members("v6"), Some(vec!["2001:db8::1/128".to_string()]));
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let client = Arc::new(InMemoryIpSet::new());
        client.insert_set("v4", &[]);
        client.insert_set("v6", &[]);
        let events: FamilyEvents = vec![event("198.51.100.1", Action::Add)].into_iter().collect();
        let sink = sink(client.clone());

        sink.apply(&events).await.expect("first");
        sink.apply(&events).await.expect("replay");
        assert_eq!(client.members("v4"), Some(vec!["198.51.100.1/32".to_string()]));
    }

    #[tokio::test]
    async fn test_stale_token_rejected() {
        let client = Arc::new(InMemoryIpSet::new());
        client.insert_set("v4", &["203.0.113.0/32"]);
        let stale = client.read_set(&target("v4")).await.expect("read");
        client.bump_token("v4");

        let err = client
            .write_set(&target("v4"), &["198.51.100.1/32".to_string()], &stale.token)
            .await
            .expect_err("stale");
        assert!(err.is_conflict());
        assert_eq!(client.members("v4"), Some(vec!["203.0.113.0/32".to_string()]));
    }

    #[tokio::test]
    async fn test_family_without_events_issues_no_calls() {
        let client = Arc::new(InMemoryIpSet::new());
        client.insert_set("v4", &[]);
        // No v6 set exists: a read would fail with 404.
        let events: FamilyEvents = vec![event("198.51.100.1", Action::Add)].into_iter().collect();
        sink(client.clone()).apply(&events).await.expect("apply");
    }

    #[tokio::test]
    async fn test_missing_set_reported() {
        let client = Arc::new(InMemoryIpSet::new());
        client.insert_set("v4", &[]);
        let events: FamilyEvents = vec![
            event("198.51.100.1", Action::Add),
            event("2001:db8::1", Action::Add),
        ]
        .into_iter()
        .collect();

        let failures = sink(client.clone())
            .apply(&events)
            .await
            .expect_err("v6 set missing");
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].kind, SinkKind::List);
        assert_eq!(failures[0].target, "v6");
        assert_eq!(client.members("v4"), Some(vec!["198.51.100.1/32".to_string()]));
    }
}
