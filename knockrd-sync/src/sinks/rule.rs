//! Rule-based sink: directional ingress rules per target.
//!
//! Add events become one authorize call and Delete events one revoke call
//! per target, each carrying both families. The two calls are independent
//! and unordered. Authorizing a range that is already present, or revoking
//! one that is absent, is a no-op; when a provider rejects a multi-range
//! call for that reason the ranges are retried one by one so the rest land.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::SecondsFormat;
use futures_util::future::join_all;
use knockrd_core::{
    AddressFamily, ChangeEvent, Clock, FamilyEvents, RuleTarget, SinkError, SystemClock,
};

use crate::sink::{bounded, Sink, SinkFailure, SinkKind};

const SINK_NAME: &str = "security-group";

/// One address range in an ingress call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IpRange {
    pub cidr: String,
    pub description: Option<String>,
}

/// Ranges for one call, split by family.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    pub v4: Vec<IpRange>,
    pub v6: Vec<IpRange>,
}

impl RangeSet {
    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }

    pub fn len(&self) -> usize {
        self.v4.len() + self.v6.len()
    }

    pub fn cidrs(&self) -> Vec<String> {
        self.v4
            .iter()
            .chain(self.v6.iter())
            .map(|r| r.cidr.clone())
            .collect()
    }

    /// One single-range set per range, v4 first.
    fn split(&self) -> Vec<RangeSet> {
        let v4 = self.v4.iter().map(|r| RangeSet {
            v4: vec![r.clone()],
            v6: Vec::new(),
        });
        let v6 = self.v6.iter().map(|r| RangeSet {
            v4: Vec::new(),
            v6: vec![r.clone()],
        });
        v4.chain(v6).collect()
    }

    fn from_events<'a>(
        events: impl Iterator<Item = &'a ChangeEvent>,
        description: Option<&str>,
    ) -> Self {
        let mut seen = HashSet::new();
        let mut set = RangeSet::default();
        for event in events {
            let cidr = event.cidr();
            if !seen.insert(cidr.clone()) {
                continue;
            }
            let range = IpRange {
                cidr,
                description: description.map(str::to_string),
            };
            match event.family() {
                AddressFamily::V4 => set.v4.push(range),
                AddressFamily::V6 => set.v6.push(range),
            }
        }
        set
    }
}

/// Remote boundary of a rule-based sink.
#[async_trait]
pub trait IngressClient: Send + Sync {
    async fn authorize_ingress(&self, target: &RuleTarget, ranges: &RangeSet)
        -> Result<(), SinkError>;

    async fn revoke_ingress(&self, target: &RuleTarget, ranges: &RangeSet)
        -> Result<(), SinkError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Authorize,
    Revoke,
}

impl Direction {
    fn operation(self) -> &'static str {
        match self {
            Self::Authorize => "authorize_ingress",
            Self::Revoke => "revoke_ingress",
        }
    }
}

/// Applies events to every configured rule target.
pub struct RuleSink {
    client: Arc<dyn IngressClient>,
    targets: Vec<RuleTarget>,
    timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RuleSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleSink")
            .field("targets", &self.targets)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RuleSink {
    pub fn new(client: Arc<dyn IngressClient>, targets: Vec<RuleTarget>, timeout: Duration) -> Self {
        Self {
            client,
            targets,
            timeout,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Description attached to authorized ranges.
    pub fn description(&self) -> String {
        format!(
            "by knockrd at {}",
            self.clock.now().to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }

    async fn call(
        &self,
        direction: Direction,
        target: &RuleTarget,
        ranges: &RangeSet,
    ) -> Result<(), SinkError> {
        let fut = match direction {
            Direction::Authorize => self.client.authorize_ingress(target, ranges),
            Direction::Revoke => self.client.revoke_ingress(target, ranges),
        };
        bounded(SINK_NAME, direction.operation(), self.timeout, fut).await
    }

    /// Issue one call, tolerating no-op rejections. Failures are returned.
    async fn issue(
        &self,
        direction: Direction,
        target: &RuleTarget,
        ranges: &RangeSet,
    ) -> Vec<SinkFailure> {
        if ranges.is_empty() {
            return Vec::new();
        }
        let fail = |error: SinkError| SinkFailure::new(SinkKind::Rule, target.id.clone(), error);

        match self.call(direction, target, ranges).await {
            Ok(()) => {
                tracing::info!(
                    group = %target.id,
                    operation = direction.operation(),
                    ranges = ?ranges.cidrs(),
                    "Updated security group"
                );
                Vec::new()
            }
            Err(e) if e.is_noop() && ranges.len() == 1 => {
                tracing::debug!(group = %target.id, error = %e, "Ingress rule already in desired state");
                Vec::new()
            }
            Err(e) if e.is_noop() => {
                tracing::debug!(
                    group = %target.id,
                    operation = direction.operation(),
                    error = %e,
                    "Retrying ranges individually after no-op rejection"
                );
                let mut failures = Vec::new();
                for single in ranges.split() {
                    match self.call(direction, target, &single).await {
                        Ok(()) => {}
                        Err(e) if e.is_noop() => {}
                        Err(e) => failures.push(fail(e)),
                    }
                }
                failures
            }
            Err(e) => vec![fail(e)],
        }
    }

    async fn apply_target(
        &self,
        target: &RuleTarget,
        authorize: &RangeSet,
        revoke: &RangeSet,
    ) -> Vec<SinkFailure> {
        let (authorized, revoked) = futures_util::join!(
            self.issue(Direction::Authorize, target, authorize),
            self.issue(Direction::Revoke, target, revoke),
        );
        authorized.into_iter().chain(revoked).collect()
    }
}

#[async_trait]
impl Sink for RuleSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Rule
    }

    fn targets(&self) -> Vec<String> {
        self.targets.iter().map(|t| t.id.clone()).collect()
    }

    async fn apply(&self, events: &FamilyEvents) -> Result<(), Vec<SinkFailure>> {
        let description = self.description();
        let authorize = RangeSet::from_events(
            events.iter().filter(|e| e.is_add()),
            Some(description.as_str()),
        );
        let revoke = RangeSet::from_events(events.iter().filter(|e| !e.is_add()), None);
        if authorize.is_empty() && revoke.is_empty() {
            return Ok(());
        }

        let failures: Vec<SinkFailure> = join_all(
            self.targets
                .iter()
                .map(|target| self.apply_target(target, &authorize, &revoke)),
        )
        .await
        .into_iter()
        .flatten()
        .collect();

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

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RuleKey {
    protocol: String,
    from_port: i64,
    to_port: i64,
    cidr: String,
}

impl RuleKey {
    fn new(target: &RuleTarget, cidr: &str) -> Self {
        Self {
            protocol: target.protocol.clone(),
            from_port: target.from_port,
            to_port: target.to_port,
            cidr: cidr.to_string(),
        }
    }
}

/// [`IngressClient`] over a local map of groups.
///
/// Like a real provider it rejects a whole call when any range is already
/// present (authorize) or absent (revoke). Groups are created on first use.
#[derive(Debug, Default)]
pub struct InMemorySecurityGroup {
    groups: Mutex<HashMap<String, HashMap<RuleKey, Option<String>>>>,
    authorize_calls: AtomicUsize,
    revoke_calls: AtomicUsize,
}

impl InMemorySecurityGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// CIDRs currently allowed on `group` for `target`'s port template, sorted.
    pub fn allowed(&self, target: &RuleTarget) -> Vec<String> {
        let groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        let mut cidrs: Vec<String> = groups
            .get(&target.id)
            .map(|rules| {
                rules
                    .keys()
                    .filter(|k| {
                        k.protocol == target.protocol
                            && k.from_port == target.from_port
                            && k.to_port == target.to_port
                    })
                    .map(|k| k.cidr.clone())
                    .collect()
            })
            .unwrap_or_default();
        cidrs.sort();
        cidrs
    }

    /// Description stored with an allowed range.
    pub fn description(&self, target: &RuleTarget, cidr: &str) -> Option<String> {
        let groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        groups
            .get(&target.id)
            .and_then(|rules| rules.get(&RuleKey::new(target, cidr)).cloned())
            .flatten()
    }

    pub fn authorize_calls(&self) -> usize {
        self.authorize_calls.load(Ordering::SeqCst)
    }

    pub fn revoke_calls(&self) -> usize {
        self.revoke_calls.load(Ordering::SeqCst)
    }
}

fn all_ranges(ranges: &RangeSet) -> impl Iterator<Item = &IpRange> {
    ranges.v4.iter().chain(ranges.v6.iter())
}

#[async_trait]
impl IngressClient for InMemorySecurityGroup {
    async fn authorize_ingress(
        &self,
        target: &RuleTarget,
        ranges: &RangeSet,
    ) -> Result<(), SinkError> {
        self.authorize_calls.fetch_add(1, Ordering::SeqCst);
        let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        let rules = groups.entry(target.id.clone()).or_default();

        let duplicates: Vec<String> = all_ranges(ranges)
            .filter(|r| rules.contains_key(&RuleKey::new(target, &r.cidr)))
            .map(|r| r.cidr.clone())
            .collect();
        if !duplicates.is_empty() {
            return Err(SinkError::DuplicateRule {
                target: target.id.clone(),
                ranges: duplicates,
            });
        }
        for range in all_ranges(ranges) {
            rules.insert(RuleKey::new(target, &range.cidr), range.description.clone());
        }
        Ok(())
    }

    async fn revoke_ingress(
        &self,
        target: &RuleTarget,
        ranges: &RangeSet,
    ) -> Result<(), SinkError> {
        self.revoke_calls.fetch_add(1, Ordering::SeqCst);
        let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        let rules = groups.entry(target.id.clone()).or_default();

        let absent: Vec<String> = all_ranges(ranges)
            .filter(|r| !rules.contains_key(&RuleKey::new(target, &r.cidr)))
            .map(|r| r.cidr.clone())
            .collect();
        if !absent.is_empty() {
            return Err(SinkError::RuleNotFound {
                target: target.id.clone(),
                ranges: absent,
            });
        }
        for range in all_ranges(ranges) {
            rules.remove(&RuleKey::new(target, &range.cidr));
        }
        Ok(())
    }
}
