//! knockrd Sync - Propagation
//!
//! Applies access-state changes to external enforcement points.
//!
//! Propagation path: mutation-log batch → extraction → [`Reconciler`] →
//! [`Sink`] adapters. Three sink kinds ship:
//! - [`ListSink`]: membership sets under an optimistic version token
//! - [`RuleSink`]: directional ingress rules per target
//! - [`KvSink`]: one mirrored key per allowed address
//!
//! [`KnockContext`] builds the store, cache and reconciler once at startup.

pub mod context;
pub mod reconcile;
pub mod sink;
pub mod sinks;

pub use context::{KnockContext, SinkClients};
pub use reconcile::{ReconcileError, ReconcileReport, Reconciler};
pub use sink::{Sink, SinkFailure, SinkKind};
pub use sinks::{
    updated_members, ConsulKvClient, IngressClient, InMemoryIpSet, InMemoryKv,
    InMemorySecurityGroup, IpRange, IpSetClient, IpSetSnapshot, KvClient, KvSink, ListSink,
    RangeSet, RuleSink,
};
