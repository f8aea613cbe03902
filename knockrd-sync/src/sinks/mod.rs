//! Enforcement point implementations.
//!
//! Each sink pairs a [`Sink`](crate::Sink) adapter with a client trait at its
//! remote boundary and an in-memory client that honours the same contract.

pub mod consul;
pub mod kv;
pub mod list;
pub mod rule;

pub use consul::ConsulKvClient;
pub use kv::{InMemoryKv, KvClient, KvSink};
pub use list::{updated_members, InMemoryIpSet, IpSetClient, IpSetSnapshot, ListSink};
pub use rule::{IngressClient, InMemorySecurityGroup, IpRange, RangeSet, RuleSink};
