//! Enforcement sink targets.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Where a list-based sink lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ListScope {
    #[serde(rename = "REGIONAL", alias = "regional")]
    Regional,
    #[serde(rename = "CLOUDFRONT", alias = "cloudfront")]
    CloudFront,
}

impl fmt::Display for ListScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Regional => write!(f, "REGIONAL"),
            Self::CloudFront => write!(f, "CLOUDFRONT"),
        }
    }
}

/// A named, versioned set of address ranges.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListTarget {
    pub id: String,
    pub name: String,
    pub scope: ListScope,
}

/// A group of directional ingress rules sharing one protocol/port template.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleTarget {
    pub id: String,
    pub from_port: i64,
    pub to_port: i64,
    pub protocol: String,
}

/// Namespace under which the key-value mirror writes one key per address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KvTarget {
    pub prefix: String,
}

impl KvTarget {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// `<prefix>/<percent-encoded address>`.
    pub fn key_for(&self, address: &IpAddr) -> String {
        let prefix = self.prefix.trim_end_matches('/');
        let leaf = urlencoding::encode(&address.to_string()).into_owned();
        if prefix.is_empty() {
            leaf
        } else {
            format!("{}/{}", prefix, leaf)
        }
    }
}

/// Any configured enforcement point.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SinkTarget {
    List(ListTarget),
    Rule(RuleTarget),
    KeyValue(KvTarget),
}

impl fmt::Display for SinkTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::List(t) => write!(f, "list:{}/{}({})", t.scope, t.name, t.id),
            Self::Rule(t) => write!(f, "rule:{}:{}-{}/{}", t.id, t.from_port, t.to_port, t.protocol),
            Self::KeyValue(t) => write!(f, "kv:{}", t.prefix),
        }
    }
}
