//! Mutation-log records and the change events derived from them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// IP address family of a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub fn of(address: &IpAddr) -> Self {
        match address {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }

    /// Prefix length of a single-host range in this family.
    pub fn host_prefix(self) -> u8 {
        match self {
            Self::V4 => 32,
            Self::V6 => 128,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4 => write!(f, "v4"),
            Self::V6 => write!(f, "v6"),
        }
    }
}

/// What a sink should do with an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Add,
    Delete,
}

/// Kind of mutation reported by the mutation log.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MutationKind {
    Insert,
    Modify,
    Remove,
    /// Any event name this service does not understand.
    Other(String),
}

impl MutationKind {
    /// Parse a mutation-log event name (`INSERT`, `MODIFY`, `REMOVE`).
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_uppercase().as_str() {
            "INSERT" => Self::Insert,
            "MODIFY" => Self::Modify,
            "REMOVE" => Self::Remove,
            _ => Self::Other(name.to_string()),
        }
    }

    /// Insert and Modify grant access, Remove revokes it.
    pub fn action(&self) -> Option<Action> {
        match self {
            Self::Insert | Self::Modify => Some(Action::Add),
            Self::Remove => Some(Action::Delete),
            Self::Other(_) => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Insert => "INSERT",
            Self::Modify => "MODIFY",
            Self::Remove => "REMOVE",
            Self::Other(name) => name,
        }
    }
}

impl From<&str> for MutationKind {
    fn from(name: &str) -> Self {
        Self::parse(name)
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One raw record from the mutation log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationRecord {
    pub key: String,
    pub kind: MutationKind,
}

impl MutationRecord {
    pub fn new(key: impl Into<String>, kind: impl Into<MutationKind>) -> Self {
        Self {
            key: key.into(),
            kind: kind.into(),
        }
    }
}

/// A typed access-state change for one address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChangeEvent {
    address: IpAddr,
    action: Action,
}

impl ChangeEvent {
    /// IPv4-mapped IPv6 addresses are folded into their IPv4 form.
    pub fn new(address: IpAddr, action: Action) -> Self {
        let address = match address {
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => IpAddr::V4(v4),
                None => IpAddr::V6(v6),
            },
            v4 => v4,
        };
        Self { address, action }
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn family(&self) -> AddressFamily {
        AddressFamily::of(&self.address)
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn is_add(&self) -> bool {
        self.action == Action::Add
    }

    /// Single-host range: `/32` for v4, `/128` for v6.
    pub fn cidr(&self) -> String {
        format!("{}/{}", self.address, self.family().host_prefix())
    }
}

impl fmt::Display for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {}", self.action, self.cidr())
    }
}

/// Change events split by address family, each in input order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FamilyEvents {
    pub v4: Vec<ChangeEvent>,
    pub v6: Vec<ChangeEvent>,
}

impl FamilyEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event to the sequence for its family.
    pub fn push(&mut self, event: ChangeEvent) {
        match event.family() {
            AddressFamily::V4 => self.v4.push(event),
            AddressFamily::V6 => self.v6.push(event),
        }
    }

    pub fn family(&self, family: AddressFamily) -> &[ChangeEvent] {
        match family {
            AddressFamily::V4 => &self.v4,
            AddressFamily::V6 => &self.v6,
        }
    }

    pub fn len(&self) -> usize {
        self.v4.len() + self.v6.len()
    }

    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }

    /// All events, v4 first, each family in input order.
    pub fn iter(&self) -> impl Iterator<Item = &ChangeEvent> {
        self.v4.iter().chain(self.v6.iter())
    }
}

impl FromIterator<ChangeEvent> for FamilyEvents {
    fn from_iter<I: IntoIterator<Item = ChangeEvent>>(iter: I) -> Self {
        let mut events = Self::new();
        for event in iter {
            events.push(event);
        }
        events
    }
}

/// Normalize a range string to `network/prefix` with host bits masked.
///
/// A bare address is treated as a single-host range. Returns `None` when
/// the input is not a valid address or prefix.
pub fn normalize_cidr(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let (addr, prefix) = match raw.split_once('/') {
        Some((addr, prefix)) => (addr.parse::<IpAddr>().ok()?, Some(prefix.parse::<u8>().ok()?)),
        None => (raw.parse::<IpAddr>().ok()?, None),
    };

    match addr {
        IpAddr::V4(v4) => {
            let prefix = prefix.unwrap_or(32);
            if prefix > 32 {
                return None;
            }
            let mask = u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0);
            let network = Ipv4Addr::from(u32::from(v4) & mask);
            Some(format!("{}/{}", network, prefix))
        }
        IpAddr::V6(v6) => {
            let prefix = prefix.unwrap_or(128);
            if prefix > 128 {
                return None;
            }
            let mask = u128::MAX.checked_shl(128 - u32::from(prefix)).unwrap_or(0);
            let network = Ipv6Addr::from(u128::from(v6) & mask);
            Some(format!("{}/{}", network, prefix))
        }
    }
}
