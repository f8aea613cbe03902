//! knockrd Core - Shared Types
//!
//! Data model, error taxonomy, configuration and clock abstraction shared by
//! every other knockrd crate. This crate performs no I/O beyond reading a
//! configuration file.

pub mod access;
pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod target;

pub use access::{AccessEntry, EXPIRY_ATTRIBUTE};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    ConfigAdjustment, ConsulConfig, IpSetConfig, KnockConfig, RetryPolicy, CONFIG_PATH_ENV,
    DEFAULT_KV_PREFIX, DEFAULT_TABLE,
};
pub use error::{ConfigError, KnockError, KnockResult, SinkError, StoreError, ValidationError};
pub use event::{
    normalize_cidr, Action, AddressFamily, ChangeEvent, FamilyEvents, MutationKind,
    MutationRecord,
};
pub use target::{KvTarget, ListScope, ListTarget, RuleTarget, SinkTarget};

/// Timestamp type using UTC timezone.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
