//! Error types for knockrd operations

use std::time::Duration;
use thiserror::Error;

/// Access store errors.
///
/// "Not found" is never an error: a missing key is a normal `false` lookup.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store {operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Provisioning of collection {collection} failed: {reason}")]
    Provisioning { collection: String, reason: String },

    #[error("Failed to encode or decode entry {key}: {reason}")]
    Codec { key: String, reason: String },
}

impl StoreError {
    /// Timeouts and unavailability are transient and may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Unavailable { .. })
    }
}

/// Errors raised by enforcement sink boundaries.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SinkError {
    #[error("{sink} {operation} timed out after {after:?}")]
    Timeout {
        sink: &'static str,
        operation: &'static str,
        after: Duration,
    },

    #[error("{sink} transport failure: {reason}")]
    Transport { sink: &'static str, reason: String },

    #[error("{sink} rejected request with status {status}: {reason}")]
    Rejected {
        sink: &'static str,
        status: u16,
        reason: String,
    },

    #[error("Version token for {target} is stale, write rejected")]
    Conflict { target: String },

    #[error("Rule already present on {target}: {ranges:?}")]
    DuplicateRule { target: String, ranges: Vec<String> },

    #[error("Rule not present on {target}: {ranges:?}")]
    RuleNotFound { target: String, ranges: Vec<String> },
}

impl SinkError {
    /// Network failures and timeouts. Upstream redelivery retries these.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Transport { .. })
    }

    /// Optimistic-lock rejection from a list-based sink.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Duplicate authorize or absent revoke. Rule sinks treat these as success.
    pub fn is_noop(&self) -> bool {
        matches!(self, Self::DuplicateRule { .. } | Self::RuleNotFound { .. })
    }
}

/// Record-level validation errors. These are logged and dropped, never
/// propagated as batch failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Key is not an IP address: {key}")]
    InvalidAddress { key: String },

    #[error("Unknown mutation kind: {kind}")]
    UnknownMutation { kind: String },

    #[error("Record has no key attribute")]
    MissingKey,
}

/// Configuration errors. Fatal at startup.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to load configuration from {path}: {reason}")]
    LoadFailed { path: String, reason: String },
}

impl ConfigError {
    pub fn missing(field: impl Into<String>) -> Self {
        Self::MissingRequired {
            field: field.into(),
        }
    }

    pub fn invalid(
        field: impl Into<String>,
        value: impl ToString,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Master error type for all knockrd errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KnockError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for knockrd operations.
pub type KnockResult<T> = Result<T, KnockError>;

// =============================================================================
// TESTS
// =============================================================================
