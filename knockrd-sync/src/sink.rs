//! Sink capability shared by every enforcement point.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use knockrd_core::{FamilyEvents, SinkError};

/// Kind of enforcement point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SinkKind {
    List,
    Rule,
    KeyValue,
}

impl SinkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::List => "list",
            Self::Rule => "rule",
            Self::KeyValue => "kv",
        }
    }
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One failed call against one sink target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkFailure {
    pub kind: SinkKind,
    pub target: String,
    pub error: SinkError,
}

impl SinkFailure {
    pub fn new(kind: SinkKind, target: impl Into<String>, error: SinkError) -> Self {
        Self {
            kind,
            target: target.into(),
            error,
        }
    }
}

impl fmt::Display for SinkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} sink {}: {}", self.kind, self.target, self.error)
    }
}

/// An enforcement point that change events are applied to.
///
/// Implementations must be safe under redelivery: applying the same events
/// twice converges to the same remote state.
#[async_trait]
pub trait Sink: Send + Sync {
    fn kind(&self) -> SinkKind;

    /// Targets this sink writes to, for logs.
    fn targets(&self) -> Vec<String>;

    /// Apply one invocation's events. Every failure is returned; none are
    /// swallowed.
    async fn apply(&self, events: &FamilyEvents) -> Result<(), Vec<SinkFailure>>;
}

/// Bound a sink call by `timeout`, mapping expiry to [`SinkError::Timeout`].
pub(crate) async fn bounded<T, F>(
    sink: &'static str,
    operation: &'static str,
    timeout: Duration,
    fut: F,
) -> Result<T, SinkError>
where
    F: Future<Output = Result<T, SinkError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(SinkError::Timeout {
            sink,
            operation,
            after: timeout,
        }),
    }
}
