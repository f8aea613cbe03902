//! Reconciliation engine.
//!
//! One invocation takes one mutation-log batch, extracts per-family change
//! events and applies them to every configured sink. Sinks run concurrently
//! and independently; a failing sink never stops the others. Every failure
//! is collected and returned so the consumer boundary can decide whether the
//! batch is redelivered.

use std::fmt;
use std::sync::Arc;

use futures_util::future::join_all;
use knockrd_core::{FamilyEvents, MutationRecord};
use knockrd_events::{extract, extract_batch, Extraction, StreamBatch};

use crate::sink::{Sink, SinkFailure, SinkKind};

/// Outcome of a successful invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub v4_events: usize,
    pub v6_events: usize,
    /// Records dropped during extraction.
    pub dropped: usize,
    pub sinks_applied: Vec<SinkKind>,
    pub sinks_skipped: Vec<SinkKind>,
}

impl ReconcileReport {
    pub fn events(&self) -> usize {
        self.v4_events + self.v6_events
    }
}

/// Every sink failure of one invocation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{count} sink failure(s): {summary}", count = .failures.len(), summary = summarize(.failures))]
pub struct ReconcileError {
    pub failures: Vec<SinkFailure>,
}

impl ReconcileError {
    /// True when every failure is a timeout or transport error.
    pub fn is_transient(&self) -> bool {
        self.failures.iter().all(|f| f.error.is_transient())
    }

    /// Sink kinds with at least one failure, deduplicated.
    pub fn failed_kinds(&self) -> Vec<SinkKind> {
        let mut kinds: Vec<SinkKind> = self.failures.iter().map(|f| f.kind).collect();
        kinds.sort();
        kinds.dedup();
        kinds
    }
}

fn summarize(failures: &[SinkFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Dispatches change events to the configured sinks.
#[derive(Clone, Default)]
pub struct Reconciler {
    sinks: Vec<Arc<dyn Sink>>,
}

impl fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler")
            .field("sinks", &self.kinds())
            .finish()
    }
}

impl Reconciler {
    pub fn new(sinks: Vec<Arc<dyn Sink>>) -> Self {
        Self { sinks }
    }

    pub fn with_sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn kinds(&self) -> Vec<SinkKind> {
        self.sinks.iter().map(|s| s.kind()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Decode-side entry point for a mutation-log batch.
    pub async fn reconcile_batch(
        &self,
        batch: &StreamBatch,
    ) -> Result<ReconcileReport, ReconcileError> {
        self.run(extract_batch(batch)).await
    }

    /// Reconcile an ordered slice of already-decoded records.
    pub async fn reconcile(
        &self,
        records: &[MutationRecord],
    ) -> Result<ReconcileReport, ReconcileError> {
        self.run(extract(records)).await
    }

    async fn run(&self, extraction: Extraction) -> Result<ReconcileReport, ReconcileError> {
        let mut report = self.apply(&extraction.events).await?;
        report.dropped = extraction.dropped();
        Ok(report)
    }

    /// Apply events to every sink once.
    pub async fn apply(&self, events: &FamilyEvents) -> Result<ReconcileReport, ReconcileError> {
        let mut report = ReconcileReport {
            v4_events: events.v4.len(),
            v6_events: events.v6.len(),
            ..Default::default()
        };

        if events.is_empty() {
            report.sinks_skipped = self.kinds();
            tracing::debug!(sinks = self.sinks.len(), "No change events, skipping sinks");
            return Ok(report);
        }

        let results = join_all(self.sinks.iter().map(|sink| async move {
            let result = sink.apply(events).await;
            (sink.kind(), result)
        }))
        .await;

        let mut failures = Vec::new();
        for (kind, result) in results {
            match result {
                Ok(()) => report.sinks_applied.push(kind),
                Err(errs) => {
                    for failure in &errs {
                        tracing::error!(
                            sink = %failure.kind,
                            target = %failure.target,
                            error = %failure.error,
                            transient = failure.error.is_transient(),
                            "Sink update failed"
                        );
                    }
                    failures.extend(errs);
                }
            }
        }

        if !failures.is_empty() {
            return Err(ReconcileError { failures });
        }

        tracing::info!(
            v4_events = report.v4_events,
            v6_events = report.v6_events,
            sinks = report.sinks_applied.len(),
            "Reconciled change events"
        );
        Ok(report)
    }
}
