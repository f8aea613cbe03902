//! knockrd Events - Mutation Log Extraction
//!
//! Decodes mutation-log batches and extracts per-family change events from
//! them. This crate is pure: no I/O and no async.
//!
//! # Key Types
//!
//! Core types are re-exported from `knockrd-core`:
//! - `MutationRecord`: `{key, kind}` as read from the log
//! - `ChangeEvent`: a typed add/delete for one address
//! - `FamilyEvents`: v4 and v6 event sequences, each in input order

mod extract;
mod stream;

pub use extract::{classify, extract, extract_batch, Extraction};
pub use stream::{AttributeValue, StreamBatch, StreamChange, StreamRecord, KEY_ATTRIBUTE};

pub use knockrd_core::{
    Action, AddressFamily, ChangeEvent, FamilyEvents, MutationKind, MutationRecord,
};
