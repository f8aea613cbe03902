//! Change event extraction.
//!
//! Turns mutation-log records into per-family [`ChangeEvent`] sequences,
//! preserving input order within each family. Records whose key is not an
//! IP address are dropped silently (the store also holds non-address keys);
//! records with an unknown mutation kind are dropped with a warning.

use std::net::IpAddr;

use knockrd_core::{ChangeEvent, FamilyEvents, MutationRecord, ValidationError};

use crate::stream::StreamBatch;

/// Extraction output with counters of what was dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    pub events: FamilyEvents,
    /// Keys that are not IP addresses.
    pub dropped_non_address: usize,
    /// Mutation kinds other than insert/modify/remove.
    pub dropped_unknown_kind: usize,
    /// Wire records without a string key attribute.
    pub dropped_missing_key: usize,
}

impl Extraction {
    pub fn dropped(&self) -> usize {
        self.dropped_non_address + self.dropped_unknown_kind + self.dropped_missing_key
    }

    fn record_drop(&mut self, err: &ValidationError) {
        match err {
            ValidationError::InvalidAddress { .. } => self.dropped_non_address += 1,
            ValidationError::UnknownMutation { .. } => self.dropped_unknown_kind += 1,
            ValidationError::MissingKey => self.dropped_missing_key += 1,
        }
    }
}

/// Classify one record.
///
/// The address is checked before the mutation kind, so a non-address key
/// with an unknown kind counts as a non-address drop.
pub fn classify(record: &MutationRecord) -> Result<ChangeEvent, ValidationError> {
    let address: IpAddr = record
        .key
        .parse()
        .map_err(|_| ValidationError::InvalidAddress {
            key: record.key.clone(),
        })?;
    let action = record
        .kind
        .action()
        .ok_or_else(|| ValidationError::UnknownMutation {
            kind: record.kind.to_string(),
        })?;
    Ok(ChangeEvent::new(address, action))
}

/// Extract change events from an ordered batch of records.
pub fn extract(records: &[MutationRecord]) -> Extraction {
    let mut extraction = Extraction::default();
    for record in records {
        accept(&mut extraction, classify(record));
    }
    log_summary(&extraction);
    extraction
}

/// Decode and extract a wire batch in one pass.
pub fn extract_batch(batch: &StreamBatch) -> Extraction {
    let mut extraction = Extraction::default();
    for decoded in batch.mutation_records() {
        let classified = decoded.and_then(|record| classify(&record));
        accept(&mut extraction, classified);
    }
    log_summary(&extraction);
    extraction
}

fn accept(extraction: &mut Extraction, classified: Result<ChangeEvent, ValidationError>) {
    match classified {
        Ok(event) => extraction.events.push(event),
        Err(e) => {
            match &e {
                ValidationError::InvalidAddress { key } => {
                    tracing::debug!(key = %key, "Skipping record with non-address key");
                }
                ValidationError::UnknownMutation { kind } => {
                    tracing::warn!(kind = %kind, "Skipping record with unknown mutation kind");
                }
                ValidationError::MissingKey => {
                    tracing::warn!("Skipping record without a key attribute");
                }
            }
            extraction.record_drop(&e);
        }
    }
}

fn log_summary(extraction: &Extraction) {
    tracing::debug!(
        v4 = extraction.events.v4.len(),
        v6 = extraction.events.v6.len(),
        dropped = extraction.dropped(),
        "Extracted change events"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use knockrd_core::{Action, AddressFamily, MutationKind};

    fn records(pairs: &[(&str, &str)]) -> Vec<MutationRecord> {
        pairs
            .iter()
            .map(|(key, kind)| MutationRecord::new(*key, *kind))
            .collect()
    }

    #[test]
    fn test_mixed_batch() {
        let input = records(&[
            ("198.51.100.1", "INSERT"),
            ("2001:db8::1", "MODIFY"),
            ("198.51.100.1", "REMOVE"),
            ("not-an-ip", "INSERT"),
        ]);
        let extraction = extract(&input);

        let v4: Vec<(String, Action)> = extraction
            .events
            .v4
            .iter()
            .map(|e| (e.cidr(), e.action()))
            .collect();
        assert_eq!(
            v4,
            vec![
                ("198.51.100.1/32".to_string(), Action::Add),
                ("198.51.100.1/32".to_string(), Action::Delete),
            ]
        );

        let v6: Vec<(String, Action)> = extraction
            .events
            .v6
            .iter()
            .map(|e| (e.cidr(), e.action()))
            .collect();
        assert_eq!(v6, vec![("2001:db8::1/128".to_string(), Action::Add)]);

        assert_eq!(extraction.dropped_non_address, 1);
        assert_eq!(extraction.dropped(), 1);
    }

    #[test]
    fn test_unknown_kind_dropped() {
        let extraction = extract(&records(&[
            ("198.51.100.1", "TRUNCATE"),
            ("198.51.100.2", "insert"),
        ]));
        assert_eq!(extraction.dropped_unknown_kind, 1);
        assert_eq!(extraction.events.len(), 1);
        assert_eq!(
            extraction.events.v4[0].address(),
            "198.51.100.2".parse::<IpAddr>().expect("ip")
        );
    }

    #[test]
    fn test_classify_errors() {
        assert_eq!(
            classify(&MutationRecord::new("csrf-token-abc", MutationKind::Insert)),
            Err(ValidationError::InvalidAddress {
                key: "csrf-token-abc".to_string()
            })
        );
        assert_eq!(
            classify(&MutationRecord::new(
                "198.51.100.1",
                MutationKind::Other("X".to_string())
            )),
            Err(ValidationError::UnknownMutation {
                kind: "X".to_string()
            })
        );
    }

    #[test]
    fn test_mapped_address_routes_to_v4() {
        let extraction = extract(&records(&[("::ffff:192.0.2.5", "INSERT")]));
        assert_eq!(extraction.events.v4.len(), 1);
        assert_eq!(extraction.events.v4[0].family(), AddressFamily::V4);
        assert!(extraction.events.v6.is_empty());
    }

    #[test]
    fn test_extract_batch_counts_missing_keys() {
        let json = r#"{"Records":[
            {"eventName":"INSERT","dynamodb":{"Keys":{"Key":{"S":"192.0.2.1"}}}},
            {"eventName":"INSERT","dynamodb":{}}
        ]}"#;
        let batch = StreamBatch::from_json(json).expect("decode");
        let extraction = extract_batch(&batch);
        assert_eq!(extraction.events.len(), 1);
        assert_eq!(extraction.dropped_missing_key, 1);
    }

    #[test]
    fn test_empty_batch() {
        let extraction = extract(&[]);
        assert!(extraction.events.is_empty());
        assert_eq!(extraction.dropped(), 0);
    }
}
