//! Fuzz test for mutation-log decoding and change event extraction
//!
//! Feeds arbitrary bytes to the batch decoder and, when they decode,
//! through extraction. Neither step may panic, and every decoded record
//! must be either an event or a counted drop.
//!
//! Run with: cargo +nightly fuzz run stream_batch_fuzz -- -max_total_time=60

#![no_main]

use knockrd_events::{extract_batch, StreamBatch};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(batch) = StreamBatch::from_slice(data) {
        let extraction = extract_batch(&batch);
        assert_eq!(
            extraction.events.len() + extraction.dropped(),
            batch.len(),
            "every record is an event or a counted drop"
        );
        for event in extraction.events.iter() {
            assert!(event.cidr().contains('/'));
        }
    }
});
