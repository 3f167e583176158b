//! Fuzz test for the record codec
//!
//! Decodes arbitrary bytes as a stored record to find:
//! - Panics on truncated or corrupt input
//! - Unbounded allocations from forged length prefixes
//! - Records that decode but do not survive re-encoding
//!
//! Run with: cargo +nightly fuzz run record_decode_fuzz -- -max_total_time=60

#![no_main]

use libfuzzer_sys::fuzz_target;
use normcache_storage::{decode_record, encode_record, encoded_len};

fuzz_target!(|data: &[u8]| {
    // Corrupt input must come back as a CodecError, never a panic
    let Ok(record) = decode_record(data) else {
        return;
    };

    let encoded = encode_record(&record);
    assert_eq!(encoded.len(), encoded_len(&record), "encoded_len must match the encoding");

    let again = decode_record(&encoded).expect("re-encoded record should decode");
    assert_eq!(again.key, record.key, "key must survive re-encoding");
    assert_eq!(again.len(), record.len(), "field count must survive re-encoding");
});
