//! Fuzz test for single value decoding
//!
//! Every tag byte and length prefix is attacker-controlled here; decoding
//! must reject bad input with an error.
//!
//! Run with: cargo +nightly fuzz run value_decode_fuzz -- -max_total_time=60

#![no_main]

use libfuzzer_sys::fuzz_target;
use normcache_storage::codec::{decode_value, encode_value};

fuzz_target!(|data: &[u8]| {
    if let Ok(value) = decode_value(data) {
        let encoded = encode_value(&value);
        assert!(
            decode_value(&encoded).is_ok(),
            "re-encoded value should decode"
        );
    }
});
