//! Fuzz target: JSON fleet-config ingestion
//!
//! Feeds arbitrary bytes to the serde_json deserializer for `FleetConfig`
//! and asserts that parsing never panics, that validation of whatever was
//! accepted is panic-free, and that an accepted config always serializes
//! back out.
//!
//! cargo fuzz run fuzz_config_json

#![no_main]

use libfuzzer_sys::fuzz_target;
use provalve::config::FleetConfig;

fuzz_target!(|data: &[u8]| {
    let Ok(config) = serde_json::from_slice::<FleetConfig>(data) else {
        return;
    };

    // Structural acceptance does not imply semantic validity; the checker
    // must flag out-of-range values without panicking.
    let _ = config.validate();

    // An accepted config is expected to round out to JSON again.
    serde_json::to_string(&config).expect("re-serialize of a parsed config must succeed");
});
