//! Fuzz target: `FleetConfig::from_block`
//!
//! Drives arbitrary byte sequences into the persisted-config decoder and
//! asserts that it never panics, that whatever it accepts survives a
//! re-encode/decode cycle, and that validation of a decoded config is
//! panic-free.
//!
//! cargo fuzz run fuzz_config_block

#![no_main]

use libfuzzer_sys::fuzz_target;
use provalve::config::FleetConfig;

fuzz_target!(|data: &[u8]| {
    let Ok(config) = FleetConfig::from_block(data) else {
        return;
    };

    // Decoded garbage may still be semantically invalid; validation must
    // reject it with an error, never a panic.
    let _ = config.validate();

    // Anything the decoder accepted must re-encode, and the fresh block
    // must decode back to a structurally identical config. Compare the
    // encoded forms so NaN-carrying floats do not defeat the check.
    let block = config
        .to_block()
        .expect("re-encode of a decoded config must succeed");
    let again = FleetConfig::from_block(&block)
        .expect("decode of a freshly encoded block must succeed");
    assert_eq!(
        again.to_block().expect("second encode must succeed"),
        block,
        "config block is not stable across decode/encode"
    );
});
