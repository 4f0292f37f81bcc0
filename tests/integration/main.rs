//! Integration test driver for `tests/integration/` submodule.
//!
//! Each `mod` below maps to a file that exercises the valve core against
//! the scripted mechanics rig in `valve_sim`.  All tests run on the host
//! (x86_64) with no real hardware required.
//!
//! The GPIO simulation bank is process-global, so every test in this
//! binary owns a disjoint pin block; the block tables live at the top of
//! each submodule.

mod channel_tests;
mod fleet_tests;
