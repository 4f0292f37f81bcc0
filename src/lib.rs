//! ProValve firmware library.
//!
//! Exposes the host-testable modules for integration testing and external
//! inspection. All ESP-IDF-specific code is guarded by
//! `#[cfg(target_os = "espidf")]` within each module, with simulation
//! fallbacks compiled for host targets.

#![deny(unused_must_use)]

pub mod channel;
pub mod config;
pub mod error;
pub mod fleet;
pub mod nvs;
pub mod pins;
pub mod profile;
pub mod status;

// GPIO, clock, and task primitives shared by every layer above.
pub mod drivers;
