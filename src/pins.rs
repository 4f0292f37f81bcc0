//! GPIO pin assignments for the reference two-channel valve carrier board.
//!
//! Single source of truth for the defaults baked into
//! `FleetConfig::default()`. Deployments with different wiring override
//! these through the configuration layer, never by editing drivers.
//!
//! Drive lines feed a DRV8871 H-bridge per channel (A high = run toward
//! open, B high = run toward closed, both low = coast). End-stop inputs are
//! lever microswitches to ground, so they read inverted.

// ---------------------------------------------------------------------------
// Channel 0
// ---------------------------------------------------------------------------

/// Drive line A (toward open).
pub const CH0_DRIVE_A_GPIO: i32 = 4;
/// Drive line B (toward closed).
pub const CH0_DRIVE_B_GPIO: i32 = 5;
/// End-stop switch at the fully-open limit (active low).
pub const CH0_ENDSTOP_OPEN_GPIO: i32 = 6;
/// End-stop switch at the fully-closed limit (active low).
pub const CH0_ENDSTOP_CLOSED_GPIO: i32 = 7;
/// Load-detect comparator output from the shunt amplifier.
pub const CH0_LOAD_DETECT_GPIO: i32 = 15;

// ---------------------------------------------------------------------------
// Channel 1
// ---------------------------------------------------------------------------

pub const CH1_DRIVE_A_GPIO: i32 = 8;
pub const CH1_DRIVE_B_GPIO: i32 = 9;
pub const CH1_ENDSTOP_OPEN_GPIO: i32 = 10;
pub const CH1_ENDSTOP_CLOSED_GPIO: i32 = 11;
pub const CH1_LOAD_DETECT_GPIO: i32 = 16;

// ---------------------------------------------------------------------------
// Load-detect analog front end (shared shunt amplifier design)
// ---------------------------------------------------------------------------

/// Series shunt resistance per drive channel, in ohms.
pub const LOAD_SHUNT_OHM: f32 = 0.5;
/// Motor current above this threshold is treated as a stall, in mA.
pub const LOAD_STALL_THRESHOLD_MA: f32 = 450.0;

// ---------------------------------------------------------------------------
// UART debug
// ---------------------------------------------------------------------------

pub const UART_TX_GPIO: i32 = 17;
pub const UART_RX_GPIO: i32 = 18;
