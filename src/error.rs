//! Unified error type for the ProValve firmware.
//!
//! A single small `Copy` enum that every subsystem converts into, keeping
//! error handling uniform from the channel workers up to the fleet API.
//! `Display` output is consumed verbatim by the caller-facing action layer;
//! the exact wording (including capitalisation) is part of that contract.

use core::fmt;

// ---------------------------------------------------------------------------
// Top-level firmware error
// ---------------------------------------------------------------------------

/// Every fallible operation in the valve core funnels into this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Channel index outside the configured fleet.
    ChannelOutOfRange,
    /// Operation on a channel that has not been started (or was stopped).
    ChannelNotActive,
    /// Calibration requested while an actuation is in flight.
    ChannelBusy,
    /// Intermediate target requested before any successful calibration.
    NotCalibrated,
    /// Calibration run timed out or was cancelled mid-run.
    CalibrationFailed,
    /// Timed positioning run failed (anchor traversal timed out).
    ActuationFailed,
    /// Requested valve value outside 0–100.
    ValueOutOfRange,
    /// The fleet action queue is at capacity.
    QueueFull,
    /// Configuration rejected before the fleet accepted it.
    Config(&'static str),
    /// GPIO peripheral configuration failed (ESP-IDF return code).
    Gpio(i32),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChannelOutOfRange => write!(f, "channel out of range"),
            Self::ChannelNotActive => write!(f, "Channel not active"),
            Self::ChannelBusy => write!(f, "Channel busy"),
            Self::NotCalibrated => write!(f, "channel not calibrated"),
            Self::CalibrationFailed => write!(f, "calibration error"),
            Self::ActuationFailed => write!(f, "actuation error"),
            Self::ValueOutOfRange => write!(f, "value out of range"),
            Self::QueueFull => write!(f, "action queue full"),
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Gpio(rc) => write!(f, "GPIO config failed (rc={rc})"),
        }
    }
}

impl core::error::Error for Error {}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Firmware-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
