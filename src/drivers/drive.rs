//! Two-line reversible valve drive with end-stop sensing.
//!
//! One H-bridge per channel: line A energized runs the motor toward the
//! open end, line B toward the closed end, both low coasts. Both lines
//! high would shoot through the bridge, so every direction change writes
//! the line being released *before* the line being energized.
//!
//! This is a dumb actuator in the same sense the rest of the drive layer
//! is: it moves when told and reports end-stop levels. All sequencing,
//! timing, and safety decisions live in the channel workers above it.

use embedded_hal::digital::PinState;

use crate::config::{ChannelConfig, PinDesc};
use crate::drivers::gpio;
use crate::error::Error;

// ── Direction ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveDirection {
    TowardOpen,
    TowardClosed,
}

impl DriveDirection {
    pub fn opposite(self) -> Self {
        match self {
            Self::TowardOpen => Self::TowardClosed,
            Self::TowardClosed => Self::TowardOpen,
        }
    }

    /// Travel-time position of the end this direction runs into:
    /// 100 at fully open, 0 at fully closed.
    pub fn end_position_pct(self) -> f32 {
        match self {
            Self::TowardOpen => 100.0,
            Self::TowardClosed => 0.0,
        }
    }
}

// ── Valve drive ───────────────────────────────────────────────

/// Bound pin set for one valve. `Copy` so workers carry their own handle
/// into the hot loop without touching the channel lock.
#[derive(Debug, Clone, Copy)]
pub struct ValveDrive {
    line_a: PinDesc,
    line_b: PinDesc,
    stop_open: PinDesc,
    stop_closed: PinDesc,
}

impl ValveDrive {
    /// Configure the four pins of `cfg` and leave both drive lines low.
    pub fn bind(cfg: &ChannelConfig) -> Result<Self, Error> {
        gpio::configure_output(cfg.one_a.pin)?;
        gpio::configure_output(cfg.one_b.pin)?;
        gpio::configure_input(cfg.endstop_open.pin)?;
        gpio::configure_input(cfg.endstop_closed.pin)?;

        let drive = Self {
            line_a: cfg.one_a,
            line_b: cfg.one_b,
            stop_open: cfg.endstop_open,
            stop_closed: cfg.endstop_closed,
        };
        drive.halt();
        Ok(drive)
    }

    /// Energize the line for `dir`, releasing the opposite line first.
    pub fn drive(&self, dir: DriveDirection) {
        match dir {
            DriveDirection::TowardOpen => {
                write_logical(self.line_b, false);
                write_logical(self.line_a, true);
            }
            DriveDirection::TowardClosed => {
                write_logical(self.line_a, false);
                write_logical(self.line_b, true);
            }
        }
    }

    /// Release both drive lines (coast).
    pub fn halt(&self) {
        write_logical(self.line_a, false);
        write_logical(self.line_b, false);
    }

    /// Is the end-stop at the end `dir` runs into asserted?
    pub fn endstop(&self, dir: DriveDirection) -> bool {
        match dir {
            DriveDirection::TowardOpen => read_logical(self.stop_open),
            DriveDirection::TowardClosed => read_logical(self.stop_closed),
        }
    }

    /// Both end-stop levels as `(open, closed)`.
    pub fn endstops(&self) -> (bool, bool) {
        (read_logical(self.stop_open), read_logical(self.stop_closed))
    }
}

// ── Polarity boundary ─────────────────────────────────────────

fn write_logical(desc: PinDesc, active: bool) {
    gpio::write(desc.pin, PinState::from(active != desc.inverted));
}

fn read_logical(desc: PinDesc) -> bool {
    (gpio::read(desc.pin) == PinState::High) != desc.inverted
}
