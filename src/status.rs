//! Per-channel status: the snapshot workers publish and callers poll.
//!
//! `ChannelStatus` is the single source of truth for what a channel last
//! did and whether it is busy. Workers update it under the channel lock
//! as their final act; the supervisor reads it to decide when the shared
//! motor supply is free for the next queued action.

use serde::Serialize;

use crate::drivers::drive::DriveDirection;

// ── Lifecycle state ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    /// No pins bound. The channel rejects work until the next start.
    #[default]
    Uninitialized,
    Idle,
    Actuating,
    Calibrating,
}

impl ChannelState {
    /// True while the channel may be drawing motor current.
    pub fn is_moving(self) -> bool {
        matches!(self, Self::Actuating | Self::Calibrating)
    }
}

// ── Measured travel times ─────────────────────────────────────

/// Empirical full-travel durations, one per direction. Zero means
/// "never measured"; both fields set means the channel is calibrated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TravelTimes {
    pub open_to_closed_ms: u32,
    pub closed_to_open_ms: u32,
}

impl TravelTimes {
    pub fn is_calibrated(&self) -> bool {
        self.open_to_closed_ms != 0 && self.closed_to_open_ms != 0
    }

    /// Travel time for a full run in `dir`.
    pub fn for_direction(&self, dir: DriveDirection) -> u32 {
        match dir {
            DriveDirection::TowardOpen => self.closed_to_open_ms,
            DriveDirection::TowardClosed => self.open_to_closed_ms,
        }
    }

    pub fn set_for_direction(&mut self, dir: DriveDirection, ms: u32) {
        match dir {
            DriveDirection::TowardOpen => self.closed_to_open_ms = ms,
            DriveDirection::TowardClosed => self.open_to_closed_ms = ms,
        }
    }

    pub fn longest(&self) -> u32 {
        self.open_to_closed_ms.max(self.closed_to_open_ms)
    }

    /// Discard both measurements (after a failed calibration or rewire).
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

// ── Status snapshot ───────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChannelStatus {
    pub state: ChannelState,
    /// Last commanded flow value in percent. Updated at submission time,
    /// so a queued follow-up overwrites it before dispatch (latest wins).
    pub value: u8,
    /// Last failure, empty when the previous operation succeeded.
    pub error: heapless::String<32>,
    pub travel: TravelTimes,
    /// Relative moves taken since the estimate was last anchored at an
    /// end stop.
    pub add_up_count: u8,
    /// Anchor threshold from the active valve profile (0 = every move).
    pub max_add_ups: u8,
}

impl ChannelStatus {
    /// Record `msg`, truncating at the storage cap. The firmware's own
    /// error strings all fit; truncation only guards formatted text.
    pub fn set_error(&mut self, msg: &str) {
        self.error.clear();
        for ch in msg.chars() {
            if self.error.push(ch).is_err() {
                break;
            }
        }
    }

    pub fn clear_error(&mut self) {
        self.error.clear();
    }

    pub fn has_error(&self) -> bool {
        !self.error.is_empty()
    }
}
