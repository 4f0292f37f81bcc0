//! Fleet configuration data model.
//!
//! Everything the valve core consumes from the outer configuration layer:
//! per-channel pin descriptors, the named valve-profile map, and the fleet
//! timing knobs. The JSON action layer feeds these structs in via serde;
//! the restart-diff layer persists them as an opaque postcard blob through
//! [`FleetConfig::to_block`] / [`FleetConfig::from_block`].
//!
//! Pin *uniqueness* is not checked here; the GPIO capability registry
//! rejects duplicate or incapable assignments before a config ever reaches
//! this core. Everything else is validated at accept time, before any
//! handler sees the config.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::pins;
use crate::profile::FlowCurve;

// ── Pin descriptors ───────────────────────────────────────────

/// A GPIO reference plus its polarity.
///
/// `inverted` means the logical assertion is the *low* physical level
/// (switches to ground, low-side drivers). Drive writes and end-stop reads
/// honor the flag at the GPIO boundary; all logic above it is polarity-free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinDesc {
    pub pin: i32,
    #[serde(default)]
    pub inverted: bool,
}

impl PinDesc {
    pub const fn new(pin: i32) -> Self {
        Self {
            pin,
            inverted: false,
        }
    }

    pub const fn new_inverted(pin: i32) -> Self {
        Self {
            pin,
            inverted: true,
        }
    }
}

/// Stall/overcurrent sensing descriptor.
///
/// The core validates and carries this for the external current-sensing
/// driver; it never reads the pin itself.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoadDetect {
    pub pin: i32,
    pub series_resistance_ohm: f32,
    pub threshold_ma: f32,
}

// ── Per-channel configuration ─────────────────────────────────

/// Wiring and defaults for one valve channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Drive line A, energized to run toward the open end.
    pub one_a: PinDesc,
    /// Drive line B, energized to run toward the closed end.
    pub one_b: PinDesc,
    /// End-stop input asserting at the fully-open limit.
    pub endstop_open: PinDesc,
    /// End-stop input asserting at the fully-closed limit.
    pub endstop_closed: PinDesc,
    /// Optional stall detection input.
    #[serde(default)]
    pub load_detect: Option<LoadDetect>,
    /// Name of the valve profile in [`FleetConfig::profiles`].
    pub valve_profile: String,
    /// Target value the channel reports after start, 0–100.
    #[serde(default)]
    pub default_value: u8,
}

impl ChannelConfig {
    /// True when the drive-line pins match. The fleet diff recalibrates only
    /// when this is false: end-stop or load-detect rewires do not disturb a
    /// measured travel time, but swapped drive lines invalidate it.
    pub fn same_drive_lines(&self, other: &Self) -> bool {
        self.one_a == other.one_a && self.one_b == other.one_b
    }

    /// True when every pin binding matches (drive, end-stops, load detect).
    pub fn same_wiring(&self, other: &Self) -> bool {
        self.same_drive_lines(other)
            && self.endstop_open == other.endstop_open
            && self.endstop_closed == other.endstop_closed
            && self.load_detect == other.load_detect
    }
}

// ── Valve profile ─────────────────────────────────────────────

/// Static descriptor of a valve type, shared by every channel naming it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValveProfile {
    /// Nominal end-to-end travel time in seconds. Informational only; the
    /// channel always works from its own measured times.
    pub open_time_s: f32,
    /// Consecutive relative actuations allowed before the next one must
    /// re-anchor at an end-stop. 0 means every actuation re-anchors.
    pub max_actuate_add_ups: u8,
    /// Travel-time→flow transfer curve; empty means linear.
    #[serde(default)]
    pub time_2_flow_rate: FlowCurve,
}

impl Default for ValveProfile {
    fn default() -> Self {
        Self {
            open_time_s: 12.0,
            max_actuate_add_ups: 5,
            time_2_flow_rate: FlowCurve::identity(),
        }
    }
}

// ── Fleet timing ──────────────────────────────────────────────

/// Whether one measured travel time serves both directions.
///
/// Gear-motor valves travel measurably slower against the return spring, so
/// asymmetric installations measure open→closed and closed→open separately.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimingMode {
    #[default]
    Symmetric,
    Asymmetric,
}

/// Timing knobs handed to every channel at start/reconfigure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimingPolicy {
    pub mode: TimingMode,
    /// Per-leg calibration timeout override in seconds; 0 selects the
    /// automatic bound.
    pub timeout_seconds: u16,
}

impl TimingPolicy {
    /// Per-leg timeout in milliseconds. The automatic bound is
    /// max(30 s, 2 × the longest previously measured travel time), so a
    /// slow valve that calibrated once is always given room to finish.
    pub fn leg_timeout_ms(&self, last_travel_ms: u32) -> u32 {
        if self.timeout_seconds != 0 {
            u32::from(self.timeout_seconds) * 1_000
        } else {
            30_000.max(last_travel_ms.saturating_mul(2))
        }
    }
}

// ── Fleet configuration ───────────────────────────────────────

fn default_scheduler_idle_poll_ms() -> u32 {
    1_000
}

/// Complete configuration for one valve fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Channel wiring, in slot order. Slot index is channel identity.
    pub channels: Vec<ChannelConfig>,
    /// Named valve profiles. A `BTreeMap` keeps [`to_block`] output
    /// deterministic, which the restart-diff layer relies on when comparing
    /// blobs across restarts.
    ///
    /// [`to_block`]: FleetConfig::to_block
    pub profiles: BTreeMap<String, ValveProfile>,
    #[serde(default)]
    pub timing_mode: TimingMode,
    /// Calibration leg timeout in seconds; 0 selects the automatic bound.
    #[serde(default)]
    pub timeout_seconds: u16,
    /// Scheduler poll cadence while the action queue is empty.
    #[serde(default = "default_scheduler_idle_poll_ms")]
    pub scheduler_idle_poll_ms: u32,
}

impl Default for FleetConfig {
    /// Reference two-channel carrier board wiring (see `pins.rs`).
    fn default() -> Self {
        let profile_name = "ball-valve".to_string();
        let channel = |a, b, open, closed, load| ChannelConfig {
            one_a: PinDesc::new(a),
            one_b: PinDesc::new(b),
            // Lever microswitches to ground read inverted.
            endstop_open: PinDesc::new_inverted(open),
            endstop_closed: PinDesc::new_inverted(closed),
            load_detect: Some(LoadDetect {
                pin: load,
                series_resistance_ohm: pins::LOAD_SHUNT_OHM,
                threshold_ma: pins::LOAD_STALL_THRESHOLD_MA,
            }),
            valve_profile: profile_name.clone(),
            default_value: 0,
        };

        let mut profiles = BTreeMap::new();
        profiles.insert(profile_name.clone(), ValveProfile::default());

        Self {
            channels: vec![
                channel(
                    pins::CH0_DRIVE_A_GPIO,
                    pins::CH0_DRIVE_B_GPIO,
                    pins::CH0_ENDSTOP_OPEN_GPIO,
                    pins::CH0_ENDSTOP_CLOSED_GPIO,
                    pins::CH0_LOAD_DETECT_GPIO,
                ),
                channel(
                    pins::CH1_DRIVE_A_GPIO,
                    pins::CH1_DRIVE_B_GPIO,
                    pins::CH1_ENDSTOP_OPEN_GPIO,
                    pins::CH1_ENDSTOP_CLOSED_GPIO,
                    pins::CH1_LOAD_DETECT_GPIO,
                ),
            ],
            profiles,
            timing_mode: TimingMode::Asymmetric,
            timeout_seconds: 0,
            scheduler_idle_poll_ms: default_scheduler_idle_poll_ms(),
        }
    }
}

impl FleetConfig {
    /// Accept-time validation. Runs before the fleet touches any handler so
    /// a rejected config never reaches running hardware.
    pub fn validate(&self) -> Result<(), Error> {
        for ch in &self.channels {
            if ch.default_value > 100 {
                return Err(Error::Config("default value outside 0–100"));
            }
            if !self.profiles.contains_key(&ch.valve_profile) {
                return Err(Error::Config("unknown valve profile"));
            }
            if let Some(ld) = &ch.load_detect {
                if ld.series_resistance_ohm <= 0.0 || ld.threshold_ma <= 0.0 {
                    return Err(Error::Config("load-detect descriptor invalid"));
                }
            }
        }
        for profile in self.profiles.values() {
            if profile.open_time_s < 0.0 {
                return Err(Error::Config("profile open time negative"));
            }
            profile.time_2_flow_rate.validate()?;
        }
        Ok(())
    }

    /// The timing knobs channels receive at start/reconfigure.
    pub fn timing_policy(&self) -> TimingPolicy {
        TimingPolicy {
            mode: self.timing_mode,
            timeout_seconds: self.timeout_seconds,
        }
    }

    /// Resolve a channel's profile. Only valid after [`validate`] passed.
    ///
    /// [`validate`]: FleetConfig::validate
    pub fn profile_for(&self, ch: &ChannelConfig) -> Option<&ValveProfile> {
        self.profiles.get(&ch.valve_profile)
    }

    /// Encode as the opaque persisted blob consumed by the restart-diff
    /// layer. Deterministic for equal configs.
    pub fn to_block(&self) -> Result<Vec<u8>, Error> {
        postcard::to_allocvec(self).map_err(|_| Error::Config("config block encode failed"))
    }

    /// Decode a persisted blob. The decoded config is *not* validated;
    /// callers run [`validate`] before use.
    ///
    /// [`validate`]: FleetConfig::validate
    pub fn from_block(bytes: &[u8]) -> Result<Self, Error> {
        postcard::from_bytes(bytes).map_err(|_| Error::Config("config block decode failed"))
    }
}
