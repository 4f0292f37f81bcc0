//! Timed self-calibration.
//!
//! The only position feedback a valve has is its two end-stops, so the
//! channel measures how long a full traverse takes in each direction and
//! later converts those durations into timed pulses. A calibration run is
//! a short sequence of *legs*, each driving toward one end until its stop
//! asserts:
//!
//! ```text
//!   parked on a stop, symmetric:    [measure away]
//!   parked on a stop, asymmetric:   [measure away][measure back]
//!   mid-travel:                     [position, unrecorded][as above]
//! ```
//!
//! The positioning leg runs toward whichever end the channel's last
//! commanded value points at, so a valve that is about to be opened
//! calibrates from the open end and skips a pointless full traverse.
//!
//! A leg that times out fails the whole run: travel times are cleared and
//! the channel reports `calibration error` until a later run succeeds.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{error, info};

use crate::config::{TimingMode, TimingPolicy};
use crate::drivers::clock;
use crate::drivers::drive::{DriveDirection, ValveDrive};
use crate::status::{ChannelState, TravelTimes};

use super::Inner;

// ═══════════════════════════════════════════════════════════════
//  Worker context
// ═══════════════════════════════════════════════════════════════

/// Everything the calibration worker needs, copied out of the channel
/// before spawn so the hot loop never touches the channel lock.
pub(crate) struct CalContext {
    pub(crate) index: usize,
    pub(crate) drive: ValveDrive,
    pub(crate) timing: TimingPolicy,
    /// Previously measured times, used only to derive leg timeouts.
    pub(crate) prior_travel: TravelTimes,
    /// Last commanded flow value; picks the positioning-leg direction.
    pub(crate) target_hint: u8,
}

// ═══════════════════════════════════════════════════════════════
//  Leg planning
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LegPlan {
    /// Parked on a stop: measure away from it (and back, asymmetric).
    FromEndStop { away: DriveDirection },
    /// Neither stop asserted: run an unrecorded leg to `first`'s end,
    /// then measure as if parked there.
    FromMidTravel { first: DriveDirection },
}

/// Decide the leg sequence from the current end-stop pair. `None` means
/// both stops read asserted at once, which a healthy valve cannot do.
pub(crate) fn plan(open: bool, closed: bool, target_hint: u8) -> Option<LegPlan> {
    match (open, closed) {
        (true, true) => None,
        (true, false) => Some(LegPlan::FromEndStop {
            away: DriveDirection::TowardClosed,
        }),
        (false, true) => Some(LegPlan::FromEndStop {
            away: DriveDirection::TowardOpen,
        }),
        (false, false) => {
            let first = if target_hint > 50 {
                DriveDirection::TowardOpen
            } else {
                DriveDirection::TowardClosed
            };
            Some(LegPlan::FromMidTravel { first })
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Leg execution
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy)]
pub(crate) struct LegOutcome {
    pub(crate) elapsed_ms: u32,
    /// The destination stop asserted (as opposed to timing out).
    pub(crate) hit: bool,
    pub(crate) cancelled: bool,
}

/// Drive toward `dir`'s end until its stop asserts, the timeout expires,
/// or `cancel` is raised. The drive is always halted on return. Polls at
/// 1 ms, which bounds the measurement error well below mechanical slack.
pub(crate) fn run_leg(
    drive: &ValveDrive,
    dir: DriveDirection,
    timeout_ms: u32,
    cancel: &AtomicBool,
) -> LegOutcome {
    if drive.endstop(dir) {
        // Already parked at the destination.
        return LegOutcome {
            elapsed_ms: 0,
            hit: true,
            cancelled: false,
        };
    }

    drive.drive(dir);
    let started = clock::now_ms();
    let outcome = loop {
        let elapsed_ms = clock::elapsed_ms(started);
        if cancel.load(Ordering::Relaxed) {
            break LegOutcome {
                elapsed_ms,
                hit: false,
                cancelled: true,
            };
        }
        if drive.endstop(dir) {
            break LegOutcome {
                elapsed_ms,
                hit: true,
                cancelled: false,
            };
        }
        if elapsed_ms >= timeout_ms {
            break LegOutcome {
                elapsed_ms,
                hit: false,
                cancelled: false,
            };
        }
        clock::sleep_ms(1);
    };
    drive.halt();
    outcome
}

// ═══════════════════════════════════════════════════════════════
//  Worker body
// ═══════════════════════════════════════════════════════════════

enum Measured {
    Complete {
        travel: TravelTimes,
        /// End the valve is parked on afterwards.
        parked: DriveDirection,
    },
    Cancelled,
    Failed,
}

/// Calibration worker entry point. Runs on its own task; publishes the
/// result and flips the channel back to `Idle` as its final act.
pub(crate) fn run(inner: &Arc<Mutex<Inner>>, ctx: &CalContext, cancel: &AtomicBool) {
    let result = measure(ctx, cancel);

    let mut guard = super::lock(inner);
    match result {
        Measured::Complete { travel, parked } => {
            info!(
                "Channel {}: calibrated, open→closed {} ms, closed→open {} ms",
                ctx.index, travel.open_to_closed_ms, travel.closed_to_open_ms
            );
            guard.status.travel = travel;
            guard.status.add_up_count = 0;
            guard.status.clear_error();
            guard.position_pct = Some(parked.end_position_pct());
        }
        Measured::Cancelled => {
            // Shutdown path. Keep prior data; the stop that raised the
            // flag resets the channel anyway.
            info!("Channel {}: calibration cancelled", ctx.index);
        }
        Measured::Failed => {
            error!("Channel {}: calibration failed", ctx.index);
            guard.status.travel.clear();
            guard.status.add_up_count = 0;
            guard.status.set_error("calibration error");
            guard.position_pct = None;
        }
    }
    guard.status.state = ChannelState::Idle;
}

fn measure(ctx: &CalContext, cancel: &AtomicBool) -> Measured {
    let (open, closed) = ctx.drive.endstops();
    let Some(plan) = plan(open, closed, ctx.target_hint) else {
        error!(
            "Channel {}: both end-stops asserted, wiring fault",
            ctx.index
        );
        return Measured::Failed;
    };

    // Longest travel seen so far; feeds the per-leg timeout bound and is
    // refreshed after each measured leg.
    let mut known_ms = ctx.prior_travel.longest();

    let away = match plan {
        LegPlan::FromEndStop { away } => away,
        LegPlan::FromMidTravel { first } => {
            let leg = run_leg(&ctx.drive, first, ctx.timing.leg_timeout_ms(known_ms), cancel);
            if leg.cancelled {
                return Measured::Cancelled;
            }
            if !leg.hit {
                return Measured::Failed;
            }
            first.opposite()
        }
    };

    let mut travel = TravelTimes::default();
    let leg = run_leg(&ctx.drive, away, ctx.timing.leg_timeout_ms(known_ms), cancel);
    if leg.cancelled {
        return Measured::Cancelled;
    }
    if !leg.hit {
        return Measured::Failed;
    }
    // A stop can not assert in 0 ms on a real gear train; clamping keeps
    // a quantized measurement from reading as "never measured".
    let away_ms = leg.elapsed_ms.max(1);
    travel.set_for_direction(away, away_ms);
    known_ms = known_ms.max(away_ms);

    match ctx.timing.mode {
        TimingMode::Symmetric => {
            travel.set_for_direction(away.opposite(), away_ms);
            Measured::Complete {
                travel,
                parked: away,
            }
        }
        TimingMode::Asymmetric => {
            let back = away.opposite();
            let leg = run_leg(&ctx.drive, back, ctx.timing.leg_timeout_ms(known_ms), cancel);
            if leg.cancelled {
                return Measured::Cancelled;
            }
            if !leg.hit {
                return Measured::Failed;
            }
            travel.set_for_direction(back, leg.elapsed_ms.max(1));
            Measured::Complete {
                travel,
                parked: back,
            }
        }
    }
}
