//! Timed-pulse actuation.
//!
//! Between the end-stops a valve's position is only ever an estimate: the
//! channel tracks where it *believes* the valve is as a percentage of full
//! travel and moves relative to that with timed pulses. Every relative
//! pulse inherits a little mechanical error, so moves since the last
//! end-stop contact are counted and, once the profile's add-up limit is
//! reached, the next actuation first re-anchors at the end nearest its
//! target before pulsing to it.
//!
//! Targets of exactly 0 or 100 never pulse: they seek the corresponding
//! end-stop directly, which also works on an uncalibrated channel and
//! resets the add-up counter for free.
//!
//! Flow targets pass through the profile's transfer curve, so a command
//! of "40 % flow" becomes "the travel fraction where the curve reaches
//! 40 % flow" before any pulse arithmetic happens.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{error, info};

use crate::config::TimingPolicy;
use crate::drivers::clock;
use crate::drivers::drive::{DriveDirection, ValveDrive};
use crate::profile::FlowCurve;
use crate::status::{ChannelState, TravelTimes};

use super::calibration::run_leg;
use super::Inner;

/// Steps below half a percent of travel sit inside gear slack and would
/// only accumulate estimate error; they are treated as already reached.
const MIN_STEP_PCT: f32 = 0.5;

// ═══════════════════════════════════════════════════════════════
//  Worker context
// ═══════════════════════════════════════════════════════════════

/// Snapshot of the channel taken at dispatch; the worker never reads the
/// channel again until it publishes its result.
pub(crate) struct ActContext {
    pub(crate) index: usize,
    pub(crate) drive: ValveDrive,
    pub(crate) travel: TravelTimes,
    pub(crate) curve: FlowCurve,
    pub(crate) target_flow_pct: u8,
    pub(crate) position_pct: Option<f32>,
    pub(crate) add_up_count: u8,
    pub(crate) max_add_ups: u8,
    pub(crate) timing: TimingPolicy,
}

// ═══════════════════════════════════════════════════════════════
//  Pulse planning
// ═══════════════════════════════════════════════════════════════

/// Which end to re-anchor at for a given travel-fraction target: the
/// nearer one, so the follow-up pulse stays short.
pub(crate) fn anchor_end(target_time_pct: f32) -> DriveDirection {
    if target_time_pct > 50.0 {
        DriveDirection::TowardOpen
    } else {
        DriveDirection::TowardClosed
    }
}

/// Turn "believed at `current_pct`, want `target_time_pct`" into a timed
/// pulse. `None` means the difference is inside [`MIN_STEP_PCT`] (or
/// rounds to a zero-length pulse) and no movement is warranted.
pub(crate) fn plan_pulse(
    current_pct: f32,
    target_time_pct: f32,
    travel: &TravelTimes,
) -> Option<(DriveDirection, u32)> {
    let delta = target_time_pct - current_pct;
    if delta.abs() < MIN_STEP_PCT {
        return None;
    }
    let dir = if delta > 0.0 {
        DriveDirection::TowardOpen
    } else {
        DriveDirection::TowardClosed
    };
    let full_ms = travel.for_direction(dir);
    let pulse_ms = (delta.abs() / 100.0 * full_ms as f32).round() as u32;
    if pulse_ms == 0 {
        return None;
    }
    Some((dir, pulse_ms))
}

/// Dead-reckon the estimate after driving `dir` for `elapsed_ms`.
/// Unknown starting point or unmeasured travel both collapse to `None`.
pub(crate) fn advance(
    position_pct: Option<f32>,
    dir: DriveDirection,
    elapsed_ms: u32,
    travel: &TravelTimes,
) -> Option<f32> {
    let current = position_pct?;
    let full_ms = travel.for_direction(dir);
    if full_ms == 0 {
        return None;
    }
    let step = elapsed_ms as f32 / full_ms as f32 * 100.0;
    let moved = match dir {
        DriveDirection::TowardOpen => current + step,
        DriveDirection::TowardClosed => current - step,
    };
    Some(moved.clamp(0.0, 100.0))
}

// ═══════════════════════════════════════════════════════════════
//  Worker body
// ═══════════════════════════════════════════════════════════════

enum Acted {
    Done {
        position_pct: Option<f32>,
        add_ups: u8,
    },
    Cancelled {
        position_pct: Option<f32>,
    },
    Failed,
}

/// Actuation worker entry point. Publishes the outcome and flips the
/// channel back to `Idle` as its final act. The commanded value itself is
/// not written here: it was stored at submission time and a newer command
/// may have overwritten it since.
pub(crate) fn run(inner: &Arc<Mutex<Inner>>, ctx: &ActContext, cancel: &AtomicBool) {
    let result = execute(ctx, cancel);

    let mut guard = super::lock(inner);
    match result {
        Acted::Done {
            position_pct,
            add_ups,
        } => {
            info!(
                "Channel {}: actuation complete, value {} %",
                ctx.index, ctx.target_flow_pct
            );
            guard.status.clear_error();
            guard.status.add_up_count = add_ups;
            guard.position_pct = position_pct;
        }
        Acted::Cancelled { position_pct } => {
            info!("Channel {}: actuation cancelled", ctx.index);
            guard.position_pct = position_pct;
        }
        Acted::Failed => {
            error!("Channel {}: actuation failed", ctx.index);
            guard.status.set_error("actuation error");
            guard.position_pct = None;
        }
    }
    guard.status.state = ChannelState::Idle;
}

fn execute(ctx: &ActContext, cancel: &AtomicBool) -> Acted {
    let target = ctx.target_flow_pct;
    if target == 0 || target == 100 {
        let dir = if target == 0 {
            DriveDirection::TowardClosed
        } else {
            DriveDirection::TowardOpen
        };
        return seek(ctx, dir, cancel);
    }

    let target_time = ctx.curve.time_for_flow(f32::from(target));

    // Re-anchor when the estimate is gone or the drift budget is spent.
    let (current, add_ups) = match ctx.position_pct {
        Some(p) if ctx.add_up_count < ctx.max_add_ups => (p, ctx.add_up_count),
        _ => {
            let dir = anchor_end(target_time);
            info!(
                "Channel {}: re-anchoring at {} end",
                ctx.index,
                if dir == DriveDirection::TowardOpen {
                    "open"
                } else {
                    "closed"
                }
            );
            let timeout = ctx.timing.leg_timeout_ms(ctx.travel.longest());
            let leg = run_leg(&ctx.drive, dir, timeout, cancel);
            if leg.cancelled {
                return Acted::Cancelled {
                    position_pct: advance(ctx.position_pct, dir, leg.elapsed_ms, &ctx.travel),
                };
            }
            if !leg.hit {
                return Acted::Failed;
            }
            (dir.end_position_pct(), 0)
        }
    };

    let Some((dir, pulse_ms)) = plan_pulse(current, target_time, &ctx.travel) else {
        return Acted::Done {
            position_pct: Some(current),
            add_ups,
        };
    };

    match timed_pulse(&ctx.drive, dir, pulse_ms, cancel) {
        Pulse::Complete => Acted::Done {
            // The estimate is the commanded point, not an integration of
            // the pulse, so rounding error does not accumulate.
            position_pct: Some(target_time),
            add_ups: add_ups.saturating_add(1),
        },
        Pulse::Cancelled { elapsed_ms } => Acted::Cancelled {
            position_pct: advance(Some(current), dir, elapsed_ms, &ctx.travel),
        },
    }
}

/// Full traversal to `dir`'s end-stop; the only absolute move there is.
fn seek(ctx: &ActContext, dir: DriveDirection, cancel: &AtomicBool) -> Acted {
    let (open, closed) = ctx.drive.endstops();
    if open && closed {
        error!(
            "Channel {}: both end-stops asserted, wiring fault",
            ctx.index
        );
        return Acted::Failed;
    }

    let timeout = ctx.timing.leg_timeout_ms(ctx.travel.longest());
    let leg = run_leg(&ctx.drive, dir, timeout, cancel);
    if leg.cancelled {
        return Acted::Cancelled {
            position_pct: advance(ctx.position_pct, dir, leg.elapsed_ms, &ctx.travel),
        };
    }
    if !leg.hit {
        return Acted::Failed;
    }
    Acted::Done {
        position_pct: Some(dir.end_position_pct()),
        add_ups: 0,
    }
}

enum Pulse {
    Complete,
    Cancelled { elapsed_ms: u32 },
}

/// Drive `dir` for exactly `pulse_ms`, then halt. The end-stops are not
/// watched here: pulse lengths come from measured travel, and absolute
/// targets take the seek path instead.
fn timed_pulse(drive: &ValveDrive, dir: DriveDirection, pulse_ms: u32, cancel: &AtomicBool) -> Pulse {
    drive.drive(dir);
    let started = clock::now_ms();
    let outcome = loop {
        let elapsed_ms = clock::elapsed_ms(started);
        if cancel.load(Ordering::Relaxed) {
            break Pulse::Cancelled { elapsed_ms };
        }
        if elapsed_ms >= pulse_ms {
            break Pulse::Complete;
        }
        clock::sleep_ms(1);
    };
    drive.halt();
    outcome
}
