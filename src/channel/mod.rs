//! One valve channel: command surface, worker lifecycle, shared status.
//!
//! ```text
//!             fleet supervisor (owns the handler)
//!    start/stop/calibrate/actuate/set_target/status
//!                        │
//!                 ┌──────▼──────┐     spawn       ┌──────────────┐
//!                 │ChannelHandler│ ──────────────► │ worker task  │
//!                 │  worker slot │  cancel + join  │ (cal or act) │
//!                 └──────┬──────┘                  └──────┬───────┘
//!                        │        Arc<Mutex<Inner>>       │
//!                        └──────────────┬─────────────────┘
//!                                       ▼
//!                        status · drive · profile · estimate
//! ```
//!
//! A channel runs at most one worker at a time. Commands transition the
//! status under the lock *before* the worker is spawned, so an observer
//! never catches an "idle" channel that is about to move; the worker's
//! final act is to publish its result and flip the status back to `Idle`.
//! Workers carry a copy of everything they need and touch the lock only
//! for that final publish, keeping the 1 ms drive loops lock-free.

pub mod actuation;
pub mod calibration;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use log::{error, info, warn};

use crate::config::{ChannelConfig, TimingPolicy, ValveProfile};
use crate::drivers::drive::ValveDrive;
use crate::drivers::task::{self, Core};
use crate::error::Error;
use crate::status::{ChannelState, ChannelStatus};

/// Drive workers run above the radio stacks but below the watchdog feeder.
const WORKER_PRIORITY: u8 = 5;
const WORKER_STACK_KB: usize = 16;

// ═══════════════════════════════════════════════════════════════
//  Shared channel state
// ═══════════════════════════════════════════════════════════════

/// State shared between the handler and its worker.
pub(crate) struct Inner {
    pub(crate) status: ChannelStatus,
    /// Bound pins; `Some` exactly while the status is not `Uninitialized`.
    pub(crate) drive: Option<ValveDrive>,
    pub(crate) profile: ValveProfile,
    pub(crate) timing: TimingPolicy,
    /// Believed position as a fraction of full travel, in percent.
    /// `None` until an end-stop contact anchors the estimate.
    pub(crate) position_pct: Option<f32>,
}

/// Lock the shared state, recovering it if a worker panicked mid-update.
/// Workers publish whole results in one critical section, so a poisoned
/// guard still holds a consistent snapshot.
pub(crate) fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

struct WorkerSlot {
    handle: JoinHandle<()>,
    cancel: Arc<AtomicBool>,
}

// ═══════════════════════════════════════════════════════════════
//  Channel handler
// ═══════════════════════════════════════════════════════════════

/// Owner of one valve channel. All methods are called with the fleet's
/// channel table locked, so they never race each other; the only
/// concurrent actor is the channel's own worker, which moves the status
/// strictly toward `Idle`.
pub struct ChannelHandler {
    index: usize,
    inner: Arc<Mutex<Inner>>,
    worker: Option<WorkerSlot>,
    /// Wiring currently bound, for the reconfigure no-op check.
    bound: Option<ChannelConfig>,
}

impl ChannelHandler {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            inner: Arc::new(Mutex::new(Inner {
                status: ChannelStatus::default(),
                drive: None,
                profile: ValveProfile::default(),
                timing: TimingPolicy::default(),
                position_pct: None,
            })),
            worker: None,
            bound: None,
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────

    /// Bind the channel's pins and reset it to a fresh `Idle` with the
    /// configured default value. Any previous worker is cancelled first.
    /// On a pin failure the channel stays `Uninitialized` with the error
    /// recorded.
    pub fn start(
        &mut self,
        cfg: &ChannelConfig,
        profile: &ValveProfile,
        timing: TimingPolicy,
    ) -> Result<(), Error> {
        self.halt_worker();

        let mut inner = lock(&self.inner);
        inner.status = ChannelStatus::default();
        inner.position_pct = None;
        inner.profile = profile.clone();
        inner.timing = timing;

        match ValveDrive::bind(cfg) {
            Ok(drive) => {
                inner.drive = Some(drive);
                inner.status.state = ChannelState::Idle;
                inner.status.value = cfg.default_value;
                inner.status.max_add_ups = profile.max_actuate_add_ups;
                drop(inner);
                self.bound = Some(cfg.clone());
                info!(
                    "Channel {}: started (A={} B={} stops={}/{})",
                    self.index,
                    cfg.one_a.pin,
                    cfg.one_b.pin,
                    cfg.endstop_open.pin,
                    cfg.endstop_closed.pin
                );
                Ok(())
            }
            Err(e) => {
                inner.drive = None;
                inner.status.set_error(&e.to_string());
                drop(inner);
                self.bound = None;
                error!("Channel {}: start failed: {e}", self.index);
                Err(e)
            }
        }
    }

    /// Cancel any running worker, release the drive, and return to
    /// `Uninitialized`. Travel times and the position estimate are
    /// discarded with the binding.
    pub fn stop(&mut self) {
        self.halt_worker();

        let mut inner = lock(&self.inner);
        if let Some(drive) = inner.drive.take() {
            drive.halt();
        }
        inner.status = ChannelStatus::default();
        inner.position_pct = None;
        drop(inner);
        self.bound = None;
        info!("Channel {}: stopped", self.index);
    }

    /// Apply a new wiring description. When the bound pins are unchanged
    /// only the live-applicable pieces (profile, timing) are touched;
    /// otherwise the channel is drained, rebound, and reset like a fresh
    /// start. Whether the change warrants recalibration is the fleet's
    /// call, not this one's.
    pub fn reconfigure(
        &mut self,
        cfg: &ChannelConfig,
        profile: &ValveProfile,
        timing: TimingPolicy,
    ) -> Result<(), Error> {
        if self.bound.as_ref().is_some_and(|old| old.same_wiring(cfg)) {
            self.set_valve_profile(profile);
            self.set_timing(timing);
            return Ok(());
        }
        info!("Channel {}: rewiring", self.index);
        self.start(cfg, profile, timing)
    }

    // ── Configuration ─────────────────────────────────────────

    /// Swap the valve profile. A worker already underway keeps the
    /// snapshot it was dispatched with; the next actuation sees the new
    /// curve and add-up limit.
    pub fn set_valve_profile(&mut self, profile: &ValveProfile) {
        let mut inner = lock(&self.inner);
        inner.status.max_add_ups = profile.max_actuate_add_ups;
        inner.profile = profile.clone();
    }

    /// Swap the timing policy used by future calibrations and seeks.
    pub fn set_timing(&mut self, timing: TimingPolicy) {
        lock(&self.inner).timing = timing;
    }

    // ── Commands ──────────────────────────────────────────────

    /// Record a new flow target. This is the submission half of an
    /// actuation: whatever is stored here when the dispatcher gets to the
    /// channel is what gets driven, so rapid-fire commands collapse into
    /// the newest one.
    pub fn set_target(&mut self, value: u8) -> Result<(), Error> {
        if value > 100 {
            return Err(Error::ValueOutOfRange);
        }
        let mut inner = lock(&self.inner);
        if inner.status.state == ChannelState::Uninitialized {
            return Err(Error::ChannelNotActive);
        }
        inner.status.value = value;
        Ok(())
    }

    /// Err when the channel has no bound pins.
    pub fn ensure_active(&self) -> Result<(), Error> {
        if self.state() == ChannelState::Uninitialized {
            Err(Error::ChannelNotActive)
        } else {
            Ok(())
        }
    }

    /// Begin a calibration run. Already calibrating is a no-op success;
    /// an actuation in flight is a hard reject.
    pub fn calibrate(&mut self) -> Result<(), Error> {
        {
            let inner = lock(&self.inner);
            match inner.status.state {
                ChannelState::Uninitialized => return Err(Error::ChannelNotActive),
                ChannelState::Calibrating => return Ok(()),
                ChannelState::Actuating => return Err(Error::ChannelBusy),
                ChannelState::Idle => {}
            }
        }
        self.join_worker();

        let cancel = Arc::new(AtomicBool::new(false));
        let ctx = {
            let mut inner = lock(&self.inner);
            let Some(drive) = inner.drive else {
                // Idle implies a bound drive; kept as a guard.
                return Err(Error::ChannelNotActive);
            };
            inner.status.state = ChannelState::Calibrating;
            inner.status.clear_error();
            calibration::CalContext {
                index: self.index,
                drive,
                timing: inner.timing,
                prior_travel: inner.status.travel,
                target_hint: inner.status.value,
            }
        };
        info!("Channel {}: calibration started", self.index);

        let shared = Arc::clone(&self.inner);
        let cancelled = Arc::clone(&cancel);
        let handle = task::spawn_on_core(
            Core::App,
            WORKER_PRIORITY,
            WORKER_STACK_KB,
            "valve-cal\0",
            move || calibration::run(&shared, &ctx, &cancelled),
        );
        self.worker = Some(WorkerSlot { handle, cancel });
        Ok(())
    }

    /// Begin driving toward the stored target. This is the dispatch half
    /// of an actuation; relative targets additionally require measured
    /// travel times.
    pub fn actuate(&mut self) -> Result<(), Error> {
        {
            let inner = lock(&self.inner);
            match inner.status.state {
                ChannelState::Uninitialized => return Err(Error::ChannelNotActive),
                ChannelState::Calibrating | ChannelState::Actuating => {
                    return Err(Error::ChannelBusy)
                }
                ChannelState::Idle => {}
            }
        }
        self.join_worker();

        let cancel = Arc::new(AtomicBool::new(false));
        let ctx = {
            let mut inner = lock(&self.inner);
            let Some(drive) = inner.drive else {
                return Err(Error::ChannelNotActive);
            };
            let target = inner.status.value;
            if target != 0 && target != 100 && !inner.status.travel.is_calibrated() {
                inner.status.set_error("channel not calibrated");
                return Err(Error::NotCalibrated);
            }
            inner.status.state = ChannelState::Actuating;
            inner.status.clear_error();
            actuation::ActContext {
                index: self.index,
                drive,
                travel: inner.status.travel,
                curve: inner.profile.time_2_flow_rate.clone(),
                target_flow_pct: target,
                position_pct: inner.position_pct,
                add_up_count: inner.status.add_up_count,
                max_add_ups: inner.status.max_add_ups,
                timing: inner.timing,
            }
        };
        info!(
            "Channel {}: actuation started, target {} %",
            self.index, ctx.target_flow_pct
        );

        let shared = Arc::clone(&self.inner);
        let cancelled = Arc::clone(&cancel);
        let handle = task::spawn_on_core(
            Core::App,
            WORKER_PRIORITY,
            WORKER_STACK_KB,
            "valve-act\0",
            move || actuation::run(&shared, &ctx, &cancelled),
        );
        self.worker = Some(WorkerSlot { handle, cancel });
        Ok(())
    }

    // ── Observation ───────────────────────────────────────────

    pub fn status(&self) -> ChannelStatus {
        lock(&self.inner).status.clone()
    }

    pub fn state(&self) -> ChannelState {
        lock(&self.inner).status.state
    }

    /// Believed travel fraction, for diagnostics.
    pub fn position_pct(&self) -> Option<f32> {
        lock(&self.inner).position_pct
    }

    // ── Worker plumbing ───────────────────────────────────────

    /// Raise the cancel flag and wait for the worker to publish and exit.
    /// Never called with the shared state locked: the worker needs it for
    /// its final publish.
    fn halt_worker(&mut self) {
        if let Some(slot) = self.worker.take() {
            slot.cancel.store(true, Ordering::Relaxed);
            if slot.handle.join().is_err() {
                warn!("Channel {}: worker panicked", self.index);
            }
        }
    }

    /// Reclaim a worker that has already reached `Idle`. The join is
    /// near-instant because the status flip is the worker's last act.
    fn join_worker(&mut self) {
        if let Some(slot) = self.worker.take() {
            if slot.handle.join().is_err() {
                warn!("Channel {}: worker panicked", self.index);
            }
        }
    }
}

impl Drop for ChannelHandler {
    fn drop(&mut self) {
        self.halt_worker();
    }
}
