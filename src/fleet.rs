//! Fleet supervisor: the channel table, the action queue, and the
//! scheduler that feeds one into the other.
//!
//! ```text
//!   caller ──calibrate/actuate──► [action queue (FIFO)]
//!                                        │
//!                              scheduler task, one per fleet
//!                                        │  dequeues only when EVERY
//!                                        ▼  channel reports idle
//!                              ChannelHandler[index]
//!                                        │ spawn
//!                                        ▼
//!                                  worker task
//! ```
//!
//! All channels share one motor supply rail, so the scheduler releases
//! the head action only when no channel is moving. One busy channel
//! stalls the whole fleet on purpose: simultaneous motor draw would sag
//! the rail and corrupt the timed moves of every other channel.
//!
//! Commands are fire-and-forget: they validate, store the newest target,
//! enqueue, and return. Completion shows up in later status polls. An
//! actuation's value is read from the channel at *dispatch* time, so a
//! burst of commands to one channel collapses into its newest value no
//! matter how many queue entries it produced.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use heapless::Deque;
use log::{info, warn};

use crate::channel::ChannelHandler;
use crate::config::FleetConfig;
use crate::drivers::clock;
use crate::drivers::task::{self, Core};
use crate::error::Error;
use crate::status::ChannelStatus;

/// Pending commands across the whole fleet. Deep enough for a calibrate
/// per channel of the largest wirable carrier plus a burst of actuations.
const ACTION_QUEUE_DEPTH: usize = 32;

/// The scheduler runs below the drive workers so dispatch bookkeeping
/// never delays an end-stop poll.
const SCHED_PRIORITY: u8 = 4;
const SCHED_STACK_KB: usize = 16;

// ═══════════════════════════════════════════════════════════════
//  Actions
// ═══════════════════════════════════════════════════════════════

/// One queued command. Actuations carry no value: the channel's stored
/// target at dispatch time is authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Calibrate { channel: usize },
    Actuate { channel: usize },
}

type ActionQueue = Deque<Action, ACTION_QUEUE_DEPTH>;

// ═══════════════════════════════════════════════════════════════
//  Shared fleet state
// ═══════════════════════════════════════════════════════════════

/// State shared with the scheduler task.
///
/// Lock ordering: `channels` before `queue`, always. Workers take neither
/// (each locks only its own channel's inner state).
struct Shared {
    channels: Mutex<Vec<ChannelHandler>>,
    queue: Mutex<ActionQueue>,
    running: AtomicBool,
    idle_poll_ms: AtomicU32,
}

fn hold<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn push(queue: &Mutex<ActionQueue>, action: Action) -> Result<(), Error> {
    hold(queue).push_back(action).map_err(|_| Error::QueueFull)
}

// ═══════════════════════════════════════════════════════════════
//  Supervisor
// ═══════════════════════════════════════════════════════════════

/// Owner of every valve channel. One per firmware.
pub struct FleetSupervisor {
    shared: Arc<Shared>,
    config: Option<FleetConfig>,
    scheduler: Option<JoinHandle<()>>,
}

impl FleetSupervisor {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                channels: Mutex::new(Vec::new()),
                queue: Mutex::new(Deque::new()),
                running: AtomicBool::new(false),
                idle_poll_ms: AtomicU32::new(1_000),
            }),
            config: None,
            scheduler: None,
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────

    /// Bring the fleet up under `config`: start every channel, queue a
    /// calibration for each (every boot re-measures travel times), and
    /// launch the scheduler. A fleet that is already running is stopped
    /// first. A channel whose pins fail to bind is left `Uninitialized`
    /// with its error recorded; the rest of the fleet still comes up.
    pub fn start(&mut self, config: FleetConfig) -> Result<(), Error> {
        config.validate()?;
        if self.is_running() {
            self.stop();
        }

        self.shared
            .idle_poll_ms
            .store(config.scheduler_idle_poll_ms.max(1), Ordering::Relaxed);
        let timing = config.timing_policy();
        {
            let mut channels = hold(&self.shared.channels);
            sync_table(&mut channels, config.channels.len());
            for (i, cfg) in config.channels.iter().enumerate() {
                let profile = config.profile_for(cfg).cloned().unwrap_or_default();
                if channels[i].start(cfg, &profile, timing).is_ok() {
                    if let Err(e) = push(&self.shared.queue, Action::Calibrate { channel: i }) {
                        warn!("Fleet: calibration for channel {i} not queued: {e}");
                    }
                }
            }
        }
        info!("Fleet: started, {} channel(s)", config.channels.len());
        self.config = Some(config);

        self.shared.running.store(true, Ordering::Relaxed);
        let shared = Arc::clone(&self.shared);
        self.scheduler = Some(task::spawn_on_core(
            Core::App,
            SCHED_PRIORITY,
            SCHED_STACK_KB,
            "valve-sched\0",
            move || scheduler_loop(&shared),
        ));
        Ok(())
    }

    /// Wind the fleet down: park the scheduler, cancel and join every
    /// worker, force all outputs low, flush the queue. Channel handlers
    /// stay in the table for the next start; the configuration is kept
    /// for diffing.
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.scheduler.take() {
            if handle.join().is_err() {
                warn!("Fleet: scheduler panicked");
            }
        }

        let mut channels = hold(&self.shared.channels);
        for ch in channels.iter_mut() {
            ch.stop();
        }
        drop(channels);
        hold(&self.shared.queue).clear();
        info!("Fleet: stopped");
    }

    /// Apply a new configuration to a live fleet.
    ///
    /// Channels are matched positionally. A slot whose drive-line pins
    /// changed is rewired and queued for recalibration; its profile and
    /// timing are re-applied either way, without recalibrating, so curve
    /// tweaks land free of a full traverse. Added slots are started and
    /// queued for calibration, removed slots are stopped and discarded.
    /// On a stopped fleet this is simply a start.
    pub fn reconfigure(&mut self, config: FleetConfig) -> Result<(), Error> {
        config.validate()?;
        if !self.is_running() {
            return self.start(config);
        }

        self.shared
            .idle_poll_ms
            .store(config.scheduler_idle_poll_ms.max(1), Ordering::Relaxed);
        let timing = config.timing_policy();
        {
            let mut channels = hold(&self.shared.channels);
            let old_channels: &[_] = self.config.as_ref().map_or(&[], |c| &c.channels);

            for (i, cfg) in config.channels.iter().enumerate() {
                let profile = config.profile_for(cfg).cloned().unwrap_or_default();

                if i >= old_channels.len() {
                    // Grown slot.
                    if channels.len() <= i {
                        channels.push(ChannelHandler::new(i));
                    }
                    if channels[i].start(cfg, &profile, timing).is_ok() {
                        if let Err(e) = push(&self.shared.queue, Action::Calibrate { channel: i })
                        {
                            warn!("Fleet: calibration for channel {i} not queued: {e}");
                        }
                    }
                    continue;
                }

                if old_channels[i].same_drive_lines(cfg) {
                    channels[i].set_valve_profile(&profile);
                    channels[i].set_timing(timing);
                } else if channels[i].reconfigure(cfg, &profile, timing).is_ok() {
                    // New drive wiring invalidates the measured times.
                    if let Err(e) = push(&self.shared.queue, Action::Calibrate { channel: i }) {
                        warn!("Fleet: calibration for channel {i} not queued: {e}");
                    }
                }
            }

            while channels.len() > config.channels.len() {
                if let Some(mut ch) = channels.pop() {
                    ch.stop();
                }
            }
        }
        info!("Fleet: reconfigured, {} channel(s)", config.channels.len());
        self.config = Some(config);
        Ok(())
    }

    // ── Commands ──────────────────────────────────────────────

    /// Queue a calibration run for `channel`. Fire-and-forget.
    pub fn calibrate(&self, channel: usize) -> Result<(), Error> {
        let channels = hold(&self.shared.channels);
        let ch = channels.get(channel).ok_or(Error::ChannelOutOfRange)?;
        ch.ensure_active()?;
        push(&self.shared.queue, Action::Calibrate { channel })
    }

    /// Store `value` as `channel`'s target and queue an actuation.
    /// Fire-and-forget; the stored target is updated immediately even
    /// while the channel is busy, so the newest command wins.
    pub fn actuate(&self, channel: usize, value: u8) -> Result<(), Error> {
        let mut channels = hold(&self.shared.channels);
        let ch = channels.get_mut(channel).ok_or(Error::ChannelOutOfRange)?;
        ch.set_target(value)?;
        push(&self.shared.queue, Action::Actuate { channel })
    }

    // ── Observation ───────────────────────────────────────────

    /// Coherent snapshot of every channel, taken under one lock.
    pub fn get_status(&self) -> Vec<ChannelStatus> {
        hold(&self.shared.channels)
            .iter()
            .map(ChannelHandler::status)
            .collect()
    }

    pub fn channel_status(&self, channel: usize) -> Result<ChannelStatus, Error> {
        hold(&self.shared.channels)
            .get(channel)
            .map(ChannelHandler::status)
            .ok_or(Error::ChannelOutOfRange)
    }

    /// Believed travel fraction of one channel, for diagnostics.
    pub fn position_pct(&self, channel: usize) -> Result<Option<f32>, Error> {
        hold(&self.shared.channels)
            .get(channel)
            .map(ChannelHandler::position_pct)
            .ok_or(Error::ChannelOutOfRange)
    }

    /// Commands waiting for the barrier.
    pub fn pending_actions(&self) -> usize {
        hold(&self.shared.queue).len()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> Option<&FleetConfig> {
        self.config.as_ref()
    }
}

impl Default for FleetSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FleetSupervisor {
    fn drop(&mut self) {
        if self.is_running() || self.scheduler.is_some() {
            self.stop();
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Scheduler task
// ═══════════════════════════════════════════════════════════════

fn scheduler_loop(shared: &Shared) {
    info!("Fleet: scheduler up");
    while shared.running.load(Ordering::Relaxed) {
        if !dispatch_head(shared) {
            idle_wait(shared);
        }
    }
    info!("Fleet: scheduler down");
}

/// Pop and dispatch the head action if every channel is settled.
/// Returns whether an action was consumed (dispatched or dropped).
fn dispatch_head(shared: &Shared) -> bool {
    let mut channels = hold(&shared.channels);
    if channels.iter().any(|ch| ch.state().is_moving()) {
        return false;
    }
    let Some(action) = hold(&shared.queue).pop_front() else {
        return false;
    };

    match action {
        Action::Calibrate { channel } => match channels.get_mut(channel) {
            Some(ch) => {
                if let Err(e) = ch.calibrate() {
                    warn!("Fleet: calibrate on channel {channel} rejected: {e}");
                }
            }
            None => warn!("Fleet: dropping action for removed channel {channel}"),
        },
        Action::Actuate { channel } => match channels.get_mut(channel) {
            Some(ch) => {
                if let Err(e) = ch.actuate() {
                    warn!("Fleet: actuate on channel {channel} rejected: {e}");
                }
            }
            None => warn!("Fleet: dropping action for removed channel {channel}"),
        },
    }
    true
}

/// Sleep the configured idle poll, in slices so `stop()` is honoured
/// within ~50 ms rather than a full poll period.
fn idle_wait(shared: &Shared) {
    let mut remaining = shared.idle_poll_ms.load(Ordering::Relaxed);
    while remaining > 0 && shared.running.load(Ordering::Relaxed) {
        let slice = remaining.min(50);
        clock::sleep_ms(slice);
        remaining -= slice;
    }
}

/// Grow or shrink the handler table to `count` slots. Handlers persist
/// across reconfigurations positionally; only trailing slots are ever
/// discarded.
fn sync_table(channels: &mut Vec<ChannelHandler>, count: usize) {
    while channels.len() > count {
        if let Some(mut ch) = channels.pop() {
            ch.stop();
        }
    }
    while channels.len() < count {
        channels.push(ChannelHandler::new(channels.len()));
    }
}
