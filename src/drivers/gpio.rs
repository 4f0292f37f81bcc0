//! Lock-free GPIO primitives for the valve drive and end-stop pins.
//!
//! The end-stop polling loops in the channel workers run at millisecond
//! cadence, so the read/write primitives here are plain register accesses
//! with no locking. Pins are configured once at bind time; after that,
//! `read`/`write` are safe from any task context.
//!
//! ## Dual-target design
//!
//! On ESP-IDF: `gpio_config` at bind time, raw `gpio_get_level` /
//! `gpio_set_level` in the hot path.
//!
//! On host/test: a static atomic pin bank. Every call to [`write`] bumps a
//! per-pin counter and appends a timestamped entry to a level trace, which
//! is what the integration tests use to assert "no GPIO activity" and to
//! reconstruct drive-pulse durations. Test code scripts input pins through
//! [`sim::set_level`], which deliberately bypasses both instruments.

use embedded_hal::digital::PinState;

use crate::error::Error;

#[cfg(target_os = "espidf")]
use esp_idf_svc::sys::*;

// ── Pin configuration (bind time) ─────────────────────────────

/// Configure `pin` as a push-pull output. The level is left untouched;
/// callers drive it low themselves immediately after binding.
#[cfg(target_os = "espidf")]
pub fn configure_output(pin: i32) -> Result<(), Error> {
    let cfg = gpio_config_t {
        pin_bit_mask: 1u64 << pin,
        mode: gpio_mode_t_GPIO_MODE_OUTPUT,
        pull_up_en: gpio_pullup_t_GPIO_PULLUP_DISABLE,
        pull_down_en: gpio_pulldown_t_GPIO_PULLDOWN_DISABLE,
        intr_type: gpio_int_type_t_GPIO_INTR_DISABLE,
    };
    // SAFETY: gpio_config validates the pin number and runs from the
    // lifecycle path only, never concurrently with the hot loop.
    let ret = unsafe { gpio_config(&cfg) };
    if ret != ESP_OK as i32 {
        return Err(Error::Gpio(ret));
    }
    Ok(())
}

/// Configure `pin` as an input with pull-up (end-stop switches to ground).
#[cfg(target_os = "espidf")]
pub fn configure_input(pin: i32) -> Result<(), Error> {
    let cfg = gpio_config_t {
        pin_bit_mask: 1u64 << pin,
        mode: gpio_mode_t_GPIO_MODE_INPUT,
        pull_up_en: gpio_pullup_t_GPIO_PULLUP_ENABLE,
        pull_down_en: gpio_pulldown_t_GPIO_PULLDOWN_DISABLE,
        intr_type: gpio_int_type_t_GPIO_INTR_DISABLE,
    };
    // SAFETY: see configure_output.
    let ret = unsafe { gpio_config(&cfg) };
    if ret != ESP_OK as i32 {
        return Err(Error::Gpio(ret));
    }
    Ok(())
}

#[cfg(not(target_os = "espidf"))]
pub fn configure_output(pin: i32) -> Result<(), Error> {
    sim::touch(pin);
    Ok(())
}

#[cfg(not(target_os = "espidf"))]
pub fn configure_input(pin: i32) -> Result<(), Error> {
    sim::touch(pin);
    Ok(())
}

// ── Hot-path read/write ───────────────────────────────────────

/// Set the physical level of an already-configured output pin.
#[cfg(target_os = "espidf")]
pub fn write(pin: i32, level: PinState) {
    // SAFETY: gpio_set_level writes to an already-configured output pin;
    // it is a single register write and callable from any task.
    unsafe {
        gpio_set_level(pin, if matches!(level, PinState::High) { 1 } else { 0 });
    }
}

/// Read the physical level of an already-configured input pin.
#[cfg(target_os = "espidf")]
pub fn read(pin: i32) -> PinState {
    // SAFETY: gpio_get_level is a read-only register access on an
    // already-configured input pin.
    if (unsafe { gpio_get_level(pin) }) != 0 {
        PinState::High
    } else {
        PinState::Low
    }
}

#[cfg(not(target_os = "espidf"))]
pub fn write(pin: i32, level: PinState) {
    sim::record_write(pin, matches!(level, PinState::High));
}

#[cfg(not(target_os = "espidf"))]
pub fn read(pin: i32) -> PinState {
    if sim::level(pin) {
        PinState::High
    } else {
        PinState::Low
    }
}

// ── Host simulation bank ──────────────────────────────────────

/// In-memory pin bank standing in for the GPIO matrix on host builds.
///
/// Tests drive input pins with [`sim::set_level`] and observe firmware
/// output through [`sim::write_count`] and [`sim::drive_trace`]. The bank is
/// process-global, so concurrently running tests must use disjoint pin
/// numbers.
#[cfg(not(target_os = "espidf"))]
pub mod sim {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{Mutex, PoisonError};

    use crate::drivers::clock;

    /// Bank size. Generously above the 48 pins of an ESP32-S3 so parallel
    /// tests can carve out disjoint ranges.
    pub const PIN_COUNT: usize = 256;

    struct SimPin {
        level: AtomicBool,
        writes: AtomicU32,
    }

    impl SimPin {
        const fn new() -> Self {
            Self {
                level: AtomicBool::new(false),
                writes: AtomicU32::new(0),
            }
        }
    }

    static BANK: [SimPin; PIN_COUNT] = [const { SimPin::new() }; PIN_COUNT];

    /// One recorded output-level write.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TraceEvent {
        pub pin: i32,
        pub high: bool,
        pub at_ms: u32,
    }

    static TRACE: Mutex<Vec<TraceEvent>> = Mutex::new(Vec::new());

    fn slot(pin: i32) -> &'static SimPin {
        let idx = usize::try_from(pin).ok().filter(|&i| i < PIN_COUNT);
        match idx {
            Some(i) => &BANK[i],
            None => panic!("sim pin {pin} outside bank (0..{PIN_COUNT})"),
        }
    }

    pub(super) fn touch(pin: i32) {
        // Bind-time validation only; configuration is not a level write.
        let _ = slot(pin);
    }

    pub(super) fn record_write(pin: i32, high: bool) {
        let s = slot(pin);
        s.level.store(high, Ordering::SeqCst);
        s.writes.fetch_add(1, Ordering::SeqCst);
        // A panicking test must not poison the trace for the rest of the
        // suite, so recover the guard instead of unwrapping.
        let mut trace = TRACE.lock().unwrap_or_else(PoisonError::into_inner);
        trace.push(TraceEvent {
            pin,
            high,
            at_ms: clock::now_ms(),
        });
    }

    /// Script the level of an input pin (models the physical world).
    /// Does not count as a firmware write and leaves no trace entry.
    pub fn set_level(pin: i32, high: bool) {
        slot(pin).level.store(high, Ordering::SeqCst);
    }

    /// Current level of a pin, whether written by firmware or scripted.
    pub fn level(pin: i32) -> bool {
        slot(pin).level.load(Ordering::SeqCst)
    }

    /// Number of firmware writes to this pin since process start.
    pub fn write_count(pin: i32) -> u32 {
        slot(pin).writes.load(Ordering::SeqCst)
    }

    /// Snapshot of every recorded write to `pin`, in order.
    pub fn drive_trace(pin: i32) -> Vec<TraceEvent> {
        let trace = TRACE.lock().unwrap_or_else(PoisonError::into_inner);
        trace.iter().filter(|e| e.pin == pin).copied().collect()
    }
}
