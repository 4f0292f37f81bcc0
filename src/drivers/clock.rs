//! Monotonic millisecond clock.
//!
//! All leg timing and timeouts in the valve core are measured against this
//! clock, never against wall time.
//!
//! - **`target_os = "espidf"`**: wraps `esp_timer_get_time()` from the
//!   ESP-IDF high-resolution timer (microsecond precision, monotonic).
//! - **`not(target_os = "espidf")`**: uses `std::time::Instant` anchored at
//!   first use, for host-side testing and simulation.
//!
//! The counter is deliberately `u32`: it wraps after ~49.7 days, and every
//! consumer must compute elapsed time with [`elapsed_ms`] (wrapping
//! subtraction) rather than ordinary comparison.

/// Milliseconds since boot, wrapping at `u32::MAX`.
#[cfg(target_os = "espidf")]
pub fn now_ms() -> u32 {
    // SAFETY: esp_timer_get_time is a monotonic counter read; callable from
    // any task context.
    ((unsafe { esp_idf_svc::sys::esp_timer_get_time() }) / 1_000) as u32
}

/// Milliseconds since the first clock query, wrapping at `u32::MAX`.
#[cfg(not(target_os = "espidf"))]
pub fn now_ms() -> u32 {
    use std::sync::LazyLock;
    use std::time::Instant;

    static EPOCH: LazyLock<Instant> = LazyLock::new(Instant::now);
    EPOCH.elapsed().as_millis() as u32
}

/// Wraparound-safe elapsed time since `since` (a previous [`now_ms`] value).
pub fn elapsed_ms(since: u32) -> u32 {
    now_ms().wrapping_sub(since)
}

/// Sleep the calling thread. On ESP-IDF this yields the FreeRTOS task.
pub fn sleep_ms(ms: u32) {
    std::thread::sleep(std::time::Duration::from_millis(u64::from(ms)));
}
