//! Core-pinned thread spawning for the ESP32-S3 dual-core.
//!
//! The fleet scheduler and the per-operation valve workers are real OS
//! threads (FreeRTOS tasks via `std::thread` on ESP-IDF). This module wraps
//! `esp_pthread_set_cfg()` so a spawn lands on a specific CPU core with an
//! explicit priority and stack size; on host targets it falls back to a
//! plain named thread.
//!
//! # ESP-IDF Threading Model
//!
//! ESP-IDF implements `std::thread` via pthreads, thin wrappers around
//! FreeRTOS tasks. `esp_pthread_set_cfg()` sets thread-local configuration
//! consumed by the *next* `pthread_create()` from the calling thread, so the
//! config→spawn pair below must not be interleaved with other thread
//! creation on the same thread. All provalve spawns go through this module,
//! which keeps the pair adjacent.

/// CPU core identifiers for the ESP32-S3 Xtensa LX7 dual-core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Core {
    /// Core 0 (PRO_CPU), reserved for radio/protocol stacks.
    Pro = 0,
    /// Core 1 (APP_CPU), where the valve scheduler and drive workers run.
    App = 1,
}

/// Spawn a thread pinned to `core` with explicit priority and stack.
///
/// `name` must be null-terminated (e.g. `"valve-sched\0"`) because ESP-IDF
/// takes it as a raw C string.
///
/// On non-ESP targets, `core` and `priority` are ignored.
#[cfg(target_os = "espidf")]
pub fn spawn_on_core(
    core: Core,
    priority: u8,
    stack_kb: usize,
    name: &'static str,
    f: impl FnOnce() + Send + 'static,
) -> std::thread::JoinHandle<()> {
    unsafe {
        let mut cfg = esp_idf_sys::esp_create_default_pthread_config();
        cfg.pin_to_core = core as i32;
        cfg.prio = priority as i32;
        cfg.stack_size = (stack_kb * 1024) as i32;
        cfg.thread_name = name.as_ptr() as *const _;
        let ret = esp_idf_sys::esp_pthread_set_cfg(&cfg);
        assert!(
            ret == esp_idf_sys::ESP_OK as i32,
            "esp_pthread_set_cfg failed: {ret}"
        );
    }

    let display_name = name.trim_end_matches('\0');
    log::debug!(
        "spawning '{}' on {:?} (pri={}, stack={}KB)",
        display_name,
        core,
        priority,
        stack_kb
    );

    std::thread::Builder::new()
        .name(display_name.into())
        .spawn(f)
        .expect("spawn_on_core: thread creation failed")
}

/// Simulation fallback: plain named thread, no core affinity.
#[cfg(not(target_os = "espidf"))]
pub fn spawn_on_core(
    _core: Core,
    _priority: u8,
    stack_kb: usize,
    name: &'static str,
    f: impl FnOnce() + Send + 'static,
) -> std::thread::JoinHandle<()> {
    let display_name = name.trim_end_matches('\0');
    log::debug!("spawning '{}' (sim, stack={}KB)", display_name, stack_kb);

    std::thread::Builder::new()
        .name(display_name.into())
        .stack_size(stack_kb * 1024)
        .spawn(f)
        .expect("spawn_on_core(sim): thread creation failed")
}
