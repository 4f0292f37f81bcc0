//! Fleet-configuration persistence.
//!
//! The valve core never writes this blob. The external action layer owns
//! configuration and persists it as an opaque postcard block
//! ([`FleetConfig::to_block`]); on boot the firmware reads the block back
//! so a restart resumes the wiring it last ran with. A missing block is
//! the factory state, not an error, and every failure path degrades to
//! the reference-carrier defaults.

use crate::config::FleetConfig;

#[cfg(target_os = "espidf")]
use esp_idf_svc::sys::*;

/// Null-terminated, as ESP-IDF takes them.
#[cfg(target_os = "espidf")]
const NAMESPACE: &[u8] = b"provalve\0";
#[cfg(target_os = "espidf")]
const KEY: &[u8] = b"fleetcfg\0";

/// Upper bound on a stored config; anything larger is treated as corrupt.
#[cfg(target_os = "espidf")]
const MAX_BLOB_SIZE: usize = 4000;

// ── ESP-IDF backend ───────────────────────────────────────────

/// Initialise the NVS flash partition, erasing it on a layout/version
/// mismatch so a firmware upgrade never bricks the boot path.
#[cfg(target_os = "espidf")]
pub fn init_flash() -> Result<(), i32> {
    // SAFETY: called once from the main task before any other NVS access.
    let ret = unsafe { nvs_flash_init() };
    if ret == ESP_ERR_NVS_NO_FREE_PAGES as i32 || ret == ESP_ERR_NVS_NEW_VERSION_FOUND as i32 {
        log::warn!("NVS: erasing and re-initialising flash partition");
        let ret = unsafe { nvs_flash_erase() };
        if ret != ESP_OK as i32 {
            return Err(ret);
        }
        let ret = unsafe { nvs_flash_init() };
        if ret != ESP_OK as i32 {
            return Err(ret);
        }
    } else if ret != ESP_OK as i32 {
        return Err(ret);
    }
    log::info!("NVS: flash initialised");
    Ok(())
}

/// Load the stored fleet configuration, if any. Logs and returns `None`
/// on absence or any defect; the caller falls back to defaults.
#[cfg(target_os = "espidf")]
pub fn load_fleet_config() -> Option<FleetConfig> {
    let bytes = match read_blob() {
        Ok(Some(bytes)) => bytes,
        Ok(None) => {
            log::info!("NVS: no stored fleet config");
            return None;
        }
        Err(rc) => {
            log::warn!("NVS: fleet config read failed (rc={rc})");
            return None;
        }
    };
    match FleetConfig::from_block(&bytes) {
        Ok(config) => {
            log::info!("NVS: fleet config loaded ({} bytes)", bytes.len());
            Some(config)
        }
        Err(e) => {
            log::warn!("NVS: stored fleet config corrupt ({e})");
            None
        }
    }
}

#[cfg(target_os = "espidf")]
fn read_blob() -> Result<Option<Vec<u8>>, i32> {
    with_handle(|handle| {
        // First call sizes the blob, second fills it.
        let mut size: usize = 0;
        let ret = unsafe {
            nvs_get_blob(
                handle,
                KEY.as_ptr() as *const _,
                core::ptr::null_mut(),
                &mut size,
            )
        };
        if ret == ESP_ERR_NVS_NOT_FOUND as i32 {
            return Ok(None);
        }
        if ret != ESP_OK as i32 {
            return Err(ret);
        }
        if size == 0 || size > MAX_BLOB_SIZE {
            return Err(ESP_ERR_INVALID_SIZE as i32);
        }

        let mut buf = vec![0u8; size];
        let ret = unsafe {
            nvs_get_blob(
                handle,
                KEY.as_ptr() as *const _,
                buf.as_mut_ptr() as *mut _,
                &mut size,
            )
        };
        if ret != ESP_OK as i32 {
            return Err(ret);
        }
        Ok(Some(buf))
    })
}

/// Open the provalve namespace read-only, run `f`, close the handle.
#[cfg(target_os = "espidf")]
fn with_handle<T>(f: impl FnOnce(nvs_handle_t) -> Result<T, i32>) -> Result<T, i32> {
    let mut handle: nvs_handle_t = 0;
    // SAFETY: NAMESPACE is null-terminated and the handle is closed on
    // every path before returning.
    let ret = unsafe {
        nvs_open(
            NAMESPACE.as_ptr() as *const _,
            nvs_open_mode_t_NVS_READONLY,
            &mut handle,
        )
    };
    if ret != ESP_OK as i32 {
        return Err(ret);
    }
    let result = f(handle);
    unsafe { nvs_close(handle) };
    result
}

// ── Simulation backend ────────────────────────────────────────

#[cfg(not(target_os = "espidf"))]
pub fn init_flash() -> Result<(), i32> {
    log::info!("NVS: simulation backend, nothing persisted");
    Ok(())
}

#[cfg(not(target_os = "espidf"))]
pub fn load_fleet_config() -> Option<FleetConfig> {
    None
}
