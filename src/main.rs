//! ProValve Firmware: Main Entry Point
//!
//! Boot sequence and task topology:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │  main task (PRO core)                                          │
//! │                                                                │
//! │  link_patches ─▶ logger ─▶ NVS flash ─▶ fleet config           │
//! │                                │             │                 │
//! │                                │       stored block            │
//! │                                │       or defaults             │
//! │                                ▼             ▼                 │
//! │              erase-and-retry on      FleetSupervisor::start    │
//! │              version mismatch          │                       │
//! │                                        ├─ bind channel GPIO    │
//! │                                        ├─ queue calibrations   │
//! │                                        └─ spawn scheduler ──┐  │
//! │                                                             │  │
//! │  heartbeat loop (status log only) ◀─────────────────────────┘  │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! After start-up the main task only heartbeats: the scheduler task owns
//! the action queue, and each moving channel owns a short-lived drive
//! worker, all pinned to the application core.
#![deny(unused_must_use)]

// ── Module declarations ───────────────────────────────────────
pub mod channel;
pub mod config;
pub mod drivers;
pub mod error;
pub mod fleet;
pub mod nvs;
pub mod pins;
pub mod profile;
pub mod status;

// ── Imports ───────────────────────────────────────────────────
use anyhow::Result;
use log::{info, warn};

use config::FleetConfig;
use fleet::FleetSupervisor;

/// Period of the idle status log in the main task.
const HEARTBEAT_SECS: u32 = 30;

fn main() -> Result<()> {
    // Mandatory for ESP-IDF: patch runtime symbols before anything else.
    esp_idf_svc::sys::link_patches();
    esp_idf_logger::init()?;

    info!("╔══════════════════════════════════════╗");
    info!("║       ProValve Firmware v{}       ║", env!("CARGO_PKG_VERSION"));
    info!("║   motorized valve fleet controller   ║");
    info!("╚══════════════════════════════════════╝");

    if let Err(rc) = nvs::init_flash() {
        warn!("NVS unavailable (rc={rc}); running with defaults only");
    }
    let fleet_config = nvs::load_fleet_config().unwrap_or_else(|| {
        info!("Using reference carrier pin map");
        FleetConfig::default()
    });
    info!(
        "Fleet config: {} channel(s), {} valve profile(s)",
        fleet_config.channels.len(),
        fleet_config.profiles.len()
    );

    let mut fleet = FleetSupervisor::new();
    fleet.start(fleet_config)?;
    info!("Supervisor running; channels calibrate in queue order");

    loop {
        drivers::clock::sleep_ms(HEARTBEAT_SECS * 1_000);

        let pending = fleet.pending_actions();
        if pending > 0 {
            info!("Fleet: {pending} action(s) queued");
        }
        for (index, st) in fleet.get_status().iter().enumerate() {
            if st.has_error() {
                warn!(
                    "ch{index}: {:?} value={} err='{}'",
                    st.state, st.value, st.error
                );
            } else {
                info!(
                    "ch{index}: {:?} value={} travel={}ms/{}ms add-ups={}/{}",
                    st.state,
                    st.value,
                    st.travel.open_to_closed_ms,
                    st.travel.closed_to_open_ms,
                    st.add_up_count,
                    st.max_add_ups
                );
            }
        }
    }
}
