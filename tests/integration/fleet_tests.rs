//! Integration tests for the fleet supervisor: boot calibration, the
//! all-idle dispatch barrier, latest-wins targeting, reconfiguration
//! diffing, and lifecycle.
//!
//! Pin blocks (8 per channel, two channels where needed):
//!
//! | base      | test                                      |
//! |-----------|-------------------------------------------|
//! |  80 /  88 | boot_calibrates_every_channel_in_slot_order |
//! |  96 / 104 | barrier_serializes_motion_across_channels |
//! | 112       | latest_value_wins_on_rapid_commands       |
//! | 128 / 136 / 140 | reconfigure_applies_minimal_diff    |
//! | 144       | invalid_commands_are_rejected_cleanly     |
//! | 160 / 168 | stop_flushes_queue_and_parks_channels     |

use provalve::config::TimingMode;
use provalve::drivers::clock;
use provalve::drivers::gpio::sim;
use provalve::error::Error;
use provalve::fleet::FleetSupervisor;
use provalve::status::ChannelState;

use crate::valve_sim::{
    channel_config, fleet_config, wait_until, Mechanics, ValveRig, POSITION_TOL_PCT, TEST_PROFILE,
    TRAVEL_TOL_MS,
};

fn first_high_ms(pin: i32) -> Option<u32> {
    sim::drive_trace(pin).iter().find(|e| e.high).map(|e| e.at_ms)
}

fn last_write_ms(pin: i32) -> Option<u32> {
    sim::drive_trace(pin).last().map(|e| e.at_ms)
}

/// Earliest energization across a channel's two drive lines.
fn motion_began_ms(line_a: i32, line_b: i32) -> Option<u32> {
    match (first_high_ms(line_a), first_high_ms(line_b)) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn wait_for_drain(fleet: &FleetSupervisor, timeout_ms: u32) {
    wait_until(timeout_ms, "queue to drain and channels to settle", || {
        fleet.pending_actions() == 0
            && fleet
                .get_status()
                .iter()
                .all(|s| s.state == ChannelState::Idle)
    });
}

// ── Boot sequence ────────────────────────────────────────────

#[test]
fn boot_calibrates_every_channel_in_slot_order() {
    // Channel 0 parked closed; channel 1 caught mid-travel with a
    // mostly-open default target, so its run starts with a positioning
    // leg toward the open end.
    let cfg0 = channel_config(80, 0);
    let cfg1 = channel_config(88, 70);
    let rig0 = ValveRig::spawn(&cfg0, Mechanics::symmetric(300, 0.0));
    let rig1 = ValveRig::spawn(&cfg1, Mechanics::symmetric(300, 50.0));

    let mut fleet = FleetSupervisor::new();
    fleet
        .start(fleet_config(
            vec![cfg0.clone(), cfg1.clone()],
            TimingMode::Asymmetric,
        ))
        .unwrap();
    assert!(fleet.is_running());

    wait_until(10_000, "both boot calibrations", || {
        fleet
            .get_status()
            .iter()
            .all(|s| s.state == ChannelState::Idle && s.travel.is_calibrated())
    });

    for (i, status) in fleet.get_status().iter().enumerate() {
        assert!(!status.has_error(), "channel {i}: {}", status.error);
        for measured in [
            status.travel.open_to_closed_ms,
            status.travel.closed_to_open_ms,
        ] {
            assert!(
                measured.abs_diff(300) <= TRAVEL_TOL_MS,
                "channel {i} measured {measured} ms"
            );
        }
    }

    // Slot order under the barrier: channel 1 never moved until channel
    // 0's run was completely over.
    let ch0_began = motion_began_ms(80, 81).expect("channel 0 moved");
    let ch0_ended = last_write_ms(80).unwrap().max(last_write_ms(81).unwrap());
    let ch1_began = motion_began_ms(88, 89).expect("channel 1 moved");
    assert!(ch0_began < ch1_began);
    assert!(
        ch1_began >= ch0_ended,
        "channel 1 moved at {ch1_began} ms, channel 0 still active until {ch0_ended} ms"
    );

    // The mid-travel channel drove open (line A) before it ever drove
    // closed: the positioning leg follows the stored target.
    let ch1_open_first = first_high_ms(88).expect("channel 1 never drove open");
    let ch1_close_first = first_high_ms(89).expect("channel 1 never drove closed");
    assert!(
        ch1_open_first < ch1_close_first,
        "channel 1 positioned away from its target (open at {ch1_open_first} ms, closed at {ch1_close_first} ms)"
    );

    fleet.stop();
    drop(rig0);
    drop(rig1);
}

// ── Shared-supply barrier ────────────────────────────────────

#[test]
fn barrier_serializes_motion_across_channels() {
    let cfg0 = channel_config(96, 0);
    let cfg1 = channel_config(104, 0);
    let rig0 = ValveRig::spawn(&cfg0, Mechanics::symmetric(300, 0.0));
    let rig1 = ValveRig::spawn(&cfg1, Mechanics::symmetric(300, 0.0));

    let mut fleet = FleetSupervisor::new();
    fleet
        .start(fleet_config(
            vec![cfg0.clone(), cfg1.clone()],
            TimingMode::Symmetric,
        ))
        .unwrap();
    wait_for_drain(&fleet, 10_000);

    // Both parked open after calibration; send both back down at once.
    fleet.actuate(0, 0).unwrap();
    fleet.actuate(1, 0).unwrap();

    // Sample the whole run: at no instant are two channels in motion.
    let started = clock::now_ms();
    let mut saw_motion = false;
    loop {
        let statuses = fleet.get_status();
        let moving = statuses.iter().filter(|s| s.state.is_moving()).count();
        assert!(moving <= 1, "barrier violated: {moving} channels moving");
        saw_motion |= moving == 1;

        let settled = statuses.iter().all(|s| s.state == ChannelState::Idle);
        if settled && fleet.pending_actions() == 0 {
            break;
        }
        assert!(
            clock::elapsed_ms(started) < 10_000,
            "actuations never finished"
        );
        clock::sleep_ms(2);
    }
    assert!(saw_motion, "sampled no motion at all");

    assert_eq!(fleet.position_pct(0).unwrap(), Some(0.0));
    assert_eq!(fleet.position_pct(1).unwrap(), Some(0.0));
    fleet.stop();
    assert!(rig0.stop() <= 2.0);
    assert!(rig1.stop() <= 2.0);
}

// ── Latest-wins targeting ────────────────────────────────────

#[test]
fn latest_value_wins_on_rapid_commands() {
    let cfg = channel_config(112, 0);
    let rig = ValveRig::spawn(&cfg, Mechanics::symmetric(300, 0.0));

    let mut fleet = FleetSupervisor::new();
    fleet
        .start(fleet_config(vec![cfg.clone()], TimingMode::Symmetric))
        .unwrap();

    // Pile up commands while the boot calibration still holds the
    // barrier, so all three are queued before any of them dispatches.
    wait_until(2_000, "boot calibration to start", || {
        fleet.channel_status(0).unwrap().state == ChannelState::Calibrating
    });
    fleet.actuate(0, 70).unwrap();
    fleet.actuate(0, 30).unwrap();
    fleet.actuate(0, 90).unwrap();
    assert_eq!(
        fleet.channel_status(0).unwrap().value,
        90,
        "newest target stored immediately"
    );

    wait_for_drain(&fleet, 10_000);

    // Every dispatch read the stored target, so the first drove to 90
    // and the other two were in-place no-ops.
    let status = fleet.channel_status(0).unwrap();
    assert!(!status.has_error(), "unexpected error: {}", status.error);
    assert_eq!(status.value, 90);
    assert_eq!(status.add_up_count, 1, "duplicates must not pulse again");

    let est = fleet.position_pct(0).unwrap().expect("anchored estimate");
    assert!((est - 90.0).abs() < 0.01, "estimate at {est}");
    fleet.stop();
    let shaft = rig.stop();
    assert!(
        (shaft - 90.0).abs() <= POSITION_TOL_PCT,
        "shaft at {shaft}, wanted ~90"
    );
}

// ── Reconfiguration diff ─────────────────────────────────────

#[test]
fn reconfigure_applies_minimal_diff() {
    let cfg0 = channel_config(128, 0);
    let cfg1 = channel_config(136, 0);
    let rig0 = ValveRig::spawn(&cfg0, Mechanics::symmetric(300, 0.0));
    let rig1 = ValveRig::spawn(&cfg1, Mechanics::symmetric(300, 0.0));

    let mut fleet = FleetSupervisor::new();
    let base = fleet_config(vec![cfg0.clone(), cfg1.clone()], TimingMode::Symmetric);
    fleet.start(base.clone()).unwrap();
    wait_for_drain(&fleet, 10_000);
    let travels: Vec<_> = fleet.get_status().iter().map(|s| s.travel).collect();

    let drive_pins = [128, 129, 136, 137];
    let writes = |pins: &[i32]| -> Vec<u32> { pins.iter().map(|&p| sim::write_count(p)).collect() };

    // (1) Identical config: no GPIO activity, no queued work, travel kept.
    let before = writes(&drive_pins);
    fleet.reconfigure(base.clone()).unwrap();
    clock::sleep_ms(100);
    assert_eq!(writes(&drive_pins), before, "no-op reconfigure moved pins");
    assert_eq!(fleet.pending_actions(), 0);
    let now: Vec<_> = fleet.get_status().iter().map(|s| s.travel).collect();
    assert_eq!(now, travels, "no-op reconfigure disturbed travel times");

    // (2) Profile-only change: applied live, still no motion.
    let mut profile_tweak = base.clone();
    profile_tweak
        .profiles
        .get_mut(TEST_PROFILE)
        .unwrap()
        .max_actuate_add_ups = 9;
    fleet.reconfigure(profile_tweak.clone()).unwrap();
    assert!(fleet.get_status().iter().all(|s| s.max_add_ups == 9));
    clock::sleep_ms(100);
    assert_eq!(writes(&drive_pins), before, "profile change moved pins");
    assert_eq!(fleet.pending_actions(), 0);
    let now: Vec<_> = fleet.get_status().iter().map(|s| s.travel).collect();
    assert_eq!(now, travels, "profile change disturbed travel times");

    // (3) Drive-line rewire on channel 1: rebind plus recalibration on
    // the new pins, while channel 0 never stirs.
    drop(rig1);
    let cfg1_new = channel_config(140, 0);
    let rig1_new = ValveRig::spawn(&cfg1_new, Mechanics::symmetric(300, 0.0));
    let mut rewire = profile_tweak.clone();
    rewire.channels[1] = cfg1_new;
    let ch0_before = writes(&[128, 129]);

    fleet.reconfigure(rewire).unwrap();
    // The rebind clears the measurement synchronously; the queued
    // calibration then re-measures it on the new wiring.
    wait_until(10_000, "channel 1 to recalibrate", || {
        let s = fleet.channel_status(1).unwrap();
        s.state == ChannelState::Idle && s.travel.is_calibrated()
    });

    assert!(
        first_high_ms(140).is_some() || first_high_ms(141).is_some(),
        "new drive lines never energized"
    );
    assert_eq!(
        writes(&[128, 129]),
        ch0_before,
        "channel 0 moved during a rewire of channel 1"
    );
    assert_eq!(
        fleet.channel_status(0).unwrap().travel,
        travels[0],
        "channel 0 lost its measurement"
    );

    fleet.stop();
    drop(rig0);
    drop(rig1_new);
}

// ── Validation ───────────────────────────────────────────────

#[test]
fn invalid_commands_are_rejected_cleanly() {
    let cfg = channel_config(144, 20);
    let rig = ValveRig::spawn(&cfg, Mechanics::symmetric(300, 0.0));

    let mut fleet = FleetSupervisor::new();
    fleet
        .start(fleet_config(vec![cfg.clone()], TimingMode::Symmetric))
        .unwrap();
    wait_for_drain(&fleet, 10_000);

    assert_eq!(fleet.actuate(0, 101), Err(Error::ValueOutOfRange));
    assert_eq!(fleet.actuate(5, 50), Err(Error::ChannelOutOfRange));
    assert_eq!(fleet.calibrate(9), Err(Error::ChannelOutOfRange));

    // Nothing stored, nothing queued.
    assert_eq!(fleet.pending_actions(), 0);
    assert_eq!(fleet.channel_status(0).unwrap().value, 20);
    fleet.stop();
    drop(rig);
}

// ── Lifecycle ────────────────────────────────────────────────

#[test]
fn stop_flushes_queue_and_parks_channels() {
    let cfg0 = channel_config(160, 0);
    let cfg1 = channel_config(168, 0);
    let rig0 = ValveRig::spawn(&cfg0, Mechanics::symmetric(400, 0.0));
    let rig1 = ValveRig::spawn(&cfg1, Mechanics::symmetric(400, 0.0));

    let mut fleet = FleetSupervisor::new();
    let config = fleet_config(vec![cfg0.clone(), cfg1.clone()], TimingMode::Symmetric);
    fleet.start(config.clone()).unwrap();

    // Catch the fleet mid-boot: channel 0 calibrating, channel 1's
    // calibration still behind the barrier, plus one queued actuation.
    wait_until(2_000, "first boot calibration to start", || {
        fleet.channel_status(0).unwrap().state == ChannelState::Calibrating
    });
    fleet.actuate(1, 80).unwrap();
    assert_eq!(fleet.pending_actions(), 2);

    fleet.stop();
    assert!(!fleet.is_running());
    assert_eq!(fleet.pending_actions(), 0, "stop must flush the queue");
    for (i, status) in fleet.get_status().iter().enumerate() {
        assert_eq!(
            status.state,
            ChannelState::Uninitialized,
            "channel {i} not parked"
        );
    }
    for pin in [160, 161, 168, 169] {
        assert!(!sim::level(pin), "drive line {pin} energized after stop");
    }

    // The same supervisor comes back up cleanly.
    fleet.start(config).unwrap();
    assert!(fleet.is_running());
    wait_until(12_000, "recalibration after restart", || {
        fleet
            .get_status()
            .iter()
            .all(|s| s.state == ChannelState::Idle && s.travel.is_calibrated())
    });
    fleet.stop();
    drop(rig0);
    drop(rig1);
}
