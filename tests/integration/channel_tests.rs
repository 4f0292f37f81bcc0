//! Integration tests for one channel handler driving the mechanics rig:
//! calibration leg sequences, end-stop seeks, timed relative moves, the
//! drift budget, and worker cancellation.
//!
//! Pin blocks (4 pins each, spaced by 8):
//!
//! | base | test                                              |
//! |------|---------------------------------------------------|
//! |  0   | calibrate_from_closed_end_symmetric_mirrors_one_leg |
//! |  8   | calibrate_from_open_end_asymmetric_measures_both_legs |
//! | 16   | calibrate_from_mid_travel_positions_toward_target_first |
//! | 24   | calibration_timeout_reports_error_and_releases_lines |
//! | 32   | seek_works_uncalibrated_and_anchors               |
//! | 40   | relative_move_lands_on_target                     |
//! | 48   | add_up_budget_forces_re_anchor                    |
//! | 56   | stop_mid_motion_cancels_promptly                  |

use provalve::channel::ChannelHandler;
use provalve::config::{TimingMode, TimingPolicy};
use provalve::drivers::clock;
use provalve::drivers::gpio::sim;
use provalve::status::ChannelState;

use crate::valve_sim::{
    channel_config, test_profile, wait_until, Mechanics, ValveRig, END_EPS_PCT, POSITION_TOL_PCT,
    TRAVEL_TOL_MS,
};

fn timing(mode: TimingMode) -> TimingPolicy {
    TimingPolicy {
        mode,
        timeout_seconds: 0,
    }
}

fn assert_travel_close(measured_ms: u32, expected_ms: u32) {
    let diff = measured_ms.abs_diff(expected_ms);
    assert!(
        diff <= TRAVEL_TOL_MS,
        "measured {measured_ms} ms, expected ~{expected_ms} ms"
    );
}

// ── Calibration: parked on a stop, symmetric ─────────────────

#[test]
fn calibrate_from_closed_end_symmetric_mirrors_one_leg() {
    let cfg = channel_config(0, 0);
    let rig = ValveRig::spawn(&cfg, Mechanics::symmetric(400, 0.0));
    let mut ch = ChannelHandler::new(0);
    ch.start(&cfg, &test_profile(5), timing(TimingMode::Symmetric))
        .unwrap();

    ch.calibrate().unwrap();
    assert_eq!(ch.state(), ChannelState::Calibrating);
    // A second request during the run is absorbed, not an error and not
    // a second worker.
    ch.calibrate()
        .expect("calibrate while calibrating must be a no-op");
    wait_until(5_000, "calibration to finish", || {
        ch.state() == ChannelState::Idle
    });

    let status = ch.status();
    assert!(!status.has_error(), "unexpected error: {}", status.error);
    assert!(status.travel.is_calibrated());
    // One measured leg, mirrored into both directions.
    assert_eq!(
        status.travel.open_to_closed_ms,
        status.travel.closed_to_open_ms
    );
    assert_travel_close(status.travel.closed_to_open_ms, 400);
    assert_eq!(status.add_up_count, 0);

    // The single away leg from the closed stop parks the valve open.
    assert_eq!(ch.position_pct(), Some(100.0));
    assert!(rig.stop() >= 100.0 - 2.0 * END_EPS_PCT);
}

// ── Calibration: parked on a stop, asymmetric ────────────────

#[test]
fn calibrate_from_open_end_asymmetric_measures_both_legs() {
    let cfg = channel_config(8, 0);
    let rig = ValveRig::spawn(&cfg, Mechanics::asymmetric(600, 300, 100.0));
    let mut ch = ChannelHandler::new(1);
    ch.start(&cfg, &test_profile(5), timing(TimingMode::Asymmetric))
        .unwrap();

    ch.calibrate().unwrap();
    wait_until(8_000, "calibration to finish", || {
        ch.state() == ChannelState::Idle
    });

    let status = ch.status();
    assert!(!status.has_error(), "unexpected error: {}", status.error);
    assert_travel_close(status.travel.open_to_closed_ms, 600);
    assert_travel_close(status.travel.closed_to_open_ms, 300);
    // Genuinely separate measurements, not a mirror.
    assert!(status.travel.open_to_closed_ms > status.travel.closed_to_open_ms);

    // Away leg to closed, back leg home: parked open again.
    assert_eq!(ch.position_pct(), Some(100.0));
    assert!(rig.stop() >= 100.0 - 2.0 * END_EPS_PCT);
}

// ── Calibration: mid-travel start ────────────────────────────

#[test]
fn calibrate_from_mid_travel_positions_toward_target_first() {
    let cfg = channel_config(16, 0);
    let rig = ValveRig::spawn(&cfg, Mechanics::asymmetric(500, 400, 50.0));
    let mut ch = ChannelHandler::new(2);
    ch.start(&cfg, &test_profile(5), timing(TimingMode::Asymmetric))
        .unwrap();

    // A mostly-open target makes the unrecorded positioning leg run to
    // the open end, not through a pointless full close.
    ch.set_target(70).unwrap();
    ch.calibrate().unwrap();
    wait_until(8_000, "calibration to finish", || {
        ch.state() == ChannelState::Idle
    });

    // Line A (toward open) energized before line B ever was.
    let a_first = sim::drive_trace(16).iter().find(|e| e.high).map(|e| e.at_ms);
    let b_first = sim::drive_trace(17).iter().find(|e| e.high).map(|e| e.at_ms);
    assert!(
        a_first.unwrap() < b_first.unwrap(),
        "positioning leg ran the wrong way: A at {a_first:?}, B at {b_first:?}"
    );

    // The positioning leg is not recorded: both measurements are full
    // traverses despite the half-open start.
    let status = ch.status();
    assert!(!status.has_error(), "unexpected error: {}", status.error);
    assert_travel_close(status.travel.open_to_closed_ms, 500);
    assert_travel_close(status.travel.closed_to_open_ms, 400);
    assert_eq!(status.value, 70, "calibration must not touch the target");
    assert_eq!(ch.position_pct(), Some(100.0));
    drop(rig);
}

// ── Calibration: stuck valve ─────────────────────────────────

#[test]
fn calibration_timeout_reports_error_and_releases_lines() {
    // No rig: the motor spins but no end-stop ever asserts.
    let cfg = channel_config(24, 0);
    let mut ch = ChannelHandler::new(3);
    ch.start(
        &cfg,
        &test_profile(5),
        TimingPolicy {
            mode: TimingMode::Symmetric,
            timeout_seconds: 1,
        },
    )
    .unwrap();

    ch.calibrate().unwrap();
    wait_until(6_000, "calibration to fail", || {
        ch.state() == ChannelState::Idle
    });

    let status = ch.status();
    assert_eq!(status.error.as_str(), "calibration error");
    assert!(!status.travel.is_calibrated());
    assert_eq!(ch.position_pct(), None);
    assert!(!sim::level(24), "line A still energized after timeout");
    assert!(!sim::level(25), "line B still energized after timeout");
}

// ── Absolute targets: end-stop seek ──────────────────────────

#[test]
fn seek_works_uncalibrated_and_anchors() {
    let cfg = channel_config(32, 0);
    let rig = ValveRig::spawn(&cfg, Mechanics::symmetric(400, 40.0));
    let mut ch = ChannelHandler::new(4);
    ch.start(&cfg, &test_profile(5), timing(TimingMode::Symmetric))
        .unwrap();

    // Never calibrated, but 100 is an end-stop seek, not a timed pulse.
    ch.set_target(100).unwrap();
    ch.actuate().unwrap();
    wait_until(5_000, "seek to finish", || ch.state() == ChannelState::Idle);

    let status = ch.status();
    assert!(!status.has_error(), "unexpected error: {}", status.error);
    assert!(!status.travel.is_calibrated(), "a seek measures nothing");
    assert_eq!(status.add_up_count, 0);
    assert_eq!(ch.position_pct(), Some(100.0));
    assert!(rig.stop() >= 100.0 - 2.0 * END_EPS_PCT);
}

// ── Relative targets: timed pulse ────────────────────────────

#[test]
fn relative_move_lands_on_target() {
    let cfg = channel_config(40, 0);
    let rig = ValveRig::spawn(&cfg, Mechanics::symmetric(400, 0.0));
    let mut ch = ChannelHandler::new(5);
    ch.start(&cfg, &test_profile(5), timing(TimingMode::Symmetric))
        .unwrap();

    ch.calibrate().unwrap();
    wait_until(5_000, "calibration to finish", || {
        ch.state() == ChannelState::Idle
    });
    assert_eq!(ch.position_pct(), Some(100.0));

    ch.set_target(50).unwrap();
    ch.actuate().unwrap();
    wait_until(5_000, "move to finish", || ch.state() == ChannelState::Idle);

    let status = ch.status();
    assert!(!status.has_error(), "unexpected error: {}", status.error);
    assert_eq!(status.add_up_count, 1);
    let est = ch.position_pct().expect("estimate survives a pulse");
    assert!((est - 50.0).abs() < 0.01, "estimate drifted to {est}");

    let shaft = rig.stop();
    assert!(
        (shaft - 50.0).abs() <= POSITION_TOL_PCT,
        "shaft at {shaft}, wanted ~50"
    );
}

// ── Drift budget ─────────────────────────────────────────────

#[test]
fn add_up_budget_forces_re_anchor() {
    let cfg = channel_config(48, 0);
    let rig = ValveRig::spawn(&cfg, Mechanics::symmetric(400, 100.0));
    let mut ch = ChannelHandler::new(6);
    // Budget of two relative moves between anchors.
    ch.start(&cfg, &test_profile(2), timing(TimingMode::Symmetric))
        .unwrap();

    ch.calibrate().unwrap();
    wait_until(5_000, "calibration to finish", || {
        ch.state() == ChannelState::Idle
    });
    // From the open stop the away leg parks the valve closed.
    assert_eq!(ch.position_pct(), Some(0.0));

    ch.set_target(60).unwrap();
    ch.actuate().unwrap();
    wait_until(5_000, "first move", || ch.state() == ChannelState::Idle);
    assert_eq!(ch.status().add_up_count, 1);

    // Second move fits the budget: a short pulse, no end-stop trip.
    rig.reset_extremes();
    ch.set_target(55).unwrap();
    ch.actuate().unwrap();
    wait_until(5_000, "second move", || ch.state() == ChannelState::Idle);
    assert_eq!(ch.status().add_up_count, 2);
    assert!(
        rig.highest_pct() < 70.0,
        "in-budget move should not have re-anchored (peak {})",
        rig.highest_pct()
    );

    // Budget spent: the next move must run to the stop nearest its
    // target before pulsing.
    rig.reset_extremes();
    ch.set_target(70).unwrap();
    ch.actuate().unwrap();
    wait_until(8_000, "re-anchored move", || {
        ch.state() == ChannelState::Idle
    });
    assert!(
        rig.highest_pct() >= 100.0 - 2.0 * END_EPS_PCT,
        "move over budget never touched the open stop (peak {})",
        rig.highest_pct()
    );
    let status = ch.status();
    assert!(!status.has_error(), "unexpected error: {}", status.error);
    assert_eq!(status.add_up_count, 1, "anchor resets the budget");
    let est = ch.position_pct().expect("estimate after re-anchor");
    assert!((est - 70.0).abs() < 0.01, "estimate drifted to {est}");
    drop(rig);
}

// ── Cancellation ─────────────────────────────────────────────

#[test]
fn stop_mid_motion_cancels_promptly() {
    let cfg = channel_config(56, 0);
    let rig = ValveRig::spawn(&cfg, Mechanics::symmetric(500, 0.0));
    let mut ch = ChannelHandler::new(7);
    ch.start(&cfg, &test_profile(5), timing(TimingMode::Symmetric))
        .unwrap();

    ch.calibrate().unwrap();
    wait_until(5_000, "calibration to finish", || {
        ch.state() == ChannelState::Idle
    });

    // A full close takes ~500 ms; stop in the middle of it.
    ch.set_target(0).unwrap();
    ch.actuate().unwrap();
    clock::sleep_ms(100);

    let t0 = clock::now_ms();
    ch.stop();
    let stop_ms = clock::elapsed_ms(t0);
    assert!(stop_ms < 250, "stop blocked for {stop_ms} ms");

    assert_eq!(ch.state(), ChannelState::Uninitialized);
    assert!(!sim::level(56), "line A still energized after stop");
    assert!(!sim::level(57), "line B still energized after stop");

    // The shaft froze wherever the cancel caught it.
    let shaft = rig.stop();
    assert!(
        shaft > 5.0 && shaft < 95.0,
        "shaft at {shaft}, expected mid-travel"
    );

    // And the channel is reusable afterwards.
    ch.start(&cfg, &test_profile(5), timing(TimingMode::Symmetric))
        .unwrap();
    assert_eq!(ch.state(), ChannelState::Idle);
}
