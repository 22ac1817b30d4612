//! End-to-end controller scenarios against the simulated instrument.
//!
//! These run in real time against the firmware model: the menu settle,
//! post-reset flush and sample cadence all behave as on hardware, so count
//! assertions carry a +/-2 tolerance for timing.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use qdaq_core::{ControllerState, QdaqError, SensorMode};
use qdaq_driver_qseries::{SensorController, SimTransport};

fn trace_init() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn connect_sim(controller: &SensorController) -> Arc<SimTransport> {
    let sim = Arc::new(SimTransport::new());
    controller
        .connect_transport(sim.clone(), "SIM", 9600)
        .expect("connect");
    sim
}

#[test]
fn connect_configure_freerun_stop() {
    trace_init();
    let controller = SensorController::new();
    controller.connect("SIM", 9600).expect("connect");
    assert_eq!(controller.state(), ControllerState::ConfigMenu);
    assert_eq!(controller.sensor_id(), "Q12345");

    // 125 averaged at 125 Hz: one reading per second.
    let config = controller.set_averaging(125).expect("set_averaging");
    assert_eq!(config.averaging, 125);
    let config = controller.set_adc_rate(125).expect("set_adc_rate");
    assert_eq!(config.adc_rate_hz, 125);
    let config = controller
        .set_mode(SensorMode::Freerun, None)
        .expect("set_mode");
    assert_eq!(config.mode, SensorMode::Freerun);

    controller.start(1.0).expect("start");
    assert_eq!(controller.state(), ControllerState::AcqFreerun);

    thread::sleep(Duration::from_secs(10));
    let snapshot = controller.snapshot();
    assert!(
        (8..=12).contains(&snapshot.len()),
        "expected ~10 readings at 1 Hz, got {}",
        snapshot.len()
    );
    assert!(snapshot.iter().all(|r| r.mode == SensorMode::Freerun));
    assert!(snapshot.iter().all(|r| r.sensor_id == "Q12345"));
    // Timestamps are non-decreasing in append order.
    for pair in snapshot.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }

    controller.stop().expect("stop");
    assert_eq!(controller.state(), ControllerState::ConfigMenu);
    controller.disconnect();
    assert_eq!(controller.state(), ControllerState::Disconnected);
    assert!(!controller.is_connected());
}

#[test]
fn polled_sequence() {
    let controller = SensorController::new();
    controller.connect("SIM", 9600).expect("connect");

    let config = controller
        .set_mode(SensorMode::Polled, Some('A'))
        .expect("set_mode");
    assert_eq!(config.mode, SensorMode::Polled);
    assert_eq!(config.tag, Some('A'));
    controller.set_averaging(100).expect("set_averaging");
    controller.set_adc_rate(125).expect("set_adc_rate");

    controller.start(2.0).expect("start");
    assert_eq!(controller.state(), ControllerState::AcqPolled);

    thread::sleep(Duration::from_secs(5));
    let snapshot = controller.snapshot();
    assert!(
        (8..=12).contains(&snapshot.len()),
        "expected ~10 readings at 2 Hz over 5 s, got {}",
        snapshot.len()
    );
    assert!(snapshot.iter().all(|r| r.mode == SensorMode::Polled));

    controller.stop().expect("stop");
    assert_eq!(controller.state(), ControllerState::ConfigMenu);
    controller.disconnect();
}

#[test]
fn pause_preserves_mode_and_resume_continues() {
    let controller = SensorController::new();
    controller.connect("SIM", 9600).expect("connect");
    controller.start(1.0).expect("start");
    assert_eq!(controller.state(), ControllerState::AcqFreerun);
    thread::sleep(Duration::from_secs(2));

    controller.pause().expect("pause");
    assert_eq!(controller.state(), ControllerState::Paused);
    let during_pause = controller.snapshot().len();
    thread::sleep(Duration::from_secs(2));
    assert_eq!(
        controller.snapshot().len(),
        during_pause,
        "no readings may arrive while paused"
    );

    controller.resume().expect("resume");
    assert_eq!(controller.state(), ControllerState::AcqFreerun);
    thread::sleep(Duration::from_secs(2));
    assert!(
        controller.snapshot().len() > during_pause,
        "readings resume after resume()"
    );

    controller.stop().expect("stop");
    controller.disconnect();
}

#[test]
fn stop_works_from_paused() {
    let controller = SensorController::new();
    controller.connect("SIM", 9600).expect("connect");
    controller.start(1.0).expect("start");
    controller.pause().expect("pause");
    controller.stop().expect("stop from paused");
    assert_eq!(controller.state(), ControllerState::ConfigMenu);
    controller.disconnect();
}

#[test]
fn invalid_config_rejected_before_any_wire_traffic() {
    let controller = SensorController::new();
    let sim = connect_sim(&controller);
    let config_before = controller.get_config().expect("get_config");
    let bytes_before = sim.bytes_written();

    let err = controller.set_adc_rate(1000).unwrap_err();
    assert!(matches!(err, QdaqError::InvalidConfigValue(_)));
    assert_eq!(
        sim.bytes_written(),
        bytes_before,
        "rejected value must not reach the wire"
    );
    assert_eq!(controller.get_config().unwrap(), config_before);

    let err = controller.set_averaging(0).unwrap_err();
    assert!(matches!(err, QdaqError::InvalidConfigValue(_)));
    let err = controller
        .set_mode(SensorMode::Polled, Some('a'))
        .unwrap_err();
    assert!(matches!(err, QdaqError::InvalidConfigValue(_)));
    let err = controller.set_mode(SensorMode::Polled, None).unwrap_err();
    assert!(matches!(err, QdaqError::InvalidConfigValue(_)));
    assert_eq!(sim.bytes_written(), bytes_before);

    controller.disconnect();
}

#[test]
fn config_writes_are_reflected_by_get_config() {
    let controller = SensorController::new();
    controller.connect("SIM", 9600).expect("connect");

    controller.set_averaging(250).expect("set_averaging");
    assert_eq!(controller.get_config().unwrap().averaging, 250);

    controller.set_adc_rate(62).expect("set_adc_rate");
    let config = controller.get_config().unwrap();
    assert_eq!(config.adc_rate_hz, 62);
    assert_eq!(config.averaging, 250, "rate write must not clobber averaging");

    controller
        .set_mode(SensorMode::Polled, Some('C'))
        .expect("set_mode");
    let config = controller.get_config().unwrap();
    assert_eq!(config.mode, SensorMode::Polled);
    assert_eq!(config.tag, Some('C'));

    controller.disconnect();
}

#[test]
fn tag_mismatch_is_logged_and_skipped() {
    let controller = SensorController::new();
    let sim = connect_sim(&controller);
    controller
        .set_mode(SensorMode::Polled, Some('A'))
        .expect("set_mode");
    controller.set_averaging(50).expect("set_averaging");
    controller.set_adc_rate(125).expect("set_adc_rate");
    controller.start(2.0).expect("start");

    // A response framed for another instrument's TAG.
    sim.inject_line("B,123.456789");
    thread::sleep(Duration::from_secs(2));

    let snapshot = controller.snapshot();
    assert!(
        snapshot.iter().all(|r| r.value != 123.456789),
        "mismatched TAG line must not be appended"
    );
    assert!(
        !snapshot.is_empty(),
        "reader keeps polling after a TAG mismatch"
    );
    assert_eq!(controller.state(), ControllerState::AcqPolled);

    controller.stop().expect("stop");
    controller.disconnect();
}

#[test]
fn illegal_transitions_fail_with_invalid_state() {
    let controller = SensorController::new();

    assert!(matches!(
        controller.start(1.0).unwrap_err(),
        QdaqError::InvalidState { .. }
    ));
    assert!(matches!(
        controller.pause().unwrap_err(),
        QdaqError::InvalidState { .. }
    ));
    assert!(matches!(
        controller.get_config().unwrap_err(),
        QdaqError::InvalidState { .. }
    ));

    controller.connect("SIM", 9600).expect("connect");
    assert!(matches!(
        controller.connect("SIM", 9600).unwrap_err(),
        QdaqError::InvalidState { .. }
    ));
    assert!(matches!(
        controller.resume().unwrap_err(),
        QdaqError::InvalidState { .. }
    ));
    assert!(matches!(
        controller.stop().unwrap_err(),
        QdaqError::InvalidState { .. }
    ));

    controller.start(1.0).expect("start");
    assert!(matches!(
        controller.get_config().unwrap_err(),
        QdaqError::InvalidState { .. }
    ));
    assert!(matches!(
        controller.set_averaging(10).unwrap_err(),
        QdaqError::InvalidState { .. }
    ));

    // disconnect is legal from any state.
    controller.disconnect();
    assert_eq!(controller.state(), ControllerState::Disconnected);
}

#[test]
fn disconnect_clears_buffer_and_reconnect_restores_menu() {
    let controller = SensorController::new();
    controller.connect("SIM", 9600).expect("connect");
    controller.start(1.0).expect("start");
    thread::sleep(Duration::from_secs(2));
    controller.disconnect();
    assert!(controller.snapshot().is_empty());
    assert!(controller.latest().is_none());

    controller.reconnect().expect("reconnect");
    assert_eq!(controller.state(), ControllerState::ConfigMenu);
    controller.disconnect();
}

#[test]
fn reconnect_without_prior_connection_fails() {
    let controller = SensorController::new();
    assert!(matches!(
        controller.reconnect().unwrap_err(),
        QdaqError::PortUnavailable(_)
    ));
}
