mod common;

use abc150_lib::lifecycle::{SingleChannelTest, TestControl, TestError, TestState};
use abc150_lib::protocol::{self, Channel, ControlMode};
use abc150_lib::single::{CapacityPhase, CapacityTest, ChargeDischargeTest, PulseTest};
use common::{approx, pack, Rig};
use std::time::Duration;

const SECOND: Duration = Duration::from_secs(1);

fn pulse_rig() -> Rig {
    Rig::ready(vec![pack(1, 350.0, &[3.70, 3.71, 3.69])])
}

#[test]
fn pulse_measures_dcr() {
    let rig = pulse_rig();
    let test = PulseTest::new(rig.station.clone(), Channel::A, 10 * SECOND);

    test.start(1).unwrap();
    assert_eq!(test.state(), TestState::Running);
    let module = rig.pack(1);
    assert!(module.online && module.hv_on && module.used);
    let desired = rig.converter().channel(Channel::A).desired;
    assert_eq!(desired.control_mode, ControlMode::Current);
    approx(desired.command, -10.0, 1e-6);
    assert!(desired.enable && desired.sending);
    assert!(rig
        .bus
        .sent()
        .iter()
        .any(|frame| frame.id() == protocol::CHANGE_CONTROL));

    rig.batteries.update(1, |m| {
        m.voltage = 349.5;
        m.cell_voltages = vec![3.68, 3.69, 3.66];
    });
    rig.advance(9 * SECOND);
    test.step();
    assert_eq!(test.state(), TestState::Running);

    rig.advance(SECOND);
    test.step();
    assert_eq!(test.state(), TestState::Success);

    let result = test.last_result().unwrap();
    approx(result.pack_dcr, 0.05, 1e-4);
    approx(result.cell_dcr[2], 0.003, 1e-4);
    assert_eq!(result.max_cell_dcr.map(|(id, _)| id), Some(3));
    assert!(!result.broken_weld);
    assert!(test.results().iter().any(|line| line == "BM DCR = 0.0500"));

    let state = rig.converter().channel(Channel::A);
    assert!(!state.desired.enable);
    assert!(!state.desired.sending);
    assert!(!rig.pack(1).hv_on);
}

#[test]
fn pulse_flags_broken_weld() {
    let rig = Rig::ready(vec![pack(1, 360.0, &[3.70, 3.70, 3.70])]);
    let test = PulseTest::new(rig.station.clone(), Channel::A, 10 * SECOND);
    test.start(1).unwrap();
    rig.batteries.update(1, |m| m.cell_voltages = vec![3.68, 3.52, 3.68]);
    rig.advance(10 * SECOND);
    test.step();
    assert_eq!(test.state(), TestState::Success);
    assert!(test.last_result().unwrap().broken_weld);
    assert!(test.results().iter().any(|line| line == "===BROKEN WELD==="));
}

#[test]
fn pulse_fails_when_pack_drops_hv() {
    let rig = pulse_rig();
    let test = PulseTest::new(rig.station.clone(), Channel::A, 10 * SECOND);
    test.start(1).unwrap();
    rig.batteries.update(1, |m| m.hv_on = false);
    test.step();
    assert_eq!(test.state(), TestState::Failed);
    assert_eq!(test.last_result(), None);
}

#[test]
fn pulse_restarts_between_cycles() {
    let rig = pulse_rig();
    let test = PulseTest::new(rig.station.clone(), Channel::A, 10 * SECOND);
    test.set_cycles(2);
    test.start(1).unwrap();
    rig.advance(10 * SECOND);
    test.step();
    assert_eq!(test.state(), TestState::Restart);
    assert_eq!(test.core().cycles(), 1);

    rig.advance(5 * SECOND);
    test.step();
    assert_eq!(test.state(), TestState::Restart);

    rig.advance(5 * SECOND);
    test.step();
    assert_eq!(test.state(), TestState::Running);

    rig.advance(10 * SECOND);
    test.step();
    assert_eq!(test.state(), TestState::Success);
}

#[test]
fn stop_between_cycles_goes_idle() {
    let rig = pulse_rig();
    let test = PulseTest::new(rig.station.clone(), Channel::A, 10 * SECOND);
    test.set_cycles(3);
    test.start(1).unwrap();
    rig.advance(10 * SECOND);
    test.step();
    assert_eq!(test.state(), TestState::Restart);

    test.stop(TestState::Idle).unwrap();
    assert_eq!(test.state(), TestState::Idle);
    assert_eq!(test.stop(TestState::Idle), Err(TestError::NotRunning));
}

#[test]
fn start_requires_detected_converter() {
    let rig = Rig::new(vec![pack(1, 360.0, &[])]);
    let test = PulseTest::new(rig.station.clone(), Channel::A, 10 * SECOND);
    assert_eq!(test.start(1), Err(TestError::ConverterNotDetected));
    assert_eq!(test.state(), TestState::Idle);
    assert!(rig.bus.sent().is_empty());
}

#[test]
fn start_rejects_faulty_or_missing_pack() {
    let mut faulty = pack(1, 360.0, &[]);
    faulty.temperature_error = true;
    let rig = Rig::ready(vec![faulty]);
    let test = PulseTest::new(rig.station.clone(), Channel::A, 10 * SECOND);
    assert_eq!(test.start(1), Err(TestError::BatteryFault(1)));
    assert_eq!(test.start(2), Err(TestError::BatteryNotFound(2)));
    assert!(!rig.pack(1).hv_on);
}

#[test]
fn capacity_runs_all_phases() {
    let rig = Rig::ready(vec![pack(2, 350.0, &[4.0, 3.5])]);
    let test = CapacityTest::new(rig.station.clone(), Channel::B, 15 * 60 * SECOND);
    test.start(2).unwrap();
    assert_eq!(test.phase(), CapacityPhase::ConstantCurrent);
    approx(rig.converter().channel(Channel::B).desired.command, 6.0, 1e-6);

    test.step();
    assert_eq!(test.phase(), CapacityPhase::ConstantCurrent);

    rig.batteries.update(2, |m| m.max_cell_voltage = 4.2);
    rig.telemetry(Channel::B, 400.0, 6.0, 0);
    test.step();
    assert_eq!(test.phase(), CapacityPhase::ConstantVoltage);
    let desired = rig.converter().channel(Channel::B).desired;
    assert_eq!(desired.control_mode, ControlMode::Voltage);
    approx(desired.command, 400.0, 0.01);

    rig.telemetry(Channel::B, 400.0, 0.1, 1_000);
    test.step();
    assert_eq!(test.phase(), CapacityPhase::Discharge);
    approx(rig.converter().channel(Channel::B).desired.command, -6.0, 1e-6);

    rig.advance(Duration::from_secs(3600));
    rig.batteries.update(2, |m| m.min_cell_voltage = 2.5);
    rig.telemetry(Channel::B, 350.0, -6.0, 3_601_000);
    test.step();
    assert_eq!(test.phase(), CapacityPhase::Recharge);
    let result = test.last_result().unwrap();
    approx(result.capacity_local, 6.0, 1e-3);
    approx(result.capacity_converter, 6.0, 1e-3);
    approx(result.energy, 2100.0, 0.5);

    rig.telemetry(Channel::B, 330.0, 6.0, 3_700_000);
    test.step();
    assert_eq!(test.state(), TestState::Success);
    assert_eq!(test.results().len(), 3);
}

#[test]
fn charge_discharge_needs_destination() {
    let rig = Rig::ready(vec![pack(1, 360.0, &[])]);
    let test = ChargeDischargeTest::new(rig.station.clone(), Channel::A);
    assert_eq!(test.start(1), Err(TestError::DestinationVoltageUnset));
    assert!(!rig.pack(1).hv_on);
}

#[test]
fn charge_discharge_ends_on_settled_current() {
    let rig = Rig::ready(vec![pack(1, 360.0, &[])]);
    let test = ChargeDischargeTest::new(rig.station.clone(), Channel::A);
    test.set_destination_voltage(380.0);
    test.start(1).unwrap();
    assert!(test.is_charging());
    let desired = rig.converter().channel(Channel::A).desired;
    assert_eq!(desired.control_mode, ControlMode::Voltage);
    approx(desired.command, 380.0, 1e-3);

    rig.telemetry(Channel::A, 375.0, 3.0, 0);
    rig.advance(6 * SECOND);
    test.step();
    assert_eq!(test.state(), TestState::Running);

    rig.telemetry(Channel::A, 380.0, 0.1, 6_000);
    test.step();
    assert_eq!(test.state(), TestState::Success);
    assert_eq!(test.core().destination_voltage(), 0.0);
    assert_eq!(test.results(), vec!["Reached 380.00V".to_string()]);
}

#[test]
fn charge_discharge_waits_minimum_dwell() {
    let rig = Rig::ready(vec![pack(1, 360.0, &[])]);
    let test = ChargeDischargeTest::new(rig.station.clone(), Channel::A);
    test.set_destination_voltage(340.0);
    test.start(1).unwrap();
    assert!(!test.is_charging());

    rig.telemetry(Channel::A, 340.0, -0.1, 0);
    rig.advance(4 * SECOND);
    test.step();
    assert_eq!(test.state(), TestState::Running);
    rig.advance(2 * SECOND);
    test.step();
    assert_eq!(test.state(), TestState::Success);
}
