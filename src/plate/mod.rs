//! Tests driving all online packs of the plate through channel A, with
//! channel B paralleled to it.

mod charge_discharge;
mod drive_cycle;

pub use charge_discharge::PlateChargeDischargeTest;
pub use drive_cycle::PlateDriveCycleTest;

use crate::battery::Relay;
use crate::lifecycle::{Station, TestCore, TestError};
use crate::protocol::{Channel, ControlMode, Limits, LoadMode};
use std::time::Duration;

pub const PLATE_SETTLE: Duration = Duration::from_millis(500);
const RELAY_STEP_MS: u64 = 100;

/// Validates the converter and brings every error-free pack online.
/// Returns the number of packs online.
fn pre_test_checks(station: &Station, core: &TestCore) -> Result<usize, TestError> {
    if !station.converter.is_detected() {
        log::error!("{}: ABC150 not detected", core.name());
        return Err(TestError::ConverterNotDetected);
    }
    core.ensure_not_running()?;
    let mut online = 0;
    for module in station.batteries.modules() {
        if module.has_hard_faults() {
            if module.online {
                station.plate.set_module_state(module.id, false);
            }
            log::warn!("BM {} has an error and will not go online", module.id);
        } else {
            station.plate.set_module_state(module.id, true);
            online += 1;
        }
    }
    if online == 0 {
        log::error!("{}: there are 0 BMs online", core.name());
        return Err(TestError::NoBatteryOnline);
    }
    Ok(online)
}

/// Switches HV on for the plate and checks every online pack followed.
fn energize(station: &Station, online: usize) -> Result<(), TestError> {
    station.plate.hv_on(None);
    station.clock().sleep(PLATE_SETTLE);
    let hv_on = station.batteries.hv_count();
    if hv_on != online {
        log::error!("HV count {} != online count {}", hv_on, online);
        station.plate.hv_off(None);
        for module in station.batteries.modules().iter().filter(|m| m.online) {
            station.plate.set_module_state(module.id, false);
        }
        return Err(TestError::HvCountMismatch { online, hv_on });
    }
    log::info!("There are {} BMs online", online);
    Ok(())
}

fn set_limits(station: &Station, lower: Limits, upper: Limits) {
    for channel in Channel::ALL {
        station.converter.set_lower_limits(channel, lower);
        station.converter.set_upper_limits(channel, upper);
    }
}

fn close_contactors(station: &Station) {
    let plate = &station.plate;
    plate.set_relay(Relay::Precharge, true);
    plate.set_relay(Relay::Negative, true);
    station.sleep_ms(RELAY_STEP_MS);
    plate.set_relay(Relay::Positive, true);
    station.sleep_ms(RELAY_STEP_MS);
    plate.set_relay(Relay::Precharge, false);
}

fn open_contactors(station: &Station) {
    let plate = &station.plate;
    plate.set_relay(Relay::Negative, false);
    station.sleep_ms(RELAY_STEP_MS);
    plate.set_relay(Relay::Positive, false);
    station.sleep_ms(RELAY_STEP_MS);
}

/// Takes channel A, then briefly channel B to switch the converter into
/// parallel load mode.
fn hand_over_parallel(station: &Station) {
    let converter = &station.converter;
    station.hand_over(Channel::A, PLATE_SETTLE);
    if let Err(e) = converter.take_control(Channel::B) {
        log::error!("Take control of channel B failed: {}", e);
    }
    converter.set_load_mode(Channel::A, LoadMode::Parallel);
    station.clock().sleep(PLATE_SETTLE);
    converter.release_control(Channel::B);
}

fn loop_check(station: &Station, core: &TestCore, control_mode: ControlMode) -> bool {
    for module in station.batteries.modules().iter().filter(|m| m.online) {
        if module.has_hard_faults() || !module.hv_on {
            log::error!("{}: BM {} has an error", core.name(), module.id);
            return false;
        }
    }
    let state = station.converter.channel(Channel::A);
    if !state.is_remote() {
        log::error!("{}: not in remote mode", core.name());
        return false;
    }
    if state.desired.control_mode != control_mode {
        log::error!("{}: not in {:?} control mode", core.name(), control_mode);
        return false;
    }
    if state.desired.load_mode != LoadMode::Parallel {
        log::error!("{}: not in parallel load mode", core.name());
        return false;
    }
    true
}

fn teardown(station: &Station, release_settle: Duration) {
    let converter = &station.converter;
    converter.disable(Channel::A);
    station.clock().sleep(PLATE_SETTLE);
    open_contactors(station);
    station.plate.hv_off(None);
    converter.set_load_mode(Channel::A, LoadMode::Independent);
    station.clock().sleep(release_settle);
    converter.release_control(Channel::A);
    converter.release_control(Channel::B);
}
