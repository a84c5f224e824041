//! Tests driving one converter channel into one battery pack.

mod capacity;
mod charge_discharge;
mod pulse;

pub use capacity::{CapacityPhase, CapacityResult, CapacityTest};
pub use charge_discharge::ChargeDischargeTest;
pub use pulse::{PulseResult, PulseTest};

use crate::battery::{BatteryId, BatteryModule};
use crate::lifecycle::{Station, TestCore, TestError};
use crate::protocol::{Channel, LoadMode};
use std::time::Duration;

/// Wait for the converter to confirm remote control.
pub const HANDOVER_SETTLE: Duration = Duration::from_millis(2000);
const TEARDOWN_SETTLE_MS: u64 = 500;

/// Validation before a single-channel test touches any hardware.
fn pre_test_checks(
    station: &Station,
    core: &TestCore,
    battery: BatteryId,
) -> Result<BatteryModule, TestError> {
    if !station.converter.is_detected() {
        log::error!("{}: ABC150 not detected", core.name());
        return Err(TestError::ConverterNotDetected);
    }
    core.ensure_not_running()?;
    let module = station
        .batteries
        .module(battery)
        .ok_or(TestError::BatteryNotFound(battery))?;
    if module.has_hard_faults() {
        log::error!("{}: battery {} reports errors", core.name(), battery);
        return Err(TestError::BatteryFault(battery));
    }
    Ok(module)
}

/// Puts the pack on HV and takes over the channel.
fn energize(station: &Station, channel: Channel, battery: BatteryId) {
    station.plate.set_module_state(battery, true);
    station.plate.hv_on(Some(battery));
    station.hand_over(channel, HANDOVER_SETTLE);
}

fn enable(station: &Station, core: &TestCore, channel: Channel) {
    if let Err(e) = station.converter.enable(channel) {
        log::error!("{}: cannot enable channel {}: {}", core.name(), channel, e);
    }
}

/// Conditions that must hold on every poll tick of a running test. Returns
/// the fresh pack snapshot.
fn loop_check(
    station: &Station,
    core: &TestCore,
    channel: Channel,
    battery: BatteryId,
) -> Option<BatteryModule> {
    let Some(module) = station.batteries.module(battery) else {
        log::error!("{}: battery {} disappeared", core.name(), battery);
        return None;
    };
    if !module.online || !module.hv_on || !module.used {
        log::error!("{}: battery {} state error", core.name(), battery);
        return None;
    }
    let state = station.converter.channel(channel);
    if !state.is_remote() {
        log::error!("{}: channel {} not in remote mode", core.name(), channel);
        return None;
    }
    if state.desired.load_mode != LoadMode::Independent {
        log::error!("{}: channel {} not in independent load mode", core.name(), channel);
        return None;
    }
    if module.has_hard_faults() {
        log::error!("{}: battery {} error", core.name(), battery);
        return None;
    }
    Some(module)
}

fn teardown(station: &Station, channel: Channel, battery: BatteryId) {
    station.converter.disable(channel);
    station.sleep_ms(TEARDOWN_SETTLE_MS);
    station.converter.release_control(channel);
    station.plate.hv_off(Some(battery));
}
