use super::*;
use crate::lifecycle::{SingleChannelTest, StopAction, TestControl, TestState};
use crate::protocol::Limits;
use parking_lot::Mutex;

const SETTLED_CURRENT: f32 = 0.2;
const MIN_DWELL_MS: u64 = 5000;

#[derive(Default)]
struct ChargeDischargeRun {
    battery: Option<BatteryId>,
    charging: bool,
}

/// Brings a pack to the destination voltage in voltage mode and ends once
/// the current has decayed.
pub struct ChargeDischargeTest {
    core: TestCore,
    station: Station,
    channel: Channel,
    run: Mutex<ChargeDischargeRun>,
}

impl ChargeDischargeTest {
    pub fn new(station: Station, channel: Channel) -> Self {
        Self {
            core: TestCore::new("ChargeDischargeTest", station.clock().clone(), Duration::ZERO),
            station,
            channel,
            run: Mutex::new(ChargeDischargeRun::default()),
        }
    }

    pub fn is_charging(&self) -> bool {
        self.run.lock().charging
    }

    fn battery(&self) -> Option<BatteryId> {
        self.run.lock().battery
    }
}

impl TestControl for ChargeDischargeTest {
    fn core(&self) -> &TestCore {
        &self.core
    }

    fn uses_destination_voltage(&self) -> bool {
        true
    }

    fn stop(&self, requested: TestState) -> Result<(), TestError> {
        let _guard = self.core.stop_guard();
        if self.core.begin_stop(requested)? == StopAction::Done {
            return Ok(());
        }
        if let Some(battery) = self.battery() {
            teardown(&self.station, self.channel, battery);
        }
        self.core.set_destination_voltage(0.0);
        self.core.conclude(requested, false);
        Ok(())
    }

    fn step(&self) {
        if self.core.state() != TestState::Running {
            return;
        }
        let Some(battery) = self.battery() else {
            return;
        };
        if loop_check(&self.station, &self.core, self.channel, battery).is_none() {
            let _ = self.stop(TestState::Failed);
            return;
        }
        let current = self.station.converter.channel(self.channel).measured.telemetry.current;
        let settled = if self.is_charging() {
            current <= SETTLED_CURRENT
        } else {
            current >= -SETTLED_CURRENT
        };
        if settled && self.core.running_ms() > MIN_DWELL_MS {
            self.core
                .push_result(format!("Reached {:.2}V", self.core.destination_voltage()));
            let _ = self.stop(TestState::Success);
        }
    }
}

impl SingleChannelTest for ChargeDischargeTest {
    fn channel(&self) -> Channel {
        self.channel
    }

    fn start(&self, battery: BatteryId) -> Result<(), TestError> {
        let _guard = self.core.start_guard();
        let module = pre_test_checks(&self.station, &self.core, battery)?;
        let destination = self.core.destination_voltage();
        if destination == 0.0 {
            log::error!("{}: destination voltage not set", self.core.name());
            return Err(TestError::DestinationVoltageUnset);
        }

        let converter = &self.station.converter;
        converter.set_lower_limits(self.channel, Limits::new(240.0, -6.0, -2460.0));
        converter.set_upper_limits(self.channel, Limits::new(406.0, 6.0, 2460.0));
        let charging = destination > module.voltage;
        converter.set_voltage(self.channel, destination);
        *self.run.lock() = ChargeDischargeRun {
            battery: Some(battery),
            charging,
        };
        log::info!(
            "{}: {} to {:.2}V",
            self.core.name(),
            if charging { "charging" } else { "discharging" },
            destination
        );

        energize(&self.station, self.channel, battery);
        self.core.set_running();
        enable(&self.station, &self.core, self.channel);
        Ok(())
    }
}
