//! Registry of all tests with the channel arbitration between them.

use crate::battery::{BatteryId, BatteryInfo};
use crate::config::WaitTimes;
use crate::drive_cycle::DriveCycleProvider;
use crate::lifecycle::{
    DualChannelTest, SingleChannelTest, Station, TestControl, TestError, TestState,
};
use crate::plate::{PlateChargeDischargeTest, PlateDriveCycleTest};
use crate::protocol::Channel;
use crate::scheduler::Periodic;
use crate::single::{CapacityTest, ChargeDischargeTest, PulseTest};
use crate::Error;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "protocol_serde")]
use serde::Serialize;

pub const POLL_PERIOD: Duration = Duration::from_millis(100);
pub const DEFAULT_DEBUG_PERIOD: Duration = Duration::from_secs(1);
const OVERRIDE_SETTLE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize))]
pub enum TestKind {
    Single,
    Dual,
}

impl fmt::Display for TestKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TestKind::Single => write!(f, "single"),
            TestKind::Dual => write!(f, "dual"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize))]
pub struct TestSummary {
    pub kind: TestKind,
    pub index: usize,
    pub name: &'static str,
    pub channel: Option<Channel>,
    pub state: TestState,
    pub elapsed: Duration,
    pub cycles: bool,
    pub destination_voltage: bool,
}

impl fmt::Display for TestSummary {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{} {}] {}", self.kind, self.index, self.name)?;
        if let Some(channel) = self.channel {
            write!(f, " channel {}", channel)?;
        }
        write!(
            f,
            " - {} ({})",
            self.state,
            humanize_duration(self.elapsed)
        )
    }
}

fn humanize_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60)
}

/// One line of plate telemetry for the debug output.
pub fn debug_line(info: &BatteryInfo) -> String {
    format!(
        "{:.02}V | {:.02}A | {:.02}% | {} online | {} HV_ON | {:.02}C_Max | {:.02}C_Avg | {:.02}kw_AP | {:.02}kwh_AE | {:.02}kw_CP",
        info.voltage,
        info.current,
        info.soc,
        info.online_count,
        info.hv_on_count,
        info.max_temperature,
        info.avg_temperature,
        info.available_power,
        info.available_energy,
        info.charging_power
    )
}

#[derive(Debug)]
struct DebugTelemetry {
    enabled: bool,
    period: Duration,
    last_ms: u64,
}

pub struct TestManager {
    station: Station,
    singles: Vec<Arc<dyn SingleChannelTest>>,
    duals: Vec<Arc<dyn DualChannelTest>>,
    batteries: Mutex<[Option<BatteryId>; 2]>,
    debug: Mutex<DebugTelemetry>,
}

impl TestManager {
    pub fn new(station: Station) -> Self {
        Self {
            station,
            singles: Vec::new(),
            duals: Vec::new(),
            batteries: Mutex::new([None; 2]),
            debug: Mutex::new(DebugTelemetry {
                enabled: false,
                period: DEFAULT_DEBUG_PERIOD,
                last_ms: 0,
            }),
        }
    }

    /// Registers the standard test suite: pulse, capacity and
    /// charge/discharge on both channels, then the two plate tests. The drive
    /// cycle test is returned as well so its profile task can be started.
    pub fn with_standard_tests(
        station: Station,
        waits: &WaitTimes,
        drive_cycle: Arc<dyn DriveCycleProvider>,
    ) -> (Self, Arc<PlateDriveCycleTest>) {
        let mut manager = Self::new(station.clone());
        for channel in Channel::ALL {
            manager.register_single(Arc::new(PulseTest::new(
                station.clone(),
                channel,
                waits.pulse,
            )));
        }
        for channel in Channel::ALL {
            manager.register_single(Arc::new(CapacityTest::new(
                station.clone(),
                channel,
                waits.capacity,
            )));
        }
        for channel in Channel::ALL {
            manager.register_single(Arc::new(ChargeDischargeTest::new(station.clone(), channel)));
        }
        manager.register_dual(Arc::new(PlateChargeDischargeTest::new(station.clone())));
        let plate_drive_cycle = Arc::new(PlateDriveCycleTest::new(
            station,
            drive_cycle,
            waits.drive_cycle,
        ));
        manager.register_dual(plate_drive_cycle.clone());
        (manager, plate_drive_cycle)
    }

    pub fn register_single(&mut self, test: Arc<dyn SingleChannelTest>) -> usize {
        self.singles.push(test);
        self.singles.len() - 1
    }

    pub fn register_dual(&mut self, test: Arc<dyn DualChannelTest>) -> usize {
        self.duals.push(test);
        self.duals.len() - 1
    }

    pub fn set_debug_period(&self, period: Duration) {
        self.debug.lock().period = period;
    }

    fn single(&self, index: usize) -> Result<&Arc<dyn SingleChannelTest>, TestError> {
        self.singles.get(index).ok_or_else(|| {
            log::error!("Invalid single test index {}", index);
            TestError::InvalidIndex(index)
        })
    }

    fn dual(&self, index: usize) -> Result<&Arc<dyn DualChannelTest>, TestError> {
        self.duals.get(index).ok_or_else(|| {
            log::error!("Invalid dual test index {}", index);
            TestError::InvalidIndex(index)
        })
    }

    fn control(&self, kind: TestKind, index: usize) -> Result<&dyn TestControl, TestError> {
        Ok(match kind {
            TestKind::Single => self.single(index)?.as_ref() as &dyn TestControl,
            TestKind::Dual => self.dual(index)?.as_ref() as &dyn TestControl,
        })
    }

    fn active_dual(&self) -> Option<&'static str> {
        self.duals
            .iter()
            .find(|t| t.state().is_active())
            .map(|t| t.name())
    }

    fn active_single(&self, channel: Option<Channel>) -> Option<&'static str> {
        self.singles
            .iter()
            .filter(|t| channel.map_or(true, |c| t.channel() == c))
            .find(|t| t.state().is_active())
            .map(|t| t.name())
    }

    pub fn assign_battery(&self, channel: Channel, battery: BatteryId) {
        log::info!("Battery {} assigned to channel {}", battery, channel);
        self.batteries.lock()[channel.index()] = Some(battery);
    }

    pub fn battery_for(&self, channel: Channel) -> Option<BatteryId> {
        self.batteries.lock()[channel.index()]
    }

    pub fn run_single(
        &self,
        index: usize,
        cycles: Option<u32>,
        destination_voltage: Option<f32>,
    ) -> Result<(), TestError> {
        let test = self.single(index)?;
        if let Some(name) = self.active_dual() {
            log::error!("{} is running", name);
            return Err(TestError::Busy(name.to_string()));
        }
        if let Some(name) = self.active_single(Some(test.channel())) {
            log::error!("{} is running on channel {}", name, test.channel());
            return Err(TestError::Busy(name.to_string()));
        }
        let battery = self
            .battery_for(test.channel())
            .ok_or(TestError::BatteryUnassigned(test.channel()))?;
        if self.station.batteries.module(battery).is_none() {
            log::error!("Battery {} not found", battery);
            return Err(TestError::BatteryNotFound(battery));
        }
        self.configure(test.as_ref(), cycles, destination_voltage);
        test.start(battery)
    }

    pub fn run_dual(
        &self,
        index: usize,
        cycles: Option<u32>,
        destination_voltage: Option<f32>,
    ) -> Result<(), TestError> {
        let test = self.dual(index)?;
        if let Some(name) = self.active_dual().or_else(|| self.active_single(None)) {
            log::error!("{} is running", name);
            return Err(TestError::Busy(name.to_string()));
        }
        self.configure(test.as_ref(), cycles, destination_voltage);
        test.start()
    }

    fn configure(&self, test: &dyn TestControl, cycles: Option<u32>, voltage: Option<f32>) {
        if test.supports_cycles() {
            test.set_cycles(cycles.unwrap_or(1));
        }
        if let (true, Some(voltage)) = (test.uses_destination_voltage(), voltage) {
            test.set_destination_voltage(voltage);
        }
    }

    pub fn set_destination_voltage(
        &self,
        kind: TestKind,
        index: usize,
        voltage: f32,
    ) -> Result<(), TestError> {
        self.control(kind, index)?.set_destination_voltage(voltage);
        Ok(())
    }

    pub fn stop(&self, kind: TestKind, index: usize) -> Result<(), TestError> {
        let test = self.control(kind, index)?;
        if !test.state().is_active() {
            return Err(TestError::NotRunning);
        }
        test.stop(TestState::Idle)
    }

    pub fn stop_single(&self, index: usize) -> Result<(), TestError> {
        self.stop(TestKind::Single, index)
    }

    pub fn stop_dual(&self, index: usize) -> Result<(), TestError> {
        self.stop(TestKind::Dual, index)
    }

    pub fn stop_all(&self) {
        let tests = self
            .singles
            .iter()
            .map(|t| t.as_ref() as &dyn TestControl)
            .chain(self.duals.iter().map(|t| t.as_ref() as &dyn TestControl));
        for test in tests.filter(|t| t.state().is_active()) {
            if let Err(e) = test.stop(TestState::Idle) {
                log::warn!("Stopping {} failed: {}", test.name(), e);
            }
        }
    }

    /// Emergency stop: de-energizes the plate and releases both channels
    /// whatever state the tests are in.
    pub fn stop_all_override(&self) {
        log::warn!("Override stop");
        self.station.plate.hv_off(None);
        self.station.clock().sleep(OVERRIDE_SETTLE);
        for channel in Channel::ALL {
            self.station.converter.release_control(channel);
        }
    }

    pub fn running_time(&self, kind: TestKind, index: usize) -> Result<Duration, TestError> {
        Ok(self.control(kind, index)?.elapsed())
    }

    pub fn results(&self, kind: TestKind, index: usize) -> Result<Vec<String>, TestError> {
        Ok(self.control(kind, index)?.results())
    }

    pub fn state(&self, kind: TestKind, index: usize) -> Result<TestState, TestError> {
        Ok(self.control(kind, index)?.state())
    }

    pub fn list(&self) -> Vec<TestSummary> {
        let singles = self.singles.iter().enumerate().map(|(index, t)| TestSummary {
            kind: TestKind::Single,
            index,
            name: t.name(),
            channel: Some(t.channel()),
            state: t.state(),
            elapsed: t.elapsed(),
            cycles: t.supports_cycles(),
            destination_voltage: t.uses_destination_voltage(),
        });
        let duals = self.duals.iter().enumerate().map(|(index, t)| TestSummary {
            kind: TestKind::Dual,
            index,
            name: t.name(),
            channel: None,
            state: t.state(),
            elapsed: t.elapsed(),
            cycles: t.supports_cycles(),
            destination_voltage: t.uses_destination_voltage(),
        });
        singles.chain(duals).collect()
    }

    /// Returns whether the debug telemetry is now enabled.
    pub fn toggle_debug(&self) -> bool {
        let mut debug = self.debug.lock();
        debug.enabled = !debug.enabled;
        debug.last_ms = self.station.now_ms();
        debug.enabled
    }

    /// One poll tick: steps every test and emits the debug telemetry when due.
    pub fn poll(&self) {
        for test in &self.singles {
            test.step();
        }
        for test in &self.duals {
            test.step();
        }

        let now = self.station.now_ms();
        let due = {
            let mut debug = self.debug.lock();
            let due = debug.enabled
                && now.saturating_sub(debug.last_ms) >= debug.period.as_millis() as u64;
            if due {
                debug.last_ms = now;
            }
            due
        };
        if due {
            log::info!("{}", debug_line(&self.station.batteries.info()));
        }
    }

    pub fn spawn_poll_loop(self: &Arc<Self>, period: Duration) -> Result<Periodic, Error> {
        let manager = self.clone();
        Periodic::spawn("test-manager", move || {
            manager.poll();
            Some(period)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_line_format() {
        let info = BatteryInfo {
            voltage: 350.0,
            current: -12.5,
            soc: 80.0,
            online_count: 2,
            hv_on_count: 1,
            max_temperature: 31.25,
            avg_temperature: 28.5,
            available_power: 50.0,
            available_energy: 12.75,
            charging_power: 30.0,
        };
        assert_eq!(
            debug_line(&info),
            "350.00V | -12.50A | 80.00% | 2 online | 1 HV_ON | 31.25C_Max | 28.50C_Avg | 50.00kw_AP | 12.75kwh_AE | 30.00kw_CP"
        );
    }

    #[test]
    fn summary_display() {
        let summary = TestSummary {
            kind: TestKind::Single,
            index: 3,
            name: "CapacityTest",
            channel: Some(Channel::B),
            state: TestState::Running,
            elapsed: Duration::from_secs(3725),
            cycles: true,
            destination_voltage: false,
        };
        assert_eq!(
            summary.to_string(),
            "[single 3] CapacityTest channel B - Running (01:02:05)"
        );
    }
}
