use super::*;
use crate::drive_cycle::{clamp_drive_power, DriveCycleProvider, DriveCycleSource};
use crate::lifecycle::{DualChannelTest, StopAction, TestControl, TestState};
use crate::scheduler::Periodic;
use crate::Error;
use parking_lot::Mutex;
use std::sync::Arc;

/// Tick period of the profile task while no record is being replayed.
const IDLE_TICK: Duration = Duration::from_millis(100);
const RELEASE_SETTLE: Duration = Duration::from_millis(1000);

/// Replays a drive-cycle power profile on the plate in power mode.
///
/// Records are applied by [`PlateDriveCycleTest::plate_tick`], which runs on
/// its own task with a period taken from the record being replayed. The safety
/// checks run on the regular poll tick.
pub struct PlateDriveCycleTest {
    core: TestCore,
    station: Station,
    provider: Arc<dyn DriveCycleProvider>,
    source: Mutex<Option<Box<dyn DriveCycleSource>>>,
    packs: Mutex<usize>,
}

impl PlateDriveCycleTest {
    pub fn new(
        station: Station,
        provider: Arc<dyn DriveCycleProvider>,
        restart_wait: Duration,
    ) -> Self {
        Self {
            core: TestCore::new("PlateDriveCycleTest", station.clock().clone(), restart_wait),
            station,
            provider,
            source: Mutex::new(None),
            packs: Mutex::new(0),
        }
    }

    pub fn pack_count(&self) -> usize {
        *self.packs.lock()
    }

    /// Applies the next profile record. Returns the delay until the next call.
    pub fn plate_tick(&self) -> Duration {
        match self.core.state() {
            TestState::Running => {}
            TestState::Restart if self.core.restart_due() => {
                if let Err(e) = self.start() {
                    log::error!("{}: restart failed: {}", self.core.name(), e);
                }
                return IDLE_TICK;
            }
            _ => return IDLE_TICK,
        }

        let next = match self.source.lock().as_mut() {
            Some(source) => source.next_record(),
            None => return IDLE_TICK,
        };
        match next {
            Ok(Some(record)) => {
                let info = self.station.batteries.info();
                let applied = clamp_drive_power(
                    record.power_kw,
                    info.available_power,
                    info.charging_power,
                );
                log::debug!(
                    "requested {:.2}kW available {:.2}kW charging {:.2}kW applied {:.2}kW",
                    record.power_kw,
                    info.available_power,
                    info.charging_power,
                    applied
                );
                self.station
                    .batteries
                    .report_drive_cycle_power(record.power_kw, applied);
                let converter = &self.station.converter;
                converter.set_power(Channel::A, applied * 1000.0);
                let period = record.time_delta.max(Duration::from_millis(1));
                converter.set_period(period);
                period
            }
            Ok(None) => {
                log::info!("{}: finished drive cycle", self.core.name());
                self.core.push_result("Drive cycle completed".to_string());
                let _ = self.stop(TestState::Success);
                IDLE_TICK
            }
            Err(e) => {
                log::error!("{}: drive cycle not readable: {}", self.core.name(), e);
                self.core.push_result(format!("Drive cycle aborted: {e}"));
                let _ = self.stop(TestState::Failed);
                IDLE_TICK
            }
        }
    }

    pub fn spawn_ticker(self: &Arc<Self>) -> Result<Periodic, Error> {
        let test = self.clone();
        Periodic::spawn("drive-cycle", move || Some(test.plate_tick()))
    }
}

impl TestControl for PlateDriveCycleTest {
    fn core(&self) -> &TestCore {
        &self.core
    }

    fn supports_cycles(&self) -> bool {
        true
    }

    fn stop(&self, requested: TestState) -> Result<(), TestError> {
        let _guard = self.core.stop_guard();
        if self.core.begin_stop(requested)? == StopAction::Done {
            return Ok(());
        }
        teardown(&self.station, RELEASE_SETTLE);
        self.source.lock().take();
        self.station.converter.set_default_period();
        self.core.conclude(requested, true);
        Ok(())
    }

    fn step(&self) {
        if self.core.state() == TestState::Running
            && !loop_check(&self.station, &self.core, ControlMode::Power)
        {
            let _ = self.stop(TestState::Failed);
        }
    }
}

impl DualChannelTest for PlateDriveCycleTest {
    fn start(&self) -> Result<(), TestError> {
        let _guard = self.core.start_guard();
        let online = pre_test_checks(&self.station, &self.core)?;
        let source = self.provider.open().map_err(|e| {
            log::error!("{}: drive cycle unreadable: {}", self.core.name(), e);
            TestError::DriveCycle(e.to_string())
        })?;
        energize(&self.station, online)?;

        let n = online as f32;
        set_limits(
            &self.station,
            Limits::new(240.0, -15.0 * n, -3600.0 * n),
            Limits::new(406.0, 6.0 * n, 2436.0 * n),
        );
        *self.packs.lock() = online;
        *self.source.lock() = Some(source);

        close_contactors(&self.station);
        hand_over_parallel(&self.station);
        let converter = &self.station.converter;
        converter.set_power(Channel::A, 0.0);
        if let Err(e) = converter.enable(Channel::A) {
            log::error!("{}: cannot enable channel A: {}", self.core.name(), e);
        }
        self.core.set_running();
        Ok(())
    }
}
