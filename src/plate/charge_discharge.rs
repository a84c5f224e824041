use super::*;
use crate::lifecycle::{DualChannelTest, StopAction, TestControl, TestState};
use parking_lot::Mutex;

const SETTLED_CURRENT_PER_PACK: f32 = 0.2;
const MIN_DWELL_MS: u64 = 5000;

#[derive(Default)]
struct PlateRun {
    packs: usize,
    charging: bool,
}

/// Brings the whole plate to the destination voltage.
pub struct PlateChargeDischargeTest {
    core: TestCore,
    station: Station,
    run: Mutex<PlateRun>,
}

impl PlateChargeDischargeTest {
    pub fn new(station: Station) -> Self {
        Self {
            core: TestCore::new(
                "PlateChargeDischargeTest",
                station.clock().clone(),
                Duration::ZERO,
            ),
            station,
            run: Mutex::new(PlateRun::default()),
        }
    }

    /// Packs online when the current run started.
    pub fn pack_count(&self) -> usize {
        self.run.lock().packs
    }
}

impl TestControl for PlateChargeDischargeTest {
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
        teardown(&self.station, PLATE_SETTLE);
        self.core.set_destination_voltage(0.0);
        self.core.conclude(requested, false);
        Ok(())
    }

    fn step(&self) {
        if self.core.state() != TestState::Running {
            return;
        }
        if !loop_check(&self.station, &self.core, ControlMode::Voltage) {
            let _ = self.stop(TestState::Failed);
            return;
        }
        let (packs, charging) = {
            let run = self.run.lock();
            (run.packs, run.charging)
        };
        let threshold = SETTLED_CURRENT_PER_PACK * packs as f32;
        let current = self.station.converter.channel(Channel::A).measured.telemetry.current;
        let settled = if charging {
            current <= threshold
        } else {
            current >= -threshold
        };
        if settled && self.core.running_ms() > MIN_DWELL_MS {
            self.core.push_result(format!(
                "Plate of {} packs reached {:.2}V",
                packs,
                self.core.destination_voltage()
            ));
            let _ = self.stop(TestState::Success);
        }
    }
}

impl DualChannelTest for PlateChargeDischargeTest {
    fn start(&self) -> Result<(), TestError> {
        let _guard = self.core.start_guard();
        let destination = self.core.destination_voltage();
        if destination == 0.0 {
            log::error!("{}: destination voltage not set", self.core.name());
            return Err(TestError::DestinationVoltageUnset);
        }
        let online = pre_test_checks(&self.station, &self.core)?;
        log::info!("{}: destination voltage {:.2}V", self.core.name(), destination);
        energize(&self.station, online)?;

        let n = online as f32;
        set_limits(
            &self.station,
            Limits::new(240.0, -6.0 * n, -2460.0 * n),
            Limits::new(406.0, 6.0 * n, 2460.0 * n),
        );
        let converter = &self.station.converter;
        let charging = destination > converter.channel(Channel::A).measured.telemetry.voltage;
        *self.run.lock() = PlateRun {
            packs: online,
            charging,
        };

        close_contactors(&self.station);
        hand_over_parallel(&self.station);
        converter.set_voltage(Channel::A, destination);
        if let Err(e) = converter.enable(Channel::A) {
            log::error!("{}: cannot enable channel A: {}", self.core.name(), e);
        }
        self.core.set_running();
        Ok(())
    }
}
