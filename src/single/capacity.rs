use super::*;
use crate::lifecycle::{SingleChannelTest, StopAction, TestControl, TestState};
use crate::protocol::Limits;
use parking_lot::Mutex;

const CHARGE_CURRENT: f32 = 6.0;
const DISCHARGE_CURRENT: f32 = 6.0;
const CELL_FULL_VOLTAGE: f32 = 4.2;
const CELL_EMPTY_VOLTAGE: f32 = 2.5;
const CV_CUTOFF_CURRENT: f32 = 0.2;
const RECHARGED_VOLTAGE: f32 = 320.0;
const MS_PER_HOUR: f32 = 3_600_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CapacityPhase {
    #[default]
    ConstantCurrent,
    ConstantVoltage,
    Discharge,
    Recharge,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CapacityResult {
    /// Ah derived from the host clock.
    pub capacity_local: f32,
    /// Ah derived from the converter timestamps.
    pub capacity_converter: f32,
    /// Wh delivered during discharge.
    pub energy: f32,
}

impl CapacityResult {
    fn lines(&self) -> Vec<String> {
        vec![
            format!("Capacity (local clock): {:.3}Ah", self.capacity_local),
            format!("Capacity (ABC150 clock): {:.3}Ah", self.capacity_converter),
            format!("Energy: {:.1}Wh", self.energy),
        ]
    }
}

#[derive(Default)]
struct CapacityRun {
    battery: Option<BatteryId>,
    phase: CapacityPhase,
    discharge_start_ms: u64,
    discharge_start_stamp: u32,
    last_tick_ms: u64,
    /// V * A * ms
    energy: f32,
    result: Option<CapacityResult>,
}

/// Full charge (CC then CV), measured discharge down to the empty cell
/// voltage and recharge.
pub struct CapacityTest {
    core: TestCore,
    station: Station,
    channel: Channel,
    run: Mutex<CapacityRun>,
}

impl CapacityTest {
    pub fn new(station: Station, channel: Channel, restart_wait: Duration) -> Self {
        Self {
            core: TestCore::new("CapacityTest", station.clock().clone(), restart_wait),
            station,
            channel,
            run: Mutex::new(CapacityRun::default()),
        }
    }

    pub fn phase(&self) -> CapacityPhase {
        self.run.lock().phase
    }

    pub fn last_result(&self) -> Option<CapacityResult> {
        self.run.lock().result
    }

    fn battery(&self) -> Option<BatteryId> {
        self.run.lock().battery
    }

    /// Advances the charge/discharge phases. Returns true once recharged.
    fn advance(&self, module: &BatteryModule) -> bool {
        let converter = &self.station.converter;
        let telemetry = converter.channel(self.channel).measured.telemetry;
        let now = self.station.now_ms();
        let mut run = self.run.lock();
        let mut finished = None;
        let phase = run.phase;
        match phase {
            CapacityPhase::ConstantCurrent if module.max_cell_voltage >= CELL_FULL_VOLTAGE => {
                log::info!("CC done, setting voltage to {:.2}V", telemetry.voltage);
                converter.set_voltage(self.channel, telemetry.voltage);
                run.phase = CapacityPhase::ConstantVoltage;
            }
            CapacityPhase::ConstantVoltage if telemetry.current <= CV_CUTOFF_CURRENT => {
                log::info!("CV done");
                run.discharge_start_ms = now;
                run.discharge_start_stamp = telemetry.timestamp;
                run.last_tick_ms = now;
                run.energy = 0.0;
                converter.set_current(self.channel, -DISCHARGE_CURRENT);
                run.phase = CapacityPhase::Discharge;
            }
            CapacityPhase::Discharge => {
                let dt = now.saturating_sub(run.last_tick_ms) as f32;
                run.energy += telemetry.voltage * telemetry.current * dt;
                run.last_tick_ms = now;
                if module.min_cell_voltage <= CELL_EMPTY_VOLTAGE {
                    log::info!("Discharge done");
                    let local_ms = now.saturating_sub(run.discharge_start_ms) as f32;
                    let stamp_ms =
                        telemetry.timestamp.wrapping_sub(run.discharge_start_stamp) as f32;
                    let result = CapacityResult {
                        capacity_local: local_ms * DISCHARGE_CURRENT / MS_PER_HOUR,
                        capacity_converter: stamp_ms * DISCHARGE_CURRENT / MS_PER_HOUR,
                        energy: run.energy.abs() / MS_PER_HOUR,
                    };
                    run.result = Some(result);
                    finished = Some(result);
                    converter.set_current(self.channel, CHARGE_CURRENT);
                    run.phase = CapacityPhase::Recharge;
                }
            }
            CapacityPhase::Recharge if telemetry.voltage >= RECHARGED_VOLTAGE => {
                log::info!("Recharge done");
                return true;
            }
            _ => {}
        }
        drop(run);
        if let Some(result) = finished {
            for line in result.lines() {
                self.core.push_result(line);
            }
        }
        false
    }
}

impl TestControl for CapacityTest {
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
        if let Some(battery) = self.battery() {
            teardown(&self.station, self.channel, battery);
        }
        self.core.conclude(requested, true);
        Ok(())
    }

    fn step(&self) {
        match self.core.state() {
            TestState::Running => {
                let Some(battery) = self.battery() else {
                    return;
                };
                let Some(module) = loop_check(&self.station, &self.core, self.channel, battery)
                else {
                    let _ = self.stop(TestState::Failed);
                    return;
                };
                if self.advance(&module) {
                    let _ = self.stop(TestState::Success);
                }
            }
            TestState::Restart if self.core.restart_due() => {
                if let Some(battery) = self.battery() {
                    if let Err(e) = self.start(battery) {
                        log::error!("{}: restart failed: {}", self.core.name(), e);
                    }
                }
            }
            _ => {}
        }
    }
}

impl SingleChannelTest for CapacityTest {
    fn channel(&self) -> Channel {
        self.channel
    }

    fn start(&self, battery: BatteryId) -> Result<(), TestError> {
        let _guard = self.core.start_guard();
        pre_test_checks(&self.station, &self.core, battery)?;

        let converter = &self.station.converter;
        converter.set_lower_limits(self.channel, Limits::new(240.0, -6.0, -2460.0));
        converter.set_upper_limits(self.channel, Limits::new(406.0, 6.0, 2460.0));
        converter.set_current(self.channel, CHARGE_CURRENT);
        *self.run.lock() = CapacityRun {
            battery: Some(battery),
            ..Default::default()
        };

        energize(&self.station, self.channel, battery);
        self.core.set_running();
        enable(&self.station, &self.core, self.channel);
        Ok(())
    }
}
