use super::*;
use crate::lifecycle::{SingleChannelTest, StopAction, TestControl, TestState};
use crate::protocol::Limits;
use parking_lot::Mutex;

/// Discharge current of the pulse, in amps.
pub const PULSE_CURRENT: f32 = 10.0;
const PULSE_DURATION_MS: u64 = 10_000;
const BROKEN_WELD_SPREAD: f32 = 0.1;

#[derive(Debug, Clone, PartialEq)]
pub struct PulseResult {
    pub initial_voltage: f32,
    pub final_voltage: f32,
    /// Pack resistance in ohms.
    pub pack_dcr: f32,
    pub cell_dcr: Vec<f32>,
    /// 1-based cell id and resistance.
    pub min_cell_dcr: Option<(usize, f32)>,
    pub max_cell_dcr: Option<(usize, f32)>,
    pub broken_weld: bool,
}

impl PulseResult {
    fn compute(initial: &BatteryModule, last: &BatteryModule) -> Self {
        let cell_dcr: Vec<f32> = initial
            .cell_voltages
            .iter()
            .zip(&last.cell_voltages)
            .map(|(before, after)| (before - after) / PULSE_CURRENT)
            .collect();
        let extremes = BatteryModule {
            cell_voltages: cell_dcr.clone(),
            ..Default::default()
        }
        .cell_extremes();
        let spread = |m: &BatteryModule| {
            m.cell_extremes()
                .map_or(0.0, |((_, min), (_, max))| max - min)
        };
        Self {
            initial_voltage: initial.voltage,
            final_voltage: last.voltage,
            pack_dcr: (initial.voltage - last.voltage) / PULSE_CURRENT,
            cell_dcr,
            min_cell_dcr: extremes.map(|((id, v), _)| (id + 1, v)),
            max_cell_dcr: extremes.map(|(_, (id, v))| (id + 1, v)),
            broken_weld: spread(initial) >= BROKEN_WELD_SPREAD
                || spread(last) >= BROKEN_WELD_SPREAD,
        }
    }

    fn lines(&self) -> Vec<String> {
        let mut lines = vec![
            format!("Initial BM voltage: {:.3}V", self.initial_voltage),
            format!("Final BM voltage: {:.3}V", self.final_voltage),
            format!("BM DCR = {:.4}", self.pack_dcr),
        ];
        if let (Some((max_id, max)), Some((min_id, min))) = (self.max_cell_dcr, self.min_cell_dcr)
        {
            lines.push(format!("Max DCR: {max:.4} ID: {max_id}"));
            lines.push(format!("Min DCR: {min:.4} ID: {min_id}"));
        }
        if self.broken_weld {
            lines.push("===BROKEN WELD===".to_string());
        }
        lines
    }
}

#[derive(Default)]
struct PulseRun {
    battery: Option<BatteryId>,
    initial: BatteryModule,
    result: Option<PulseResult>,
}

/// Applies a 10 s discharge pulse and derives the DC resistance of the pack
/// and of each cell from the voltage drop.
pub struct PulseTest {
    core: TestCore,
    station: Station,
    channel: Channel,
    run: Mutex<PulseRun>,
}

impl PulseTest {
    pub fn new(station: Station, channel: Channel, restart_wait: Duration) -> Self {
        Self {
            core: TestCore::new("PulseTest", station.clock().clone(), restart_wait),
            station,
            channel,
            run: Mutex::new(PulseRun::default()),
        }
    }

    pub fn last_result(&self) -> Option<PulseResult> {
        self.run.lock().result.clone()
    }

    fn battery(&self) -> Option<BatteryId> {
        self.run.lock().battery
    }

    fn finish(&self, last: &BatteryModule) {
        let result = {
            let mut run = self.run.lock();
            let result = PulseResult::compute(&run.initial, last);
            run.result = Some(result.clone());
            result
        };
        if self.stop(TestState::Success).is_ok() {
            for line in result.lines() {
                self.core.push_result(line);
            }
        }
    }
}

impl TestControl for PulseTest {
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
                if self.core.running_ms() >= PULSE_DURATION_MS {
                    self.finish(&module);
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

impl SingleChannelTest for PulseTest {
    fn channel(&self) -> Channel {
        self.channel
    }

    fn start(&self, battery: BatteryId) -> Result<(), TestError> {
        let _guard = self.core.start_guard();
        let module = pre_test_checks(&self.station, &self.core, battery)?;

        let converter = &self.station.converter;
        converter.set_lower_limits(self.channel, Limits::new(240.0, -PULSE_CURRENT, -4000.0));
        converter.set_upper_limits(self.channel, Limits::new(401.5, 0.0, 0.0));
        converter.set_current(self.channel, -PULSE_CURRENT);
        {
            let mut run = self.run.lock();
            run.battery = Some(battery);
            run.initial = module;
            run.result = None;
        }

        energize(&self.station, self.channel, battery);
        self.core.set_running();
        enable(&self.station, &self.core, self.channel);
        Ok(())
    }
}
