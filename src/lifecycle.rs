//! Bookkeeping shared by every test: state machine, timing, cycles, results
//! and the start/stop guards.

use crate::battery::{BatteryAggregator, BatteryId, PlateDriver};
use crate::clock::Clock;
use crate::converter::Converter;
use crate::protocol::Channel;
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[cfg(feature = "protocol_serde")]
use serde::Serialize;

const MAX_RESULTS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize))]
pub enum TestState {
    #[default]
    Idle,
    Running,
    Success,
    Failed,
    /// Waiting for the next cycle of a multi-cycle test.
    Restart,
}

impl TestState {
    /// Running or waiting for its next cycle.
    pub fn is_active(self) -> bool {
        matches!(self, TestState::Running | TestState::Restart)
    }
}

impl fmt::Display for TestState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TestError {
    #[error("Test already running")]
    AlreadyRunning,
    #[error("Test not running")]
    NotRunning,
    #[error("Battery {0} not found")]
    BatteryNotFound(BatteryId),
    #[error("No battery assigned to channel {0}")]
    BatteryUnassigned(Channel),
    #[error("Battery {0} reports errors")]
    BatteryFault(BatteryId),
    #[error("Destination voltage not set")]
    DestinationVoltageUnset,
    #[error("ABC150 not detected")]
    ConverterNotDetected,
    #[error("No battery online on the plate")]
    NoBatteryOnline,
    #[error("{hv_on} batteries with HV on but {online} online")]
    HvCountMismatch { online: usize, hv_on: usize },
    #[error("Drive cycle unavailable: {0}")]
    DriveCycle(String),
    #[error("Invalid test index {0}")]
    InvalidIndex(usize),
    #[error("Converter busy with {0}")]
    Busy(String),
}

/// Collaborators every test drives.
#[derive(Clone)]
pub struct Station {
    pub converter: Arc<Converter>,
    pub batteries: Arc<dyn BatteryAggregator>,
    pub plate: Arc<dyn PlateDriver>,
}

impl Station {
    pub fn new(
        converter: Arc<Converter>,
        batteries: Arc<dyn BatteryAggregator>,
        plate: Arc<dyn PlateDriver>,
    ) -> Self {
        Self {
            converter,
            batteries,
            plate,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        self.converter.clock()
    }

    pub fn now_ms(&self) -> u64 {
        self.clock().now_ms()
    }

    pub fn sleep_ms(&self, ms: u64) {
        self.clock().sleep(Duration::from_millis(ms));
    }

    /// Requests remote control of `channel` and waits `settle` for the
    /// converter to confirm. One more attempt is made if it did not.
    pub fn hand_over(&self, channel: Channel, settle: Duration) -> bool {
        for attempt in 0..2 {
            if attempt > 0 {
                log::warn!("Channel {} not in remote mode, taking control again", channel);
            }
            if let Err(e) = self.converter.take_control(channel) {
                log::error!("Take control of channel {} failed: {}", channel, e);
            }
            self.clock().sleep(settle);
            if self.converter.is_remote(channel) {
                return true;
            }
        }
        log::error!("Channel {} did not switch to remote mode", channel);
        false
    }
}

#[derive(Debug, Default)]
struct Lifecycle {
    state: TestState,
    start_ms: u64,
    stop_ms: u64,
    wait_start_ms: u64,
    cycles: u32,
    destination_voltage: f32,
    results: VecDeque<String>,
}

/// State shared by all concrete tests. Each test embeds one.
pub struct TestCore {
    name: &'static str,
    clock: Arc<dyn Clock>,
    restart_wait: Duration,
    start_guard: Mutex<()>,
    stop_guard: Mutex<()>,
    inner: Mutex<Lifecycle>,
}

/// Outcome of [`TestCore::begin_stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopAction {
    /// Hardware must be torn down, then [`TestCore::conclude`] called.
    Teardown,
    /// Stopped between cycles, nothing left to tear down.
    Done,
}

impl TestCore {
    pub fn new(name: &'static str, clock: Arc<dyn Clock>, restart_wait: Duration) -> Self {
        Self {
            name,
            clock,
            restart_wait,
            start_guard: Mutex::new(()),
            stop_guard: Mutex::new(()),
            inner: Mutex::new(Lifecycle {
                cycles: 1,
                ..Default::default()
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> TestState {
        self.inner.lock().state
    }

    pub fn start_guard(&self) -> MutexGuard<'_, ()> {
        self.start_guard.lock()
    }

    pub fn stop_guard(&self) -> MutexGuard<'_, ()> {
        self.stop_guard.lock()
    }

    pub fn ensure_not_running(&self) -> Result<(), TestError> {
        if self.state() == TestState::Running {
            log::error!("{}: already running", self.name);
            return Err(TestError::AlreadyRunning);
        }
        Ok(())
    }

    pub fn set_running(&self) {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        inner.state = TestState::Running;
        inner.start_ms = now;
        log::info!("{}: running", self.name);
    }

    pub fn start_ms(&self) -> u64 {
        self.inner.lock().start_ms
    }

    /// Milliseconds since the current run started.
    pub fn running_ms(&self) -> u64 {
        self.clock.now_ms().saturating_sub(self.start_ms())
    }

    /// Decides how a stop request is handled. Must be called with the stop
    /// guard held.
    pub fn begin_stop(&self, requested: TestState) -> Result<StopAction, TestError> {
        let mut inner = self.inner.lock();
        match inner.state {
            TestState::Restart if requested == TestState::Idle => {
                inner.state = TestState::Idle;
                log::info!("{}: idle", self.name);
                Ok(StopAction::Done)
            }
            TestState::Running => Ok(StopAction::Teardown),
            _ => Err(TestError::NotRunning),
        }
    }

    /// Records the end of a run after teardown. A successful run with cycles
    /// left moves to [`TestState::Restart`].
    pub fn conclude(&self, requested: TestState, cycling: bool) {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        inner.stop_ms = now;
        if cycling {
            inner.cycles = inner.cycles.saturating_sub(1);
        }
        inner.state = if requested == TestState::Success && cycling && inner.cycles > 0 {
            log::info!("{}: cycle done, {} left", self.name, inner.cycles);
            inner.wait_start_ms = now;
            TestState::Restart
        } else {
            requested
        };
        log::info!("{}: {}", self.name, inner.state);
    }

    /// True when the test waits for its next cycle and the wait elapsed.
    pub fn restart_due(&self) -> bool {
        let now = self.clock.now_ms();
        let inner = self.inner.lock();
        inner.state == TestState::Restart
            && now.saturating_sub(inner.wait_start_ms) >= self.restart_wait.as_millis() as u64
    }

    pub fn cycles(&self) -> u32 {
        self.inner.lock().cycles
    }

    pub fn set_cycles(&self, cycles: u32) {
        self.inner.lock().cycles = cycles.max(1);
    }

    pub fn destination_voltage(&self) -> f32 {
        self.inner.lock().destination_voltage
    }

    pub fn set_destination_voltage(&self, voltage: f32) {
        self.inner.lock().destination_voltage = voltage;
    }

    pub fn push_result(&self, line: String) {
        log::info!("{}: {}", self.name, line);
        let mut inner = self.inner.lock();
        if inner.results.len() == MAX_RESULTS {
            inner.results.pop_front();
        }
        inner.results.push_back(line);
    }

    pub fn results(&self) -> Vec<String> {
        self.inner.lock().results.iter().cloned().collect()
    }

    /// Running time of the current run, or of the last one once stopped.
    pub fn elapsed(&self) -> Duration {
        let now = self.clock.now_ms();
        let inner = self.inner.lock();
        let end = if inner.state == TestState::Running {
            now
        } else {
            inner.stop_ms
        };
        Duration::from_millis(end.saturating_sub(inner.start_ms))
    }
}

/// Operations common to every test, as seen by the manager.
pub trait TestControl: Send + Sync {
    fn core(&self) -> &TestCore;

    /// Stops the test. `Success` and `Failed` come from the test itself,
    /// `Idle` from an operator.
    fn stop(&self, requested: TestState) -> Result<(), TestError>;

    /// One poll tick.
    fn step(&self);

    /// The test repeats on success while cycles are left.
    fn supports_cycles(&self) -> bool {
        false
    }

    /// The test drives towards a destination voltage.
    fn uses_destination_voltage(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        self.core().name()
    }

    fn state(&self) -> TestState {
        self.core().state()
    }

    fn results(&self) -> Vec<String> {
        self.core().results()
    }

    fn elapsed(&self) -> Duration {
        self.core().elapsed()
    }

    fn set_cycles(&self, cycles: u32) {
        self.core().set_cycles(cycles);
    }

    fn set_destination_voltage(&self, voltage: f32) {
        self.core().set_destination_voltage(voltage);
    }
}

pub trait SingleChannelTest: TestControl {
    fn channel(&self) -> Channel;
    fn start(&self, battery: BatteryId) -> Result<(), TestError>;
}

pub trait DualChannelTest: TestControl {
    fn start(&self) -> Result<(), TestError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn core() -> (Arc<ManualClock>, TestCore) {
        let clock = Arc::new(ManualClock::new());
        let core = TestCore::new("core", clock.clone(), Duration::from_secs(10));
        (clock, core)
    }

    #[test]
    fn stop_requires_running() {
        let (_, core) = core();
        assert_eq!(core.begin_stop(TestState::Idle), Err(TestError::NotRunning));
        core.set_running();
        assert_eq!(core.begin_stop(TestState::Failed), Ok(StopAction::Teardown));
    }

    #[test]
    fn cycles_restart_then_idle() {
        let (clock, core) = core();
        core.set_cycles(2);
        core.set_running();
        clock.advance(Duration::from_secs(5));
        core.conclude(TestState::Success, true);
        assert_eq!(core.state(), TestState::Restart);
        assert_eq!(core.elapsed(), Duration::from_secs(5));
        assert!(!core.restart_due());
        clock.advance(Duration::from_secs(10));
        assert!(core.restart_due());

        assert_eq!(core.begin_stop(TestState::Idle), Ok(StopAction::Done));
        assert_eq!(core.state(), TestState::Idle);
    }

    #[test]
    fn last_cycle_succeeds() {
        let (_, core) = core();
        core.set_running();
        core.conclude(TestState::Success, true);
        assert_eq!(core.state(), TestState::Success);
        assert_eq!(core.cycles(), 0);
    }

    #[test]
    fn failure_does_not_restart() {
        let (_, core) = core();
        core.set_cycles(3);
        core.set_running();
        core.conclude(TestState::Failed, true);
        assert_eq!(core.state(), TestState::Failed);
    }

    #[test]
    fn results_are_bounded() {
        let (_, core) = core();
        for i in 0..(MAX_RESULTS + 1) {
            core.push_result(format!("line {i}"));
        }
        let results = core.results();
        assert_eq!(results.len(), MAX_RESULTS);
        assert_eq!(results[0], "line 1");
    }
}
