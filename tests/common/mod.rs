#![allow(dead_code)]

use abc150_lib::battery::{BatteryCollection, BatteryId, BatteryModule, SimulatedPlate};
use abc150_lib::bus::LoopbackBus;
use abc150_lib::clock::ManualClock;
use abc150_lib::converter::Converter;
use abc150_lib::lifecycle::Station;
use abc150_lib::protocol::{self, CanFrame, Channel};
use std::sync::Arc;
use std::time::Duration;

/// A station on simulated time: loopback bus, in-memory packs and plate.
/// Converter replies are fed in by hand through [`Rig::handle`].
pub struct Rig {
    pub bus: Arc<LoopbackBus>,
    pub clock: Arc<ManualClock>,
    pub batteries: Arc<BatteryCollection>,
    pub plate: Arc<SimulatedPlate>,
    pub station: Station,
}

impl Rig {
    pub fn new(packs: Vec<BatteryModule>) -> Self {
        let bus = Arc::new(LoopbackBus::new());
        let clock = Arc::new(ManualClock::new());
        let converter = Arc::new(Converter::new(bus.clone(), clock.clone()));
        let batteries = Arc::new(BatteryCollection::from_modules(packs));
        let plate = Arc::new(SimulatedPlate::new(batteries.clone()));
        let station = Station::new(converter, batteries.clone(), plate.clone());
        Self {
            bus,
            clock,
            batteries,
            plate,
            station,
        }
    }

    /// Converter detected with both channels under remote control.
    pub fn ready(packs: Vec<BatteryModule>) -> Self {
        let rig = Self::new(packs);
        rig.detect();
        rig.remote(Channel::A);
        rig.remote(Channel::B);
        rig
    }

    pub fn converter(&self) -> &Arc<Converter> {
        &self.station.converter
    }

    pub fn handle(&self, id: u16, data: &[u8]) {
        let frame = CanFrame::new(id, data).unwrap();
        self.converter().handle_frame(&frame).unwrap();
    }

    pub fn detect(&self) {
        self.handle(
            protocol::GREETING,
            &[0, 0, 0, 1, protocol::ABC150_HARDWARE_VERSION],
        );
    }

    pub fn remote(&self, channel: Channel) {
        self.handle(protocol::STATUS + offset(channel), &[0, 0, 1, 0b1011, 0]);
    }

    /// Telemetry frame with voltage and current given in volts and amps.
    pub fn telemetry(&self, channel: Channel, voltage: f32, current: f32, timestamp: u32) {
        let mut data = [0u8; 8];
        data[0..2].copy_from_slice(&((voltage / 0.02).round() as i16).to_be_bytes());
        data[2..4].copy_from_slice(&((current / 0.02).round() as i16).to_be_bytes());
        data[4..8].copy_from_slice(&timestamp.to_be_bytes());
        self.handle(protocol::DATA + offset(channel), &data);
    }

    pub fn advance(&self, duration: Duration) {
        self.clock.advance(duration);
    }

    pub fn pack(&self, id: BatteryId) -> BatteryModule {
        use abc150_lib::battery::BatteryAggregator;
        self.batteries.module(id).unwrap()
    }
}

pub fn offset(channel: Channel) -> u16 {
    channel.index() as u16 * protocol::CHANNEL_OFFSET
}

pub fn pack(id: BatteryId, voltage: f32, cells: &[f32]) -> BatteryModule {
    let mut module = BatteryModule::new(id);
    module.voltage = voltage;
    module.cell_voltages = cells.to_vec();
    if let Some(((_, min), (_, max))) = module.cell_extremes() {
        module.min_cell_voltage = min;
        module.max_cell_voltage = max;
    }
    module
}

pub fn approx(actual: f32, expected: f32, tolerance: f32) {
    assert!(
        (actual - expected).abs() <= tolerance,
        "{actual} is not within {tolerance} of {expected}"
    );
}
