//! Protocol engine for one ABC150 converter.
//!
//! [`Converter`] owns the shadow state of both channels. Inbound frames are
//! applied through [`Converter::handle_frame`], host setpoints through the
//! setters, and [`Converter::transmit_cycle`] pushes the desired state of
//! every channel under remote control to the bus.

use crate::bus::{CanBus, CanReceiver};
use crate::channel::{ChannelState, DeviceIdentity};
use crate::clock::Clock;
use crate::protocol::*;
use crate::scheduler::Periodic;
use crate::Error;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_TRANSMIT_PERIOD: Duration = Duration::from_millis(500);
/// Gap between the frames of one burst, needed by the converter to ingest them.
pub const BURST_GAP: Duration = Duration::from_millis(1);
const RECEIVE_TIMEOUT: Duration = Duration::from_millis(100);

pub struct Converter {
    bus: Arc<dyn CanBus>,
    clock: Arc<dyn Clock>,
    channels: Mutex<[ChannelState; 2]>,
    device: Mutex<DeviceIdentity>,
    default_period: Duration,
    period_ms: AtomicU64,
}

impl Converter {
    pub fn new(bus: Arc<dyn CanBus>, clock: Arc<dyn Clock>) -> Self {
        Self::with_period(bus, clock, DEFAULT_TRANSMIT_PERIOD)
    }

    pub fn with_period(bus: Arc<dyn CanBus>, clock: Arc<dyn Clock>, period: Duration) -> Self {
        Self {
            bus,
            clock,
            channels: Mutex::new([ChannelState::default(); 2]),
            device: Mutex::new(DeviceIdentity::default()),
            default_period: period,
            period_ms: AtomicU64::new(period.as_millis() as u64),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn handle_frame(&self, frame: &CanFrame) -> Result<(), Error> {
        log::trace!("rx {}", frame);
        match DecodedFrame::decode(frame)? {
            Some(decoded) => self.apply(decoded),
            None => Ok(()),
        }
    }

    fn apply(&self, decoded: DecodedFrame) -> Result<(), Error> {
        match decoded {
            DecodedFrame::Telemetry { channel, telemetry } => {
                self.channels.lock()[channel.index()].measured.telemetry = telemetry;
            }
            DecodedFrame::Limits {
                channel,
                bound,
                limits,
            } => {
                let mut channels = self.channels.lock();
                let measured = &mut channels[channel.index()].measured;
                match bound {
                    Bound::Lower => measured.lower_limits = limits,
                    Bound::Upper => measured.upper_limits = limits,
                }
            }
            DecodedFrame::Status { channel, status } => {
                let previous = {
                    let mut channels = self.channels.lock();
                    let measured = &mut channels[channel.index()].measured;
                    std::mem::replace(&mut measured.status, status).converter_status
                };
                if previous != status.converter_status {
                    log::info!(
                        "Channel {} converter status {:?} -> {:?}",
                        channel,
                        previous,
                        status.converter_status
                    );
                }
            }
            DecodedFrame::StationId {
                channel,
                station_id,
            } => {
                if self.channels.lock()[channel.index()].latch_station_id(station_id) {
                    log::info!("Channel {} station id 0x{:010X}", channel, station_id);
                }
            }
            DecodedFrame::Greeting(greeting) => {
                let mut device = self.device.lock();
                device.software_version = greeting.software_version;
                device.hardware_version = greeting.hardware_version;
                device.detected = greeting.is_abc150();
                if device.detected {
                    log::info!(
                        "ABC150 detected, software version {}",
                        greeting.software_version
                    );
                } else {
                    log::error!(
                        "Unexpected hardware version 0x{:02X}",
                        greeting.hardware_version
                    );
                }
            }
            DecodedFrame::Fault(fault) => {
                let mut device = self.device.lock();
                device.fault_id = fault.fault_id;
                device.module_id = fault.module_id;
                log::error!(
                    "Converter fault {} on module {}",
                    fault.fault_id,
                    fault.module_id
                );
            }
            DecodedFrame::PacketProblem(problem) => {
                let mut device = self.device.lock();
                if device.problem != problem.problem
                    || device.problem_supplementary != problem.supplementary
                {
                    log::warn!(
                        "Packet problem on channel {}: {}",
                        problem_channel(problem.supplementary),
                        problem.problem
                    );
                }
                device.problem = problem.problem;
                device.problem_supplementary = problem.supplementary;
            }
            DecodedFrame::Request { requested_id } => {
                if requested_id == PC_GREETING {
                    self.bus.send(&pc_greeting_request())?;
                } else {
                    log::debug!("Ignoring request for 0x{:03X}", requested_id);
                }
            }
        }
        Ok(())
    }

    pub fn channel(&self, channel: Channel) -> ChannelState {
        self.channels.lock()[channel.index()]
    }

    pub fn device(&self) -> DeviceIdentity {
        *self.device.lock()
    }

    pub fn is_detected(&self) -> bool {
        self.device.lock().detected
    }

    pub fn is_remote(&self, channel: Channel) -> bool {
        self.channels.lock()[channel.index()].is_remote()
    }

    fn update<F: FnOnce(&mut ChannelState)>(&self, channel: Channel, f: F) {
        f(&mut self.channels.lock()[channel.index()]);
    }

    pub fn set_lower_limits(&self, channel: Channel, limits: Limits) {
        self.update(channel, |c| c.desired.lower_limits = limits);
    }

    pub fn set_upper_limits(&self, channel: Channel, limits: Limits) {
        self.update(channel, |c| c.desired.upper_limits = limits);
    }

    pub fn set_voltage(&self, channel: Channel, voltage: f32) {
        self.update(channel, |c| c.set_command(ControlMode::Voltage, voltage));
    }

    pub fn set_current(&self, channel: Channel, current: f32) {
        self.update(channel, |c| c.set_command(ControlMode::Current, current));
    }

    pub fn set_power(&self, channel: Channel, power: f32) {
        self.update(channel, |c| c.set_command(ControlMode::Power, power));
    }

    pub fn set_load_mode(&self, channel: Channel, load_mode: LoadMode) {
        self.update(channel, |c| c.desired.load_mode = load_mode);
    }

    pub fn enable(&self, channel: Channel) -> Result<(), Error> {
        if !self.is_detected() {
            log::error!("ABC150 not detected");
            return Err(Error::ConverterNotDetected);
        }
        let mut channels = self.channels.lock();
        let state = &mut channels[channel.index()];
        if state.desired.control_mode == ControlMode::Standby {
            log::error!("Channel {} control mode not set", channel);
            return Err(Error::ControlModeNotSet(channel));
        }
        state.desired.enable = true;
        Ok(())
    }

    pub fn disable(&self, channel: Channel) {
        self.update(channel, ChannelState::disable);
    }

    /// Greets the converter, requests remote control of `channel` and starts
    /// the periodic transmission for it.
    pub fn take_control(&self, channel: Channel) -> Result<(), Error> {
        let state = self.channel(channel);
        let hardware_version = self.device.lock().hardware_version;
        self.bus.send(&pc_greeting_request())?;
        self.bus.send(&change_control_request(
            channel,
            state.measured.status.converter_status,
            hardware_version,
            state.measured.station_id.unwrap_or_default(),
        ))?;
        self.update(channel, |c| c.desired.sending = true);
        Ok(())
    }

    /// Stops periodic transmission. The converter falls back on its own.
    pub fn release_control(&self, channel: Channel) {
        self.update(channel, |c| c.desired.sending = false);
    }

    pub fn request_converter(&self) -> Result<(), Error> {
        self.bus.send(&converter_request())
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms.load(Ordering::Relaxed))
    }

    pub fn set_period(&self, period: Duration) {
        self.period_ms
            .store(period.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn set_default_period(&self) {
        self.set_period(self.default_period);
    }

    /// Sends the command, lower limit and upper limit frames of every channel
    /// that is sending and under remote control.
    pub fn transmit_cycle(&self) -> Result<(), Error> {
        for channel in Channel::ALL {
            let burst = {
                let mut channels = self.channels.lock();
                let state = &mut channels[channel.index()];
                if !(state.desired.sending && state.is_remote()) {
                    continue;
                }
                state.burst(channel)
            };
            for frame in &burst {
                self.bus.send(frame)?;
                self.clock.sleep(BURST_GAP);
            }
        }
        Ok(())
    }

    pub fn spawn_transmitter(self: &Arc<Self>) -> Result<Periodic, Error> {
        let converter = self.clone();
        Periodic::spawn("abc150-tx", move || {
            if let Err(e) = converter.transmit_cycle() {
                log::warn!("Transmit cycle failed: {}", e);
            }
            Some(converter.period())
        })
    }

    pub fn spawn_receiver(
        self: &Arc<Self>,
        mut receiver: Box<dyn CanReceiver>,
    ) -> Result<Periodic, Error> {
        let converter = self.clone();
        Periodic::spawn("abc150-rx", move || {
            match receiver.receive(RECEIVE_TIMEOUT) {
                Ok(Some(frame)) => {
                    if let Err(e) = converter.handle_frame(&frame) {
                        log::warn!("Rejected frame {}: {}", frame, e);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    log::error!("CAN receive failed: {}", e);
                    return None;
                }
            }
            Some(Duration::ZERO)
        })
    }
}

fn problem_channel(supplementary: u8) -> &'static str {
    match supplementary {
        0 => "A",
        1 => "B",
        _ => "Unknown",
    }
}
