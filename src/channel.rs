//! Shadow state of the converter kept by the host.

use crate::protocol::*;

#[cfg(feature = "protocol_serde")]
use serde::Serialize;

/// Values last reported by the converter for one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize))]
pub struct Measured {
    pub telemetry: Telemetry,
    pub lower_limits: Limits,
    pub upper_limits: Limits,
    pub status: ChannelStatus,
    /// Latched from the first station id frame and never overwritten.
    pub station_id: Option<u64>,
}

/// Values the host wants the converter to apply on one channel.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize))]
pub struct Desired {
    pub lower_limits: Limits,
    pub upper_limits: Limits,
    pub control_mode: ControlMode,
    pub command: f32,
    pub load_mode: LoadMode,
    pub enable: bool,
    /// Periodic transmission is active for this channel.
    pub sending: bool,
    pub counter: u8,
}

impl Default for Desired {
    fn default() -> Self {
        Self {
            lower_limits: Limits::default(),
            upper_limits: Limits::default(),
            control_mode: ControlMode::Standby,
            command: 0.0,
            load_mode: LoadMode::Independent,
            enable: false,
            sending: false,
            counter: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize))]
pub struct ChannelState {
    pub measured: Measured,
    pub desired: Desired,
}

impl ChannelState {
    pub fn is_remote(&self) -> bool {
        self.measured.status.converter_status == ConverterStatus::Remote
    }

    /// Returns false when a station id was already latched.
    pub fn latch_station_id(&mut self, station_id: u64) -> bool {
        if self.measured.station_id.is_some() {
            return false;
        }
        self.measured.station_id = Some(station_id);
        true
    }

    pub fn set_command(&mut self, control_mode: ControlMode, command: f32) {
        self.desired.control_mode = control_mode;
        self.desired.command = command;
    }

    pub fn disable(&mut self) {
        self.desired.enable = false;
        self.desired.command = 0.0;
        self.desired.control_mode = ControlMode::Standby;
    }

    /// Outbound burst for this channel. The counter advances once the burst
    /// is built, before anything is sent, so a burst that fails halfway
    /// still uses up its stamp.
    pub fn burst(&mut self, channel: Channel) -> [CanFrame; 3] {
        let d = &mut self.desired;
        let frames = [
            command_request(
                channel,
                d.counter,
                d.command,
                d.control_mode,
                d.load_mode,
                d.enable,
            ),
            d.lower_limits.request(channel, Bound::Lower, d.counter),
            d.upper_limits.request(channel, Bound::Upper, d.counter),
        ];
        d.counter = d.counter.wrapping_add(1);
        frames
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize))]
pub struct DeviceIdentity {
    pub software_version: u32,
    pub hardware_version: u8,
    pub detected: bool,
    pub fault_id: u8,
    pub module_id: u8,
    pub problem: ProblemId,
    pub problem_supplementary: u8,
}
