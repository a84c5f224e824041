use crate::codec::*;
use crate::Error;
use std::fmt;

#[cfg(feature = "protocol_serde")]
use serde::Serialize;

// converter -> host
pub const DATA: u16 = 0x100;
pub const LOWER_LIMITS: u16 = 0x101;
pub const UPPER_LIMITS: u16 = 0x102;
pub const STATUS: u16 = 0x103;
pub const STATION_ID: u16 = 0x104;
pub const GREETING: u16 = 0x140;
pub const FAULT: u16 = 0x141;
pub const PACKET_PROBLEM: u16 = 0x142;
pub const REQUEST_PC: u16 = 0x160;

// host -> converter
pub const COMMAND: u16 = 0x180;
pub const LOWER_LIMITS_OUT: u16 = 0x181;
pub const UPPER_LIMITS_OUT: u16 = 0x182;
pub const PC_GREETING: u16 = 0x1C0;
pub const CHANGE_CONTROL: u16 = 0x1C1;
pub const REQUEST_ABC: u16 = 0x1E0;

/// Hardware version reported by an ABC150 in its greeting.
pub const ABC150_HARDWARE_VERSION: u8 = 0x0D;

/// Identifier distance between channel A and channel B frames.
pub const CHANNEL_OFFSET: u16 = 0x20;

const MAX_PAYLOAD: usize = 8;

macro_rules! read_bit {
    ($byte:expr,$position:expr) => {
        ($byte >> $position) & 1 != 0
    };
}

fn validate_len(frame: &CanFrame, required: usize) -> std::result::Result<(), Error> {
    if frame.data().len() < required {
        log::warn!(
            "Invalid frame size - id=0x{:03X} required={} received={}",
            frame.id(),
            required,
            frame.data().len()
        );
        return Err(Error::FrameTooShort {
            id: frame.id(),
            expected: required,
            actual: frame.data().len(),
        });
    }
    Ok(())
}

/// Standard 11-bit CAN frame with up to eight payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    id: u16,
    data: [u8; MAX_PAYLOAD],
    len: u8,
}

impl CanFrame {
    pub fn new(id: u16, payload: &[u8]) -> std::result::Result<Self, Error> {
        if payload.len() > MAX_PAYLOAD {
            return Err(Error::PayloadTooLong(payload.len()));
        }
        let mut data = [0u8; MAX_PAYLOAD];
        data[..payload.len()].copy_from_slice(payload);
        Ok(Self {
            id: id & 0x7FF,
            data,
            len: payload.len() as u8,
        })
    }

    fn from_buffer(id: u16, data: [u8; MAX_PAYLOAD], len: u8) -> Self {
        Self { id, data, len }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:03X} [{}] {:02X?}", self.id, self.len, self.data())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize))]
pub enum Channel {
    A,
    B,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::A, Channel::B];

    pub fn index(self) -> usize {
        self as usize
    }

    fn offset(self) -> u16 {
        self as u16 * CHANNEL_OFFSET
    }

    /// Maps a per-channel inbound identifier to its base identifier and channel.
    fn split_id(id: u16) -> Option<(u16, Channel)> {
        match id {
            DATA..=STATION_ID => Some((id, Channel::A)),
            _ if (DATA + CHANNEL_OFFSET..=STATION_ID + CHANNEL_OFFSET).contains(&id) => {
                Some((id - CHANNEL_OFFSET, Channel::B))
            }
            _ => None,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Channel::A => write!(f, "A"),
            Channel::B => write!(f, "B"),
        }
    }
}

impl std::str::FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "A" | "a" | "0" => Ok(Channel::A),
            "B" | "b" | "1" => Ok(Channel::B),
            _ => Err(format!("Invalid channel '{s}', expected A or B")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize))]
pub enum ConverterStatus {
    #[default]
    Local = 0,
    Remote = 1,
    J1850 = 2,
}

impl TryFrom<u8> for ConverterStatus {
    type Error = Error;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(ConverterStatus::Local),
            1 => Ok(ConverterStatus::Remote),
            2 => Ok(ConverterStatus::J1850),
            _ => Err(Error::UnknownValue {
                kind: "converter status",
                value,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize))]
pub enum ControlMode {
    Voltage = 0,
    Current = 1,
    Power = 2,
    #[default]
    Standby = 3,
}

impl ControlMode {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => ControlMode::Voltage,
            1 => ControlMode::Current,
            2 => ControlMode::Power,
            _ => ControlMode::Standby,
        }
    }

    /// Scale of the commanded value while the channel runs in this mode.
    pub fn command_scale(self) -> f32 {
        match self {
            ControlMode::Voltage => VOLTAGE_SCALE,
            ControlMode::Current => CURRENT_SCALE,
            ControlMode::Power => POWER_SCALE,
            ControlMode::Standby => RAW_SCALE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize))]
pub enum NormalMode {
    #[default]
    Normal,
    ProtectedStandby,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize))]
pub enum EnableMode {
    Enabled,
    #[default]
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize))]
pub enum LoadMode {
    #[default]
    Independent = 0,
    Parallel = 1,
    Differential = 2,
    DoNotChange = 3,
}

impl LoadMode {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => LoadMode::Independent,
            1 => LoadMode::Parallel,
            2 => LoadMode::Differential,
            _ => LoadMode::DoNotChange,
        }
    }
}

impl std::str::FromStr for LoadMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "independent" => Ok(LoadMode::Independent),
            "parallel" => Ok(LoadMode::Parallel),
            "differential" => Ok(LoadMode::Differential),
            "keep" | "do-not-change" => Ok(LoadMode::DoNotChange),
            _ => Err(format!("Invalid load mode '{s}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize))]
pub enum RvsMode {
    #[default]
    Off,
    On,
}

/// Problem codes reported by the converter about a frame it rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize))]
pub enum ProblemId {
    #[default]
    None,
    CommandOutOfLimits,
    UvlTooHigh,
    UvlTooLow,
    LvlTooHigh,
    LvlTooLow,
    UclTooHigh,
    UclTooLow,
    LclTooHigh,
    LclTooLow,
    UplTooHigh,
    UplTooLow,
    LplTooHigh,
    LplTooLow,
    InvalidConfig,
    InvalidMode,
    UpperVoltageBelowLower,
    UpperCurrentBelowLower,
    UpperPowerBelowLower,
    InvalidControlSource,
    InvalidModeCombination,
    NotInRemoteControl,
    InvalidStationId,
    LoadVoltageIncompatible,
    PowerAllocationError,
    TooMuchCommand,
    OutOfOperatingSpace,
    InvalidChannel,
    InvalidSoftwareVersion,
    WrongLength,
    UnknownType,
    Other(u8),
}

impl From<u8> for ProblemId {
    fn from(code: u8) -> Self {
        match code {
            0x00 => ProblemId::None,
            0x01 => ProblemId::CommandOutOfLimits,
            0x02 => ProblemId::UvlTooHigh,
            0x03 => ProblemId::UvlTooLow,
            0x04 => ProblemId::LvlTooHigh,
            0x05 => ProblemId::LvlTooLow,
            0x06 => ProblemId::UclTooHigh,
            0x07 => ProblemId::UclTooLow,
            0x08 => ProblemId::LclTooHigh,
            0x09 => ProblemId::LclTooLow,
            0x0A => ProblemId::UplTooHigh,
            0x0B => ProblemId::UplTooLow,
            0x0C => ProblemId::LplTooHigh,
            0x0D => ProblemId::LplTooLow,
            0x0E => ProblemId::InvalidConfig,
            0x0F => ProblemId::InvalidMode,
            0x10 => ProblemId::UpperVoltageBelowLower,
            0x11 => ProblemId::UpperCurrentBelowLower,
            0x12 => ProblemId::UpperPowerBelowLower,
            0x13 => ProblemId::InvalidControlSource,
            0x15 => ProblemId::InvalidModeCombination,
            0x20 => ProblemId::NotInRemoteControl,
            0x21 => ProblemId::InvalidStationId,
            0x80 => ProblemId::LoadVoltageIncompatible,
            0x81 => ProblemId::PowerAllocationError,
            0x82 => ProblemId::TooMuchCommand,
            0x8F => ProblemId::OutOfOperatingSpace,
            0xF0 => ProblemId::InvalidChannel,
            0xFD => ProblemId::InvalidSoftwareVersion,
            0xFE => ProblemId::WrongLength,
            0xFF => ProblemId::UnknownType,
            other => ProblemId::Other(other),
        }
    }
}

impl fmt::Display for ProblemId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = match self {
            ProblemId::None => "no problem",
            ProblemId::CommandOutOfLimits => "command out of limits",
            ProblemId::UvlTooHigh => "upper voltage limit too high",
            ProblemId::UvlTooLow => "upper voltage limit too low",
            ProblemId::LvlTooHigh => "lower voltage limit too high",
            ProblemId::LvlTooLow => "lower voltage limit too low",
            ProblemId::UclTooHigh => "upper current limit too high",
            ProblemId::UclTooLow => "upper current limit too low",
            ProblemId::LclTooHigh => "lower current limit too high",
            ProblemId::LclTooLow => "lower current limit too low",
            ProblemId::UplTooHigh => "upper power limit too high",
            ProblemId::UplTooLow => "upper power limit too low",
            ProblemId::LplTooHigh => "lower power limit too high",
            ProblemId::LplTooLow => "lower power limit too low",
            ProblemId::InvalidConfig => "invalid configuration",
            ProblemId::InvalidMode => "invalid mode",
            ProblemId::UpperVoltageBelowLower => "upper voltage limit lower than lower limit",
            ProblemId::UpperCurrentBelowLower => "upper current limit lower than lower limit",
            ProblemId::UpperPowerBelowLower => "upper power limit lower than lower limit",
            ProblemId::InvalidControlSource => "invalid control source",
            ProblemId::InvalidModeCombination => "invalid mode combination",
            ProblemId::NotInRemoteControl => "not in remote control",
            ProblemId::InvalidStationId => "invalid station id received",
            ProblemId::LoadVoltageIncompatible => "load voltage incompatible",
            ProblemId::PowerAllocationError => "power allocation error",
            ProblemId::TooMuchCommand => "too much command",
            ProblemId::OutOfOperatingSpace => "out of operating space",
            ProblemId::InvalidChannel => "invalid channel",
            ProblemId::InvalidSoftwareVersion => "invalid software version",
            ProblemId::WrongLength => "wrong length",
            ProblemId::UnknownType => "unknown type",
            ProblemId::Other(code) => return write!(f, "unknown problem 0x{code:02X}"),
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    Lower,
    Upper,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize))]
pub struct Telemetry {
    pub voltage: f32,
    pub current: f32,
    /// Milliseconds counted by the converter
    pub timestamp: u32,
}

impl Telemetry {
    pub fn decode(frame: &CanFrame) -> std::result::Result<Self, Error> {
        validate_len(frame, 8)?;
        let data = frame.data();
        Ok(Self {
            voltage: to_physical(read_i16_be(data, 0), VOLTAGE_SCALE),
            current: to_physical(read_i16_be(data, 2), CURRENT_SCALE),
            timestamp: read_u32_be(data, 4),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize))]
pub struct Limits {
    pub voltage: f32,
    pub current: f32,
    pub power: f32,
}

impl Limits {
    pub fn new(voltage: f32, current: f32, power: f32) -> Self {
        Self {
            voltage,
            current,
            power,
        }
    }

    pub fn decode(frame: &CanFrame) -> std::result::Result<Self, Error> {
        validate_len(frame, 6)?;
        let data = frame.data();
        Ok(Self {
            voltage: to_physical(read_i16_be(data, 0), VOLTAGE_SCALE),
            current: to_physical(read_i16_be(data, 2), CURRENT_SCALE),
            power: to_physical(read_i16_be(data, 4), POWER_SCALE),
        })
    }

    /// Builds the outbound limit frame. The counter labels the burst the
    /// frame belongs to.
    pub fn request(&self, channel: Channel, bound: Bound, counter: u8) -> CanFrame {
        let id = match bound {
            Bound::Lower => LOWER_LIMITS_OUT,
            Bound::Upper => UPPER_LIMITS_OUT,
        } + channel.offset();
        let mut data = [0u8; MAX_PAYLOAD];
        data[0] = counter;
        write_i16_be(to_raw(self.voltage, VOLTAGE_SCALE), &mut data, 1);
        write_i16_be(to_raw(self.current, CURRENT_SCALE), &mut data, 3);
        write_i16_be(to_raw(self.power, POWER_SCALE), &mut data, 5);
        CanFrame::from_buffer(id, data, 7)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize))]
pub struct ConnectorStatus {
    pub negative: bool,
    pub positive: bool,
    pub interlock: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize))]
pub struct ChannelStatus {
    /// Commanded value as echoed by the converter, scaled by `control_mode`.
    pub command: f32,
    pub converter_status: ConverterStatus,
    pub control_mode: ControlMode,
    pub normal_mode: NormalMode,
    pub enable_mode: EnableMode,
    pub load_mode: LoadMode,
    pub rvs_mode: RvsMode,
    pub connector: ConnectorStatus,
}

impl ChannelStatus {
    pub fn decode(frame: &CanFrame) -> std::result::Result<Self, Error> {
        validate_len(frame, 5)?;
        let data = frame.data();
        let mode = data[3];
        let control_mode = ControlMode::from_bits(mode);
        Ok(Self {
            command: to_physical(read_i16_be(data, 0), control_mode.command_scale()),
            converter_status: ConverterStatus::try_from(data[2])?,
            control_mode,
            normal_mode: if read_bit!(mode, 2) {
                NormalMode::ProtectedStandby
            } else {
                NormalMode::Normal
            },
            enable_mode: if read_bit!(mode, 3) {
                EnableMode::Disabled
            } else {
                EnableMode::Enabled
            },
            load_mode: LoadMode::from_bits(mode >> 4),
            rvs_mode: if read_bit!(mode, 6) {
                RvsMode::On
            } else {
                RvsMode::Off
            },
            connector: ConnectorStatus {
                negative: read_bit!(data[4], 0),
                positive: read_bit!(data[4], 1),
                interlock: read_bit!(data[4], 2),
            },
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize))]
pub struct Greeting {
    pub software_version: u32,
    pub hardware_version: u8,
}

impl Greeting {
    pub fn decode(frame: &CanFrame) -> std::result::Result<Self, Error> {
        validate_len(frame, 5)?;
        let data = frame.data();
        Ok(Self {
            software_version: read_u32_be(data, 0),
            hardware_version: data[4],
        })
    }

    pub fn is_abc150(&self) -> bool {
        self.hardware_version == ABC150_HARDWARE_VERSION
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize))]
pub struct Fault {
    pub fault_id: u8,
    pub module_id: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize))]
pub struct PacketProblem {
    pub problem: ProblemId,
    /// Channel the problem refers to: 0 for A, 1 for B.
    pub supplementary: u8,
}

/// A frame received from the converter, classified by identifier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DecodedFrame {
    Telemetry {
        channel: Channel,
        telemetry: Telemetry,
    },
    Limits {
        channel: Channel,
        bound: Bound,
        limits: Limits,
    },
    Status {
        channel: Channel,
        status: ChannelStatus,
    },
    StationId {
        channel: Channel,
        station_id: u64,
    },
    Greeting(Greeting),
    Fault(Fault),
    PacketProblem(PacketProblem),
    Request {
        requested_id: u16,
    },
}

impl DecodedFrame {
    /// Decodes a received frame. Unknown identifiers yield `Ok(None)`.
    pub fn decode(frame: &CanFrame) -> std::result::Result<Option<Self>, Error> {
        if let Some((base, channel)) = Channel::split_id(frame.id()) {
            let decoded = match base {
                DATA => DecodedFrame::Telemetry {
                    channel,
                    telemetry: Telemetry::decode(frame)?,
                },
                LOWER_LIMITS => DecodedFrame::Limits {
                    channel,
                    bound: Bound::Lower,
                    limits: Limits::decode(frame)?,
                },
                UPPER_LIMITS => DecodedFrame::Limits {
                    channel,
                    bound: Bound::Upper,
                    limits: Limits::decode(frame)?,
                },
                STATUS => DecodedFrame::Status {
                    channel,
                    status: ChannelStatus::decode(frame)?,
                },
                _ => {
                    validate_len(frame, 5)?;
                    DecodedFrame::StationId {
                        channel,
                        station_id: read_u40_be(frame.data(), 0),
                    }
                }
            };
            return Ok(Some(decoded));
        }

        let decoded = match frame.id() {
            GREETING => DecodedFrame::Greeting(Greeting::decode(frame)?),
            FAULT => {
                validate_len(frame, 2)?;
                DecodedFrame::Fault(Fault {
                    fault_id: frame.data()[0],
                    module_id: frame.data()[1],
                })
            }
            PACKET_PROBLEM => {
                validate_len(frame, 2)?;
                DecodedFrame::PacketProblem(PacketProblem {
                    problem: ProblemId::from(frame.data()[0]),
                    supplementary: frame.data()[1],
                })
            }
            REQUEST_PC => {
                validate_len(frame, 2)?;
                DecodedFrame::Request {
                    requested_id: read_u16_be(frame.data(), 0),
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(decoded))
    }
}

/// Outbound setpoint frame. A disabled channel is always commanded into
/// standby with a zero setpoint.
pub fn command_request(
    channel: Channel,
    counter: u8,
    command: f32,
    control_mode: ControlMode,
    load_mode: LoadMode,
    enabled: bool,
) -> CanFrame {
    let mode = if enabled {
        control_mode
    } else {
        ControlMode::Standby
    };
    let raw = match mode {
        ControlMode::Standby => 0,
        _ => to_raw(command, mode.command_scale()),
    };
    let mut data = [0u8; MAX_PAYLOAD];
    data[0] = counter;
    write_i16_be(raw, &mut data, 1);
    data[3] = mode as u8 | ((load_mode as u8) << 4);
    CanFrame::from_buffer(COMMAND + channel.offset(), data, 4)
}

pub fn pc_greeting_request() -> CanFrame {
    CanFrame::from_buffer(PC_GREETING, [0u8; MAX_PAYLOAD], 6)
}

/// Announces the hand-over of `channel` from its present control source to
/// remote control by this host.
pub fn change_control_request(
    channel: Channel,
    from: ConverterStatus,
    hardware_version: u8,
    station_id: u64,
) -> CanFrame {
    let mut data = [0u8; MAX_PAYLOAD];
    data[0] = channel as u8 | ((from as u8) << 1) | ((ConverterStatus::Remote as u8) << 4);
    data[1] = hardware_version;
    write_u40_be(station_id, &mut data, 3);
    CanFrame::from_buffer(CHANGE_CONTROL, data, 8)
}

/// Asks every converter on the bus to announce itself with a greeting.
pub fn converter_request() -> CanFrame {
    let mut data = [0u8; MAX_PAYLOAD];
    data[..2].copy_from_slice(&GREETING.to_be_bytes());
    CanFrame::from_buffer(REQUEST_ABC, data, 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: u16, payload: &[u8]) -> CanFrame {
        CanFrame::new(id, payload).unwrap()
    }

    #[test]
    fn telemetry_channel_b() {
        let decoded = DecodedFrame::decode(&frame(
            0x120,
            &[0x44, 0x5C, 0xFE, 0x0C, 0x00, 0x00, 0x03, 0xE8],
        ))
        .unwrap();
        match decoded {
            Some(DecodedFrame::Telemetry { channel, telemetry }) => {
                assert_eq!(channel, Channel::B);
                assert!((telemetry.voltage - 350.0).abs() < 0.01);
                assert!((telemetry.current + 10.0).abs() < 0.01);
                assert_eq!(telemetry.timestamp, 1000);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn status_bitfields() {
        // command 200 * 5W, remote, power mode, enabled, parallel, rvs on
        let mode = 0b0101_0010;
        let decoded =
            DecodedFrame::decode(&frame(STATUS, &[0x00, 0xC8, 0x01, mode, 0b101])).unwrap();
        let Some(DecodedFrame::Status { channel, status }) = decoded else {
            panic!("unexpected {decoded:?}");
        };
        assert_eq!(channel, Channel::A);
        assert_eq!(status.command, 1000.0);
        assert_eq!(status.converter_status, ConverterStatus::Remote);
        assert_eq!(status.control_mode, ControlMode::Power);
        assert_eq!(status.normal_mode, NormalMode::Normal);
        assert_eq!(status.enable_mode, EnableMode::Enabled);
        assert_eq!(status.load_mode, LoadMode::Parallel);
        assert_eq!(status.rvs_mode, RvsMode::On);
        assert!(status.connector.negative);
        assert!(!status.connector.positive);
        assert!(status.connector.interlock);
    }

    #[test]
    fn status_standby_command_is_raw() {
        let decoded =
            DecodedFrame::decode(&frame(STATUS, &[0x00, 0x07, 0x00, 0b1011, 0])).unwrap();
        let Some(DecodedFrame::Status { status, .. }) = decoded else {
            panic!("unexpected {decoded:?}");
        };
        assert_eq!(status.control_mode, ControlMode::Standby);
        assert_eq!(status.enable_mode, EnableMode::Disabled);
        assert_eq!(status.command, 7.0);
    }

    #[test]
    fn status_invalid_converter_status() {
        assert!(matches!(
            DecodedFrame::decode(&frame(STATUS, &[0, 0, 7, 0, 0])),
            Err(Error::UnknownValue { .. })
        ));
    }

    #[test]
    fn short_frames_are_rejected() {
        for id in [DATA, LOWER_LIMITS + CHANNEL_OFFSET, STATUS, STATION_ID, GREETING] {
            assert!(matches!(
                DecodedFrame::decode(&frame(id, &[])),
                Err(Error::FrameTooShort { .. })
            ));
        }
        assert!(matches!(
            DecodedFrame::decode(&frame(DATA, &[0; 7])),
            Err(Error::FrameTooShort {
                expected: 8,
                actual: 7,
                ..
            })
        ));
        assert!(matches!(
            DecodedFrame::decode(&frame(PACKET_PROBLEM, &[1])),
            Err(Error::FrameTooShort { .. })
        ));
    }

    #[test]
    fn unknown_identifier_is_ignored() {
        assert!(matches!(DecodedFrame::decode(&frame(0x1C2, &[1, 2])), Ok(None)));
        assert!(matches!(DecodedFrame::decode(&frame(0x105, &[])), Ok(None)));
        assert!(matches!(DecodedFrame::decode(&frame(0x7FF, &[0; 8])), Ok(None)));
    }

    #[test]
    fn greeting_and_problem() {
        let decoded =
            DecodedFrame::decode(&frame(GREETING, &[0x00, 0x01, 0x02, 0x03, 0x0D])).unwrap();
        let Some(DecodedFrame::Greeting(greeting)) = decoded else {
            panic!("unexpected {decoded:?}");
        };
        assert_eq!(greeting.software_version, 0x0001_0203);
        assert!(greeting.is_abc150());

        let decoded = DecodedFrame::decode(&frame(PACKET_PROBLEM, &[0x20, 0x01])).unwrap();
        assert_eq!(
            decoded,
            Some(DecodedFrame::PacketProblem(PacketProblem {
                problem: ProblemId::NotInRemoteControl,
                supplementary: 1,
            }))
        );
        assert_eq!(ProblemId::from(0x42), ProblemId::Other(0x42));
    }

    #[test]
    fn limits_round_trip() {
        let limits = Limits::new(401.5, -10.0, -4000.0);
        let out = limits.request(Channel::B, Bound::Upper, 9);
        assert_eq!(out.id(), 0x1A2);
        assert_eq!(out.data().len(), 7);
        assert_eq!(out.data()[0], 9);
        // inbound layout is the outbound layout without the counter
        let decoded = Limits::decode(&frame(UPPER_LIMITS, &out.data()[1..])).unwrap();
        assert!((decoded.voltage - 401.5).abs() <= 0.02);
        assert!((decoded.current + 10.0).abs() <= 0.02);
        assert_eq!(decoded.power, -4000.0);
    }

    #[test]
    fn command_frame() {
        let out = command_request(
            Channel::A,
            3,
            -10.0,
            ControlMode::Current,
            LoadMode::Parallel,
            true,
        );
        assert_eq!(out.id(), COMMAND);
        assert_eq!(out.data(), &[3, 0xFE, 0x0C, 0x11]);

        let out = command_request(
            Channel::B,
            4,
            -10.0,
            ControlMode::Current,
            LoadMode::Independent,
            false,
        );
        assert_eq!(out.id(), 0x1A0);
        assert_eq!(out.data(), &[4, 0, 0, 0x03]);
    }

    #[test]
    fn control_frames() {
        let out = change_control_request(Channel::B, ConverterStatus::Local, 0x0D, 0x01_0203_0405);
        assert_eq!(out.id(), CHANGE_CONTROL);
        assert_eq!(out.data(), &[0x11, 0x0D, 0, 1, 2, 3, 4, 5]);
        assert_eq!(pc_greeting_request().data(), &[0; 6]);
        assert_eq!(converter_request().data(), &[0x01, 0x40]);
    }

    #[test]
    fn frame_payload_limit() {
        assert!(matches!(
            CanFrame::new(DATA, &[0; 9]),
            Err(Error::PayloadTooLong(9))
        ));
    }
}
