use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Frame 0x{id:03X} too short - required={expected} received={actual}")]
    FrameTooShort {
        id: u16,
        expected: usize,
        actual: usize,
    },
    #[error("Payload of {0} bytes does not fit into a CAN frame")]
    PayloadTooLong(usize),
    #[error("Unknown {kind} value {value}")]
    UnknownValue { kind: &'static str, value: u8 },
    #[error("Converter not detected")]
    ConverterNotDetected,
    #[error("No control mode selected for channel {0}")]
    ControlModeNotSet(crate::protocol::Channel),
    #[error("CAN bus error: {0}")]
    Bus(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Drive cycle data error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Invalid drive cycle record: {0}")]
    DriveCycleRecord(String),
    #[error("Configuration error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
