#![cfg_attr(docsrs, feature(doc_cfg))]
//! # abc150_lib
//!
//! This crate drives an ABC150 bidirectional DC-DC converter over CAN and runs
//! battery tests (pulse, capacity, charge/discharge and drive cycles) on top of it.
//!
//! The [`converter::Converter`] keeps a shadow of both converter channels, decodes
//! every inbound frame and periodically transmits the desired setpoints of each
//! channel under remote control. Tests in [`single`] and [`plate`] are driven by
//! the [`manager::TestManager`], which arbitrates who may use which channel.
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `abc150` command-line tool.
//!
//! ### Bus Features
//! - `socketcan`: Enables the Linux SocketCAN backend using the `socketcan` crate.
//!
//! ### Utility Features
//! - `protocol_serde`: Enables `serde` serialization of the decoded protocol structures.
//! - `bin-dependencies`: Enables all features required by the `abc150` binary executable.

/// Contains error types for the library.
mod error;
/// Scaling and big-endian helpers of the wire format.
pub mod codec;
/// Frame identifiers, decoders and encoders of the ABC150 CAN protocol.
pub mod protocol;

pub mod battery;
pub mod bus;
pub mod channel;
pub mod clock;
pub mod config;
pub mod converter;
pub mod drive_cycle;
pub mod lifecycle;
pub mod manager;
pub mod plate;
pub mod scheduler;
pub mod single;

pub use error::Error;
