//! CAN transports used by the converter engine.

use crate::protocol::{self, CanFrame};
use crate::Error;
use parking_lot::Mutex;
use std::sync::mpsc;
use std::time::Duration;

/// Transmit side of a CAN interface. Shared by the transmit cycle and the
/// operator command path, so sending takes `&self`.
pub trait CanBus: Send + Sync {
    fn send(&self, frame: &CanFrame) -> Result<(), Error>;
}

/// Receive side of a CAN interface, owned by a single reader thread.
pub trait CanReceiver: Send {
    /// Waits up to `timeout` for the next data frame. `Ok(None)` on timeout.
    fn receive(&mut self, timeout: Duration) -> Result<Option<CanFrame>, Error>;
}

/// In-process bus. Records every transmitted frame and can answer like a
/// converter would, which is enough to exercise the station without hardware.
#[derive(Debug)]
pub struct LoopbackBus {
    sent: Mutex<Vec<CanFrame>>,
    echo: bool,
    inbound: Mutex<Option<mpsc::Sender<CanFrame>>>,
}

impl LoopbackBus {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            echo: false,
            inbound: Mutex::new(None),
        }
    }

    /// Answers discovery and change-control frames with greeting and status
    /// frames on the receiver returned by [`LoopbackBus::receiver`].
    pub fn with_converter_echo() -> Self {
        Self {
            echo: true,
            ..Self::new()
        }
    }

    pub fn receiver(&self) -> LoopbackReceiver {
        let (tx, rx) = mpsc::channel();
        *self.inbound.lock() = Some(tx);
        LoopbackReceiver { rx }
    }

    pub fn sent(&self) -> Vec<CanFrame> {
        self.sent.lock().clone()
    }

    pub fn take_sent(&self) -> Vec<CanFrame> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn inject(&self, frame: CanFrame) {
        if let Some(tx) = self.inbound.lock().as_ref() {
            // a dropped receiver only means nobody listens anymore
            let _ = tx.send(frame);
        }
    }

    fn replies(frame: &CanFrame) -> Vec<CanFrame> {
        let data = frame.data();
        let reply = match frame.id() {
            protocol::REQUEST_ABC => vec![
                CanFrame::new(
                    protocol::GREETING,
                    &[0, 0, 0, 1, protocol::ABC150_HARDWARE_VERSION],
                ),
                CanFrame::new(protocol::STATION_ID, &[0, 0, 0, 0x15, 0x0A]),
                CanFrame::new(
                    protocol::STATION_ID + protocol::CHANNEL_OFFSET,
                    &[0, 0, 0, 0x15, 0x0B],
                ),
            ],
            protocol::CHANGE_CONTROL if !data.is_empty() => {
                let offset = (data[0] & 1) as u16 * protocol::CHANNEL_OFFSET;
                vec![CanFrame::new(protocol::STATUS + offset, &[0, 0, 1, 0b1011, 0])]
            }
            id if data.len() == 4
                && (id == protocol::COMMAND
                    || id == protocol::COMMAND + protocol::CHANNEL_OFFSET) =>
            {
                let mode = data[3] & 0b11;
                let enable_bit = if mode == 3 { 1 << 3 } else { 0 };
                vec![CanFrame::new(
                    protocol::STATUS + (id - protocol::COMMAND),
                    &[data[1], data[2], 1, data[3] | enable_bit, 0b111],
                )]
            }
            _ => Vec::new(),
        };
        reply.into_iter().filter_map(Result::ok).collect()
    }
}

impl Default for LoopbackBus {
    fn default() -> Self {
        Self::new()
    }
}

impl CanBus for LoopbackBus {
    fn send(&self, frame: &CanFrame) -> Result<(), Error> {
        log::trace!("loopback tx {}", frame);
        self.sent.lock().push(*frame);
        if self.echo {
            for reply in Self::replies(frame) {
                self.inject(reply);
            }
        }
        Ok(())
    }
}

pub struct LoopbackReceiver {
    rx: mpsc::Receiver<CanFrame>,
}

impl CanReceiver for LoopbackReceiver {
    fn receive(&mut self, timeout: Duration) -> Result<Option<CanFrame>, Error> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(Error::Bus("loopback bus closed".into()))
            }
        }
    }
}

/// Linux SocketCAN backend.
#[cfg_attr(docsrs, doc(cfg(feature = "socketcan")))]
#[cfg(feature = "socketcan")]
pub mod socket {
    use super::{CanBus, CanReceiver};
    use crate::protocol::CanFrame;
    use crate::Error;
    use socketcan::{CanSocket, EmbeddedFrame, Frame, Socket, StandardId};
    use std::io::ErrorKind;
    use std::time::Duration;

    pub struct SocketCanBus {
        socket: CanSocket,
        interface: String,
    }

    impl SocketCanBus {
        pub fn open(interface: &str) -> Result<Self, Error> {
            let socket = CanSocket::open(interface)
                .map_err(|e| Error::Bus(format!("Cannot open '{interface}': {e}")))?;
            Ok(Self {
                socket,
                interface: interface.to_string(),
            })
        }

        /// Opens an independent socket on the same interface for reading.
        pub fn receiver(&self) -> Result<SocketCanReceiver, Error> {
            let socket = CanSocket::open(&self.interface)
                .map_err(|e| Error::Bus(format!("Cannot open '{}': {e}", self.interface)))?;
            Ok(SocketCanReceiver {
                socket,
                timeout: None,
            })
        }
    }

    impl CanBus for SocketCanBus {
        fn send(&self, frame: &CanFrame) -> Result<(), Error> {
            let out = StandardId::new(frame.id())
                .and_then(|id| socketcan::CanFrame::new(id, frame.data()))
                .ok_or_else(|| {
                    Error::Bus(format!("Failed to create frame with ID 0x{:X}", frame.id()))
                })?;
            self.socket.write_frame(&out)?;
            log::trace!("Sent CAN frame {}", frame);
            Ok(())
        }
    }

    pub struct SocketCanReceiver {
        socket: CanSocket,
        timeout: Option<Duration>,
    }

    impl CanReceiver for SocketCanReceiver {
        fn receive(&mut self, timeout: Duration) -> Result<Option<CanFrame>, Error> {
            if self.timeout != Some(timeout) {
                self.socket.set_read_timeout(timeout)?;
                self.timeout = Some(timeout);
            }
            let frame = match self.socket.read_frame() {
                Ok(frame) => frame,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(None)
                }
                Err(e) => return Err(e.into()),
            };
            match frame {
                socketcan::CanFrame::Data(data) if !data.is_extended() => {
                    Ok(Some(CanFrame::new(data.raw_id() as u16, data.data())?))
                }
                other => {
                    log::debug!("Ignoring frame 0x{:X}", other.raw_id());
                    Ok(None)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_records_frames() {
        let bus = LoopbackBus::new();
        bus.send(&protocol::pc_greeting_request()).unwrap();
        bus.send(&protocol::converter_request()).unwrap();
        assert_eq!(bus.sent().len(), 2);
        assert_eq!(bus.take_sent()[1].id(), protocol::REQUEST_ABC);
        assert!(bus.sent().is_empty());
    }

    #[test]
    fn loopback_echo_answers_discovery() {
        let bus = LoopbackBus::with_converter_echo();
        let mut rx = bus.receiver();
        bus.send(&protocol::converter_request()).unwrap();
        let greeting = rx.receive(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(greeting.id(), protocol::GREETING);
        assert_eq!(greeting.data()[4], protocol::ABC150_HARDWARE_VERSION);
    }

    #[test]
    fn loopback_receive_timeout() {
        let bus = LoopbackBus::new();
        let mut rx = bus.receiver();
        assert!(matches!(rx.receive(Duration::from_millis(1)), Ok(None)));
    }
}
