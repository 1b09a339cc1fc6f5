//! Frame source reading from a Linux SocketCAN interface.
//!
//! The interface has to be configured and up (bitrate included) before it is opened:
//!
//! ```text
//! ip link set can0 type can bitrate 250000
//! ip link set can0 up
//! ```

use crate::ingest::FrameSource;
use crate::protocol::CanFrame;
use crate::Error;
use socketcan::{CanSocket, EmbeddedFrame, Frame, Socket};
use std::io;
use std::time::Duration;

pub struct SocketCanSource {
    socket: CanSocket,
    interface: String,
    timeout: Option<Duration>,
}

impl SocketCanSource {
    pub fn open(interface: &str) -> Result<Self, Error> {
        let socket = CanSocket::open(interface).map_err(|e| {
            Error::Transport(format!("Cannot open CAN interface '{interface}': {e}"))
        })?;
        log::info!("Opened CAN interface {interface}");
        Ok(Self {
            socket,
            interface: interface.to_string(),
            timeout: None,
        })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        if self.timeout != Some(timeout) {
            log::trace!("set read timeout to {timeout:?}");
            self.socket.set_read_timeout(timeout).map_err(|e| {
                Error::Transport(format!("{}: cannot set read timeout: {e}", self.interface))
            })?;
            self.timeout = Some(timeout);
        }
        Ok(())
    }
}

impl std::fmt::Debug for SocketCanSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketCanSource")
            .field("interface", &self.interface)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl FrameSource for SocketCanSource {
    fn recv(&mut self, timeout: Duration) -> Result<CanFrame, Error> {
        self.set_timeout(timeout)?;
        loop {
            let frame = match self.socket.read_frame() {
                Ok(frame) => frame,
                // EINTR is returned when a shutdown signal arrives mid-read
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    return Err(Error::TransportTimeout)
                }
                Err(e) => {
                    return Err(Error::Transport(format!(
                        "{}: cannot read frame: {e}",
                        self.interface
                    )))
                }
            };
            match frame {
                socketcan::CanFrame::Data(data_frame) => {
                    let id = data_frame.raw_id();
                    return CanFrame::new(id, data_frame.data()).ok_or_else(|| {
                        Error::Transport(format!("frame 0x{id:08X} longer than 8 bytes"))
                    });
                }
                socketcan::CanFrame::Remote(remote) => {
                    log::debug!("Skipping remote frame 0x{:08X}", remote.raw_id());
                }
                socketcan::CanFrame::Error(err) => {
                    log::warn!("{}: bus error frame {:?}", self.interface, err);
                }
            }
        }
    }
}
