//! Abstract telemetry link.
use anyhow::Result;

use crate::protocol::{Frame, Message};

pub use self::pipe::{PipeTransport, pipe};
pub use self::serial::{Baudrate, SerialTransport};

mod pipe;
mod serial;

/// Abstraction of the byte link to the ground station.
/// Might be a radio UART, or an in-process pipe.
pub trait Transport: Send {
    fn send_raw(&mut self, raw: &[u8]) -> Result<()>;
    /// Reads whatever arrived within the link's poll interval. 0 means nothing did.
    fn recv_raw(&mut self, buf: &mut [u8]) -> Result<usize>;

    fn send_frame(&mut self, frame: &Frame) -> Result<()> {
        log::debug!("=> {}", hex::encode(frame.as_slice()));
        self.send_raw(frame.as_slice())
    }

    fn send_message(&mut self, message: &Message) -> Result<()> {
        let frame = message.to_frame()?;
        self.send_frame(&frame)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send_raw(&mut self, raw: &[u8]) -> Result<()> {
        (**self).send_raw(raw)
    }

    fn recv_raw(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).recv_raw(buf)
    }
}
