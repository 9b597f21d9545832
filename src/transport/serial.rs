//! Serial Transportation.
use std::{
    fmt::Display,
    io::{self, Read, Write},
    time::Duration,
};

use anyhow::Result;
use clap::{ValueEnum, builder::PossibleValue};
use serde::{Deserialize, Serialize};
use serialport::SerialPort;

use super::Transport;

const SERIAL_POLL_MS: u64 = 10;

#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(try_from = "u32", into = "u32")]
pub enum Baudrate {
    Baud57600,
    #[default]
    Baud115200,
    Baud460800,
}

impl From<Baudrate> for u32 {
    fn from(value: Baudrate) -> Self {
        match value {
            Baudrate::Baud57600 => 57600,
            Baudrate::Baud115200 => 115200,
            Baudrate::Baud460800 => 460800,
        }
    }
}

impl TryFrom<u32> for Baudrate {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            57600 => Ok(Baudrate::Baud57600),
            115200 => Ok(Baudrate::Baud115200),
            460800 => Ok(Baudrate::Baud460800),
            other => Err(format!("unsupported baudrate {other}")),
        }
    }
}

impl Display for Baudrate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u32::from(*self))
    }
}

impl ValueEnum for Baudrate {
    fn value_variants<'a>() -> &'a [Self] {
        &[Baudrate::Baud57600, Baudrate::Baud115200, Baudrate::Baud460800]
    }

    fn to_possible_value(&self) -> Option<PossibleValue> {
        match self {
            Baudrate::Baud57600 => Some(PossibleValue::new("Baud57600").aliases(["57600"])),
            Baudrate::Baud115200 => Some(PossibleValue::new("Baud115200").aliases(["115200"])),
            Baudrate::Baud460800 => Some(PossibleValue::new("Baud460800").aliases(["460800"])),
        }
    }
}

/// The telemetry radio, attached as a serial port.
pub struct SerialTransport {
    serial_port: Box<dyn SerialPort>,
}

impl SerialTransport {
    pub fn open(port: &str, baudrate: Baudrate) -> Result<Self> {
        log::info!("Opening serial port: \"{}\" @ {} baud", port, baudrate);
        let port = serialport::new(port, baudrate.into())
            .timeout(Duration::from_millis(SERIAL_POLL_MS))
            .open()?;
        Ok(SerialTransport { serial_port: port })
    }
}

impl Transport for SerialTransport {
    fn send_raw(&mut self, raw: &[u8]) -> Result<()> {
        self.serial_port.write_all(raw)?;
        self.serial_port.flush()?;
        Ok(())
    }

    fn recv_raw(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.serial_port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baudrate_aliases() {
        assert_eq!(Baudrate::from_str("115200", false), Ok(Baudrate::Baud115200));
        assert_eq!(Baudrate::from_str("Baud57600", false), Ok(Baudrate::Baud57600));
        assert_eq!(u32::from(Baudrate::Baud460800), 460800);
        assert_eq!(Baudrate::default().to_string(), "115200");
        assert_eq!(Baudrate::try_from(460800), Ok(Baudrate::Baud460800));
        assert!(Baudrate::try_from(9600).is_err());
    }
}
