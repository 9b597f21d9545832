//! Durable storage backends driven by the I/O worker.
use std::fmt;
use std::path::Path;

use anyhow::Result;

pub use self::flash::{FlashDevice, ImageFlash, NorFlash, RamFlash};
pub use self::sd::SdCard;

mod flash;
mod sd;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Sd,
    Flash,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Sd => write!(f, "SD"),
            BackendKind::Flash => write!(f, "flash"),
        }
    }
}

/// A storage target the worker runs operations against.
///
/// `target` is the file a channel is bound to; it is `None` for backends
/// addressed by offset only. Implementations mark themselves not ready when
/// they detect a device fault, and the worker calls `init` again before the
/// next operation.
pub trait Backend: Send {
    fn kind(&self) -> BackendKind;
    fn is_ready(&self) -> bool;
    fn init(&mut self) -> Result<()>;

    /// First initialization when the worker starts.
    fn bring_up(&mut self) -> Result<()> {
        self.init()
    }

    /// Persists `data`, returns the number of bytes written.
    fn save(&mut self, target: Option<&Path>, data: &[u8]) -> Result<usize>;
    /// Reads up to `buf.len()` bytes starting at `offset`.
    fn load(&mut self, target: Option<&Path>, offset: usize, buf: &mut [u8]) -> Result<usize>;
    fn reset(&mut self, target: Option<&Path>) -> Result<()>;
}
