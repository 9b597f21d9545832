//! In-process link, used when no radio is attached.
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, channel};
use std::time::Duration;

use anyhow::Result;

use super::Transport;

const PIPE_POLL_MS: u64 = 10;

/// One end of a bidirectional in-memory byte link.
pub struct PipeTransport {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

/// Creates a connected pair of pipe ends.
pub fn pipe() -> (PipeTransport, PipeTransport) {
    let (a_tx, b_rx) = channel();
    let (b_tx, a_rx) = channel();
    let end = |tx, rx| PipeTransport {
        tx,
        rx,
        pending: Vec::new(),
    };
    (end(a_tx, a_rx), end(b_tx, b_rx))
}

impl Transport for PipeTransport {
    fn send_raw(&mut self, raw: &[u8]) -> Result<()> {
        self.tx
            .send(raw.to_vec())
            .map_err(|_| anyhow::format_err!("pipe closed"))
    }

    fn recv_raw(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv_timeout(Duration::from_millis(PIPE_POLL_MS)) {
                Ok(chunk) => self.pending = chunk,
                Err(RecvTimeoutError::Timeout) => return Ok(0),
                Err(RecvTimeoutError::Disconnected) => anyhow::bail!("pipe closed"),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}
