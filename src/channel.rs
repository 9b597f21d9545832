//! Direction-fixed byte streams between application code and the I/O worker.
//!
//! Both ends of a channel share one bounded ring. A write channel is filled
//! by the application and drained by the worker on Save, a read channel the
//! other way around on Load.
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::Sender;

use heapless::Deque;
use parking_lot::Mutex;

use crate::constants::{FLASH_MAX_READ_WRITE_SIZE, SD_MAX_READ_WRITE_SIZE};
use crate::storage::BackendKind;
use crate::worker::{IoError, IoHandle, Notification, OperationKind, Ticket};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    /// Whether an operation of `kind` makes sense on this direction.
    pub fn allows(self, kind: OperationKind) -> bool {
        !matches!(
            (kind, self),
            (OperationKind::Save, Direction::Read) | (OperationKind::Load, Direction::Write)
        )
    }
}

/// Largest single transfer a backend accepts.
pub fn max_transfer(backend: BackendKind) -> usize {
    match backend {
        BackendKind::Sd => SD_MAX_READ_WRITE_SIZE,
        BackendKind::Flash => FLASH_MAX_READ_WRITE_SIZE,
    }
}

/// Ring storage shared by the two ends of a channel. It is freed with the
/// last end.
#[derive(Clone, Default)]
pub(crate) struct Stream(Arc<Mutex<Deque<u8, SD_MAX_READ_WRITE_SIZE>>>);

impl Stream {
    fn len(&self) -> usize {
        self.0.lock().len()
    }

    /// Appends all of `data`, or nothing if the ring would exceed `capacity`.
    fn push(&self, data: &[u8], capacity: usize) -> bool {
        let mut ring = self.0.lock();
        if ring.len() + data.len() > capacity {
            return false;
        }
        for &byte in data {
            // Capacity never exceeds the ring size
            let _ = ring.push_back(byte);
        }
        true
    }

    fn pop_into(&self, out: &mut [u8]) -> usize {
        let mut ring = self.0.lock();
        let mut n = 0;
        while n < out.len() {
            match ring.pop_front() {
                Some(byte) => {
                    out[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    fn drain_into(&self, out: &mut Vec<u8>) {
        let mut ring = self.0.lock();
        out.extend(ring.iter().copied());
        ring.clear();
    }
}

/// Parameters of a channel to create.
#[derive(Debug, Clone)]
pub struct ChannelSpec {
    pub id: u8,
    pub backend: BackendKind,
    pub direction: Direction,
    pub capacity: usize,
    pub path: Option<PathBuf>,
    pub notify: Option<Sender<Notification>>,
}

impl ChannelSpec {
    /// A flash channel with the largest stream flash allows.
    pub fn flash(id: u8, direction: Direction) -> Self {
        ChannelSpec {
            id,
            backend: BackendKind::Flash,
            direction,
            capacity: FLASH_MAX_READ_WRITE_SIZE,
            path: None,
            notify: None,
        }
    }

    /// An SD channel bound to `path`, relative to the card root.
    pub fn sd<P: AsRef<Path>>(id: u8, path: P, direction: Direction) -> Self {
        ChannelSpec {
            id,
            backend: BackendKind::Sd,
            direction,
            capacity: SD_MAX_READ_WRITE_SIZE,
            path: Some(path.as_ref().to_path_buf()),
            notify: None,
        }
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn notify(mut self, sink: Sender<Notification>) -> Self {
        self.notify = Some(sink);
        self
    }

    pub(crate) fn validate(&self) -> Result<(), IoError> {
        let max = max_transfer(self.backend);
        if self.capacity == 0 || self.capacity > max {
            return Err(IoError::InvalidChannel {
                reason: format!(
                    "stream capacity {} outside 1..={} for {}",
                    self.capacity, max, self.backend
                ),
            });
        }
        match (self.backend, &self.path) {
            (BackendKind::Sd, None) => Err(IoError::InvalidChannel {
                reason: "SD channel needs a file path".into(),
            }),
            (BackendKind::Flash, Some(path)) => Err(IoError::InvalidChannel {
                reason: format!("flash channel cannot be bound to {}", path.display()),
            }),
            _ => Ok(()),
        }
    }

    /// Splits into the application end and the worker's registration.
    /// `generation` tells this registration apart from earlier ones with the
    /// same id.
    pub(crate) fn open(self, io: IoHandle, generation: u64) -> (Channel, WorkerChannel) {
        let stream = Stream::default();
        let channel = Channel {
            id: self.id,
            generation,
            backend: self.backend,
            direction: self.direction,
            capacity: self.capacity,
            stream: stream.clone(),
            io,
        };
        let worker = WorkerChannel {
            generation,
            backend: self.backend,
            direction: self.direction,
            capacity: self.capacity,
            path: self.path,
            notify: self.notify,
            stream,
        };
        (channel, worker)
    }
}

/// The worker's view of a registered channel.
pub(crate) struct WorkerChannel {
    pub generation: u64,
    pub backend: BackendKind,
    pub direction: Direction,
    pub capacity: usize,
    pub path: Option<PathBuf>,
    pub notify: Option<Sender<Notification>>,
    stream: Stream,
}

impl WorkerChannel {
    /// Takes every staged byte out of a write stream.
    pub fn drain(&self, out: &mut Vec<u8>) {
        if self.direction == Direction::Write {
            self.stream.drain_into(out);
        }
    }

    pub fn free_space(&self) -> usize {
        match self.direction {
            Direction::Read => self.capacity.saturating_sub(self.stream.len()),
            Direction::Write => 0,
        }
    }

    /// Pushes loaded bytes into a read stream, all or nothing.
    pub fn fill(&self, data: &[u8]) -> Result<(), IoError> {
        if self.direction != Direction::Read {
            return Err(IoError::DirectionMismatch {
                kind: OperationKind::Load,
                direction: self.direction,
            });
        }
        if !self.stream.push(data, self.capacity) {
            return Err(IoError::StreamOverflow {
                needed: data.len(),
                free: self.free_space(),
            });
        }
        Ok(())
    }
}

/// The application end of a channel.
///
/// Dropping it unregisters the channel from the worker, so the id can be
/// reused. Operations still queued for it then fail with
/// [`IoError::UnknownChannel`].
pub struct Channel {
    id: u8,
    generation: u64,
    backend: BackendKind,
    direction: Direction,
    capacity: usize,
    stream: Stream,
    io: IoHandle,
}

impl Channel {
    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn free_space(&self) -> usize {
        self.capacity.saturating_sub(self.stream.len())
    }

    /// Bytes staged for a save, or loaded and not yet drained.
    pub fn available_bytes(&self) -> usize {
        self.stream.len()
    }

    /// Copies `data` into the stream for the next Save. Nothing is copied if
    /// it does not fit in one transfer.
    pub fn stage_write(&mut self, data: &[u8]) -> bool {
        if self.direction != Direction::Write {
            log::warn!("Channel {} is not writable", self.id);
            return false;
        }
        if data.len() > max_transfer(self.backend) || !self.stream.push(data, self.capacity) {
            log::debug!(
                "Channel {}: cannot stage {} bytes ({} free)",
                self.id,
                data.len(),
                self.free_space()
            );
            return false;
        }
        true
    }

    /// Moves up to `out.len()` loaded bytes into `out`.
    pub fn drain_read(&mut self, out: &mut [u8]) -> usize {
        if self.direction != Direction::Read {
            return 0;
        }
        self.stream.pop_into(out)
    }

    pub fn enqueue(
        &self,
        kind: OperationKind,
        offset: usize,
        n_bytes: usize,
    ) -> Result<Ticket, IoError> {
        if !self.direction.allows(kind) {
            return Err(IoError::DirectionMismatch {
                kind,
                direction: self.direction,
            });
        }
        self.io
            .submit_to(kind, self.id, Some(self.generation), offset, n_bytes)
    }

    /// Queues a Save of everything staged so far.
    pub fn save(&self) -> Result<Ticket, IoError> {
        self.enqueue(OperationKind::Save, 0, 0)
    }

    /// Queues a Load of `n_bytes` starting at `offset`.
    pub fn load(&self, offset: usize, n_bytes: usize) -> Result<Ticket, IoError> {
        self.enqueue(OperationKind::Load, offset, n_bytes)
    }

    pub fn reset(&self) -> Result<Ticket, IoError> {
        self.enqueue(OperationKind::Reset, 0, 0)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.io.unregister(self.id, self.generation);
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("backend", &self.backend)
            .field("direction", &self.direction)
            .field("available", &self.available_bytes())
            .finish()
    }
}
