//! The peripheral I/O worker.
//!
//! One thread owns both storage backends and runs queued operations one at a
//! time, in submission order. Producers talk to it through cloned
//! [`IoHandle`]s; each submitted operation hands back a [`Ticket`] that
//! resolves with the number of bytes transferred or the reason it failed.
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Result;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use parking_lot::Mutex;
use snafu::Snafu;

use crate::channel::{Channel, ChannelSpec, Direction, WorkerChannel, max_transfer};
use crate::constants::{MAX_IO_OPERATIONS_QUEUED, notification_bits};
use crate::storage::{Backend, BackendKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum OperationKind {
    Load = 0,
    Save = 1,
    Reset = 2,
}

/// A queued request. `offset` and `n_bytes` only matter for loads.
///
/// `generation` names the registration of `channel` the request was made
/// against; `None` when the id was not registered at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operation {
    pub kind: OperationKind,
    pub channel: u8,
    pub generation: Option<u64>,
    pub offset: usize,
    pub n_bytes: usize,
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum IoError {
    #[snafu(display("Operation queue is full"))]
    QueueFull,
    #[snafu(display("{kind:?} is not allowed on a {direction:?} channel"))]
    DirectionMismatch {
        kind: OperationKind,
        direction: Direction,
    },
    #[snafu(display("Channel {id} is not registered"))]
    UnknownChannel { id: u8 },
    #[snafu(display("Channel {id} already exists"))]
    DuplicateChannel { id: u8 },
    #[snafu(display("Invalid channel: {reason}"))]
    InvalidChannel { reason: String },
    #[snafu(display("Transfer of {len} bytes exceeds the {max} byte limit"))]
    TransferTooLarge { len: usize, max: usize },
    #[snafu(display("{backend} backend unavailable"))]
    BackendUnavailable { backend: BackendKind },
    #[snafu(display("Stream needs {needed} bytes but has {free} free"))]
    StreamOverflow { needed: usize, free: usize },
    #[snafu(display("{backend} operation failed: {message}"))]
    Backend {
        backend: BackendKind,
        message: String,
    },
    #[snafu(display("I/O worker has stopped"))]
    WorkerGone,
    #[snafu(display("Timed out waiting for completion"))]
    Timeout,
}

/// Completion signal sent to a channel's owner after a successful operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Notification {
    FlashWriteComplete,
    FlashReadComplete,
    FlashResetComplete,
    SdWriteComplete,
    SdReadComplete,
    SdResetComplete,
}

impl Notification {
    pub fn for_operation(kind: OperationKind, backend: BackendKind) -> Self {
        use Notification::*;
        match (backend, kind) {
            (BackendKind::Flash, OperationKind::Save) => FlashWriteComplete,
            (BackendKind::Flash, OperationKind::Load) => FlashReadComplete,
            (BackendKind::Flash, OperationKind::Reset) => FlashResetComplete,
            (BackendKind::Sd, OperationKind::Save) => SdWriteComplete,
            (BackendKind::Sd, OperationKind::Load) => SdReadComplete,
            (BackendKind::Sd, OperationKind::Reset) => SdResetComplete,
        }
    }

    /// The task notification bit used on the flight computer.
    pub fn bit(self) -> u32 {
        match self {
            Notification::FlashWriteComplete => notification_bits::FLASH_WRITE_COMPLETE,
            Notification::FlashReadComplete => notification_bits::FLASH_READ_COMPLETE,
            Notification::FlashResetComplete => notification_bits::FLASH_RESET_COMPLETE,
            Notification::SdWriteComplete => notification_bits::SD_WRITE_COMPLETE,
            Notification::SdReadComplete => notification_bits::SD_READ_COMPLETE,
            Notification::SdResetComplete => notification_bits::SD_RESET_COMPLETE,
        }
    }
}

pub type Completion = Result<usize, IoError>;

/// Resolves once the worker has finished an operation.
#[must_use = "an operation's outcome is only known through its ticket"]
#[derive(Debug)]
pub struct Ticket {
    rx: Receiver<Completion>,
}

impl Ticket {
    pub fn wait(self) -> Completion {
        self.rx.recv().unwrap_or(Err(IoError::WorkerGone))
    }

    /// Gives up after `timeout`. The operation still runs to completion.
    pub fn wait_timeout(self, timeout: Duration) -> Completion {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(IoError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(IoError::WorkerGone),
        }
    }
}

struct Request {
    op: Operation,
    done: mpsc::Sender<Completion>,
}

#[derive(Default)]
struct Registry {
    channels: BTreeMap<u8, Arc<WorkerChannel>>,
    next_generation: u64,
}

type ChannelTable = Arc<Mutex<Registry>>;

/// Submits operations and registers channels. Cheap to clone.
#[derive(Clone)]
pub struct IoHandle {
    tx: SyncSender<Request>,
    channels: ChannelTable,
}

impl IoHandle {
    pub fn create_channel(&self, spec: ChannelSpec) -> Result<Channel, IoError> {
        spec.validate()?;
        let id = spec.id;
        let mut registry = self.channels.lock();
        if registry.channels.contains_key(&id) {
            return Err(IoError::DuplicateChannel { id });
        }
        let generation = registry.next_generation;
        registry.next_generation += 1;
        let (channel, worker) = spec.open(self.clone(), generation);
        registry.channels.insert(id, Arc::new(worker));
        log::debug!("Channel {} registered (generation {})", id, generation);
        Ok(channel)
    }

    /// Queues an operation on whatever is registered as `channel` right now,
    /// without blocking.
    pub fn submit(
        &self,
        kind: OperationKind,
        channel: u8,
        offset: usize,
        n_bytes: usize,
    ) -> Result<Ticket, IoError> {
        let generation = self
            .channels
            .lock()
            .channels
            .get(&channel)
            .map(|c| c.generation);
        self.submit_to(kind, channel, generation, offset, n_bytes)
    }

    pub(crate) fn submit_to(
        &self,
        kind: OperationKind,
        channel: u8,
        generation: Option<u64>,
        offset: usize,
        n_bytes: usize,
    ) -> Result<Ticket, IoError> {
        let (done, rx) = mpsc::channel();
        let op = Operation {
            kind,
            channel,
            generation,
            offset,
            n_bytes,
        };
        match self.tx.try_send(Request { op, done }) {
            Ok(()) => Ok(Ticket { rx }),
            Err(TrySendError::Full(_)) => Err(IoError::QueueFull),
            Err(TrySendError::Disconnected(_)) => Err(IoError::WorkerGone),
        }
    }

    pub(crate) fn unregister(&self, id: u8, generation: u64) {
        let mut registry = self.channels.lock();
        if registry
            .channels
            .get(&id)
            .is_some_and(|c| c.generation == generation)
        {
            registry.channels.remove(&id);
        }
    }
}

/// Builder for the worker and its backends.
pub struct PeriphIo {
    sd: Box<dyn Backend>,
    flash: Box<dyn Backend>,
    queue_depth: usize,
}

impl PeriphIo {
    pub fn new(sd: impl Backend + 'static, flash: impl Backend + 'static) -> Self {
        PeriphIo {
            sd: Box::new(sd),
            flash: Box::new(flash),
            queue_depth: MAX_IO_OPERATIONS_QUEUED,
        }
    }

    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    /// Creates the queue without starting the worker.
    pub fn split(self) -> (IoHandle, IoWorker) {
        let (tx, rx) = mpsc::sync_channel(self.queue_depth);
        let channels = ChannelTable::default();
        let handle = IoHandle {
            tx,
            channels: channels.clone(),
        };
        let worker = IoWorker {
            rx,
            channels,
            sd: self.sd,
            flash: self.flash,
            scratch: Vec::with_capacity(max_transfer(BackendKind::Sd)),
        };
        (handle, worker)
    }

    /// Starts the worker thread. It exits once every handle and channel is dropped.
    pub fn spawn(self) -> Result<(IoHandle, JoinHandle<()>)> {
        let (handle, worker) = self.split();
        let thread = std::thread::Builder::new()
            .name("periph-io".into())
            .spawn(move || worker.run())?;
        Ok((handle, thread))
    }
}

pub struct IoWorker {
    rx: Receiver<Request>,
    channels: ChannelTable,
    sd: Box<dyn Backend>,
    flash: Box<dyn Backend>,
    scratch: Vec<u8>,
}

impl IoWorker {
    /// Mounts the card and brings up the flash. Failures are logged and
    /// retried before the next operation.
    pub fn bring_up(&mut self) {
        for backend in [&mut self.sd, &mut self.flash] {
            match backend.bring_up() {
                Ok(()) => log::info!("{} backend ready", backend.kind()),
                Err(e) => log::warn!("{} backend not ready: {:#}", backend.kind(), e),
            }
        }
    }

    pub fn run(mut self) {
        self.bring_up();
        while let Ok(request) = self.rx.recv() {
            self.process(request);
        }
        log::debug!("I/O worker stopped");
    }

    fn retry_init(&mut self) {
        for backend in [&mut self.sd, &mut self.flash] {
            if !backend.is_ready() {
                if let Err(e) = backend.init() {
                    log::debug!("{} init retry failed: {:#}", backend.kind(), e);
                }
            }
        }
    }

    fn process(&mut self, request: Request) {
        let Request { op, done } = request;
        self.retry_init();
        let result = self.execute(&op);
        match &result {
            Ok(n) => log::debug!("{:?} on channel {}: {} bytes", op.kind, op.channel, n),
            Err(e) => log::warn!("{:?} on channel {} failed: {}", op.kind, op.channel, e),
        }
        // The caller may have stopped waiting
        let _ = done.send(result);
    }

    /// Looks up the registration `op` was submitted against. The table lock
    /// is released before any backend I/O.
    fn lookup(&self, op: &Operation) -> Result<Arc<WorkerChannel>, IoError> {
        self.channels
            .lock()
            .channels
            .get(&op.channel)
            .filter(|c| Some(c.generation) == op.generation)
            .cloned()
            .ok_or(IoError::UnknownChannel { id: op.channel })
    }

    fn execute(&mut self, op: &Operation) -> Completion {
        let channel = self.lookup(op)?;
        if !channel.direction.allows(op.kind) {
            return Err(IoError::DirectionMismatch {
                kind: op.kind,
                direction: channel.direction,
            });
        }

        let kind = channel.backend;
        let backend = match kind {
            BackendKind::Sd => self.sd.as_mut(),
            BackendKind::Flash => self.flash.as_mut(),
        };
        if !backend.is_ready() {
            // Staged bytes are still consumed, as a failed save would
            if op.kind == OperationKind::Save {
                self.scratch.clear();
                channel.drain(&mut self.scratch);
            }
            return Err(IoError::BackendUnavailable { backend: kind });
        }

        let backend_error = |e: anyhow::Error| IoError::Backend {
            backend: kind,
            message: format!("{:#}", e),
        };
        let path = channel.path.as_deref();
        let n = match op.kind {
            OperationKind::Save => {
                self.scratch.clear();
                channel.drain(&mut self.scratch);
                backend.save(path, &self.scratch).map_err(backend_error)?
            }
            OperationKind::Load => {
                let max = max_transfer(kind);
                if op.n_bytes > max {
                    return Err(IoError::TransferTooLarge {
                        len: op.n_bytes,
                        max,
                    });
                }
                self.scratch.clear();
                self.scratch.resize(op.n_bytes, 0);
                let n = backend
                    .load(path, op.offset, &mut self.scratch)
                    .map_err(backend_error)?;
                channel.fill(&self.scratch[..n])?;
                n
            }
            OperationKind::Reset => {
                backend.reset(path).map_err(backend_error)?;
                0
            }
        };

        if let Some(sink) = &channel.notify {
            let _ = sink.send(Notification::for_operation(op.kind, kind));
        }
        Ok(n)
    }
}
