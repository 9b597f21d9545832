use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use anyhow::Result;
use jetvane::channel::{ChannelSpec, Direction};
use jetvane::storage::{BackendKind, FlashDevice, NorFlash, RamFlash, SdCard};
use jetvane::worker::{IoError, IoHandle, Notification, OperationKind, PeriphIo};

fn temp_root(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("jetvane-io-{}-{}", name, std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn periph(root: &PathBuf) -> PeriphIo {
    PeriphIo::new(SdCard::new(root), NorFlash::new(RamFlash::new(4, 1024)))
}

fn spawn(root: &PathBuf) -> IoHandle {
    let (io, _worker) = periph(root).spawn().unwrap();
    io
}

#[test]
fn test_flash_save_load_reset_notifies() {
    let root = temp_root("flash");
    let io = spawn(&root);
    let (tx, notifications) = mpsc::channel();

    let mut write = io
        .create_channel(ChannelSpec::flash(0, Direction::Write).notify(tx.clone()))
        .unwrap();
    let mut read = io
        .create_channel(ChannelSpec::flash(1, Direction::Read).notify(tx))
        .unwrap();

    assert!(write.stage_write(&[1, 2, 3]));
    assert_eq!(write.save().unwrap().wait(), Ok(3));
    assert!(write.stage_write(&[4, 5]));
    assert_eq!(write.save().unwrap().wait(), Ok(2));
    assert_eq!(write.available_bytes(), 0);

    // Appended at the write pointer
    assert_eq!(read.load(2, 3).unwrap().wait(), Ok(3));
    assert_eq!(read.available_bytes(), 3);
    let mut out = [0u8; 8];
    assert_eq!(read.drain_read(&mut out), 3);
    assert_eq!(&out[..3], &[3, 4, 5]);

    assert_eq!(write.reset().unwrap().wait(), Ok(0));
    assert_eq!(read.load(0, 2).unwrap().wait(), Ok(2));
    assert_eq!(read.drain_read(&mut out), 2);
    assert_eq!(&out[..2], &[0xff, 0xff]);

    let seen: Vec<u32> = notifications.try_iter().map(Notification::bit).collect();
    assert_eq!(seen, [0x08, 0x08, 0x10, 0x40, 0x10]);
}

#[test]
fn test_sd_append_and_read_back() {
    let root = temp_root("sd");
    let io = spawn(&root);
    let (tx, notifications) = mpsc::channel();

    let mut write = io
        .create_channel(ChannelSpec::sd(2, "log.txt", Direction::Write).notify(tx.clone()))
        .unwrap();
    let mut read = io
        .create_channel(ChannelSpec::sd(3, "log.txt", Direction::Read).notify(tx))
        .unwrap();

    assert!(write.stage_write(b"jet "));
    write.save().unwrap().wait().unwrap();
    assert!(write.stage_write(b"vane"));
    write.save().unwrap().wait().unwrap();
    assert_eq!(fs::read(root.join("log.txt")).unwrap(), b"jet vane");

    // Short read at end of file
    assert_eq!(read.load(4, 100).unwrap().wait(), Ok(4));
    let mut out = [0u8; 8];
    assert_eq!(read.drain_read(&mut out), 4);
    assert_eq!(&out[..4], b"vane");

    assert_eq!(write.reset().unwrap().wait(), Ok(0));
    assert!(!root.join("log.txt").exists());

    // Failures send no notification
    assert!(matches!(
        read.load(0, 4).unwrap().wait(),
        Err(IoError::Backend {
            backend: BackendKind::Sd,
            ..
        })
    ));
    let seen: Vec<Notification> = notifications.try_iter().collect();
    assert_eq!(
        seen,
        [
            Notification::SdWriteComplete,
            Notification::SdWriteComplete,
            Notification::SdReadComplete,
            Notification::SdResetComplete,
        ]
    );

    fs::remove_dir_all(root).unwrap();
}

#[test]
fn test_stream_capacity_is_all_or_nothing() {
    let root = temp_root("capacity");
    let io = spawn(&root);

    let mut write = io
        .create_channel(ChannelSpec::flash(0, Direction::Write).capacity(8))
        .unwrap();
    assert!(write.stage_write(&[0; 5]));
    assert!(!write.stage_write(&[0; 4]));
    assert_eq!(write.available_bytes(), 5);
    assert_eq!(write.free_space(), 3);

    let mut sd = io
        .create_channel(ChannelSpec::sd(2, "big.bin", Direction::Write))
        .unwrap();
    assert!(!sd.stage_write(&[0; 513]));
    assert!(sd.stage_write(&[0; 512]));
    assert_eq!(sd.free_space(), 0);

    let read = io
        .create_channel(ChannelSpec::flash(1, Direction::Read).capacity(16))
        .unwrap();
    assert_eq!(
        read.load(0, 32).unwrap().wait(),
        Err(IoError::StreamOverflow { needed: 32, free: 16 })
    );
    assert_eq!(read.available_bytes(), 0);
}

#[test]
fn test_transfer_limits() {
    let root = temp_root("limits");
    let io = spawn(&root);

    let read = io
        .create_channel(ChannelSpec::flash(1, Direction::Read))
        .unwrap();
    assert_eq!(
        read.load(0, 300).unwrap().wait(),
        Err(IoError::TransferTooLarge { len: 300, max: 256 })
    );
    // Past the end of the chip
    assert!(matches!(
        read.load(4096 - 8, 16).unwrap().wait(),
        Err(IoError::Backend { .. })
    ));
}

#[test]
fn test_channel_registration_rules() {
    let root = temp_root("register");
    let io = spawn(&root);

    for spec in [
        ChannelSpec::flash(0, Direction::Write).capacity(0),
        ChannelSpec::flash(0, Direction::Write).capacity(257),
        ChannelSpec::sd(2, "x", Direction::Write).capacity(513),
        ChannelSpec {
            path: None,
            ..ChannelSpec::sd(2, "x", Direction::Write)
        },
        ChannelSpec {
            path: Some("x".into()),
            ..ChannelSpec::flash(0, Direction::Write)
        },
    ] {
        assert!(matches!(
            io.create_channel(spec),
            Err(IoError::InvalidChannel { .. })
        ));
    }

    let first = io
        .create_channel(ChannelSpec::flash(0, Direction::Write))
        .unwrap();
    assert_eq!(
        io.create_channel(ChannelSpec::flash(0, Direction::Read))
            .unwrap_err(),
        IoError::DuplicateChannel { id: 0 }
    );
    drop(first);
    let again = io
        .create_channel(ChannelSpec::flash(0, Direction::Read))
        .unwrap();
    assert_eq!(again.direction(), Direction::Read);
}

#[test]
fn test_direction_is_enforced() {
    let root = temp_root("direction");
    let io = spawn(&root);

    let write = io
        .create_channel(ChannelSpec::flash(0, Direction::Write))
        .unwrap();
    let mut read = io
        .create_channel(ChannelSpec::flash(1, Direction::Read))
        .unwrap();

    assert_eq!(
        write.load(0, 1).unwrap_err(),
        IoError::DirectionMismatch {
            kind: OperationKind::Load,
            direction: Direction::Write,
        }
    );
    assert!(matches!(
        read.save(),
        Err(IoError::DirectionMismatch { .. })
    ));
    assert!(!read.stage_write(&[1]));
    assert_eq!(read.reset().unwrap().wait(), Ok(0));

    // Raw submissions are checked by the worker too
    assert!(matches!(
        io.submit(OperationKind::Save, 1, 0, 0).unwrap().wait(),
        Err(IoError::DirectionMismatch { .. })
    ));
    assert_eq!(
        io.submit(OperationKind::Reset, 9, 0, 0).unwrap().wait(),
        Err(IoError::UnknownChannel { id: 9 })
    );
}

#[test]
fn test_queue_full_fails_fast() {
    let root = temp_root("queue");
    let (io, worker) = periph(&root).split();

    let tickets: Vec<_> = (0..4)
        .map(|_| io.submit(OperationKind::Reset, 7, 0, 0).unwrap())
        .collect();
    assert_eq!(
        io.submit(OperationKind::Reset, 7, 0, 0).unwrap_err(),
        IoError::QueueFull
    );

    let thread = std::thread::spawn(move || worker.run());
    for ticket in tickets {
        assert_eq!(ticket.wait(), Err(IoError::UnknownChannel { id: 7 }));
    }
    drop(io);
    thread.join().unwrap();
}

#[test]
fn test_stopped_worker() {
    let root = temp_root("stopped");
    let (io, worker) = periph(&root).split();
    drop(worker);
    assert_eq!(
        io.submit(OperationKind::Reset, 0, 0, 0).unwrap_err(),
        IoError::WorkerGone
    );
}

#[test]
fn test_unmounted_card_is_retried() {
    let root = std::env::temp_dir().join(format!("jetvane-io-late-{}", std::process::id()));
    let _ = fs::remove_dir_all(&root);
    let io = spawn(&root);

    let mut write = io
        .create_channel(ChannelSpec::sd(2, "late.txt", Direction::Write))
        .unwrap();
    assert!(write.stage_write(b"lost"));
    assert_eq!(
        write.save().unwrap().wait(),
        Err(IoError::BackendUnavailable {
            backend: BackendKind::Sd
        })
    );
    // Staged bytes are consumed by the failed save
    assert_eq!(write.available_bytes(), 0);

    fs::create_dir_all(&root).unwrap();
    assert!(write.stage_write(b"kept"));
    assert_eq!(write.save().unwrap().wait(), Ok(4));
    assert_eq!(fs::read(root.join("late.txt")).unwrap(), b"kept");

    fs::remove_dir_all(root).unwrap();
}

#[test]
fn test_stale_operation_does_not_reach_new_channel() {
    let root = temp_root("stale-op");
    fs::write(root.join("post.txt"), b"self test").unwrap();
    fs::write(root.join("data.csv"), b"1,2,3\n").unwrap();
    let (io, worker) = periph(&root).split();

    let old = io
        .create_channel(ChannelSpec::sd(2, "post.txt", Direction::Write))
        .unwrap();
    let stale = old.reset().unwrap();
    drop(old);
    let csv = io
        .create_channel(ChannelSpec::sd(2, "data.csv", Direction::Write))
        .unwrap();

    let thread = std::thread::spawn(move || worker.run());
    assert_eq!(stale.wait(), Err(IoError::UnknownChannel { id: 2 }));
    assert!(root.join("post.txt").exists());
    assert!(root.join("data.csv").exists());

    assert_eq!(csv.reset().unwrap().wait(), Ok(0));
    assert!(!root.join("data.csv").exists());

    drop(csv);
    drop(io);
    thread.join().unwrap();
}

/// RAM flash that fails one page program on request and counts inits.
struct FaultyFlash {
    ram: RamFlash,
    fail_program: Arc<AtomicBool>,
    inits: Arc<AtomicUsize>,
}

impl FlashDevice for FaultyFlash {
    fn init(&mut self) -> Result<()> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.ram.capacity()
    }

    fn sector_size(&self) -> usize {
        self.ram.sector_size()
    }

    fn read(&mut self, address: usize, buf: &mut [u8]) -> Result<()> {
        self.ram.read(address, buf)
    }

    fn program_page(&mut self, address: usize, data: &[u8]) -> Result<()> {
        if self.fail_program.swap(false, Ordering::SeqCst) {
            anyhow::bail!("spi glitch");
        }
        self.ram.program_page(address, data)
    }

    fn erase_sector(&mut self, sector: usize) -> Result<()> {
        self.ram.erase_sector(sector)
    }
}

#[test]
fn test_flash_fault_is_retried_without_losing_records() {
    let root = temp_root("flash-fault");
    let fail_program = Arc::new(AtomicBool::new(false));
    let inits = Arc::new(AtomicUsize::new(0));
    let flash = NorFlash::new(FaultyFlash {
        ram: RamFlash::new(4, 1024),
        fail_program: fail_program.clone(),
        inits: inits.clone(),
    });
    let (io, _worker) = PeriphIo::new(SdCard::new(&root), flash).spawn().unwrap();

    let mut write = io
        .create_channel(ChannelSpec::flash(0, Direction::Write))
        .unwrap();
    let mut read = io
        .create_channel(ChannelSpec::flash(1, Direction::Read))
        .unwrap();

    assert!(write.stage_write(&[0x11; 256]));
    assert_eq!(write.save().unwrap().wait(), Ok(256));

    fail_program.store(true, Ordering::SeqCst);
    assert!(write.stage_write(&[0x22; 256]));
    assert!(matches!(
        write.save().unwrap().wait(),
        Err(IoError::Backend {
            backend: BackendKind::Flash,
            ..
        })
    ));
    assert_eq!(inits.load(Ordering::SeqCst), 1);

    // The next operation reinitializes the chip first
    let mut out = [0u8; 4];
    assert_eq!(read.load(0, 4).unwrap().wait(), Ok(4));
    assert_eq!(inits.load(Ordering::SeqCst), 2);
    assert_eq!(read.drain_read(&mut out), 4);
    assert_eq!(out, [0x11; 4]);

    // Writing resumes where the failed save started
    assert!(write.stage_write(&[0x33; 4]));
    assert_eq!(write.save().unwrap().wait(), Ok(4));
    assert_eq!(read.load(254, 4).unwrap().wait(), Ok(4));
    assert_eq!(read.drain_read(&mut out), 4);
    assert_eq!(out, [0x11, 0x11, 0x33, 0x33]);
}

/// RAM flash whose first sector erase waits until the test lets it go.
struct GatedFlash {
    ram: RamFlash,
    entered: mpsc::Sender<()>,
    gate: Option<mpsc::Receiver<()>>,
}

impl FlashDevice for GatedFlash {
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.ram.capacity()
    }

    fn sector_size(&self) -> usize {
        self.ram.sector_size()
    }

    fn read(&mut self, address: usize, buf: &mut [u8]) -> Result<()> {
        self.ram.read(address, buf)
    }

    fn program_page(&mut self, address: usize, data: &[u8]) -> Result<()> {
        self.ram.program_page(address, data)
    }

    fn erase_sector(&mut self, sector: usize) -> Result<()> {
        if let Some(gate) = self.gate.take() {
            let _ = self.entered.send(());
            let _ = gate.recv();
        }
        self.ram.erase_sector(sector)
    }
}

#[test]
fn test_channels_change_during_erase() {
    let root = temp_root("erase-busy");
    let (entered_tx, entered) = mpsc::channel();
    let (open_gate, gate) = mpsc::channel();
    // Preserved contents: bring-up does not erase
    let flash = NorFlash::new(GatedFlash {
        ram: RamFlash::new(4, 1024),
        entered: entered_tx,
        gate: Some(gate),
    })
    .preserve_contents();
    let (io, _worker) = PeriphIo::new(SdCard::new(&root), flash).spawn().unwrap();

    let write = io
        .create_channel(ChannelSpec::flash(0, Direction::Write))
        .unwrap();
    let erase = write.reset().unwrap();
    entered.recv_timeout(Duration::from_secs(5)).unwrap();

    let (done_tx, done) = mpsc::channel();
    let handle = io.clone();
    std::thread::spawn(move || {
        drop(write);
        let read = handle.create_channel(ChannelSpec::flash(1, Direction::Read));
        let _ = done_tx.send(read.map(|c| c.direction()));
    });
    assert_eq!(
        done.recv_timeout(Duration::from_secs(5)).unwrap(),
        Ok(Direction::Read)
    );

    open_gate.send(()).unwrap();
    assert_eq!(erase.wait(), Ok(0));
}
