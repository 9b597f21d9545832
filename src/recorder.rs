//! State recorder: logs snapshots to flash in flight, copies them to the SD
//! card as CSV afterwards, and runs the storage self tests.
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::channel::{Channel, ChannelSpec, Direction};
use crate::command::Signal;
use crate::constants::flash::ERASED_BYTE;
use crate::constants::{SD_MAX_READ_WRITE_SIZE, STATE_RECORD_LEN, channel_ids};
use crate::format::to_csv_line;
use crate::state::{RocketState, SharedState};
use crate::worker::IoHandle;

pub const CSV_FILE: &str = "data.csv";
pub const SELF_TEST_FILE: &str = "post.txt";

const SELF_TEST_TIMEOUT: Duration = Duration::from_millis(1000);

pub struct StateRecorder {
    flash_write: Channel,
    flash_read: Channel,
    sd_write: Channel,
    n_states: usize,
}

impl StateRecorder {
    /// Opens the flash write/read channels and the CSV channel on the card.
    pub fn new(io: &IoHandle) -> Result<Self> {
        Ok(StateRecorder {
            flash_write: io.create_channel(ChannelSpec::flash(
                channel_ids::FLASH_WRITE,
                Direction::Write,
            ))?,
            flash_read: io.create_channel(ChannelSpec::flash(
                channel_ids::FLASH_READ,
                Direction::Read,
            ))?,
            sd_write: io.create_channel(ChannelSpec::sd(
                channel_ids::SD_WRITE,
                CSV_FILE,
                Direction::Write,
            ))?,
            n_states: 0,
        })
    }

    /// Number of records written to flash so far.
    pub fn n_states(&self) -> usize {
        self.n_states
    }

    /// Appends one state record to flash and waits until it is written.
    pub fn record(&mut self, state: &RocketState) -> Result<()> {
        let record = state.to_record()?;
        anyhow::ensure!(
            self.flash_write.stage_write(&record),
            "flash write stream has no room for a record"
        );
        self.flash_write.save()?.wait()?;
        self.n_states += 1;
        Ok(())
    }

    /// Counts the records on flash, up to the first erased slot.
    pub fn recorded_states(&mut self) -> Result<usize> {
        let mut record = [0u8; STATE_RECORD_LEN];
        let mut n = 0;
        // Loading past the end of the chip fails, which ends the scan
        while self
            .flash_read
            .load(n * STATE_RECORD_LEN, STATE_RECORD_LEN)?
            .wait()
            .is_ok()
        {
            self.flash_read.drain_read(&mut record);
            if record.iter().all(|&b| b == ERASED_BYTE) {
                break;
            }
            n += 1;
        }
        self.n_states = n;
        Ok(n)
    }

    /// Copies the first `n_states` records from flash to the card as CSV.
    /// `progress` sees `(done, total)` after each record. Returns the
    /// number of CSV bytes written.
    pub fn offload(
        &mut self,
        n_states: usize,
        mut progress: impl FnMut(usize, usize),
    ) -> Result<usize> {
        log::info!("Writing {} states to SD card", n_states);
        let mut offset = 0;
        let mut written = 0;
        let mut record = [0u8; STATE_RECORD_LEN];

        for i in 0..n_states {
            let n = self.flash_read.load(offset, STATE_RECORD_LEN)?.wait()?;
            offset += n;
            let got = self.flash_read.drain_read(&mut record);
            anyhow::ensure!(
                got == STATE_RECORD_LEN,
                "short record {} at flash offset {:#x}: {} bytes",
                i,
                offset - n,
                got
            );

            let state = RocketState::from_record(&record)?;
            let line = to_csv_line(&state);
            for chunk in line.as_bytes().chunks(SD_MAX_READ_WRITE_SIZE) {
                anyhow::ensure!(
                    self.sd_write.stage_write(chunk),
                    "SD write stream has no room"
                );
                written += self.sd_write.save()?.wait()?;
            }
            progress(i + 1, n_states);
        }

        log::info!("Wrote {} bytes to {}", written, CSV_FILE);
        Ok(written)
    }

    /// Records at `period` once a begin signal arrives, until a flash signal
    /// triggers the offload. Returns the number of states recorded.
    ///
    /// A flash signal that arrives before recording begins is held until
    /// then.
    pub fn run(
        mut self,
        state: &SharedState,
        signals: &Receiver<Signal>,
        period: Duration,
        mut progress: impl FnMut(usize, usize),
    ) -> Result<usize> {
        let mut flash_pending = false;
        loop {
            match signals.recv() {
                Ok(Signal::BeginStateFlash) => break,
                Ok(Signal::FlashSdCard) => flash_pending = true,
                Err(_) => return Ok(0),
            }
        }
        log::info!("Beginning state recording every {:?}", period);

        loop {
            let started = Instant::now();
            self.record(&state.snapshot())?;

            let wait = period.saturating_sub(started.elapsed());
            match signals.recv_timeout(wait) {
                Ok(Signal::FlashSdCard) => flash_pending = true,
                Ok(Signal::BeginStateFlash) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    log::warn!("Command link gone, stopping recorder without offload");
                    return Ok(self.n_states);
                }
            }

            if flash_pending {
                let n_states = self.n_states;
                self.offload(n_states, &mut progress)?;
                return Ok(n_states);
            }
        }
    }
}

fn compare(what: &str, got: &[u8], expected: impl Iterator<Item = u8>) -> Result<()> {
    for (i, (a, b)) in got.iter().zip(expected).enumerate() {
        anyhow::ensure!(
            *a == b,
            "{} mismatch at byte {}: {:#04x} != {:#04x}",
            what,
            i,
            a,
            b
        );
    }
    Ok(())
}

/// Writes two pages to flash, reads them back and erases the chip.
pub fn self_test_flash(io: &IoHandle) -> Result<()> {
    let mut write = io.create_channel(ChannelSpec::flash(
        channel_ids::FLASH_WRITE,
        Direction::Write,
    ))?;
    let mut read = io.create_channel(ChannelSpec::flash(
        channel_ids::FLASH_READ,
        Direction::Read,
    ))?;

    let offset: u8 = rand::random();
    let pattern = |start: usize| (start..start + 256).map(move |i| (i + offset as usize) as u8);
    let test_bytes: Vec<u8> = pattern(0).chain(pattern(256)).collect();

    // The first save waits for bring-up, which erases the whole chip
    anyhow::ensure!(write.stage_write(&test_bytes[..256]), "stage failed");
    write.save()?.wait()?;
    anyhow::ensure!(write.stage_write(&test_bytes[256..]), "stage failed");
    write.save()?.wait_timeout(SELF_TEST_TIMEOUT)?;

    let mut buf = [0u8; 256];
    for start in [0, 256] {
        read.load(start, 256)?.wait_timeout(SELF_TEST_TIMEOUT)?;
        anyhow::ensure!(read.drain_read(&mut buf) == 256, "short flash read");
        compare("Flash", &buf, pattern(start))?;
    }

    write.reset()?.wait()?;
    Ok(())
}

/// Writes 1 KiB to a scratch file on the card, reads it back and removes it.
pub fn self_test_sd(io: &IoHandle) -> Result<()> {
    let mut write = io.create_channel(ChannelSpec::sd(
        channel_ids::SD_WRITE,
        SELF_TEST_FILE,
        Direction::Write,
    ))?;
    let mut read = io.create_channel(ChannelSpec::sd(
        channel_ids::SD_READ,
        SELF_TEST_FILE,
        Direction::Read,
    ))?;

    // Leftovers from an aborted run would shift the readback
    let _ = write.reset()?.wait_timeout(SELF_TEST_TIMEOUT);

    let test_bytes: Vec<u8> = (0..1024).map(|i| i as u8).collect();
    for chunk in test_bytes.chunks(SD_MAX_READ_WRITE_SIZE) {
        anyhow::ensure!(write.stage_write(chunk), "stage failed");
        write.save()?.wait_timeout(SELF_TEST_TIMEOUT)?;
    }

    let mut buf = [0u8; SD_MAX_READ_WRITE_SIZE];
    for start in [0, SD_MAX_READ_WRITE_SIZE] {
        read.load(start, SD_MAX_READ_WRITE_SIZE)?
            .wait_timeout(SELF_TEST_TIMEOUT)?;
        anyhow::ensure!(
            read.drain_read(&mut buf) == SD_MAX_READ_WRITE_SIZE,
            "short SD read"
        );
        compare("SD", &buf, (start..).map(|i| i as u8))?;
    }

    write.reset()?.wait_timeout(SELF_TEST_TIMEOUT)?;
    Ok(())
}
