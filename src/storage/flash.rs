//! NOR flash backend: append-only writes at a moving pointer, reads at
//! absolute offsets, full-chip sector erase on reset.
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::Result;

use super::{Backend, BackendKind};
use crate::constants::flash::{ERASED_BYTE, N_SECTORS, PAGE_SIZE, SECTOR_SIZE};

/// Raw NOR flash chip access.
///
/// Programming can only clear bits, so writing over data that was not erased
/// first ANDs the new bytes into the old ones.
pub trait FlashDevice: Send {
    fn init(&mut self) -> Result<()>;
    fn capacity(&self) -> usize;
    fn sector_size(&self) -> usize {
        SECTOR_SIZE
    }
    fn read(&mut self, address: usize, buf: &mut [u8]) -> Result<()>;
    /// Programs at most one page; `data` must not cross a page boundary.
    fn program_page(&mut self, address: usize, data: &[u8]) -> Result<()>;
    fn erase_sector(&mut self, sector: usize) -> Result<()>;

    /// Programs `data` starting at `address`, split on page boundaries.
    fn write(&mut self, address: usize, data: &[u8]) -> Result<()> {
        let mut address = address;
        let mut data = data;
        while !data.is_empty() {
            let room = PAGE_SIZE - address % PAGE_SIZE;
            let (chunk, rest) = data.split_at(room.min(data.len()));
            self.program_page(address, chunk)?;
            address += chunk.len();
            data = rest;
        }
        Ok(())
    }
}

fn check_range(device: &impl FlashDevice, address: usize, len: usize) -> Result<()> {
    anyhow::ensure!(
        address.checked_add(len).is_some_and(|end| end <= device.capacity()),
        "flash access out of range: {:#x}+{:#x} (capacity {:#x})",
        address,
        len,
        device.capacity()
    );
    Ok(())
}

fn check_page(address: usize, len: usize) -> Result<()> {
    anyhow::ensure!(
        len == 0 || address / PAGE_SIZE == (address + len - 1) / PAGE_SIZE,
        "page program crosses a page boundary at {:#x}",
        address
    );
    Ok(())
}

/// Flash chip emulated in memory.
pub struct RamFlash {
    mem: Vec<u8>,
    sector_size: usize,
}

impl RamFlash {
    pub fn new(sectors: usize, sector_size: usize) -> Self {
        RamFlash {
            mem: vec![ERASED_BYTE; sectors * sector_size],
            sector_size,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.mem
    }
}

impl Default for RamFlash {
    fn default() -> Self {
        Self::new(N_SECTORS, SECTOR_SIZE)
    }
}

impl FlashDevice for RamFlash {
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.mem.len()
    }

    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn read(&mut self, address: usize, buf: &mut [u8]) -> Result<()> {
        check_range(self, address, buf.len())?;
        buf.copy_from_slice(&self.mem[address..address + buf.len()]);
        Ok(())
    }

    fn program_page(&mut self, address: usize, data: &[u8]) -> Result<()> {
        check_range(self, address, data.len())?;
        check_page(address, data.len())?;
        for (cell, byte) in self.mem[address..].iter_mut().zip(data) {
            *cell &= byte;
        }
        Ok(())
    }

    fn erase_sector(&mut self, sector: usize) -> Result<()> {
        let start = sector * self.sector_size;
        check_range(self, start, self.sector_size)?;
        self.mem[start..start + self.sector_size].fill(ERASED_BYTE);
        Ok(())
    }
}

/// Flash chip backed by an image file, so recordings survive a restart.
pub struct ImageFlash {
    path: PathBuf,
    file: Option<File>,
    capacity: usize,
    sector_size: usize,
}

impl ImageFlash {
    pub fn new<P: AsRef<Path>>(path: P, sectors: usize, sector_size: usize) -> Self {
        ImageFlash {
            path: path.as_ref().to_path_buf(),
            file: None,
            capacity: sectors * sector_size,
            sector_size,
        }
    }

    fn file(&mut self) -> Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| anyhow::format_err!("flash image {} not open", self.path.display()))
    }
}

impl FlashDevice for ImageFlash {
    fn init(&mut self) -> Result<()> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;
        let len = file.metadata()?.len() as usize;
        if len < self.capacity {
            // Grow with erased bytes
            file.seek(SeekFrom::Start(len as u64))?;
            file.write_all(&vec![ERASED_BYTE; self.capacity - len])?;
            file.flush()?;
        }
        log::debug!(
            "Flash image {} opened, {} KiB",
            self.path.display(),
            self.capacity / 1024
        );
        self.file = Some(file);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn read(&mut self, address: usize, buf: &mut [u8]) -> Result<()> {
        check_range(self, address, buf.len())?;
        let file = self.file()?;
        file.seek(SeekFrom::Start(address as u64))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn program_page(&mut self, address: usize, data: &[u8]) -> Result<()> {
        check_range(self, address, data.len())?;
        check_page(address, data.len())?;
        let mut cells = vec![0u8; data.len()];
        self.read(address, &mut cells)?;
        for (cell, byte) in cells.iter_mut().zip(data) {
            *cell &= byte;
        }
        let file = self.file()?;
        file.seek(SeekFrom::Start(address as u64))?;
        file.write_all(&cells)?;
        Ok(())
    }

    fn erase_sector(&mut self, sector: usize) -> Result<()> {
        let start = sector * self.sector_size;
        check_range(self, start, self.sector_size)?;
        let erased = vec![ERASED_BYTE; self.sector_size];
        let file = self.file()?;
        file.seek(SeekFrom::Start(start as u64))?;
        file.write_all(&erased)?;
        Ok(())
    }
}

type EraseProgress = Box<dyn FnMut(usize, usize) + Send>;

/// Backend over a [`FlashDevice`] with a monotonic write pointer.
pub struct NorFlash<D> {
    device: D,
    ready: bool,
    write_ptr: usize,
    n_sectors: usize,
    preserve: bool,
    on_erase: Option<EraseProgress>,
}

impl<D: FlashDevice> NorFlash<D> {
    pub fn new(device: D) -> Self {
        let n_sectors = device.capacity() / device.sector_size();
        NorFlash {
            device,
            ready: false,
            write_ptr: 0,
            n_sectors,
            preserve: false,
            on_erase: None,
        }
    }

    /// Keeps the recorded contents at bring-up and resumes writing after the
    /// last programmed page, for reading back a previous flight.
    pub fn preserve_contents(mut self) -> Self {
        self.preserve = true;
        self
    }

    /// Reports `(sector, total)` after every erased sector.
    pub fn on_erase(mut self, f: impl FnMut(usize, usize) + Send + 'static) -> Self {
        self.on_erase = Some(Box::new(f));
        self
    }

    pub fn write_ptr(&self) -> usize {
        self.write_ptr
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Erases every sector and rewinds the write pointer.
    pub fn erase_all(&mut self) -> Result<()> {
        log::info!("Erasing {} flash sectors", self.n_sectors);
        self.write_ptr = 0;
        for sector in 0..self.n_sectors {
            if let Err(e) = self.device.erase_sector(sector) {
                self.ready = false;
                return Err(e.context(format!("erase sector {sector}")));
            }
            if let Some(f) = self.on_erase.as_mut() {
                f(sector + 1, self.n_sectors);
            }
        }
        log::info!("Erased flash sectors");
        Ok(())
    }

    /// Offset of the first page after the last one holding data.
    pub fn scan_end(&mut self) -> Result<usize> {
        let mut page = [0u8; PAGE_SIZE];
        let mut end = 0;
        let mut address = 0;
        while address + PAGE_SIZE <= self.device.capacity() {
            self.device.read(address, &mut page)?;
            address += PAGE_SIZE;
            if page.iter().any(|&b| b != ERASED_BYTE) {
                end = address;
            }
        }
        Ok(end)
    }

    fn fault(&mut self, e: anyhow::Error) -> anyhow::Error {
        log::warn!("Flash fault: {:#}", e);
        self.ready = false;
        e
    }
}

impl<D: FlashDevice> Backend for NorFlash<D> {
    fn kind(&self) -> BackendKind {
        BackendKind::Flash
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    /// Reopens the chip. Contents and the write pointer are left alone, so a
    /// retry after a fault keeps every record written so far.
    fn init(&mut self) -> Result<()> {
        self.device.init()?;
        if self.preserve {
            self.write_ptr = self.scan_end()?;
            log::info!("Flash holds {} bytes of records", self.write_ptr);
        }
        self.ready = true;
        log::info!("Flash initialized, {} sectors", self.n_sectors);
        Ok(())
    }

    /// Init, erase the first sector, then the whole range.
    fn bring_up(&mut self) -> Result<()> {
        self.init()?;
        if !self.preserve {
            if let Err(e) = self.device.erase_sector(0) {
                return Err(self.fault(e.context("erase sector 0")));
            }
            self.erase_all()?;
        }
        Ok(())
    }

    fn save(&mut self, target: Option<&Path>, data: &[u8]) -> Result<usize> {
        anyhow::ensure!(target.is_none(), "flash is not file addressed");
        check_range(&self.device, self.write_ptr, data.len())?;
        if let Err(e) = self.device.write(self.write_ptr, data) {
            return Err(self.fault(e));
        }
        self.write_ptr += data.len();
        Ok(data.len())
    }

    fn load(&mut self, target: Option<&Path>, offset: usize, buf: &mut [u8]) -> Result<usize> {
        anyhow::ensure!(target.is_none(), "flash is not file addressed");
        check_range(&self.device, offset, buf.len())?;
        if let Err(e) = self.device.read(offset, buf) {
            return Err(self.fault(e));
        }
        Ok(buf.len())
    }

    fn reset(&mut self, target: Option<&Path>) -> Result<()> {
        anyhow::ensure!(target.is_none(), "flash is not file addressed");
        self.erase_all()
    }
}
