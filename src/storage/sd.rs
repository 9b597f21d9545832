//! SD card backend, one file per channel below a mount point.
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::Result;

use super::{Backend, BackendKind};

pub struct SdCard {
    root: PathBuf,
    mounted: bool,
}

impl SdCard {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        SdCard {
            root: root.as_ref().to_path_buf(),
            mounted: false,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, target: Option<&Path>) -> Result<PathBuf> {
        let target = target.ok_or_else(|| anyhow::format_err!("SD operation without a file"))?;
        anyhow::ensure!(
            target.is_relative(),
            "SD path must be relative to the card: {}",
            target.display()
        );
        Ok(self.root.join(target))
    }

    /// Unmounts the card if the fault means it has gone away.
    fn check_fault(&mut self, err: std::io::Error) -> anyhow::Error {
        if !self.root.is_dir() {
            log::warn!("SD card at {} went away", self.root.display());
            self.mounted = false;
        }
        err.into()
    }
}

impl Backend for SdCard {
    fn kind(&self) -> BackendKind {
        BackendKind::Sd
    }

    fn is_ready(&self) -> bool {
        self.mounted
    }

    fn init(&mut self) -> Result<()> {
        anyhow::ensure!(
            self.root.is_dir(),
            "SD card not mounted: {} is not a directory",
            self.root.display()
        );
        self.mounted = true;
        log::info!("SD card mounted at {}", self.root.display());
        Ok(())
    }

    fn save(&mut self, target: Option<&Path>, data: &[u8]) -> Result<usize> {
        let path = self.resolve(target)?;
        let mut file = match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => file,
            Err(e) => return Err(self.check_fault(e)),
        };
        if let Err(e) = file.write_all(data) {
            return Err(self.check_fault(e));
        }
        Ok(data.len())
    }

    fn load(&mut self, target: Option<&Path>, offset: usize, buf: &mut [u8]) -> Result<usize> {
        let path = self.resolve(target)?;
        let result = File::open(&path).and_then(|mut file| {
            file.seek(SeekFrom::Start(offset as u64))?;
            let mut n = 0;
            // Short reads are fine, stop at end of file
            while n < buf.len() {
                match file.read(&mut buf[n..]) {
                    Ok(0) => break,
                    Ok(len) => n += len,
                    Err(e) if e.kind() == ErrorKind::Interrupted => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(n)
        });
        result.map_err(|e| self.check_fault(e))
    }

    fn reset(&mut self, target: Option<&Path>) -> Result<()> {
        let path = self.resolve(target)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.check_fault(e)),
        }
    }
}
