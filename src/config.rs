//! Runtime configuration, read from YAML.
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use simplelog::LevelFilter;

use crate::constants::flash::{N_SECTORS, SECTOR_SIZE};
use crate::storage::{FlashDevice, ImageFlash, NorFlash, RamFlash, SdCard};
use crate::transport::Baudrate;
use crate::worker::PeriphIo;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlashConfig {
    /// Backing file. The flash lives in RAM when unset.
    pub image: Option<PathBuf>,
    pub sectors: usize,
    pub sector_size: usize,
}

impl Default for FlashConfig {
    fn default() -> Self {
        FlashConfig {
            image: None,
            sectors: N_SECTORS,
            sector_size: SECTOR_SIZE,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub port: Option<String>,
    pub baudrate: Baudrate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sd_root: PathBuf,
    pub flash: FlashConfig,
    pub telemetry: TelemetryConfig,
    pub log_level: String,
    pub record_hz: u32,
    pub telemetry_hz: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            sd_root: PathBuf::from("sdcard"),
            flash: FlashConfig::default(),
            telemetry: TelemetryConfig::default(),
            log_level: "info".into(),
            record_hz: 10,
            telemetry_hz: 10,
        }
    }
}

impl Config {
    /// The configuration shipped with the binary.
    pub fn builtin() -> Result<Self> {
        Self::from_yaml(include_str!("../jetvane.yaml"))
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| anyhow::format_err!("cannot read {}: {}", path.display(), e))?;
        Self::from_yaml(&yaml)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.record_hz > 0, "record_hz must be positive");
        anyhow::ensure!(self.telemetry_hz > 0, "telemetry_hz must be positive");
        anyhow::ensure!(self.flash.sectors > 0, "flash needs at least one sector");
        anyhow::ensure!(
            self.flash.sector_size > 0 && self.flash.sector_size % 256 == 0,
            "flash sector size must be a multiple of the page size"
        );
        self.level()?;
        Ok(())
    }

    pub fn level(&self) -> Result<LevelFilter> {
        LevelFilter::from_str(&self.log_level)
            .map_err(|_| anyhow::format_err!("unknown log level {:?}", self.log_level))
    }

    pub fn record_period(&self) -> Duration {
        Duration::from_secs(1) / self.record_hz
    }

    pub fn telemetry_period(&self) -> Duration {
        Duration::from_secs(1) / self.telemetry_hz
    }

    /// Builds the I/O worker over the configured card directory and flash.
    ///
    /// With `preserve` the flash keeps its recordings instead of being erased
    /// at bring-up. `on_erase` sees `(sector, total)` while erasing.
    pub fn periph_io(
        &self,
        preserve: bool,
        on_erase: impl FnMut(usize, usize) + Send + 'static,
    ) -> PeriphIo {
        fn nor<D: FlashDevice>(
            device: D,
            preserve: bool,
            on_erase: impl FnMut(usize, usize) + Send + 'static,
        ) -> NorFlash<D> {
            let flash = NorFlash::new(device).on_erase(on_erase);
            if preserve { flash.preserve_contents() } else { flash }
        }

        let sd = SdCard::new(&self.sd_root);
        let flash = &self.flash;
        match &flash.image {
            Some(image) => PeriphIo::new(
                sd,
                nor(
                    ImageFlash::new(image, flash.sectors, flash.sector_size),
                    preserve,
                    on_erase,
                ),
            ),
            None => PeriphIo::new(
                sd,
                nor(RamFlash::new(flash.sectors, flash.sector_size), preserve, on_erase),
            ),
        }
    }
}
