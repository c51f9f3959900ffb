//! Streaming images onto block devices.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::blkdev::{device_path, DeviceGeometry, KernelGeometry};
use super::writer::{device_writer, frame_size, DeviceWriter};
use crate::mounts::MountTable;

/// Error opening a block device for writing.
#[derive(Debug, Error)]
pub enum BlockDeviceError {
    #[error("invalid image size {0}")]
    InvalidSize(i64),
    #[error(
        "image of {declared} bytes is larger than device {} of {available} bytes",
        path.display()
    )]
    NoSpace {
        path: PathBuf,
        declared: u64,
        available: u64,
    },
    #[error("unable to unmount {}", path.display())]
    Unmount {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },
    #[error("unable to open device {}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("unable to query geometry of device {}", path.display())]
    Geometry {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Options for opening block devices.
#[derive(Debug, Clone)]
pub struct BlockDeviceOptions {
    geometry: Arc<dyn DeviceGeometry>,
    sync_interval: Option<u64>,
}

impl Default for BlockDeviceOptions {
    fn default() -> Self {
        Self {
            geometry: Arc::new(KernelGeometry),
            sync_interval: None,
        }
    }
}

impl BlockDeviceOptions {
    /// Use the given strategy to determine the device geometry.
    pub fn with_geometry(mut self, geometry: Arc<dyn DeviceGeometry>) -> Self {
        self.geometry = geometry;
        self
    }

    /// Sync after every `interval` bytes instead of after every sector.
    ///
    /// An interval of zero syncs after every write.
    pub fn with_sync_interval(mut self, interval: Option<u64>) -> Self {
        self.sync_interval = interval;
        self
    }
}

/// Block device opened for writing an image.
///
/// Writes are buffered, so [`BlockDevice::close`] must be called for all data to
/// reach the device.
#[derive(Debug)]
pub struct BlockDevice {
    path: PathBuf,
    writer: Option<DeviceWriter<File>>,
}

impl BlockDevice {
    /// Open the device for writing an image of `declared_size` bytes.
    pub fn open(
        device: impl AsRef<Path>,
        declared_size: i64,
        options: &BlockDeviceOptions,
    ) -> Result<Self, BlockDeviceError> {
        let device = device.as_ref();
        info!("opening device {} for writing", device.display());
        let declared = u64::try_from(declared_size)
            .map_err(|_| BlockDeviceError::InvalidSize(declared_size))?;
        unmount_if_mounted(device)?;
        let path = device_path(device);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| BlockDeviceError::Open {
                path: path.clone(),
                source,
            })?;
        let geometry_error = |source| BlockDeviceError::Geometry {
            path: path.clone(),
            source,
        };
        let available = options.geometry.size(&file).map_err(geometry_error)?;
        if available < declared {
            error!(
                "image ({declared} bytes) is larger than device {} ({available} bytes)",
                path.display()
            );
            return Err(BlockDeviceError::NoSpace {
                path: path.clone(),
                declared,
                available,
            });
        }
        let sector_size = options.geometry.sector_size(&file).map_err(geometry_error)?;
        let frame_size = frame_size(sector_size);
        info!(
            "native sector size of device {} is {sector_size}, writing in chunks of {frame_size}",
            path.display()
        );
        let frame_size = usize::try_from(frame_size).map_err(|_| {
            geometry_error(io::Error::new(
                io::ErrorKind::InvalidData,
                "sector size too large",
            ))
        })?;
        let sync_interval = options.sync_interval.unwrap_or(sector_size);
        Ok(Self {
            writer: Some(device_writer(file, declared, frame_size, sync_interval)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check whether the device is still open.
    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    /// Write buffered bytes to the device, sync it, and close it.
    ///
    /// Closing an already closed device does nothing.
    pub fn close(&mut self) -> io::Result<()> {
        match self.writer.take() {
            Some(mut writer) => {
                writer.flush()?;
                debug!("closed device {}", self.path.display());
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Write for BlockDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.writer {
            Some(writer) => writer.write(buf),
            None => Err(not_open_error()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.writer {
            Some(writer) => writer.flush(),
            None => Err(not_open_error()),
        }
    }
}

fn not_open_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "block device is not open")
}

fn unmount_if_mounted(device: &Path) -> Result<(), BlockDeviceError> {
    let table = match MountTable::read() {
        Ok(table) => table,
        Err(error) => {
            debug!("unable to read mount table: {error}");
            return Ok(());
        }
    };
    let Some(entry) = table.find_by_source(device) else {
        return Ok(());
    };
    warn!(
        "device {} is mounted at {}, this might be caused by an automount service, \
        consider excluding the update partitions from it",
        device.display(),
        entry.target,
    );
    warn!("unmounting {}", entry.target);
    nix::mount::umount(device).map_err(|source| {
        error!("unable to unmount {}", device.display());
        BlockDeviceError::Unmount {
            path: device.to_path_buf(),
            source,
        }
    })
}
