//! Geometry of Linux block devices.

// cspell:ignore BLKGETSIZE, BLKSSZGET

use std::fmt;
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

/// Sector size assumed for regular files.
pub const DEFAULT_SECTOR_SIZE: u64 = 512;

/// Queries the size and sector size of an opened device.
pub trait DeviceGeometry: Send + Sync + fmt::Debug {
    /// Size of the device in bytes.
    fn size(&self, file: &File) -> io::Result<u64>;

    /// Native (logical) sector size of the device in bytes.
    fn sector_size(&self, file: &File) -> io::Result<u64>;
}

/// Geometry obtained from the kernel via `ioctl`.
///
/// Regular files report their length and [`DEFAULT_SECTOR_SIZE`].
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelGeometry;

impl DeviceGeometry for KernelGeometry {
    fn size(&self, file: &File) -> io::Result<u64> {
        use nix::{ioctl_read, libc::c_ulonglong};

        ioctl_read! {
            /// Get the size of the block device in bytes.
            ioctl_get_size, 0x12, 114, c_ulonglong
        }

        let metadata = file.metadata()?;
        if !metadata.file_type().is_block_device() {
            return Ok(metadata.len());
        }
        let mut size = 0;
        unsafe {
            // SAFETY: The file is a block device and `size` is a valid pointer.
            ioctl_get_size(file.as_raw_fd(), &mut size)
        }?;
        Ok(size)
    }

    fn sector_size(&self, file: &File) -> io::Result<u64> {
        use nix::{ioctl_read_bad, libc::c_int, request_code_none};

        ioctl_read_bad! {
            /// Get the logical sector size of the block device in bytes.
            ioctl_get_sector_size, request_code_none!(0x12, 104), c_int
        }

        if !file.metadata()?.file_type().is_block_device() {
            return Ok(DEFAULT_SECTOR_SIZE);
        }
        let mut sector_size: c_int = 0;
        unsafe {
            // SAFETY: The file is a block device and `sector_size` is a valid pointer.
            ioctl_get_sector_size(file.as_raw_fd(), &mut sector_size)
        }?;
        u64::try_from(sector_size)
            .ok()
            .filter(|size| *size > 0)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("invalid sector size {sector_size}"),
                )
            })
    }
}

/// Fixed geometry, independent of the opened file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedGeometry {
    pub size: u64,
    pub sector_size: u64,
}

impl DeviceGeometry for FixedGeometry {
    fn size(&self, _: &File) -> io::Result<u64> {
        Ok(self.size)
    }

    fn sector_size(&self, _: &File) -> io::Result<u64> {
        Ok(self.sector_size)
    }
}

/// Check whether the device name refers to a UBI volume (e.g. `ubi0_1`).
pub fn is_ubi_device(device: &Path) -> bool {
    device
        .to_str()
        .is_some_and(|device| device.starts_with("ubi"))
}

/// Path under which a device can be opened.
///
/// UBI volumes are referred to without `/dev` prefix because the kernel does not
/// accept the prefixed form as root device.
pub fn device_path(device: &Path) -> PathBuf {
    if is_ubi_device(device) {
        Path::new("/dev").join(device)
    } else {
        device.to_path_buf()
    }
}
