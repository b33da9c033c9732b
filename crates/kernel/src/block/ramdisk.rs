//! RAM-backed block device
//!
//! Used by the boot-time self tests, as scratch media for the FAT driver,
//! and by the hosted unit tests. The whole disk is a `Vec<u8>` behind a
//! mutex; reads and writes are plain copies.

use super::{BlockDevice, BlockDeviceOps, SECTOR_SIZE};
use crate::lib::error::{Errno, Result};
use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

pub struct RamDisk {
    data: Mutex<Vec<u8>>,
}

impl RamDisk {
    /// A zero-filled disk of `sectors` sectors.
    pub fn new(sectors: u64) -> Self {
        Self {
            data: Mutex::new(vec![0u8; sectors as usize * SECTOR_SIZE]),
        }
    }

    /// Wrap an existing image; the length is rounded up to whole sectors.
    pub fn from_image(mut image: Vec<u8>) -> Self {
        let rem = image.len() % SECTOR_SIZE;
        if rem != 0 {
            image.resize(image.len() + SECTOR_SIZE - rem, 0);
        }
        Self {
            data: Mutex::new(image),
        }
    }

    pub fn sectors(&self) -> u64 {
        (self.data.lock().len() / SECTOR_SIZE) as u64
    }
}

impl BlockDeviceOps for RamDisk {
    fn read_sectors(&self, _dev: &BlockDevice, sector: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.data.lock();
        let start = sector as usize * SECTOR_SIZE;
        let end = start + buf.len();
        if end > data.len() {
            return Err(Errno::EIO);
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_sectors(&self, _dev: &BlockDevice, sector: u64, buf: &[u8]) -> Result<()> {
        let mut data = self.data.lock();
        let start = sector as usize * SECTOR_SIZE;
        let end = start + buf.len();
        if end > data.len() {
            return Err(Errno::EIO);
        }
        data[start..end].copy_from_slice(buf);
        Ok(())
    }
}

/// Create and register a RAM disk from an image.
pub fn register_ramdisk(name: &str, image: Vec<u8>) -> Arc<BlockDevice> {
    let disk = Box::leak(Box::new(RamDisk::from_image(image)));
    let sectors = disk.sectors();
    super::register_block_device(BlockDevice::new(String::from(name), 1, 0, sectors, disk))
}

/// Build an unregistered RAM-backed device (unit tests and self tests).
pub fn ram_device_for_test(name: &str, sectors: u64) -> Arc<BlockDevice> {
    let disk = Box::leak(Box::new(RamDisk::new(sectors)));
    Arc::new(BlockDevice::new(String::from(name), 1, 99, sectors, disk))
}

/// Build an unregistered device over an image (unit tests and self tests).
pub fn image_device_for_test(name: &str, image: Vec<u8>) -> Arc<BlockDevice> {
    let disk = Box::leak(Box::new(RamDisk::from_image(image)));
    let sectors = disk.sectors();
    Arc::new(BlockDevice::new(String::from(name), 1, 99, sectors, disk))
}
