//! Block layer
//!
//! A unified interface for sector-addressed devices (ATA, RAM disks,
//! partitions). Drivers implement [`BlockDeviceOps`]; the layer
//! contributes bounds checking and the device registry that partition
//! discovery and filesystem probing walk. PIO requests are serialised by
//! the driver's own locking.

pub mod partition;
pub mod ramdisk;

use crate::lib::error::{Errno, Result};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

/// Default sector size; every supported device uses 512-byte sectors
/// unless its driver overrides.
pub const SECTOR_SIZE: usize = 512;

/// Block device operations trait
pub trait BlockDeviceOps: Send + Sync {
    /// Read whole sectors starting at `sector` into `buf` (its length
    /// selects the count).
    fn read_sectors(&self, dev: &BlockDevice, sector: u64, buf: &mut [u8]) -> Result<()>;

    /// Write whole sectors starting at `sector`.
    fn write_sectors(&self, dev: &BlockDevice, sector: u64, buf: &[u8]) -> Result<()>;

    /// Flush any cached writes.
    fn flush(&self, dev: &BlockDevice) -> Result<()> {
        let _ = dev;
        Ok(())
    }
}

/// Block device abstraction
pub struct BlockDevice {
    /// Device name (e.g. "hda", "hda1", "ram0")
    pub name: String,
    /// Major device number
    pub major: u32,
    /// Minor device number
    pub minor: u32,
    /// Capacity in sectors
    pub capacity_sectors: u64,
    /// Sector size in bytes
    pub sector_size: usize,
    /// Operations for this device
    pub ops: &'static dyn BlockDeviceOps,
}

impl BlockDevice {
    pub fn new(
        name: String,
        major: u32,
        minor: u32,
        capacity_sectors: u64,
        ops: &'static dyn BlockDeviceOps,
    ) -> Self {
        Self {
            name,
            major,
            minor,
            capacity_sectors,
            sector_size: SECTOR_SIZE,
            ops,
        }
    }

    fn check_range(&self, sector: u64, len_bytes: usize) -> Result<()> {
        if len_bytes % self.sector_size != 0 {
            return Err(Errno::EINVAL);
        }
        let count = (len_bytes / self.sector_size) as u64;
        if sector >= self.capacity_sectors || sector + count > self.capacity_sectors {
            return Err(Errno::EINVAL);
        }
        Ok(())
    }

    /// Read sectors from the device.
    pub fn read_sectors(&self, sector: u64, buf: &mut [u8]) -> Result<()> {
        self.check_range(sector, buf.len())?;
        self.ops.read_sectors(self, sector, buf)
    }

    /// Write sectors to the device.
    pub fn write_sectors(&self, sector: u64, buf: &[u8]) -> Result<()> {
        self.check_range(sector, buf.len())?;
        self.ops.write_sectors(self, sector, buf)
    }

    /// Flush cached writes to stable storage.
    pub fn flush(&self) -> Result<()> {
        self.ops.flush(self)
    }

    pub fn sector_count(&self) -> u64 {
        self.capacity_sectors
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_sectors * self.sector_size as u64
    }
}

/// Global block device registry
static DEVICES: Mutex<Vec<Arc<BlockDevice>>> = Mutex::new(Vec::new());

/// Register a block device and hand back its shared handle.
pub fn register_block_device(device: BlockDevice) -> Arc<BlockDevice> {
    let device = Arc::new(device);
    crate::info!(
        "block: registered {} ({} sectors, {} KiB)",
        device.name,
        device.capacity_sectors,
        device.capacity_bytes() / 1024
    );
    DEVICES.lock().push(device.clone());
    device
}

/// Look a device up by name.
pub fn get_device(name: &str) -> Option<Arc<BlockDevice>> {
    DEVICES.lock().iter().find(|d| d.name == name).cloned()
}

/// Snapshot of all registered devices.
pub fn all_devices() -> Vec<Arc<BlockDevice>> {
    DEVICES.lock().clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds_checking() {
        let dev = ramdisk::ram_device_for_test("rt0", 8);
        let mut buf = [0u8; SECTOR_SIZE];
        assert!(dev.read_sectors(7, &mut buf).is_ok());
        assert_eq!(dev.read_sectors(8, &mut buf), Err(Errno::EINVAL));
        let mut two = [0u8; SECTOR_SIZE * 2];
        assert_eq!(dev.read_sectors(7, &mut two), Err(Errno::EINVAL));
        // Partial-sector buffers are rejected outright.
        let mut odd = [0u8; 100];
        assert_eq!(dev.read_sectors(0, &mut odd), Err(Errno::EINVAL));
    }

    #[test]
    fn test_write_read_round_trip() {
        let dev = ramdisk::ram_device_for_test("rt1", 4);
        let mut out = [0u8; SECTOR_SIZE];
        out[0] = 0xAB;
        out[511] = 0xCD;
        dev.write_sectors(2, &out).unwrap();
        let mut back = [0u8; SECTOR_SIZE];
        dev.read_sectors(2, &mut back).unwrap();
        assert_eq!(out[..], back[..]);
    }
}
