//! ATA PIO disk driver
//!
//! The narrow contract the block layer needs: read N sectors, write N
//! sectors, synchronously, over the legacy I/O ports. LBA28 addressing,
//! no DMA, no command queueing - requests are serialised per channel by
//! a mutex.
//!
//! ```text
//! Primary channel:   0x1F0-0x1F7, control 0x3F6  (drives hda/hdb)
//! Secondary channel: 0x170-0x177, control 0x376  (drives hdc/hdd)
//! ```
//!
//! Register file (offset from the channel base): data 0, error 1, sector
//! count 2, LBA low/mid/high 3-5, drive select 6, status/command 7.

use crate::block::{self, BlockDevice, BlockDeviceOps, SECTOR_SIZE};
use crate::lib::error::{Errno, Result};
use alloc::boxed::Box;
use alloc::string::String;
use spin::Mutex;
use x86_64::instructions::port::Port;

const PRIMARY_IO: u16 = 0x1F0;
const PRIMARY_CTRL: u16 = 0x3F6;
const SECONDARY_IO: u16 = 0x170;
const SECONDARY_CTRL: u16 = 0x376;

// Status bits
const STATUS_ERR: u8 = 1 << 0;
const STATUS_DRQ: u8 = 1 << 3;
const STATUS_DF: u8 = 1 << 5;
const STATUS_BSY: u8 = 1 << 7;

// Commands
const CMD_READ_SECTORS: u8 = 0x20;
const CMD_WRITE_SECTORS: u8 = 0x30;
const CMD_CACHE_FLUSH: u8 = 0xE7;
const CMD_IDENTIFY: u8 = 0xEC;

/// Bounded polling loop; a dead drive must not hang the kernel.
const POLL_LIMIT: u32 = 1_000_000;

#[derive(Clone, Copy)]
struct Channel {
    io_base: u16,
    ctrl_base: u16,
}

impl Channel {
    unsafe fn status(&self) -> u8 {
        Port::<u8>::new(self.io_base + 7).read()
    }

    /// Reading the alternate status four times gives the mandated 400 ns
    /// settle delay.
    unsafe fn settle(&self) {
        let mut alt: Port<u8> = Port::new(self.ctrl_base);
        for _ in 0..4 {
            let _ = alt.read();
        }
    }

    unsafe fn wait_not_busy(&self) -> Result<u8> {
        for _ in 0..POLL_LIMIT {
            let status = self.status();
            if status & STATUS_BSY == 0 {
                return Ok(status);
            }
            core::hint::spin_loop();
        }
        Err(Errno::EIO)
    }

    unsafe fn wait_data_request(&self) -> Result<()> {
        for _ in 0..POLL_LIMIT {
            let status = self.status();
            if status & (STATUS_ERR | STATUS_DF) != 0 {
                return Err(Errno::EIO);
            }
            if status & STATUS_BSY == 0 && status & STATUS_DRQ != 0 {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        Err(Errno::EIO)
    }

    /// Program the LBA28 register block for a transfer.
    unsafe fn setup(&self, slave: bool, lba: u64, count: u8) {
        let select = 0xE0 | ((slave as u8) << 4) | ((lba >> 24) & 0x0F) as u8;
        Port::<u8>::new(self.io_base + 6).write(select);
        self.settle();
        Port::<u8>::new(self.io_base + 2).write(count);
        Port::<u8>::new(self.io_base + 3).write((lba & 0xFF) as u8);
        Port::<u8>::new(self.io_base + 4).write(((lba >> 8) & 0xFF) as u8);
        Port::<u8>::new(self.io_base + 5).write(((lba >> 16) & 0xFF) as u8);
    }

    unsafe fn command(&self, cmd: u8) {
        Port::<u8>::new(self.io_base + 7).write(cmd);
    }
}

/// One drive on a channel, plus the channel serialisation lock.
struct AtaDrive {
    channel: Channel,
    slave: bool,
    lock: Mutex<()>,
}

impl AtaDrive {
    /// IDENTIFY the drive; `None` when absent or not plain ATA.
    unsafe fn identify(channel: Channel, slave: bool) -> Option<u64> {
        channel.setup(slave, 0, 0);
        channel.command(CMD_IDENTIFY);
        channel.settle();

        if channel.status() == 0 {
            return None; // floating bus, no drive
        }
        channel.wait_not_busy().ok()?;

        // ATAPI and SATA-in-legacy report a signature here; skip them.
        let mid = Port::<u8>::new(channel.io_base + 4).read();
        let high = Port::<u8>::new(channel.io_base + 5).read();
        if mid != 0 || high != 0 {
            return None;
        }

        channel.wait_data_request().ok()?;
        let mut data: Port<u16> = Port::new(channel.io_base);
        let mut identify = [0u16; 256];
        for word in identify.iter_mut() {
            *word = data.read();
        }

        // Words 60-61: total LBA28-addressable sectors.
        let sectors = (identify[60] as u64) | ((identify[61] as u64) << 16);
        if sectors == 0 {
            return None;
        }
        Some(sectors)
    }

    unsafe fn read(&self, lba: u64, buf: &mut [u8]) -> Result<()> {
        let count = buf.len() / SECTOR_SIZE;
        let _guard = self.lock.lock();
        let mut data: Port<u16> = Port::new(self.channel.io_base);

        for sector in 0..count {
            self.channel.setup(self.slave, lba + sector as u64, 1);
            self.channel.command(CMD_READ_SECTORS);
            self.channel.wait_data_request()?;

            let base = sector * SECTOR_SIZE;
            for i in 0..SECTOR_SIZE / 2 {
                let word = data.read();
                buf[base + 2 * i] = (word & 0xFF) as u8;
                buf[base + 2 * i + 1] = (word >> 8) as u8;
            }
            self.channel.settle();
        }
        Ok(())
    }

    unsafe fn write(&self, lba: u64, buf: &[u8]) -> Result<()> {
        let count = buf.len() / SECTOR_SIZE;
        let _guard = self.lock.lock();
        let mut data: Port<u16> = Port::new(self.channel.io_base);

        for sector in 0..count {
            self.channel.setup(self.slave, lba + sector as u64, 1);
            self.channel.command(CMD_WRITE_SECTORS);
            self.channel.wait_data_request()?;

            let base = sector * SECTOR_SIZE;
            for i in 0..SECTOR_SIZE / 2 {
                let word =
                    buf[base + 2 * i] as u16 | ((buf[base + 2 * i + 1] as u16) << 8);
                data.write(word);
            }
            self.channel.command(CMD_CACHE_FLUSH);
            self.channel.wait_not_busy()?;
        }
        Ok(())
    }
}

impl BlockDeviceOps for AtaDrive {
    fn read_sectors(&self, _dev: &BlockDevice, sector: u64, buf: &mut [u8]) -> Result<()> {
        unsafe { self.read(sector, buf) }
    }

    fn write_sectors(&self, _dev: &BlockDevice, sector: u64, buf: &[u8]) -> Result<()> {
        unsafe { self.write(sector, buf) }
    }

    fn flush(&self, _dev: &BlockDevice) -> Result<()> {
        let _guard = self.lock.lock();
        unsafe {
            self.channel.command(CMD_CACHE_FLUSH);
            self.channel.wait_not_busy()?;
        }
        Ok(())
    }
}

/// Probe both channels and register every ATA drive found, then run
/// partition discovery on each.
pub fn init() {
    let channels = [
        (Channel { io_base: PRIMARY_IO, ctrl_base: PRIMARY_CTRL }, ["hda", "hdb"]),
        (Channel { io_base: SECONDARY_IO, ctrl_base: SECONDARY_CTRL }, ["hdc", "hdd"]),
    ];

    for (channel, names) in channels {
        for (i, name) in names.iter().enumerate() {
            let slave = i == 1;
            let sectors = match unsafe { AtaDrive::identify(channel, slave) } {
                Some(s) => s,
                None => continue,
            };
            let drive: &'static AtaDrive = Box::leak(Box::new(AtaDrive {
                channel,
                slave,
                lock: Mutex::new(()),
            }));
            let device = block::register_block_device(BlockDevice::new(
                String::from(*name),
                3,
                i as u32,
                sectors,
                drive,
            ));
            if let Err(e) = block::partition::register_partitions(&device) {
                crate::warn!("ata: partition scan of {} failed: {:?}", device.name, e);
            }
        }
    }
}
