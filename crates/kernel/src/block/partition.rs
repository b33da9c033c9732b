//! Partition table parsing (MBR and GPT)
//!
//! Discovery reads sectors 0 and 1 and applies this decision table, in
//! order:
//!
//! | Sector 1 starts "EFI PART" | Sector 0 0xAA55 | entry[0] type | Scheme |
//! |----------------------------|-----------------|---------------|--------|
//! | yes                        | any             | any           | GPT    |
//! | no                         | yes             | 0xEE          | GPT (protective MBR, header required) |
//! | no                         | yes             | ≠ 0xEE        | MBR    |
//! | no                         | no              | -             | none   |
//!
//! MBR parsing keeps the four primary entries with a non-zero type and
//! size and follows 0x05/0x0F extended partitions through their EBR
//! chain, one logical partition per EBR. GPT parsing verifies the header
//! and entry-array CRC32s; a mismatch surfaces as corrupted metadata and
//! the disk is treated as unpartitioned.
//!
//! Every detected partition becomes a child block device whose reads and
//! writes translate into the parent's window with bounds checks, and is
//! then offered to the filesystem probe registry.

use super::{BlockDevice, BlockDeviceOps, SECTOR_SIZE};
use crate::lib::error::{Errno, Result};
use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

/// MBR boot signature at offset 510.
const MBR_SIGNATURE: u16 = 0xAA55;

/// GPT header signature.
const GPT_SIGNATURE: [u8; 8] = *b"EFI PART";

/// Partition type for a protective MBR covering a GPT disk.
const MBR_TYPE_GPT_PROTECTIVE: u8 = 0xEE;

/// Extended-partition container types (CHS and LBA flavors).
const MBR_TYPE_EXTENDED_CHS: u8 = 0x05;
const MBR_TYPE_EXTENDED_LBA: u8 = 0x0F;

/// Cap on EBR chain length; a loop in the chain stops here.
const MAX_LOGICAL_PARTITIONS: usize = 128;

/// Partitioning scheme found on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionScheme {
    Mbr,
    Gpt,
    Unknown,
}

/// One detected partition.
#[derive(Debug, Clone)]
pub struct Partition {
    /// Child device name ("hda1", ...)
    pub name: String,
    /// Partition number (1-based)
    pub number: u32,
    /// First sector on the parent device
    pub start_lba: u64,
    /// Length in sectors
    pub sector_count: u64,
    /// MBR type byte (0 for GPT entries)
    pub type_byte: u8,
}

/// MBR partition table entry
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
struct MbrPartitionEntry {
    status: u8,
    first_chs: [u8; 3],
    partition_type: u8,
    last_chs: [u8; 3],
    first_lba: u32,
    sector_count: u32,
}

/// GPT header (LBA 1)
#[repr(C, packed)]
#[derive(Clone, Copy)]
struct GptHeader {
    signature: [u8; 8],
    revision: u32,
    header_size: u32,
    crc32: u32,
    reserved: u32,
    current_lba: u64,
    backup_lba: u64,
    first_usable_lba: u64,
    last_usable_lba: u64,
    disk_guid: [u8; 16],
    partition_entries_lba: u64,
    num_partition_entries: u32,
    partition_entry_size: u32,
    partition_entries_crc32: u32,
}

/// GPT partition entry
#[repr(C, packed)]
#[derive(Clone, Copy)]
struct GptPartitionEntry {
    type_guid: [u8; 16],
    partition_guid: [u8; 16],
    first_lba: u64,
    last_lba: u64,
    attributes: u64,
    name: [u16; 36],
}

/// CRC-32/ISO-HDLC, the checksum GPT uses (reflected, poly 0xEDB88320).
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &b in bytes {
        crc ^= b as u32;
        for _ in 0..8 {
            let lsb = crc & 1;
            crc >>= 1;
            if lsb != 0 {
                crc ^= 0xEDB8_8320;
            }
        }
    }
    !crc
}

fn read_entry(sector: &[u8], index: usize) -> MbrPartitionEntry {
    let offset = 446 + index * 16;
    unsafe { core::ptr::read_unaligned(sector.as_ptr().add(offset) as *const MbrPartitionEntry) }
}

fn mbr_signature_ok(sector: &[u8]) -> bool {
    u16::from_le_bytes([sector[510], sector[511]]) == MBR_SIGNATURE
}

/// Detect the partitioning scheme from sectors 0 and 1.
pub fn detect_scheme(sector0: &[u8], sector1: &[u8]) -> PartitionScheme {
    if sector1[0..8] == GPT_SIGNATURE {
        return PartitionScheme::Gpt;
    }
    if !mbr_signature_ok(sector0) {
        return PartitionScheme::Unknown;
    }
    if read_entry(sector0, 0).partition_type == MBR_TYPE_GPT_PROTECTIVE {
        return PartitionScheme::Gpt;
    }
    PartitionScheme::Mbr
}

/// Probe a device and return its partitions, in on-disk order.
pub fn probe_partitions(device: &Arc<BlockDevice>) -> Result<Vec<Partition>> {
    if device.capacity_sectors < 2 {
        return Ok(Vec::new());
    }

    let mut sector0 = vec![0u8; SECTOR_SIZE];
    device.read_sectors(0, &mut sector0)?;
    let mut sector1 = vec![0u8; SECTOR_SIZE];
    device.read_sectors(1, &mut sector1)?;

    match detect_scheme(&sector0, &sector1) {
        PartitionScheme::Gpt => parse_gpt(device, &sector1),
        PartitionScheme::Mbr => parse_mbr(device, &sector0),
        PartitionScheme::Unknown => {
            crate::info!("partition: no table on {}", device.name);
            Ok(Vec::new())
        }
    }
}

/// Parse a GPT disk. The header and the entry array must both pass their
/// CRC32 before any entry is believed.
fn parse_gpt(device: &Arc<BlockDevice>, header_sector: &[u8]) -> Result<Vec<Partition>> {
    if header_sector[0..8] != GPT_SIGNATURE {
        // Protective MBR promised a GPT but the header is absent.
        crate::warn!("partition: {} has a protective MBR but no GPT header", device.name);
        return Err(Errno::EUCLEAN);
    }

    let header = unsafe {
        core::ptr::read_unaligned(header_sector.as_ptr() as *const GptHeader)
    };

    let header_size = header.header_size as usize;
    if !(92..=SECTOR_SIZE).contains(&header_size) {
        return Err(Errno::EUCLEAN);
    }

    // Header CRC is computed with its own field zeroed.
    let mut header_bytes = header_sector[..header_size].to_vec();
    header_bytes[16..20].fill(0);
    let expected = header.crc32;
    if crc32(&header_bytes) != expected {
        crate::warn!("partition: {} GPT header CRC mismatch", device.name);
        return Err(Errno::EUCLEAN);
    }

    let entry_size = header.partition_entry_size as usize;
    let num_entries = header.num_partition_entries as usize;
    if entry_size < 128 || num_entries == 0 || num_entries > 1024 {
        return Err(Errno::EUCLEAN);
    }

    // Read the whole entry array and check its CRC as one unit.
    let array_bytes = num_entries * entry_size;
    let array_sectors = array_bytes.div_ceil(SECTOR_SIZE);
    let mut array = vec![0u8; array_sectors * SECTOR_SIZE];
    let entries_lba = header.partition_entries_lba;
    device.read_sectors(entries_lba, &mut array)?;

    let expected_array_crc = header.partition_entries_crc32;
    if crc32(&array[..array_bytes]) != expected_array_crc {
        crate::warn!("partition: {} GPT entry array CRC mismatch", device.name);
        return Err(Errno::EUCLEAN);
    }

    let mut partitions = Vec::new();
    for i in 0..num_entries {
        let entry = unsafe {
            core::ptr::read_unaligned(array.as_ptr().add(i * entry_size) as *const GptPartitionEntry)
        };
        // An all-zero type GUID marks an unused slot.
        if entry.type_guid.iter().all(|&b| b == 0) {
            continue;
        }
        let first = entry.first_lba;
        let last = entry.last_lba;
        let number = partitions.len() as u32 + 1;
        partitions.push(Partition {
            name: format!("{}{}", device.name, number),
            number,
            start_lba: first,
            sector_count: last - first + 1,
            type_byte: 0,
        });
    }

    crate::info!(
        "partition: {} GPT with {} partition(s)",
        device.name,
        partitions.len()
    );
    Ok(partitions)
}

/// Parse an MBR disk, following extended partitions through their EBRs.
fn parse_mbr(device: &Arc<BlockDevice>, sector0: &[u8]) -> Result<Vec<Partition>> {
    let mut partitions = Vec::new();
    let mut extended_start: Option<u64> = None;

    for i in 0..4 {
        let entry = read_entry(sector0, i);
        if entry.partition_type == 0 || entry.sector_count == 0 {
            continue;
        }
        if matches!(
            entry.partition_type,
            MBR_TYPE_EXTENDED_CHS | MBR_TYPE_EXTENDED_LBA
        ) {
            extended_start = Some(entry.first_lba as u64);
            continue;
        }
        let number = partitions.len() as u32 + 1;
        partitions.push(Partition {
            name: format!("{}{}", device.name, number),
            number,
            start_lba: entry.first_lba as u64,
            sector_count: entry.sector_count as u64,
            type_byte: entry.partition_type,
        });
    }

    if let Some(container) = extended_start {
        walk_ebr_chain(device, container, &mut partitions)?;
    }

    crate::info!(
        "partition: {} MBR with {} partition(s)",
        device.name,
        partitions.len()
    );
    Ok(partitions)
}

/// Each EBR describes one logical partition (entry 0, relative to the
/// EBR itself) and optionally links to the next EBR (entry 1, relative
/// to the extended container).
fn walk_ebr_chain(
    device: &Arc<BlockDevice>,
    container_start: u64,
    partitions: &mut Vec<Partition>,
) -> Result<()> {
    let mut ebr_lba = container_start;
    let mut sector = vec![0u8; SECTOR_SIZE];

    for _ in 0..MAX_LOGICAL_PARTITIONS {
        if ebr_lba >= device.capacity_sectors {
            break;
        }
        device.read_sectors(ebr_lba, &mut sector)?;
        if !mbr_signature_ok(&sector) {
            crate::warn!("partition: {} EBR at {} lacks signature", device.name, ebr_lba);
            break;
        }

        let logical = read_entry(&sector, 0);
        if logical.partition_type != 0 && logical.sector_count != 0 {
            let number = partitions.len() as u32 + 1;
            partitions.push(Partition {
                name: format!("{}{}", device.name, number),
                number,
                start_lba: ebr_lba + logical.first_lba as u64,
                sector_count: logical.sector_count as u64,
                type_byte: logical.partition_type,
            });
        }

        let link = read_entry(&sector, 1);
        if link.partition_type == 0 || link.sector_count == 0 {
            break;
        }
        ebr_lba = container_start + link.first_lba as u64;
    }
    Ok(())
}

/// Window translation onto the parent device.
struct PartitionOps {
    parent: Arc<BlockDevice>,
    start_lba: u64,
    sector_count: u64,
}

impl BlockDeviceOps for PartitionOps {
    fn read_sectors(&self, dev: &BlockDevice, sector: u64, buf: &mut [u8]) -> Result<()> {
        let count = (buf.len() / dev.sector_size) as u64;
        if sector + count > self.sector_count {
            return Err(Errno::EINVAL);
        }
        self.parent.read_sectors(self.start_lba + sector, buf)
    }

    fn write_sectors(&self, dev: &BlockDevice, sector: u64, buf: &[u8]) -> Result<()> {
        let count = (buf.len() / dev.sector_size) as u64;
        if sector + count > self.sector_count {
            return Err(Errno::EINVAL);
        }
        self.parent.write_sectors(self.start_lba + sector, buf)
    }

    fn flush(&self, _dev: &BlockDevice) -> Result<()> {
        self.parent.flush()
    }
}

/// Build (without registering) a child device for one partition.
pub fn partition_device(parent: &Arc<BlockDevice>, partition: &Partition) -> BlockDevice {
    let ops: &'static PartitionOps = Box::leak(Box::new(PartitionOps {
        parent: parent.clone(),
        start_lba: partition.start_lba,
        sector_count: partition.sector_count,
    }));
    BlockDevice::new(
        partition.name.clone(),
        parent.major,
        partition.number,
        partition.sector_count,
        ops,
    )
}

/// Probe a device and register one child block device per partition.
pub fn register_partitions(parent: &Arc<BlockDevice>) -> Result<Vec<Arc<BlockDevice>>> {
    let partitions = match probe_partitions(parent) {
        Ok(p) => p,
        Err(Errno::EUCLEAN) => {
            // Corrupted metadata: surface nothing rather than guesses.
            return Ok(Vec::new());
        }
        Err(e) => return Err(e),
    };

    let mut devices = Vec::new();
    for partition in &partitions {
        let dev = super::register_block_device(partition_device(parent, partition));
        devices.push(dev);
    }
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::ramdisk::image_device_for_test;

    fn mbr_entry(type_byte: u8, first_lba: u32, count: u32) -> [u8; 16] {
        let mut e = [0u8; 16];
        e[4] = type_byte;
        e[8..12].copy_from_slice(&first_lba.to_le_bytes());
        e[12..16].copy_from_slice(&count.to_le_bytes());
        e
    }

    fn sector_with_entries(entries: &[(usize, [u8; 16])]) -> Vec<u8> {
        let mut s = vec![0u8; SECTOR_SIZE];
        for &(slot, entry) in entries {
            s[446 + slot * 16..446 + slot * 16 + 16].copy_from_slice(&entry);
        }
        s[510] = 0x55;
        s[511] = 0xAA;
        s
    }

    fn gpt_disk(partitions: &[(u64, u64)], corrupt_header: bool, corrupt_array: bool) -> Vec<u8> {
        let total_sectors = 32768u64;
        let mut disk = vec![0u8; total_sectors as usize * SECTOR_SIZE];

        // Protective MBR.
        let pmbr = sector_with_entries(&[(0, mbr_entry(0xEE, 1, (total_sectors - 1) as u32))]);
        disk[0..SECTOR_SIZE].copy_from_slice(&pmbr);

        // Entry array at LBA 2.
        let entry_size = 128usize;
        let num_entries = 128usize;
        let mut array = vec![0u8; entry_size * num_entries];
        for (i, &(first, last)) in partitions.iter().enumerate() {
            let base = i * entry_size;
            array[base] = 0xAF; // any non-zero type GUID
            array[base + 32..base + 40].copy_from_slice(&first.to_le_bytes());
            array[base + 40..base + 48].copy_from_slice(&last.to_le_bytes());
        }
        let mut array_crc = crc32(&array);
        if corrupt_array {
            array_crc ^= 0xFFFF;
        }
        disk[2 * SECTOR_SIZE..2 * SECTOR_SIZE + array.len()].copy_from_slice(&array);

        // Header at LBA 1.
        let mut header = vec![0u8; 92];
        header[0..8].copy_from_slice(b"EFI PART");
        header[8..12].copy_from_slice(&0x00010000u32.to_le_bytes()); // rev 1.0
        header[12..16].copy_from_slice(&92u32.to_le_bytes());
        header[24..32].copy_from_slice(&1u64.to_le_bytes()); // current
        header[72..80].copy_from_slice(&2u64.to_le_bytes()); // entries lba
        header[80..84].copy_from_slice(&(num_entries as u32).to_le_bytes());
        header[84..88].copy_from_slice(&(entry_size as u32).to_le_bytes());
        header[88..92].copy_from_slice(&array_crc.to_le_bytes());
        let mut hcrc = crc32(&header);
        if corrupt_header {
            hcrc ^= 0xFFFF;
        }
        header[16..20].copy_from_slice(&hcrc.to_le_bytes());
        disk[SECTOR_SIZE..SECTOR_SIZE + 92].copy_from_slice(&header);

        disk
    }

    #[test]
    fn test_crc32_known_vector() {
        // The classic check value for CRC-32/ISO-HDLC.
        assert_eq!(crc32(b"123456789"), 0xCBF43926);
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn test_scheme_detection_table() {
        let empty = vec![0u8; SECTOR_SIZE];
        let mut gpt_sector = vec![0u8; SECTOR_SIZE];
        gpt_sector[0..8].copy_from_slice(b"EFI PART");

        let plain_mbr = sector_with_entries(&[(0, mbr_entry(0x83, 2048, 1000))]);
        let protective = sector_with_entries(&[(0, mbr_entry(0xEE, 1, 1000))]);

        assert_eq!(detect_scheme(&empty, &gpt_sector), PartitionScheme::Gpt);
        assert_eq!(detect_scheme(&protective, &empty), PartitionScheme::Gpt);
        assert_eq!(detect_scheme(&plain_mbr, &empty), PartitionScheme::Mbr);
        assert_eq!(detect_scheme(&empty, &empty), PartitionScheme::Unknown);
    }

    #[test]
    fn test_mbr_primary_partitions() {
        let mut disk = vec![0u8; 4096 * SECTOR_SIZE];
        let sector0 = sector_with_entries(&[
            (0, mbr_entry(0x83, 128, 1024)),
            (2, mbr_entry(0x0C, 2048, 512)),
        ]);
        disk[0..SECTOR_SIZE].copy_from_slice(&sector0);
        let dev = image_device_for_test("pd0", disk);

        let parts = probe_partitions(&dev).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!((parts[0].start_lba, parts[0].sector_count), (128, 1024));
        assert_eq!(parts[0].type_byte, 0x83);
        assert_eq!((parts[1].start_lba, parts[1].sector_count), (2048, 512));
        assert_eq!(parts[1].name, "pd02");
    }

    #[test]
    fn test_mbr_extended_chain() {
        let mut disk = vec![0u8; 8192 * SECTOR_SIZE];
        // Primary at 64, extended container at 1000.
        let sector0 = sector_with_entries(&[
            (0, mbr_entry(0x83, 64, 256)),
            (1, mbr_entry(0x05, 1000, 4000)),
        ]);
        disk[0..SECTOR_SIZE].copy_from_slice(&sector0);

        // First EBR at 1000: logical at +64 (128 sectors), link to +2000.
        let ebr1 = sector_with_entries(&[
            (0, mbr_entry(0x83, 64, 128)),
            (1, mbr_entry(0x05, 2000, 1000)),
        ]);
        disk[1000 * SECTOR_SIZE..1001 * SECTOR_SIZE].copy_from_slice(&ebr1);

        // Second EBR at 3000: logical at +32 (64 sectors), end of chain.
        let ebr2 = sector_with_entries(&[(0, mbr_entry(0x83, 32, 64))]);
        disk[3000 * SECTOR_SIZE..3001 * SECTOR_SIZE].copy_from_slice(&ebr2);

        let dev = image_device_for_test("pd1", disk);
        let parts = probe_partitions(&dev).unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!((parts[1].start_lba, parts[1].sector_count), (1064, 128));
        assert_eq!((parts[2].start_lba, parts[2].sector_count), (3032, 64));
    }

    #[test]
    fn test_gpt_two_partitions() {
        // The protective-MBR + GPT layout with two partitions.
        let disk = gpt_disk(&[(2048, 10239), (10240, 20479)], false, false);
        let dev = image_device_for_test("pd2", disk);

        let parts = probe_partitions(&dev).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!((parts[0].start_lba, parts[0].sector_count), (2048, 8192));
        assert_eq!((parts[1].start_lba, parts[1].sector_count), (10240, 10240));
        assert_eq!(parts[0].name, "pd21");
        assert_eq!(parts[1].name, "pd22");
    }

    #[test]
    fn test_gpt_header_crc_enforced() {
        let disk = gpt_disk(&[(2048, 10239)], true, false);
        let dev = image_device_for_test("pd3", disk);
        assert!(matches!(probe_partitions(&dev), Err(Errno::EUCLEAN)));
    }

    #[test]
    fn test_gpt_entry_array_crc_enforced() {
        let disk = gpt_disk(&[(2048, 10239)], false, true);
        let dev = image_device_for_test("pd4", disk);
        assert!(matches!(probe_partitions(&dev), Err(Errno::EUCLEAN)));
    }

    #[test]
    fn test_partition_device_window() {
        let mut disk = vec![0u8; 4096 * SECTOR_SIZE];
        let sector0 = sector_with_entries(&[(0, mbr_entry(0x83, 100, 10))]);
        disk[0..SECTOR_SIZE].copy_from_slice(&sector0);
        // Recognizable byte inside the partition (parent sector 103).
        disk[103 * SECTOR_SIZE] = 0x42;
        let dev = image_device_for_test("pd5", disk);

        let parts = probe_partitions(&dev).unwrap();
        let child = Arc::new(partition_device(&dev, &parts[0]));

        let mut buf = vec![0u8; SECTOR_SIZE];
        child.read_sectors(3, &mut buf).unwrap();
        assert_eq!(buf[0], 0x42);

        // Out-of-window access is refused before reaching the parent.
        assert!(child.read_sectors(10, &mut buf).is_err());

        // Writes land at the translated parent offset.
        buf[0] = 0x99;
        child.write_sectors(0, &buf).unwrap();
        let mut check = vec![0u8; SECTOR_SIZE];
        dev.read_sectors(100, &mut check).unwrap();
        assert_eq!(check[0], 0x99);
    }
}
