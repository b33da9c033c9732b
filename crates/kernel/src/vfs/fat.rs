//! FAT12/16/32 filesystem driver
//!
//! Layout of a FAT volume:
//!
//! ```text
//! ┌──────────────┬───────────────┬──────────────────┬───────────────┐
//! │ Boot sector  │ FAT #1..#n    │ Root directory   │ Data region   │
//! │ (BPB)        │               │ (FAT12/16 only)  │ (clusters)    │
//! └──────────────┴───────────────┴──────────────────┴───────────────┘
//! ```
//!
//! The FAT type is decided by the total cluster count alone (the
//! canonical rule): < 4085 is FAT12, < 65525 is FAT16, anything larger is
//! FAT32. The BPB's `fs_type` string is only a corroborating signal - a
//! disagreement is logged and ignored.
//!
//! FAT entry access per type:
//!
//! | Type  | Byte offset for cluster c | Extraction                        |
//! |-------|---------------------------|-----------------------------------|
//! | FAT12 | c + c/2                   | low 12 bits if c even, else high  |
//! | FAT16 | c * 2                     | 16-bit word                       |
//! | FAT32 | c * 4                     | low 28 bits of the 32-bit word    |
//!
//! The driver keeps one FAT sector cached at a time; every FAT write is
//! mirrored to all FAT copies. Long file names are not supported -
//! attribute-0x0F entries are skipped.

use super::vnode::{alloc_inode_id, DirEntry, FsPrivate, Vnode, VnodeKind, VnodeOps};
use super::Filesystem;
use crate::block::{BlockDevice, SECTOR_SIZE};
use crate::lib::error::{Errno, Result};
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec;
use alloc::vec::Vec;
use spin::{Mutex, RwLock};

/// Boot-sector signature at offset 510.
const BOOT_SIGNATURE: u16 = 0xAA55;

/// Directory entry attributes.
const ATTR_READ_ONLY: u8 = 0x01;
const ATTR_HIDDEN: u8 = 0x02;
const ATTR_SYSTEM: u8 = 0x04;
const ATTR_VOLUME_ID: u8 = 0x08;
const ATTR_DIRECTORY: u8 = 0x10;
const ATTR_LONG_NAME: u8 = ATTR_READ_ONLY | ATTR_HIDDEN | ATTR_SYSTEM | ATTR_VOLUME_ID;

/// Directory entry byte-0 markers.
const ENTRY_END: u8 = 0x00;
const ENTRY_DELETED: u8 = 0xE5;

/// 32 bytes per directory entry.
const DIR_ENTRY_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatType {
    Fat12,
    Fat16,
    Fat32,
}

impl FatType {
    /// Canonical classification by total cluster count.
    pub fn from_cluster_count(clusters: u32) -> Self {
        if clusters < 4085 {
            FatType::Fat12
        } else if clusters < 65525 {
            FatType::Fat16
        } else {
            FatType::Fat32
        }
    }

    /// First end-of-chain value.
    fn eof_threshold(self) -> u32 {
        match self {
            FatType::Fat12 => 0xFF8,
            FatType::Fat16 => 0xFFF8,
            FatType::Fat32 => 0x0FFF_FFF8,
        }
    }

    /// Bad-cluster marker.
    fn bad_cluster(self) -> u32 {
        match self {
            FatType::Fat12 => 0xFF7,
            FatType::Fat16 => 0xFFF7,
            FatType::Fat32 => 0x0FFF_FFF7,
        }
    }

    /// Value written to terminate a chain.
    fn eof_mark(self) -> u32 {
        match self {
            FatType::Fat12 => 0xFFF,
            FatType::Fat16 => 0xFFFF,
            FatType::Fat32 => 0x0FFF_FFFF,
        }
    }
}

/// Raw 8.3 directory entry.
#[repr(C, packed)]
#[derive(Clone, Copy)]
struct RawDirEntry {
    name: [u8; 8],
    ext: [u8; 3],
    attr: u8,
    nt_reserved: u8,
    create_time_tenth: u8,
    create_time: u16,
    create_date: u16,
    access_date: u16,
    cluster_hi: u16,
    modify_time: u16,
    modify_date: u16,
    cluster_lo: u16,
    file_size: u32,
}

impl RawDirEntry {
    fn first_cluster(&self) -> u32 {
        let hi = self.cluster_hi as u32;
        let lo = self.cluster_lo as u32;
        (hi << 16) | lo
    }

    fn is_long_name(&self) -> bool {
        self.attr & ATTR_LONG_NAME == ATTR_LONG_NAME
    }

    fn is_volume_label(&self) -> bool {
        self.attr & ATTR_VOLUME_ID != 0 && !self.is_long_name()
    }

    fn is_directory(&self) -> bool {
        self.attr & ATTR_DIRECTORY != 0
    }
}

/// Derived volume geometry, cached at probe time.
#[derive(Debug, Clone, Copy)]
pub struct FatGeometry {
    pub fat_type: FatType,
    pub sectors_per_cluster: u32,
    pub reserved_sectors: u32,
    pub fat_count: u32,
    pub sectors_per_fat: u32,
    pub root_dir_entries: u32,
    /// First sector of the first FAT.
    pub fat_start_lba: u64,
    /// First sector of the fixed root directory (FAT12/16).
    pub root_dir_start_lba: u64,
    pub root_dir_sectors: u32,
    /// First sector of the data region (cluster 2).
    pub data_start_lba: u64,
    pub total_clusters: u32,
    pub bytes_per_cluster: usize,
    /// Root directory's first cluster (FAT32 only).
    pub root_cluster: u32,
}

impl FatGeometry {
    /// Derive the geometry from a boot sector. `None` when the sector is
    /// not a plausible FAT BPB.
    pub fn parse(sector: &[u8], device_sectors: u64) -> Option<Self> {
        if sector.len() < 512 {
            return None;
        }
        if u16::from_le_bytes([sector[510], sector[511]]) != BOOT_SIGNATURE {
            return None;
        }

        let bytes_per_sector = u16::from_le_bytes([sector[11], sector[12]]) as u32;
        let sectors_per_cluster = sector[13] as u32;
        let reserved_sectors = u16::from_le_bytes([sector[14], sector[15]]) as u32;
        let fat_count = sector[16] as u32;
        let root_dir_entries = u16::from_le_bytes([sector[17], sector[18]]) as u32;
        let total_sectors_16 = u16::from_le_bytes([sector[19], sector[20]]) as u32;
        let sectors_per_fat_16 = u16::from_le_bytes([sector[22], sector[23]]) as u32;
        let total_sectors_32 =
            u32::from_le_bytes([sector[32], sector[33], sector[34], sector[35]]);
        let sectors_per_fat_32 =
            u32::from_le_bytes([sector[36], sector[37], sector[38], sector[39]]);
        let root_cluster = u32::from_le_bytes([sector[44], sector[45], sector[46], sector[47]]);

        // Only 512-byte sectors are supported by this kernel's block
        // layer; other BPB values are rejected, not misread.
        if bytes_per_sector != SECTOR_SIZE as u32 {
            return None;
        }
        if sectors_per_cluster == 0 || !sectors_per_cluster.is_power_of_two() {
            return None;
        }
        if reserved_sectors == 0 || fat_count == 0 {
            return None;
        }

        let total_sectors = if total_sectors_16 != 0 {
            total_sectors_16
        } else {
            total_sectors_32
        };
        if total_sectors == 0 || total_sectors as u64 > device_sectors {
            return None;
        }

        let sectors_per_fat = if sectors_per_fat_16 != 0 {
            sectors_per_fat_16
        } else {
            sectors_per_fat_32
        };
        if sectors_per_fat == 0 {
            return None;
        }

        let root_dir_sectors =
            (root_dir_entries * DIR_ENTRY_SIZE as u32).div_ceil(SECTOR_SIZE as u32);
        let fat_start_lba = reserved_sectors as u64;
        let root_dir_start_lba = fat_start_lba + (fat_count * sectors_per_fat) as u64;
        let data_start_lba = root_dir_start_lba + root_dir_sectors as u64;

        let data_sectors = total_sectors
            .checked_sub(data_start_lba as u32)?
            / sectors_per_cluster;
        let total_clusters = data_sectors;
        let fat_type = FatType::from_cluster_count(total_clusters);

        Some(Self {
            fat_type,
            sectors_per_cluster,
            reserved_sectors,
            fat_count,
            sectors_per_fat,
            root_dir_entries,
            fat_start_lba,
            root_dir_start_lba,
            root_dir_sectors,
            data_start_lba,
            total_clusters,
            bytes_per_cluster: (sectors_per_cluster as usize) * SECTOR_SIZE,
            root_cluster,
        })
    }

    /// First sector of a data cluster.
    pub fn cluster_to_lba(&self, cluster: u32) -> u64 {
        self.data_start_lba + ((cluster - 2) as u64) * self.sectors_per_cluster as u64
    }

    /// Byte offset of a cluster's FAT entry within the FAT.
    fn fat_entry_offset(&self, cluster: u32) -> usize {
        match self.fat_type {
            FatType::Fat12 => cluster as usize + cluster as usize / 2,
            FatType::Fat16 => cluster as usize * 2,
            FatType::Fat32 => cluster as usize * 4,
        }
    }
}

/// Per-file private data attached to each FAT vnode.
pub struct FatNode {
    pub first_cluster: u32,
    /// Location of the 32-byte directory entry describing this node
    /// (meaningless for the root).
    pub entry_lba: u64,
    pub entry_offset: usize,
    pub is_root: bool,
}

/// The single cached FAT sector (minimal design: one outstanding FAT
/// sector in RAM at a time).
struct FatCache {
    lba: Option<u64>,
    data: Vec<u8>,
}

pub struct FatFilesystem {
    device: Arc<BlockDevice>,
    geo: FatGeometry,
    root: RwLock<Option<Arc<Vnode>>>,
    cache: Mutex<FatCache>,
    fs_type_name: &'static str,
    self_ref: RwLock<Weak<FatFilesystem>>,
}

/// Probe a block device for a FAT filesystem. Registered with the VFS
/// probe registry; partitions are offered here one by one.
pub fn probe(device: &Arc<BlockDevice>) -> Option<Arc<dyn Filesystem>> {
    probe_device(device).map(|fs| fs as Arc<dyn Filesystem>)
}

/// Concrete-typed probe (self tests reach the geometry through this).
pub fn probe_device(device: &Arc<BlockDevice>) -> Option<Arc<FatFilesystem>> {
    let mut sector = vec![0u8; SECTOR_SIZE];
    device.read_sectors(0, &mut sector).ok()?;
    let geo = FatGeometry::parse(&sector, device.capacity_sectors)?;

    // The fs_type string is advisory only; cluster count wins.
    let label_off = if geo.fat_type == FatType::Fat32 { 82 } else { 54 };
    let label = &sector[label_off..label_off + 8];
    let claimed = match label {
        b"FAT12   " => Some(FatType::Fat12),
        b"FAT16   " => Some(FatType::Fat16),
        b"FAT32   " => Some(FatType::Fat32),
        _ => None,
    };
    if let Some(claimed) = claimed {
        if claimed != geo.fat_type {
            crate::warn!(
                "fat: {} fs_type string says {:?} but cluster count says {:?}",
                device.name,
                claimed,
                geo.fat_type
            );
        }
    }

    let fs_type_name = match geo.fat_type {
        FatType::Fat12 => "fat12",
        FatType::Fat16 => "fat16",
        FatType::Fat32 => "fat32",
    };

    crate::info!(
        "fat: {} is {:?} ({} clusters, {} B/cluster)",
        device.name,
        geo.fat_type,
        geo.total_clusters,
        geo.bytes_per_cluster
    );

    let fs = Arc::new(FatFilesystem {
        device: device.clone(),
        geo,
        root: RwLock::new(None),
        cache: Mutex::new(FatCache {
            lba: None,
            data: vec![0u8; SECTOR_SIZE],
        }),
        fs_type_name,
        self_ref: RwLock::new(Weak::new()),
    });
    *fs.self_ref.write() = Arc::downgrade(&fs);
    Some(fs)
}

impl Filesystem for FatFilesystem {
    fn initialize(&self) -> Result<()> {
        let (first_cluster, size) = match self.geo.fat_type {
            FatType::Fat32 => (self.geo.root_cluster, 0),
            _ => (0, (self.geo.root_dir_entries as u64) * DIR_ENTRY_SIZE as u64),
        };
        let ops: Arc<dyn VnodeOps> = Arc::new(FatOps {
            fs: self.self_ref.read().clone(),
        });
        let root = Vnode::new(
            String::from("/"),
            VnodeKind::Directory,
            alloc_inode_id(),
            size,
            FsPrivate::Fat(RwLock::new(FatNode {
                first_cluster,
                entry_lba: 0,
                entry_offset: 0,
                is_root: true,
            })),
            ops,
        );
        *self.root.write() = Some(root);
        Ok(())
    }

    fn root_vnode(&self) -> Arc<Vnode> {
        self.root
            .read()
            .clone()
            .expect("fat root requested before initialize")
    }

    fn fs_type(&self) -> &'static str {
        self.fs_type_name
    }
}

// FAT table access, through the one-sector cache.
impl FatFilesystem {
    fn cache_load(&self, cache: &mut FatCache, lba: u64) -> Result<()> {
        if cache.lba != Some(lba) {
            self.device.read_sectors(lba, &mut cache.data)?;
            cache.lba = Some(lba);
        }
        Ok(())
    }

    fn fat_byte(&self, cache: &mut FatCache, offset: usize) -> Result<u8> {
        let lba = self.geo.fat_start_lba + (offset / SECTOR_SIZE) as u64;
        self.cache_load(cache, lba)?;
        Ok(cache.data[offset % SECTOR_SIZE])
    }

    /// Write one FAT byte, mirrored to every FAT copy.
    fn fat_byte_write(&self, cache: &mut FatCache, offset: usize, value: u8) -> Result<()> {
        let sector_index = (offset / SECTOR_SIZE) as u64;
        let lba = self.geo.fat_start_lba + sector_index;
        self.cache_load(cache, lba)?;
        cache.data[offset % SECTOR_SIZE] = value;
        for copy in 0..self.geo.fat_count as u64 {
            let copy_lba = lba + copy * self.geo.sectors_per_fat as u64;
            self.device.write_sectors(copy_lba, &cache.data)?;
        }
        Ok(())
    }

    /// Read the FAT entry for `cluster`.
    fn fat_entry(&self, cluster: u32) -> Result<u32> {
        let mut cache = self.cache.lock();
        let offset = self.geo.fat_entry_offset(cluster);
        match self.geo.fat_type {
            FatType::Fat12 => {
                let lo = self.fat_byte(&mut cache, offset)? as u32;
                let hi = self.fat_byte(&mut cache, offset + 1)? as u32;
                let value = (hi << 8) | lo;
                Ok(if cluster & 1 == 0 {
                    value & 0xFFF
                } else {
                    value >> 4
                })
            }
            FatType::Fat16 => {
                let lo = self.fat_byte(&mut cache, offset)? as u32;
                let hi = self.fat_byte(&mut cache, offset + 1)? as u32;
                Ok((hi << 8) | lo)
            }
            FatType::Fat32 => {
                let mut value = 0u32;
                for i in 0..4 {
                    value |= (self.fat_byte(&mut cache, offset + i)? as u32) << (8 * i);
                }
                Ok(value & 0x0FFF_FFFF)
            }
        }
    }

    /// Write the FAT entry for `cluster`, mirroring to all copies.
    fn set_fat_entry(&self, cluster: u32, value: u32) -> Result<()> {
        let mut cache = self.cache.lock();
        let offset = self.geo.fat_entry_offset(cluster);
        match self.geo.fat_type {
            FatType::Fat12 => {
                let lo = self.fat_byte(&mut cache, offset)?;
                let hi = self.fat_byte(&mut cache, offset + 1)?;
                let (new_lo, new_hi) = if cluster & 1 == 0 {
                    // Even cluster: low 12 bits.
                    ((value & 0xFF) as u8, (hi & 0xF0) | ((value >> 8) & 0x0F) as u8)
                } else {
                    // Odd cluster: high 12 bits.
                    ((lo & 0x0F) | (((value & 0x0F) as u8) << 4), (value >> 4) as u8)
                };
                self.fat_byte_write(&mut cache, offset, new_lo)?;
                self.fat_byte_write(&mut cache, offset + 1, new_hi)
            }
            FatType::Fat16 => {
                self.fat_byte_write(&mut cache, offset, (value & 0xFF) as u8)?;
                self.fat_byte_write(&mut cache, offset + 1, (value >> 8) as u8)
            }
            FatType::Fat32 => {
                // Preserve the reserved top nibble.
                let old_top = self.fat_byte(&mut cache, offset + 3)? & 0xF0;
                self.fat_byte_write(&mut cache, offset, (value & 0xFF) as u8)?;
                self.fat_byte_write(&mut cache, offset + 1, ((value >> 8) & 0xFF) as u8)?;
                self.fat_byte_write(&mut cache, offset + 2, ((value >> 16) & 0xFF) as u8)?;
                self.fat_byte_write(
                    &mut cache,
                    offset + 3,
                    old_top | ((value >> 24) & 0x0F) as u8,
                )
            }
        }
    }

    fn is_eof(&self, value: u32) -> bool {
        value >= self.geo.fat_type.eof_threshold()
    }

    fn is_bad(&self, value: u32) -> bool {
        value == self.geo.fat_type.bad_cluster()
    }

    /// Follow the chain from `cluster` one step.
    fn next_cluster(&self, cluster: u32) -> Result<Option<u32>> {
        let value = self.fat_entry(cluster)?;
        if self.is_eof(value) || value == 0 {
            return Ok(None);
        }
        if self.is_bad(value) {
            crate::warn!("fat: bad cluster after {}", cluster);
            return Ok(None);
        }
        Ok(Some(value))
    }

    /// Walk `steps` links from `first`.
    fn walk_chain(&self, first: u32, steps: usize) -> Result<Option<u32>> {
        let mut cluster = first;
        for _ in 0..steps {
            match self.next_cluster(cluster)? {
                Some(next) => cluster = next,
                None => return Ok(None),
            }
        }
        Ok(Some(cluster))
    }

    /// Number of clusters in a chain.
    fn chain_len(&self, first: u32) -> Result<usize> {
        if first < 2 {
            return Ok(0);
        }
        let mut len = 1usize;
        let mut cluster = first;
        while let Some(next) = self.next_cluster(cluster)? {
            len += 1;
            cluster = next;
            if len > self.geo.total_clusters as usize {
                return Err(Errno::EUCLEAN); // cycle in the chain
            }
        }
        Ok(len)
    }

    /// Linear scan for the first free FAT entry.
    fn find_free_cluster(&self) -> Result<u32> {
        for cluster in 2..self.geo.total_clusters + 2 {
            if self.fat_entry(cluster)? == 0 {
                return Ok(cluster);
            }
        }
        Err(Errno::ENOSPC)
    }

    /// Allocate a cluster: mark EOF, link from `prev` if given, and zero
    /// its contents on disk.
    fn allocate_cluster(&self, prev: Option<u32>) -> Result<u32> {
        let cluster = self.find_free_cluster()?;
        self.set_fat_entry(cluster, self.geo.fat_type.eof_mark())?;
        if let Some(prev) = prev {
            self.set_fat_entry(prev, cluster)?;
        }
        let zeros = vec![0u8; self.geo.bytes_per_cluster];
        self.device
            .write_sectors(self.geo.cluster_to_lba(cluster), &zeros)?;
        Ok(cluster)
    }

    /// Free a whole chain starting at `first`.
    fn free_chain(&self, first: u32) -> Result<()> {
        let mut cluster = first;
        let mut guard = 0usize;
        while cluster >= 2 {
            let next = self.fat_entry(cluster)?;
            self.set_fat_entry(cluster, 0)?;
            if self.is_eof(next) || next == 0 {
                break;
            }
            cluster = next;
            guard += 1;
            if guard > self.geo.total_clusters as usize {
                return Err(Errno::EUCLEAN);
            }
        }
        Ok(())
    }

    fn read_cluster(&self, cluster: u32, buf: &mut [u8]) -> Result<()> {
        self.device.read_sectors(self.geo.cluster_to_lba(cluster), buf)
    }

    fn write_cluster(&self, cluster: u32, buf: &[u8]) -> Result<()> {
        self.device.write_sectors(self.geo.cluster_to_lba(cluster), buf)
    }

    /// The sectors composing a directory: the fixed root region for
    /// FAT12/16 roots, a cluster chain otherwise.
    fn dir_sectors(&self, node: &FatNode) -> Result<Vec<u64>> {
        let mut sectors = Vec::new();
        if node.is_root && self.geo.fat_type != FatType::Fat32 {
            for i in 0..self.geo.root_dir_sectors as u64 {
                sectors.push(self.geo.root_dir_start_lba + i);
            }
            return Ok(sectors);
        }
        let mut cluster = node.first_cluster;
        let mut guard = 0usize;
        while cluster >= 2 {
            let lba = self.geo.cluster_to_lba(cluster);
            for i in 0..self.geo.sectors_per_cluster as u64 {
                sectors.push(lba + i);
            }
            match self.next_cluster(cluster)? {
                Some(next) => cluster = next,
                None => break,
            }
            guard += 1;
            if guard > self.geo.total_clusters as usize {
                return Err(Errno::EUCLEAN);
            }
        }
        Ok(sectors)
    }

    /// Append one zeroed cluster to a directory, returning its sector.
    /// FAT12/16 fixed roots cannot grow.
    fn extend_directory(&self, node: &mut FatNode) -> Result<u64> {
        if node.is_root && self.geo.fat_type != FatType::Fat32 {
            return Err(Errno::ENOSPC);
        }
        let tail = if node.first_cluster >= 2 {
            let len = self.chain_len(node.first_cluster)?;
            self.walk_chain(node.first_cluster, len - 1)?
        } else {
            None
        };
        let cluster = self.allocate_cluster(tail)?;
        if node.first_cluster < 2 {
            node.first_cluster = cluster;
        }
        Ok(self.geo.cluster_to_lba(cluster))
    }

    /// Rewrite a node's 32-byte directory entry with a new size and
    /// first cluster.
    fn update_dir_entry(&self, node: &FatNode, size: u32, first_cluster: u32) -> Result<()> {
        if node.is_root {
            return Ok(());
        }
        let mut sector = vec![0u8; SECTOR_SIZE];
        self.device.read_sectors(node.entry_lba, &mut sector)?;
        let off = node.entry_offset;
        sector[off + 20..off + 22].copy_from_slice(&((first_cluster >> 16) as u16).to_le_bytes());
        sector[off + 26..off + 28].copy_from_slice(&(first_cluster as u16).to_le_bytes());
        sector[off + 28..off + 32].copy_from_slice(&size.to_le_bytes());
        self.device.write_sectors(node.entry_lba, &sector)
    }
}

/// 8.3 short-name handling.
///
/// Uppercase ASCII, invalid characters replaced with `_`, name truncated
/// to 8 characters and extension to 3.
pub fn to_short_name(name: &str) -> ([u8; 8], [u8; 3]) {
    let (stem, ext) = match name.rfind('.') {
        Some(pos) if pos > 0 => (&name[..pos], &name[pos + 1..]),
        _ => (name, ""),
    };

    let mangle = |c: char| -> u8 {
        let c = c.to_ascii_uppercase();
        match c {
            'A'..='Z' | '0'..='9' | '!' | '#' | '$' | '%' | '&' | '\'' | '(' | ')' | '-'
            | '@' | '^' | '_' | '`' | '{' | '}' | '~' => c as u8,
            _ => b'_',
        }
    };

    let mut name8 = [b' '; 8];
    for (i, c) in stem.chars().take(8).enumerate() {
        name8[i] = mangle(c);
    }
    let mut ext3 = [b' '; 3];
    for (i, c) in ext.chars().take(3).enumerate() {
        ext3[i] = mangle(c);
    }
    (name8, ext3)
}

/// Compose a display name from the raw 8+3 fields.
pub fn format_short_name(name8: &[u8; 8], ext3: &[u8; 3]) -> String {
    let stem: &[u8] = {
        let end = name8.iter().rposition(|&b| b != b' ').map_or(0, |p| p + 1);
        &name8[..end]
    };
    let ext: &[u8] = {
        let end = ext3.iter().rposition(|&b| b != b' ').map_or(0, |p| p + 1);
        &ext3[..end]
    };
    let mut out = String::new();
    for &b in stem {
        out.push(b as char);
    }
    if !ext.is_empty() {
        out.push('.');
        for &b in ext {
            out.push(b as char);
        }
    }
    out
}

/// Vnode operations for FAT volumes. Holds a weak filesystem reference
/// to keep the fs → root → ops chain from becoming a strong cycle.
struct FatOps {
    fs: Weak<FatFilesystem>,
}

impl FatOps {
    fn fs(&self) -> Result<Arc<FatFilesystem>> {
        self.fs.upgrade().ok_or(Errno::ENODEV)
    }
}

fn fat_node<'a>(vnode: &'a Vnode) -> Result<&'a RwLock<FatNode>> {
    match &vnode.fs_private {
        FsPrivate::Fat(node) => Ok(node),
        _ => Err(Errno::EINVAL),
    }
}

/// One live directory slot found during a walk.
struct FoundEntry {
    raw: RawDirEntry,
    lba: u64,
    offset: usize,
}

impl FatFilesystem {
    /// Walk a directory's live entries, applying `visit` until it returns
    /// `Some`. Deleted, LFN and volume-label entries are skipped; the
    /// 0x00 end marker stops the walk.
    fn walk_dir<R>(
        &self,
        node: &FatNode,
        mut visit: impl FnMut(&FoundEntry) -> Option<R>,
    ) -> Result<Option<R>> {
        let mut sector = vec![0u8; SECTOR_SIZE];
        for lba in self.dir_sectors(node)? {
            self.device.read_sectors(lba, &mut sector)?;
            for off in (0..SECTOR_SIZE).step_by(DIR_ENTRY_SIZE) {
                let first_byte = sector[off];
                if first_byte == ENTRY_END {
                    return Ok(None);
                }
                if first_byte == ENTRY_DELETED {
                    continue;
                }
                let raw = unsafe {
                    core::ptr::read_unaligned(sector.as_ptr().add(off) as *const RawDirEntry)
                };
                if raw.is_long_name() || raw.is_volume_label() {
                    continue;
                }
                let found = FoundEntry {
                    raw,
                    lba,
                    offset: off,
                };
                if let Some(r) = visit(&found) {
                    return Ok(Some(r));
                }
            }
        }
        Ok(None)
    }

    /// Find a directory entry by (already mangled) 8.3 name.
    fn find_entry(&self, node: &FatNode, name: &str) -> Result<Option<FoundEntry>> {
        let (name8, ext3) = to_short_name(name);
        self.walk_dir(node, |found| {
            if found.raw.name == name8 && found.raw.ext == ext3 {
                Some(FoundEntry {
                    raw: found.raw,
                    lba: found.lba,
                    offset: found.offset,
                })
            } else {
                None
            }
        })
    }

    /// Find a free 32-byte slot (0x00 or 0xE5), extending the directory
    /// by one cluster when none is left and the directory can grow.
    fn find_free_slot(&self, node: &mut FatNode) -> Result<(u64, usize)> {
        let mut sector = vec![0u8; SECTOR_SIZE];
        for lba in self.dir_sectors(node)? {
            self.device.read_sectors(lba, &mut sector)?;
            for off in (0..SECTOR_SIZE).step_by(DIR_ENTRY_SIZE) {
                if sector[off] == ENTRY_END || sector[off] == ENTRY_DELETED {
                    return Ok((lba, off));
                }
            }
        }
        let lba = self.extend_directory(node)?;
        Ok((lba, 0))
    }

    /// Write a fresh short-name entry into a slot.
    fn write_entry(
        &self,
        lba: u64,
        offset: usize,
        name: &str,
        attr: u8,
        first_cluster: u32,
        size: u32,
    ) -> Result<()> {
        let mut sector = vec![0u8; SECTOR_SIZE];
        self.device.read_sectors(lba, &mut sector)?;

        let (name8, ext3) = to_short_name(name);
        let entry = &mut sector[offset..offset + DIR_ENTRY_SIZE];
        entry.fill(0);
        entry[0..8].copy_from_slice(&name8);
        entry[8..11].copy_from_slice(&ext3);
        entry[11] = attr;
        entry[20..22].copy_from_slice(&((first_cluster >> 16) as u16).to_le_bytes());
        entry[26..28].copy_from_slice(&(first_cluster as u16).to_le_bytes());
        entry[28..32].copy_from_slice(&size.to_le_bytes());

        self.device.write_sectors(lba, &sector)
    }

    /// Build a vnode for a directory entry found on disk.
    fn vnode_from_entry(&self, found: &FoundEntry, ops: Arc<dyn VnodeOps>) -> Arc<Vnode> {
        let kind = if found.raw.is_directory() {
            VnodeKind::Directory
        } else {
            VnodeKind::Regular
        };
        let size = found.raw.file_size;
        Vnode::new(
            format_short_name(&found.raw.name, &found.raw.ext),
            kind,
            alloc_inode_id(),
            size as u64,
            FsPrivate::Fat(RwLock::new(FatNode {
                first_cluster: found.raw.first_cluster(),
                entry_lba: found.lba,
                entry_offset: found.offset,
                is_root: false,
            })),
            ops,
        )
    }
}

impl VnodeOps for FatOps {
    /// Read along the cluster chain, clipped to the file size.
    fn read(&self, vnode: &Vnode, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if vnode.is_dir() {
            return Err(Errno::EISDIR);
        }
        let fs = self.fs()?;
        let node = fat_node(vnode)?.read();

        let size = vnode.size();
        if offset >= size {
            return Ok(0);
        }
        let want = buf.len().min((size - offset) as usize);
        let cluster_size = fs.geo.bytes_per_cluster;

        // Step to the cluster containing `offset`.
        let start_idx = (offset as usize) / cluster_size;
        let mut cluster = match fs.walk_chain(node.first_cluster, start_idx)? {
            Some(c) => c,
            None => return Ok(0), // chain shorter than the size claims
        };

        let mut cluster_buf = vec![0u8; cluster_size];
        let mut copied = 0usize;
        let mut in_cluster = (offset as usize) % cluster_size;

        while copied < want {
            fs.read_cluster(cluster, &mut cluster_buf)?;
            let n = (cluster_size - in_cluster).min(want - copied);
            buf[copied..copied + n].copy_from_slice(&cluster_buf[in_cluster..in_cluster + n]);
            copied += n;
            in_cluster = 0;
            if copied < want {
                match fs.next_cluster(cluster)? {
                    Some(next) => cluster = next,
                    None => break,
                }
            }
        }
        Ok(copied)
    }

    /// Write along the chain, allocating clusters as the chain runs out;
    /// partially-covered clusters go read-modify-write, full ones are
    /// written directly.
    fn write(&self, vnode: &Vnode, offset: u64, buf: &[u8]) -> Result<usize> {
        if vnode.is_dir() {
            return Err(Errno::EISDIR);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let fs = self.fs()?;
        let mut node = fat_node(vnode)?.write();
        let cluster_size = fs.geo.bytes_per_cluster;

        // Ensure the chain reaches the first written cluster, allocating
        // (zeroed) clusters along the way.
        let start_idx = (offset as usize) / cluster_size;
        let mut cluster = if node.first_cluster < 2 {
            let c = fs.allocate_cluster(None)?;
            node.first_cluster = c;
            c
        } else {
            node.first_cluster
        };
        for _ in 0..start_idx {
            cluster = match fs.next_cluster(cluster)? {
                Some(next) => next,
                None => fs.allocate_cluster(Some(cluster))?,
            };
        }

        let mut cluster_buf = vec![0u8; cluster_size];
        let mut written = 0usize;
        let mut in_cluster = (offset as usize) % cluster_size;

        while written < buf.len() {
            let n = (cluster_size - in_cluster).min(buf.len() - written);
            if n == cluster_size {
                // Fully overwritten cluster: write straight through.
                fs.write_cluster(cluster, &buf[written..written + n])?;
            } else {
                fs.read_cluster(cluster, &mut cluster_buf)?;
                cluster_buf[in_cluster..in_cluster + n]
                    .copy_from_slice(&buf[written..written + n]);
                fs.write_cluster(cluster, &cluster_buf)?;
            }
            written += n;
            in_cluster = 0;
            if written < buf.len() {
                cluster = match fs.next_cluster(cluster)? {
                    Some(next) => next,
                    None => fs.allocate_cluster(Some(cluster))?,
                };
            }
        }

        // Extending writes update the directory entry's size field.
        let end = offset + written as u64;
        if end > vnode.size() {
            vnode.set_size(end);
            fs.update_dir_entry(&node, end as u32, node.first_cluster)?;
        } else {
            // First cluster may have changed for a previously-empty file.
            fs.update_dir_entry(&node, vnode.size() as u32, node.first_cluster)?;
        }
        Ok(written)
    }

    fn lookup(&self, dir: &Arc<Vnode>, name: &str) -> Result<Arc<Vnode>> {
        let fs = self.fs()?;
        let node = fat_node(dir)?.read();
        match fs.find_entry(&node, name)? {
            Some(found) => Ok(fs.vnode_from_entry(&found, dir.ops.clone())),
            None => Err(Errno::ENOENT),
        }
    }

    fn create(&self, dir: &Arc<Vnode>, name: &str, kind: VnodeKind) -> Result<Arc<Vnode>> {
        if !matches!(kind, VnodeKind::Regular | VnodeKind::Directory) {
            return Err(Errno::ENOSYS);
        }
        let fs = self.fs()?;
        let mut node = fat_node(dir)?.write();

        if fs.find_entry(&node, name)?.is_some() {
            return Err(Errno::EEXIST);
        }

        let (lba, offset) = fs.find_free_slot(&mut node)?;
        let first_cluster = fs.allocate_cluster(None)?;
        let attr = if kind == VnodeKind::Directory {
            ATTR_DIRECTORY
        } else {
            0
        };
        fs.write_entry(lba, offset, name, attr, first_cluster, 0)?;

        if kind == VnodeKind::Directory {
            // Seed "." and ".." so other readers see a well-formed dir.
            let cluster_lba = fs.geo.cluster_to_lba(first_cluster);
            fs.write_entry(cluster_lba, 0, ".", ATTR_DIRECTORY, first_cluster, 0)?;
            let parent_cluster = if node.is_root { 0 } else { node.first_cluster };
            fs.write_entry(cluster_lba, DIR_ENTRY_SIZE, "..", ATTR_DIRECTORY, parent_cluster, 0)?;
        }

        Ok(Vnode::new(
            String::from(name),
            kind,
            alloc_inode_id(),
            0,
            FsPrivate::Fat(RwLock::new(FatNode {
                first_cluster,
                entry_lba: lba,
                entry_offset: offset,
                is_root: false,
            })),
            dir.ops.clone(),
        ))
    }

    fn readdir(&self, dir: &Arc<Vnode>) -> Result<Vec<DirEntry>> {
        let fs = self.fs()?;
        let node = fat_node(dir)?.read();
        let mut entries = Vec::new();
        fs.walk_dir(&node, |found| {
            entries.push(DirEntry {
                inode_id: 0, // FAT has no inode numbers; synthesized ids live on vnodes
                name: format_short_name(&found.raw.name, &found.raw.ext),
                kind: if found.raw.is_directory() {
                    VnodeKind::Directory
                } else {
                    VnodeKind::Regular
                },
            });
            None::<()>
        })?;
        Ok(entries)
    }

    /// Unlink: 0xE5 the entry and free the cluster chain.
    fn unlink(&self, dir: &Arc<Vnode>, name: &str) -> Result<()> {
        let fs = self.fs()?;
        let node = fat_node(dir)?.read();
        let found = fs.find_entry(&node, name)?.ok_or(Errno::ENOENT)?;

        let mut sector = vec![0u8; SECTOR_SIZE];
        fs.device.read_sectors(found.lba, &mut sector)?;
        sector[found.offset] = ENTRY_DELETED;
        fs.device.write_sectors(found.lba, &sector)?;

        let first = found.raw.first_cluster();
        if first >= 2 {
            fs.free_chain(first)?;
        }
        Ok(())
    }

    /// Same-directory rename: rewrite the 8.3 name in place.
    fn rename(&self, dir: &Arc<Vnode>, old: &str, new: &str) -> Result<()> {
        let fs = self.fs()?;
        let node = fat_node(dir)?.read();
        if fs.find_entry(&node, new)?.is_some() {
            return Err(Errno::EEXIST);
        }
        let found = fs.find_entry(&node, old)?.ok_or(Errno::ENOENT)?;

        let mut sector = vec![0u8; SECTOR_SIZE];
        fs.device.read_sectors(found.lba, &mut sector)?;
        let (name8, ext3) = to_short_name(new);
        sector[found.offset..found.offset + 8].copy_from_slice(&name8);
        sector[found.offset + 8..found.offset + 11].copy_from_slice(&ext3);
        fs.device.write_sectors(found.lba, &sector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::ramdisk::image_device_for_test;

    /// Build a blank FAT image with the given data-region size.
    fn mkfs(
        data_sectors: u32,
        sectors_per_cluster: u8,
        fat32: bool,
        fs_type_label: &[u8; 8],
    ) -> Vec<u8> {
        let reserved: u32 = if fat32 { 32 } else { 1 };
        let fat_count: u32 = 2;
        let root_entries: u32 = if fat32 { 0 } else { 512 };
        let root_sectors = root_entries * 32 / 512;

        let clusters = data_sectors / sectors_per_cluster as u32;
        let entry_bytes: u32 = if fat32 {
            (clusters + 2) * 4
        } else if clusters < 4085 {
            ((clusters + 2) * 3).div_ceil(2)
        } else {
            (clusters + 2) * 2
        };
        let spf = entry_bytes.div_ceil(512);

        let total = reserved + fat_count * spf + root_sectors + data_sectors;
        let mut image = vec![0u8; (total as usize) * 512];

        // BPB
        image[11..13].copy_from_slice(&512u16.to_le_bytes());
        image[13] = sectors_per_cluster;
        image[14..16].copy_from_slice(&(reserved as u16).to_le_bytes());
        image[16] = fat_count as u8;
        image[17..19].copy_from_slice(&(root_entries as u16).to_le_bytes());
        if total < 0x10000 && !fat32 {
            image[19..21].copy_from_slice(&(total as u16).to_le_bytes());
        } else {
            image[32..36].copy_from_slice(&total.to_le_bytes());
        }
        if fat32 {
            image[36..40].copy_from_slice(&spf.to_le_bytes());
            image[44..48].copy_from_slice(&2u32.to_le_bytes()); // root cluster
            image[82..90].copy_from_slice(fs_type_label);
        } else {
            image[22..24].copy_from_slice(&(spf as u16).to_le_bytes());
            image[54..62].copy_from_slice(fs_type_label);
        }
        image[510] = 0x55;
        image[511] = 0xAA;

        // FAT[0], FAT[1] reserved entries in every copy.
        for copy in 0..fat_count {
            let base = ((reserved + copy * spf) as usize) * 512;
            if fat32 {
                image[base..base + 4].copy_from_slice(&0x0FFF_FFF8u32.to_le_bytes());
                image[base + 4..base + 8].copy_from_slice(&0x0FFF_FFFFu32.to_le_bytes());
                // Root directory cluster 2 = EOF.
                image[base + 8..base + 12].copy_from_slice(&0x0FFF_FFFFu32.to_le_bytes());
            } else if clusters < 4085 {
                image[base] = 0xF8;
                image[base + 1] = 0xFF;
                image[base + 2] = 0xFF;
            } else {
                image[base..base + 2].copy_from_slice(&0xFFF8u16.to_le_bytes());
                image[base + 2..base + 4].copy_from_slice(&0xFFFFu16.to_le_bytes());
            }
        }

        image
    }

    fn probe_fs(image: Vec<u8>) -> Arc<FatFilesystem> {
        let dev = image_device_for_test("fat0", image);
        let fs = probe_device(&dev).expect("probe failed");
        fs.initialize().unwrap();
        fs
    }

    #[test]
    fn test_classification_rule() {
        assert_eq!(FatType::from_cluster_count(4084), FatType::Fat12);
        assert_eq!(FatType::from_cluster_count(4085), FatType::Fat16);
        assert_eq!(FatType::from_cluster_count(65524), FatType::Fat16);
        assert_eq!(FatType::from_cluster_count(65525), FatType::Fat32);
    }

    #[test]
    fn test_probe_rejects_non_fat() {
        let dev = image_device_for_test("junk", vec![0u8; 64 * 512]);
        assert!(probe(&dev).is_none());
    }

    #[test]
    fn test_geometry_fat16() {
        let image = mkfs(4200, 1, false, b"FAT16   ");
        let dev = image_device_for_test("g16", image);
        let mut sector = vec![0u8; 512];
        dev.read_sectors(0, &mut sector).unwrap();
        let geo = FatGeometry::parse(&sector, dev.capacity_sectors).unwrap();
        assert_eq!(geo.fat_type, FatType::Fat16);
        assert_eq!(geo.fat_start_lba, 1);
        assert_eq!(geo.root_dir_sectors, 32);
        assert_eq!(
            geo.data_start_lba,
            1 + 2 * geo.sectors_per_fat as u64 + 32
        );
        assert_eq!(geo.cluster_to_lba(2), geo.data_start_lba);
        assert_eq!(geo.cluster_to_lba(5), geo.data_start_lba + 3);
    }

    #[test]
    fn test_short_name_mangling() {
        assert_eq!(to_short_name("hello.txt"), (*b"HELLO   ", *b"TXT"));
        assert_eq!(to_short_name("VeryLongFileName.data"), (*b"VERYLONG", *b"DAT"));
        assert_eq!(to_short_name("no_ext"), (*b"NO_EXT  ", *b"   "));
        assert_eq!(to_short_name("sp ace.a+"), (*b"SP_ACE  ", *b"A_ "));
        assert_eq!(format_short_name(b"HELLO   ", b"TXT"), "HELLO.TXT");
        assert_eq!(format_short_name(b"NOEXT   ", b"   "), "NOEXT");
    }

    #[test]
    fn test_fat12_entry_round_trip() {
        let fs = probe_fs(mkfs(100, 1, false, b"FAT12   "));
        assert_eq!(fs.geo.fat_type, FatType::Fat12);
        // Adjacent 12-bit entries share a byte; both must survive.
        fs.set_fat_entry(2, 0xABC).unwrap();
        fs.set_fat_entry(3, 0x123).unwrap();
        assert_eq!(fs.fat_entry(2).unwrap(), 0xABC);
        assert_eq!(fs.fat_entry(3).unwrap(), 0x123);
        fs.set_fat_entry(2, 0xFFF).unwrap();
        assert_eq!(fs.fat_entry(3).unwrap(), 0x123);
        assert!(fs.is_eof(fs.fat_entry(2).unwrap()));
    }

    #[test]
    fn test_fat16_file_round_trip() {
        let fs = probe_fs(mkfs(4200, 1, false, b"FAT16   "));
        let root = fs.root_vnode();

        let file = root.ops.create(&root, "data.bin", VnodeKind::Regular).unwrap();
        // Write three-and-a-bit clusters worth of patterned bytes.
        let payload: Vec<u8> = (0..1700u32).map(|i| (i % 251) as u8).collect();
        let n = file.ops.write(&file, 0, &payload).unwrap();
        assert_eq!(n, payload.len());
        assert_eq!(file.size(), payload.len() as u64);

        let mut back = vec![0u8; payload.len() + 64];
        let n = file.ops.read(&file, 0, &mut back).unwrap();
        assert_eq!(n, payload.len(), "read clips at file size");
        assert_eq!(&back[..n], &payload[..]);

        // Chain length = ceil(size / cluster_size).
        let node = fat_node(&file).unwrap().read();
        let expected_clusters = payload.len().div_ceil(fs.geo.bytes_per_cluster);
        assert_eq!(fs.chain_len(node.first_cluster).unwrap(), expected_clusters);

        // A fresh lookup sees the persisted size.
        drop(node);
        let again = root.ops.lookup(&root, "DATA.BIN").unwrap();
        assert_eq!(again.size(), payload.len() as u64);
        let n = again.ops.read(&again, 512, &mut back).unwrap();
        assert_eq!(&back[..n], &payload[512..]);
    }

    #[test]
    fn test_fat16_offset_write_and_eof() {
        let fs = probe_fs(mkfs(4200, 1, false, b"FAT16   "));
        let root = fs.root_vnode();
        let file = root.ops.create(&root, "OFF.TXT", VnodeKind::Regular).unwrap();

        file.ops.write(&file, 0, b"Hi Kestrel\n").unwrap();
        let mut buf = [0u8; 32];
        let n = file.ops.read(&file, 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"Hi Kestrel\n");
        // Reading at EOF returns 0.
        assert_eq!(file.ops.read(&file, n as u64, &mut buf).unwrap(), 0);

        // Overwrite in the middle without size change.
        file.ops.write(&file, 3, b"KES").unwrap();
        assert_eq!(file.size(), 11);
        let n = file.ops.read(&file, 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"Hi KEStrel\n");
    }

    #[test]
    fn test_readdir_skips_deleted_and_lfn() {
        let fs = probe_fs(mkfs(4200, 1, false, b"FAT16   "));
        let root = fs.root_vnode();
        root.ops.create(&root, "KEEP.TXT", VnodeKind::Regular).unwrap();
        root.ops.create(&root, "GONE.TXT", VnodeKind::Regular).unwrap();
        root.ops.unlink(&root, "GONE.TXT").unwrap();

        // Hand-plant an LFN entry in the root directory.
        let mut sector = vec![0u8; 512];
        fs.device.read_sectors(fs.geo.root_dir_start_lba, &mut sector).unwrap();
        let slot = 2 * DIR_ENTRY_SIZE;
        sector[slot] = 0x41;
        sector[slot + 11] = ATTR_LONG_NAME;
        fs.device.write_sectors(fs.geo.root_dir_start_lba, &sector).unwrap();

        let entries = root.ops.readdir(&root).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["KEEP.TXT"]);
    }

    #[test]
    fn test_unlink_frees_chain() {
        let fs = probe_fs(mkfs(4200, 1, false, b"FAT16   "));
        let root = fs.root_vnode();
        let file = root.ops.create(&root, "BIG.BIN", VnodeKind::Regular).unwrap();
        let payload = vec![0x5Au8; 3 * 512];
        file.ops.write(&file, 0, &payload).unwrap();

        let first = fat_node(&file).unwrap().read().first_cluster;
        assert_eq!(fs.chain_len(first).unwrap(), 3);

        root.ops.unlink(&root, "BIG.BIN").unwrap();
        // Every chain cluster is free again.
        assert_eq!(fs.fat_entry(first).unwrap(), 0);
        assert!(root.ops.lookup(&root, "BIG.BIN").is_err());

        // The freed clusters are reused by the next allocation.
        let file2 = root.ops.create(&root, "NEW.BIN", VnodeKind::Regular).unwrap();
        let first2 = fat_node(&file2).unwrap().read().first_cluster;
        assert_eq!(first2, first.min(first2));
    }

    #[test]
    fn test_cluster_conservation() {
        // Every allocated cluster is reachable from exactly one directory
        // entry through its chain.
        let fs = probe_fs(mkfs(4200, 1, false, b"FAT16   "));
        let root = fs.root_vnode();
        let names = ["A.BIN", "B.BIN", "C.BIN"];
        let sizes = [700usize, 1500, 512];
        for (name, size) in names.iter().zip(sizes) {
            let f = root.ops.create(&root, name, VnodeKind::Regular).unwrap();
            f.ops.write(&f, 0, &vec![1u8; size]).unwrap();
        }

        // Count allocated clusters in the FAT.
        let mut allocated = 0usize;
        for c in 2..fs.geo.total_clusters + 2 {
            if fs.fat_entry(c).unwrap() != 0 {
                allocated += 1;
            }
        }

        // Count clusters reachable from the directory entries.
        let mut reachable = 0usize;
        let node = fat_node(&root).unwrap().read();
        fs.walk_dir(&node, |found| {
            reachable += fs.chain_len(found.raw.first_cluster()).unwrap();
            None::<()>
        })
        .unwrap();

        assert_eq!(allocated, reachable);
    }

    #[test]
    fn test_subdirectory_create_and_walk() {
        let fs = probe_fs(mkfs(4200, 1, false, b"FAT16   "));
        let root = fs.root_vnode();
        let sub = root.ops.create(&root, "SUB", VnodeKind::Directory).unwrap();
        assert!(sub.is_dir());

        let file = sub.ops.create(&sub, "INNER.TXT", VnodeKind::Regular).unwrap();
        file.ops.write(&file, 0, b"nested").unwrap();

        let found = sub.ops.lookup(&sub, "INNER.TXT").unwrap();
        let mut buf = [0u8; 16];
        let n = found.ops.read(&found, 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"nested");

        // The new directory carries its dot entries.
        let entries = sub.ops.readdir(&sub).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, [".", "..", "INNER.TXT"]);
    }

    #[test]
    fn test_root_full_returns_nospc() {
        let fs = probe_fs(mkfs(600, 1, false, b"FAT12   "));
        let root = fs.root_vnode();
        // The FAT12/16 root holds a fixed 512 entries and cannot grow.
        let mut created = 0;
        for i in 0..513 {
            let name = alloc::format!("F{}.X", i);
            match root.ops.create(&root, &name, VnodeKind::Regular) {
                Ok(_) => created += 1,
                Err(e) => {
                    assert_eq!(e, Errno::ENOSPC);
                    break;
                }
            }
        }
        assert!(created <= 512);
        assert!(created > 0);
    }

    #[test]
    fn test_rename_in_place() {
        let fs = probe_fs(mkfs(4200, 1, false, b"FAT16   "));
        let root = fs.root_vnode();
        let f = root.ops.create(&root, "OLD.TXT", VnodeKind::Regular).unwrap();
        f.ops.write(&f, 0, b"payload").unwrap();

        root.ops.rename(&root, "OLD.TXT", "NEW.TXT").unwrap();
        assert!(root.ops.lookup(&root, "OLD.TXT").is_err());
        let renamed = root.ops.lookup(&root, "NEW.TXT").unwrap();
        assert_eq!(renamed.size(), 7);
    }

    #[test]
    fn test_fat32_root_chain() {
        // Enough clusters to classify as FAT32.
        let fs = probe_fs(mkfs(66000, 1, true, b"FAT32   "));
        assert_eq!(fs.geo.fat_type, FatType::Fat32);
        let root = fs.root_vnode();

        let f = root.ops.create(&root, "DEEP.DAT", VnodeKind::Regular).unwrap();
        let payload = vec![0xA5u8; 1024];
        f.ops.write(&f, 0, &payload).unwrap();

        let found = root.ops.lookup(&root, "DEEP.DAT").unwrap();
        let mut back = vec![0u8; 1024];
        assert_eq!(found.ops.read(&found, 0, &mut back).unwrap(), 1024);
        assert_eq!(back, payload);

        // FAT32 top-nibble reservation: entries mask to 28 bits.
        let node = fat_node(&f).unwrap().read();
        let v = fs.fat_entry(node.first_cluster).unwrap();
        assert!(fs.is_eof(v));
    }
}
