//! devfs - device nodes under /dev
//!
//! Exposes every registered block device as a `BlockDevice` vnode whose
//! read/write do byte-granular I/O over the sector interface (bounce
//! buffer for the unaligned edges), plus the `console` character device
//! feeding the kernel log sinks.

use super::vnode::{alloc_inode_id, DirEntry, FsPrivate, Vnode, VnodeKind, VnodeOps};
use super::Filesystem;
use crate::block;
use crate::lib::error::{Errno, Result};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

pub struct DevFs {
    root: Arc<Vnode>,
}

impl DevFs {
    pub fn new() -> Arc<Self> {
        let ops: Arc<dyn VnodeOps> = Arc::new(DevFsOps);
        let root = Vnode::new(
            String::from("dev"),
            VnodeKind::Directory,
            alloc_inode_id(),
            0,
            FsPrivate::None,
            ops,
        );
        Arc::new(Self { root })
    }
}

impl Filesystem for DevFs {
    /// Populate /dev from the block-device registry and add the console.
    fn initialize(&self) -> Result<()> {
        let console = Vnode::new(
            String::from("console"),
            VnodeKind::CharDevice,
            alloc_inode_id(),
            0,
            FsPrivate::Console,
            self.root.ops.clone(),
        );
        self.root.attach_child("console", console);

        for device in block::all_devices() {
            let name = device.name.clone();
            let size = device.capacity_bytes();
            let vnode = Vnode::new(
                name.clone(),
                VnodeKind::BlockDevice,
                alloc_inode_id(),
                size,
                FsPrivate::Block(device),
                self.root.ops.clone(),
            );
            self.root.attach_child(&name, vnode);
        }
        Ok(())
    }

    fn root_vnode(&self) -> Arc<Vnode> {
        self.root.clone()
    }

    fn fs_type(&self) -> &'static str {
        "devfs"
    }
}

struct DevFsOps;

impl VnodeOps for DevFsOps {
    fn read(&self, vnode: &Vnode, offset: u64, buf: &mut [u8]) -> Result<usize> {
        match &vnode.fs_private {
            FsPrivate::Block(device) => block_io(device, offset, buf.len(), |tmp| {
                buf.copy_from_slice(tmp);
            }),
            FsPrivate::Console => Ok(0),
            _ => Err(Errno::EISDIR),
        }
    }

    fn write(&self, vnode: &Vnode, offset: u64, buf: &[u8]) -> Result<usize> {
        match &vnode.fs_private {
            FsPrivate::Block(device) => block_write(device, offset, buf),
            FsPrivate::Console => {
                crate::log::write_bytes(buf);
                Ok(buf.len())
            }
            _ => Err(Errno::EISDIR),
        }
    }

    fn lookup(&self, _dir: &Arc<Vnode>, _name: &str) -> Result<Arc<Vnode>> {
        // Devices are attached at initialize(); the cache is complete.
        Err(Errno::ENOENT)
    }

    fn create(&self, _dir: &Arc<Vnode>, _name: &str, _kind: VnodeKind) -> Result<Arc<Vnode>> {
        Err(Errno::EROFS)
    }

    fn readdir(&self, dir: &Arc<Vnode>) -> Result<Vec<DirEntry>> {
        let mut entries = vec![
            DirEntry {
                inode_id: dir.inode_id,
                name: String::from("."),
                kind: VnodeKind::Directory,
            },
            DirEntry {
                inode_id: dir.parent().map(|p| p.inode_id).unwrap_or(dir.inode_id),
                name: String::from(".."),
                kind: VnodeKind::Directory,
            },
        ];
        for (name, child) in dir.children() {
            entries.push(DirEntry {
                inode_id: child.inode_id,
                name,
                kind: child.kind,
            });
        }
        Ok(entries)
    }

    fn unlink(&self, _dir: &Arc<Vnode>, _name: &str) -> Result<()> {
        Err(Errno::EROFS)
    }
}

/// Byte-granular read over the sector interface: read the covering
/// sector run into a bounce buffer and hand the requested window to the
/// consumer.
fn block_io(
    device: &Arc<block::BlockDevice>,
    offset: u64,
    len: usize,
    mut consume: impl FnMut(&[u8]),
) -> Result<usize> {
    let total = device.capacity_bytes();
    if offset >= total {
        return Ok(0);
    }
    let len = len.min((total - offset) as usize);
    if len == 0 {
        return Ok(0);
    }

    let sector_size = device.sector_size as u64;
    let first = offset / sector_size;
    let last = (offset + len as u64 - 1) / sector_size;
    let count = (last - first + 1) as usize;

    let mut bounce = vec![0u8; count * device.sector_size];
    device.read_sectors(first, &mut bounce)?;

    let skip = (offset - first * sector_size) as usize;
    consume(&bounce[skip..skip + len]);
    Ok(len)
}

/// Byte-granular write with read-modify-write on the partial edges.
fn block_write(device: &Arc<block::BlockDevice>, offset: u64, buf: &[u8]) -> Result<usize> {
    let total = device.capacity_bytes();
    if offset >= total {
        return Err(Errno::ENOSPC);
    }
    let len = buf.len().min((total - offset) as usize);
    if len == 0 {
        return Ok(0);
    }

    let sector_size = device.sector_size as u64;
    let first = offset / sector_size;
    let last = (offset + len as u64 - 1) / sector_size;
    let count = (last - first + 1) as usize;

    let mut bounce = vec![0u8; count * device.sector_size];
    device.read_sectors(first, &mut bounce)?;

    let skip = (offset - first * sector_size) as usize;
    bounce[skip..skip + len].copy_from_slice(&buf[..len]);
    device.write_sectors(first, &bounce)?;
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::ramdisk::ram_device_for_test;

    #[test]
    fn test_block_byte_io_unaligned() {
        let dev = ram_device_for_test("dv0", 4);
        // Write across a sector boundary at an odd offset.
        let n = block_write(&dev, 510, b"abcd").unwrap();
        assert_eq!(n, 4);

        let mut back = [0u8; 4];
        let n = block_io(&dev, 510, 4, |window| back.copy_from_slice(window)).unwrap();
        assert_eq!(n, 4);
        assert_eq!(&back, b"abcd");
    }

    #[test]
    fn test_block_io_clips_at_device_end() {
        let dev = ram_device_for_test("dv1", 2);
        let mut seen = 0usize;
        let n = block_io(&dev, 1000, 100, |window| seen = window.len()).unwrap();
        assert_eq!(n, 24); // 1024 - 1000
        assert_eq!(seen, 24);
        assert_eq!(block_io(&dev, 5000, 8, |_| {}).unwrap(), 0);
    }
}
