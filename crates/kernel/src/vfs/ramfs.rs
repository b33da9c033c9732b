//! ramfs - the in-memory root filesystem
//!
//! Directories live entirely in the vnode child cache; file content is a
//! `Vec<u8>` in the vnode's private data. There is no backing store, so
//! `lookup` misses are final and `unlink` has nothing to do beyond the
//! cache detach the VFS performs.

use super::vnode::{alloc_inode_id, DirEntry, FsPrivate, Vnode, VnodeKind, VnodeOps};
use super::Filesystem;
use crate::lib::error::{Errno, Result};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::RwLock;

pub struct RamFs {
    root: Arc<Vnode>,
}

impl RamFs {
    pub fn new() -> Arc<Self> {
        let ops: Arc<dyn VnodeOps> = Arc::new(RamFsOps);
        let root = Vnode::new(
            String::from("/"),
            VnodeKind::Directory,
            1,
            0,
            FsPrivate::None,
            ops,
        );
        Arc::new(Self { root })
    }
}

impl Filesystem for RamFs {
    fn initialize(&self) -> Result<()> {
        Ok(())
    }

    fn root_vnode(&self) -> Arc<Vnode> {
        self.root.clone()
    }

    fn fs_type(&self) -> &'static str {
        "ramfs"
    }
}

struct RamFsOps;

impl VnodeOps for RamFsOps {
    fn read(&self, vnode: &Vnode, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let data = match &vnode.fs_private {
            FsPrivate::Ram(data) => data.read(),
            _ => return Err(Errno::EISDIR),
        };
        let len = data.len() as u64;
        if offset >= len {
            return Ok(0);
        }
        let n = buf.len().min((len - offset) as usize);
        buf[..n].copy_from_slice(&data[offset as usize..offset as usize + n]);
        Ok(n)
    }

    fn write(&self, vnode: &Vnode, offset: u64, buf: &[u8]) -> Result<usize> {
        let mut data = match &vnode.fs_private {
            FsPrivate::Ram(data) => data.write(),
            _ => return Err(Errno::EISDIR),
        };
        let end = offset as usize + buf.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[offset as usize..end].copy_from_slice(buf);
        vnode.set_size(data.len() as u64);
        Ok(buf.len())
    }

    fn lookup(&self, _dir: &Arc<Vnode>, _name: &str) -> Result<Arc<Vnode>> {
        // The child cache is the only storage there is.
        Err(Errno::ENOENT)
    }

    fn create(&self, dir: &Arc<Vnode>, name: &str, kind: VnodeKind) -> Result<Arc<Vnode>> {
        let fs_private = match kind {
            VnodeKind::Regular => FsPrivate::Ram(RwLock::new(Vec::new())),
            VnodeKind::Directory => FsPrivate::None,
            _ => return Err(Errno::ENOSYS),
        };
        let vnode = Vnode::new(
            String::from(name),
            kind,
            alloc_inode_id(),
            0,
            fs_private,
            dir.ops.clone(),
        );
        Ok(vnode)
    }

    fn readdir(&self, dir: &Arc<Vnode>) -> Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        entries.push(DirEntry {
            inode_id: dir.inode_id,
            name: String::from("."),
            kind: VnodeKind::Directory,
        });
        let parent_id = dir.parent().map(|p| p.inode_id).unwrap_or(dir.inode_id);
        entries.push(DirEntry {
            inode_id: parent_id,
            name: String::from(".."),
            kind: VnodeKind::Directory,
        });
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
        // Dropping the cached strong reference frees the node.
        Ok(())
    }

    fn rename(&self, _dir: &Arc<Vnode>, _old: &str, _new: &str) -> Result<()> {
        // Names only exist in the cache.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_root() -> Arc<Vnode> {
        RamFs::new().root_vnode()
    }

    fn create_file(dir: &Arc<Vnode>, name: &str) -> Arc<Vnode> {
        let node = dir.ops.create(dir, name, VnodeKind::Regular).unwrap();
        dir.attach_child(name, node.clone());
        node
    }

    #[test]
    fn test_file_write_read_round_trip() {
        let root = fresh_root();
        let file = create_file(&root, "hello.txt");

        let n = file.ops.write(&file, 0, b"hello world").unwrap();
        assert_eq!(n, 11);
        assert_eq!(file.size(), 11);

        let mut buf = [0u8; 32];
        let n = file.ops.read(&file, 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello world");

        // Reads past EOF return zero bytes.
        assert_eq!(file.ops.read(&file, 100, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_sparse_write_zero_fills() {
        let root = fresh_root();
        let file = create_file(&root, "sparse");
        file.ops.write(&file, 4, b"xy").unwrap();
        assert_eq!(file.size(), 6);
        let mut buf = [0xFFu8; 6];
        file.ops.read(&file, 0, &mut buf).unwrap();
        assert_eq!(&buf, &[0, 0, 0, 0, b'x', b'y']);
    }

    #[test]
    fn test_directory_tree_and_parent_links() {
        let root = fresh_root();
        let sub = root.ops.create(&root, "sub", VnodeKind::Directory).unwrap();
        root.attach_child("sub", sub.clone());
        let file = create_file(&sub, "f");

        assert!(Arc::ptr_eq(&file.parent().unwrap(), &sub));
        assert!(Arc::ptr_eq(&sub.parent().unwrap(), &root));
        assert!(root.parent().is_none());

        let entries = root.ops.readdir(&root).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, [".", "..", "sub"]);
    }

    #[test]
    fn test_readdir_preserves_insertion_order() {
        let root = fresh_root();
        for name in ["c", "a", "b"] {
            create_file(&root, name);
        }
        let entries = root.ops.readdir(&root).unwrap();
        let names: Vec<_> = entries[2..].iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["c", "a", "b"]);
    }

    #[test]
    fn test_directory_read_rejected() {
        let root = fresh_root();
        let mut buf = [0u8; 8];
        assert_eq!(root.ops.read(&root, 0, &mut buf).err(), Some(Errno::EISDIR));
    }
}
