//! Vnode - the in-memory representation of a filesystem object
//!
//! A directory owns its children as `(name, strong-ref)` pairs in
//! insertion order; the child's back-pointer to the parent is weak, so
//! the parent/child cycle cannot leak. A vnode lives as long as someone
//! holds a strong reference (its parent directory, an open file
//! descriptor, or a mount); when the last reference drops the node goes
//! with it.
//!
//! Operations dispatch through the owning filesystem's [`VnodeOps`]; the
//! VFS layer itself only contributes the child cache, the parent links
//! and open counting.

use crate::lib::error::{Errno, Result};
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin::RwLock;

/// Inode number type
pub type InodeId = u64;

/// Global inode number allocator (1 is reserved for roots).
static NEXT_INODE_ID: AtomicU64 = AtomicU64::new(2);

/// Allocate a fresh inode number.
pub fn alloc_inode_id() -> InodeId {
    NEXT_INODE_ID.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VnodeKind {
    Regular,
    Directory,
    BlockDevice,
    CharDevice,
    Symlink,
}

/// Directory entry returned by readdir
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub inode_id: InodeId,
    pub name: String,
    pub kind: VnodeKind,
}

/// Per-filesystem payload attached to a vnode.
pub enum FsPrivate {
    None,
    /// In-RAM file content (ramfs)
    Ram(RwLock<Vec<u8>>),
    /// FAT bookkeeping (first cluster, directory-entry location)
    Fat(RwLock<super::fat::FatNode>),
    /// A device node exposing a block device
    Block(Arc<crate::block::BlockDevice>),
    /// The console character device
    Console,
}

pub struct Vnode {
    pub name: RwLock<String>,
    pub kind: VnodeKind,
    pub inode_id: InodeId,
    size: AtomicU64,
    parent: RwLock<Weak<Vnode>>,
    /// Ordered `(name, child)` pairs; only meaningful for directories.
    children: RwLock<Vec<(String, Arc<Vnode>)>>,
    pub fs_private: FsPrivate,
    pub ops: Arc<dyn VnodeOps>,
    /// Open file descriptors referencing this vnode.
    open_count: AtomicU32,
}

impl Vnode {
    pub fn new(
        name: String,
        kind: VnodeKind,
        inode_id: InodeId,
        size: u64,
        fs_private: FsPrivate,
        ops: Arc<dyn VnodeOps>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: RwLock::new(name),
            kind,
            inode_id,
            size: AtomicU64::new(size),
            parent: RwLock::new(Weak::new()),
            children: RwLock::new(Vec::new()),
            fs_private,
            ops,
            open_count: AtomicU32::new(0),
        })
    }

    pub fn is_dir(&self) -> bool {
        self.kind == VnodeKind::Directory
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn set_size(&self, size: u64) {
        self.size.store(size, Ordering::Release);
    }

    pub fn parent(&self) -> Option<Arc<Vnode>> {
        self.parent.read().upgrade()
    }

    pub fn set_parent(&self, parent: &Arc<Vnode>) {
        *self.parent.write() = Arc::downgrade(parent);
    }

    /// Cached child lookup; does not consult the filesystem.
    pub fn cached_child(&self, name: &str) -> Option<Arc<Vnode>> {
        self.children
            .read()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
    }

    /// Attach a child, wiring its parent back-reference.
    pub fn attach_child(self: &Arc<Self>, name: &str, child: Arc<Vnode>) {
        child.set_parent(self);
        self.children
            .write()
            .push((String::from(name), child));
    }

    /// Detach a child by name; the caller holds the last directory ref.
    pub fn detach_child(&self, name: &str) -> Option<Arc<Vnode>> {
        let mut children = self.children.write();
        let pos = children.iter().position(|(n, _)| n == name)?;
        Some(children.remove(pos).1)
    }

    /// Rename a cached child in place.
    pub fn rename_child(&self, old: &str, new: &str) -> bool {
        let mut children = self.children.write();
        if children.iter().any(|(n, _)| n == new) {
            return false;
        }
        match children.iter_mut().find(|(n, _)| n == old) {
            Some(slot) => {
                slot.0 = String::from(new);
                *slot.1.name.write() = String::from(new);
                true
            }
            None => false,
        }
    }

    /// Snapshot of the child list.
    pub fn children(&self) -> Vec<(String, Arc<Vnode>)> {
        self.children.read().clone()
    }

    pub fn child_count(&self) -> usize {
        self.children.read().len()
    }

    pub fn open_count(&self) -> u32 {
        self.open_count.load(Ordering::Acquire)
    }

    pub fn inc_open(&self) {
        self.open_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn dec_open(&self) {
        self.open_count.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Operations every filesystem implements for its vnodes.
///
/// `dir`-taking operations are only called on directories; the VFS layer
/// has already checked the kind.
pub trait VnodeOps: Send + Sync {
    fn read(&self, vnode: &Vnode, offset: u64, buf: &mut [u8]) -> Result<usize>;

    fn write(&self, vnode: &Vnode, offset: u64, buf: &[u8]) -> Result<usize>;

    fn open(&self, vnode: &Vnode, flags: super::file::OpenFlags) -> Result<()> {
        let _ = (vnode, flags);
        Ok(())
    }

    fn close(&self, vnode: &Vnode) {
        let _ = vnode;
    }

    /// Look a name up on the backing store (the VFS consults the child
    /// cache first).
    fn lookup(&self, dir: &Arc<Vnode>, name: &str) -> Result<Arc<Vnode>>;

    /// Create a regular file or directory.
    fn create(&self, dir: &Arc<Vnode>, name: &str, kind: VnodeKind) -> Result<Arc<Vnode>>;

    fn readdir(&self, dir: &Arc<Vnode>) -> Result<Vec<DirEntry>>;

    fn unlink(&self, dir: &Arc<Vnode>, name: &str) -> Result<()>;

    /// Rename within one directory.
    fn rename(&self, dir: &Arc<Vnode>, old: &str, new: &str) -> Result<()> {
        let _ = (dir, old, new);
        Err(Errno::ENOSYS)
    }
}
