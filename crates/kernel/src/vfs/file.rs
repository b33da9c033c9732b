//! Open files and the file-descriptor table
//!
//! One global table in the single-process model. Slots form a sparse
//! vector; `allocate` always returns the lowest free index, and closing a
//! slot makes its index immediately reusable.

use super::vnode::Vnode;
use crate::lib::error::{Errno, Result};
use alloc::sync::Arc;
use alloc::vec::Vec;

bitflags::bitflags! {
    /// File open flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const O_RDONLY = 0o0;
        const O_WRONLY = 0o1;
        const O_RDWR = 0o2;
        const O_CREAT = 0o100;
        const O_TRUNC = 0o1000;
        const O_APPEND = 0o2000;
        const O_DIRECTORY = 0o200000;
    }
}

impl OpenFlags {
    pub fn is_readable(&self) -> bool {
        (*self & OpenFlags::O_WRONLY).is_empty()
    }

    pub fn is_writable(&self) -> bool {
        self.intersects(OpenFlags::O_WRONLY | OpenFlags::O_RDWR)
    }
}

/// `lseek` origin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

/// One open file: a vnode reference plus the cursor state.
pub struct FileDescriptor {
    pub vnode: Arc<Vnode>,
    pub flags: OpenFlags,
    pub offset: u64,
}

/// Sparse descriptor table.
pub struct FdTable {
    slots: Vec<Option<FileDescriptor>>,
}

/// Hard cap on descriptors, matching the initial slot count.
pub const MAX_FDS: usize = 256;

impl FdTable {
    pub fn new() -> Self {
        let mut slots = Vec::new();
        slots.resize_with(MAX_FDS, || None);
        Self { slots }
    }

    /// Claim the lowest free slot.
    pub fn allocate(&mut self, fd: FileDescriptor) -> Result<i32> {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(fd);
                return Ok(i as i32);
            }
        }
        Err(Errno::EMFILE)
    }

    pub fn get_mut(&mut self, fd: i32) -> Result<&mut FileDescriptor> {
        if fd < 0 || fd as usize >= self.slots.len() {
            return Err(Errno::EBADF);
        }
        self.slots[fd as usize].as_mut().ok_or(Errno::EBADF)
    }

    pub fn get(&self, fd: i32) -> Result<&FileDescriptor> {
        if fd < 0 || fd as usize >= self.slots.len() {
            return Err(Errno::EBADF);
        }
        self.slots[fd as usize].as_ref().ok_or(Errno::EBADF)
    }

    /// Release a slot, returning the descriptor for final bookkeeping.
    pub fn close(&mut self, fd: i32) -> Result<FileDescriptor> {
        if fd < 0 || fd as usize >= self.slots.len() {
            return Err(Errno::EBADF);
        }
        self.slots[fd as usize].take().ok_or(Errno::EBADF)
    }

    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::vnode::{alloc_inode_id, FsPrivate, VnodeKind};

    struct NullOps;

    impl super::super::vnode::VnodeOps for NullOps {
        fn read(&self, _v: &Vnode, _o: u64, _b: &mut [u8]) -> Result<usize> {
            Ok(0)
        }
        fn write(&self, _v: &Vnode, _o: u64, _b: &[u8]) -> Result<usize> {
            Ok(0)
        }
        fn lookup(&self, _d: &Arc<Vnode>, _n: &str) -> Result<Arc<Vnode>> {
            Err(Errno::ENOENT)
        }
        fn create(&self, _d: &Arc<Vnode>, _n: &str, _k: VnodeKind) -> Result<Arc<Vnode>> {
            Err(Errno::ENOSYS)
        }
        fn readdir(&self, _d: &Arc<Vnode>) -> Result<alloc::vec::Vec<super::super::vnode::DirEntry>> {
            Ok(alloc::vec::Vec::new())
        }
        fn unlink(&self, _d: &Arc<Vnode>, _n: &str) -> Result<()> {
            Err(Errno::ENOSYS)
        }
    }

    fn test_fd() -> FileDescriptor {
        let vnode = Vnode::new(
            alloc::string::String::from("f"),
            VnodeKind::Regular,
            alloc_inode_id(),
            0,
            FsPrivate::None,
            Arc::new(NullOps),
        );
        FileDescriptor {
            vnode,
            flags: OpenFlags::O_RDONLY,
            offset: 0,
        }
    }

    #[test]
    fn test_allocate_returns_lowest_free() {
        let mut table = FdTable::new();
        assert_eq!(table.allocate(test_fd()).unwrap(), 0);
        assert_eq!(table.allocate(test_fd()).unwrap(), 1);
        assert_eq!(table.allocate(test_fd()).unwrap(), 2);

        table.close(1).unwrap();
        // The freed middle slot is the lowest again.
        assert_eq!(table.allocate(test_fd()).unwrap(), 1);
        // With no lower hole, allocation continues upward.
        assert_eq!(table.allocate(test_fd()).unwrap(), 3);
    }

    #[test]
    fn test_close_invalidates() {
        let mut table = FdTable::new();
        let fd = table.allocate(test_fd()).unwrap();
        assert!(table.get(fd).is_ok());
        table.close(fd).unwrap();
        assert_eq!(table.get(fd).err(), Some(Errno::EBADF));
        assert_eq!(table.close(fd).err(), Some(Errno::EBADF));
        assert_eq!(table.get(-1).err(), Some(Errno::EBADF));
        assert_eq!(table.get(9999).err(), Some(Errno::EBADF));
    }

    #[test]
    fn test_table_exhaustion() {
        let mut table = FdTable::new();
        for _ in 0..MAX_FDS {
            table.allocate(test_fd()).unwrap();
        }
        assert_eq!(table.allocate(test_fd()).err(), Some(Errno::EMFILE));
        table.close(42).unwrap();
        assert_eq!(table.allocate(test_fd()).unwrap(), 42);
    }

    #[test]
    fn test_offset_updates_persist() {
        let mut table = FdTable::new();
        let fd = table.allocate(test_fd()).unwrap();
        table.get_mut(fd).unwrap().offset = 1234;
        assert_eq!(table.get(fd).unwrap().offset, 1234);
    }
}
