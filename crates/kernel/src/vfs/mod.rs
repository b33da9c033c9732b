//! Virtual File System
//!
//! The VFS contributes path resolution, reference counting and offset
//! bookkeeping; everything else is delegated to the owning filesystem's
//! vnode operations. Filesystems register a probe function; partition
//! discovery offers every detected partition to each probe in turn and
//! mounts whatever answers.

pub mod devfs;
pub mod fat;
pub mod file;
pub mod mount;
pub mod ramfs;
pub mod vnode;

pub use file::{FdTable, FileDescriptor, OpenFlags, Whence};
pub use mount::{mount, mount_root, resolve, root_vnode};
pub use vnode::{DirEntry, FsPrivate, InodeId, Vnode, VnodeKind, VnodeOps};

use crate::block::BlockDevice;
use crate::lib::error::{Errno, Result};
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

/// A mounted filesystem instance.
pub trait Filesystem: Send + Sync {
    /// Read superblock-level state; called once before the first use.
    fn initialize(&self) -> Result<()>;

    /// The filesystem's root directory.
    fn root_vnode(&self) -> Arc<Vnode>;

    /// Short type name ("ramfs", "fat16", ...).
    fn fs_type(&self) -> &'static str;
}

/// A probe inspects a block device and claims it by returning a
/// filesystem instance.
pub type ProbeFn = fn(&Arc<BlockDevice>) -> Option<Arc<dyn Filesystem>>;

static PROBES: Mutex<Vec<ProbeFn>> = Mutex::new(Vec::new());

/// Register a filesystem probe.
pub fn register_filesystem(probe: ProbeFn) {
    PROBES.lock().push(probe);
}

/// Offer a device to every registered probe; mount the first claimant at
/// `path`.
pub fn probe_and_mount(device: &Arc<BlockDevice>, path: &str) -> Result<&'static str> {
    let probes = PROBES.lock().clone();
    for probe in probes {
        if let Some(fs) = probe(device) {
            fs.initialize()?;
            mount::mount(path, fs.fs_type(), fs.root_vnode())?;
            return Ok(fs.fs_type());
        }
    }
    Err(Errno::ENODEV)
}

/// Global file-descriptor table (single-process model).
static FD_TABLE: Mutex<Option<FdTable>> = Mutex::new(None);

/// Bring up the VFS: FD table, ramfs root with the standard directories,
/// devfs at /dev, and the FAT probe.
pub fn init_vfs() -> Result<()> {
    *FD_TABLE.lock() = Some(FdTable::new());

    let ramfs = ramfs::RamFs::new();
    mount::mount_root(ramfs.fs_type(), ramfs.root_vnode())?;

    mkdir("/dev")?;
    mkdir("/mnt")?;
    mkdir("/tmp")?;

    let devfs = devfs::DevFs::new();
    devfs.initialize()?;
    mount::mount("/dev", devfs.fs_type(), devfs.root_vnode())?;

    register_filesystem(fat::probe);

    crate::info!("vfs: initialized, root is ramfs");
    Ok(())
}

fn with_fds<R>(f: impl FnOnce(&mut FdTable) -> Result<R>) -> Result<R> {
    crate::arch::without_interrupts(|| {
        let mut guard = FD_TABLE.lock();
        match guard.as_mut() {
            Some(table) => f(table),
            None => Err(Errno::ENODEV),
        }
    })
}

/// Open a path, optionally creating it.
pub fn open(path: &str, flags: OpenFlags) -> Result<i32> {
    let vnode = match mount::resolve(path, None) {
        Ok(v) => v,
        Err(Errno::ENOENT) if flags.contains(OpenFlags::O_CREAT) => {
            let (dir, name) = mount::resolve_parent(path, None)?;
            let created = dir.ops.create(&dir, name, VnodeKind::Regular)?;
            dir.attach_child(name, created.clone());
            created
        }
        Err(e) => return Err(e),
    };

    if flags.contains(OpenFlags::O_DIRECTORY) && !vnode.is_dir() {
        return Err(Errno::ENOTDIR);
    }
    if vnode.is_dir() && flags.is_writable() {
        return Err(Errno::EISDIR);
    }

    vnode.ops.open(&vnode, flags)?;

    if flags.contains(OpenFlags::O_TRUNC) && flags.is_writable() {
        vnode.set_size(0);
    }
    let offset = if flags.contains(OpenFlags::O_APPEND) {
        vnode.size()
    } else {
        0
    };

    vnode.inc_open();
    let fd = FileDescriptor {
        vnode: vnode.clone(),
        flags,
        offset,
    };
    match with_fds(|table| table.allocate(fd)) {
        Ok(n) => Ok(n),
        Err(e) => {
            vnode.dec_open();
            Err(e)
        }
    }
}

/// Read from an open descriptor at its cursor.
pub fn read(fd: i32, buf: &mut [u8]) -> Result<usize> {
    let (vnode, offset, readable) = with_fds(|table| {
        let file = table.get(fd)?;
        Ok((file.vnode.clone(), file.offset, file.flags.is_readable()))
    })?;
    if !readable {
        return Err(Errno::EBADF);
    }
    let n = vnode.ops.read(&vnode, offset, buf)?;
    with_fds(|table| {
        if let Ok(file) = table.get_mut(fd) {
            file.offset = offset + n as u64;
        }
        Ok(())
    })?;
    Ok(n)
}

/// Write to an open descriptor at its cursor.
pub fn write(fd: i32, buf: &[u8]) -> Result<usize> {
    let (vnode, offset, writable, append) = with_fds(|table| {
        let file = table.get(fd)?;
        Ok((
            file.vnode.clone(),
            file.offset,
            file.flags.is_writable(),
            file.flags.contains(OpenFlags::O_APPEND),
        ))
    })?;
    if !writable {
        return Err(Errno::EBADF);
    }
    let offset = if append { vnode.size() } else { offset };
    let n = vnode.ops.write(&vnode, offset, buf)?;
    with_fds(|table| {
        if let Ok(file) = table.get_mut(fd) {
            file.offset = offset + n as u64;
        }
        Ok(())
    })?;
    Ok(n)
}

/// Reposition an open descriptor's cursor.
pub fn lseek(fd: i32, offset: i64, whence: Whence) -> Result<u64> {
    with_fds(|table| {
        let file = table.get_mut(fd)?;
        let base = match whence {
            Whence::Set => 0i64,
            Whence::Cur => file.offset as i64,
            Whence::End => file.vnode.size() as i64,
        };
        let target = base.checked_add(offset).ok_or(Errno::EINVAL)?;
        if target < 0 {
            return Err(Errno::EINVAL);
        }
        file.offset = target as u64;
        Ok(file.offset)
    })
}

/// Close a descriptor, dropping its vnode reference.
pub fn close(fd: i32) -> Result<()> {
    let file = with_fds(|table| table.close(fd))?;
    file.vnode.dec_open();
    file.vnode.ops.close(&file.vnode);
    Ok(())
}

/// Create a directory.
pub fn mkdir(path: &str) -> Result<()> {
    let (dir, name) = mount::resolve_parent(path, None)?;
    if dir.cached_child(name).is_some() || mount::lookup_child(&dir, name).is_ok() {
        return Err(Errno::EEXIST);
    }
    let created = dir.ops.create(&dir, name, VnodeKind::Directory)?;
    dir.attach_child(name, created);
    Ok(())
}

/// Remove a file or empty directory.
pub fn unlink(path: &str) -> Result<()> {
    let (dir, name) = mount::resolve_parent(path, None)?;
    let victim = mount::lookup_child(&dir, name)?;
    if victim.is_dir() && victim.child_count() > 0 {
        return Err(Errno::ENOTEMPTY);
    }
    if victim.open_count() > 0 {
        return Err(Errno::EBUSY);
    }
    dir.ops.unlink(&dir, name)?;
    dir.detach_child(name);
    Ok(())
}

/// Rename within a single directory.
pub fn rename(old_path: &str, new_path: &str) -> Result<()> {
    let (old_dir, old_name) = mount::resolve_parent(old_path, None)?;
    let (new_dir, new_name) = mount::resolve_parent(new_path, None)?;
    if !Arc::ptr_eq(&old_dir, &new_dir) {
        // Cross-directory moves are out of scope for this kernel.
        return Err(Errno::ENOSYS);
    }
    mount::lookup_child(&old_dir, old_name)?;
    if old_dir.cached_child(new_name).is_some() {
        return Err(Errno::EEXIST);
    }
    old_dir.ops.rename(&old_dir, old_name, new_name)?;
    old_dir.rename_child(old_name, new_name);
    Ok(())
}

/// List a directory.
pub fn readdir(path: &str) -> Result<Vec<DirEntry>> {
    let dir = mount::resolve(path, None)?;
    if !dir.is_dir() {
        return Err(Errno::ENOTDIR);
    }
    dir.ops.readdir(&dir)
}

/// Open descriptors in the global table (self-test hook).
pub fn open_fd_count() -> usize {
    crate::arch::without_interrupts(|| {
        FD_TABLE.lock().as_ref().map_or(0, |t| t.open_count())
    })
}
