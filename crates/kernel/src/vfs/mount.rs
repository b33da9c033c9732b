//! Mount table and path resolution
//!
//! Paths are `/`-separated; absolute paths start at the earliest-
//! registered root, relative ones at the supplied working directory.
//! `.` is a no-op, `..` moves to the parent (clamped at the root), empty
//! components collapse. Crossing into a mounted filesystem happens when
//! a resolved child is a covered mountpoint; crossing back out works
//! through the mounted root's parent link, which is wired to the
//! mountpoint's parent at mount time.

use super::vnode::Vnode;
use crate::lib::error::{Errno, Result};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::RwLock;

pub struct Mount {
    pub path: String,
    pub fs_type: &'static str,
    pub root: Arc<Vnode>,
    /// The vnode this mount shadows (`None` for the root mount).
    pub covered: Option<Arc<Vnode>>,
}

struct MountTable {
    mounts: Vec<Mount>,
}

static MOUNTS: RwLock<MountTable> = RwLock::new(MountTable { mounts: Vec::new() });

/// Install the root filesystem. Must be the first mount.
pub fn mount_root(fs_type: &'static str, root: Arc<Vnode>) -> Result<()> {
    let mut table = MOUNTS.write();
    if !table.mounts.is_empty() {
        return Err(Errno::EBUSY);
    }
    table.mounts.push(Mount {
        path: String::from("/"),
        fs_type,
        root,
        covered: None,
    });
    crate::info!("vfs: mounted {} at /", fs_type);
    Ok(())
}

/// Mount a filesystem over an existing directory.
pub fn mount(path: &str, fs_type: &'static str, root: Arc<Vnode>) -> Result<()> {
    let covered = resolve(path, None)?;
    if !covered.is_dir() {
        return Err(Errno::ENOTDIR);
    }
    // `..` out of the mounted root lands in the directory containing the
    // mountpoint.
    if let Some(parent) = covered.parent() {
        root.set_parent(&parent);
    }

    let mut table = MOUNTS.write();
    if table.mounts.iter().any(|m| m.path == path) {
        return Err(Errno::EBUSY);
    }
    table.mounts.push(Mount {
        path: String::from(path),
        fs_type,
        root,
        covered: Some(covered),
    });
    crate::info!("vfs: mounted {} at {}", fs_type, path);
    Ok(())
}

/// The global root vnode.
pub fn root_vnode() -> Option<Arc<Vnode>> {
    MOUNTS.read().mounts.first().map(|m| m.root.clone())
}

/// Mount list snapshot as `(path, fs_type)`.
pub fn mount_list() -> Vec<(String, &'static str)> {
    MOUNTS
        .read()
        .mounts
        .iter()
        .map(|m| (m.path.clone(), m.fs_type))
        .collect()
}

/// If `vnode` is covered by a mount, return the mounted root instead.
fn cross_mount(vnode: Arc<Vnode>) -> Arc<Vnode> {
    let table = MOUNTS.read();
    for m in &table.mounts {
        if let Some(covered) = &m.covered {
            if Arc::ptr_eq(covered, &vnode) {
                return m.root.clone();
            }
        }
    }
    vnode
}

/// Look one component up in a directory: child cache first, then the
/// filesystem, caching on success.
pub fn lookup_child(dir: &Arc<Vnode>, name: &str) -> Result<Arc<Vnode>> {
    if !dir.is_dir() {
        return Err(Errno::ENOTDIR);
    }
    if let Some(child) = dir.cached_child(name) {
        return Ok(child);
    }
    let child = dir.ops.lookup(dir, name)?;
    dir.attach_child(name, child.clone());
    Ok(child)
}

/// Resolve a path to a vnode.
pub fn resolve(path: &str, cwd: Option<&Arc<Vnode>>) -> Result<Arc<Vnode>> {
    let root = root_vnode().ok_or(Errno::ENOENT)?;
    let mut current = if path.starts_with('/') {
        root.clone()
    } else {
        cwd.cloned().unwrap_or_else(|| root.clone())
    };

    for component in path.split('/') {
        match component {
            "" | "." => continue,
            ".." => {
                // Clamped at the global root.
                if !Arc::ptr_eq(&current, &root) {
                    if let Some(parent) = current.parent() {
                        current = parent;
                    }
                }
            }
            name => {
                let child = lookup_child(&current, name)?;
                current = cross_mount(child);
            }
        }
    }
    Ok(current)
}

/// Resolve a path into `(parent directory, final component)`.
pub fn resolve_parent<'a>(path: &'a str, cwd: Option<&Arc<Vnode>>) -> Result<(Arc<Vnode>, &'a str)> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(Errno::EINVAL);
    }
    let (dir_part, name) = match trimmed.rfind('/') {
        Some(0) => ("/", &trimmed[1..]),
        Some(pos) => (&trimmed[..pos], &trimmed[pos + 1..]),
        None => (".", trimmed),
    };
    if name.is_empty() || name == "." || name == ".." {
        return Err(Errno::EINVAL);
    }
    if name.len() > 255 {
        return Err(Errno::ENAMETOOLONG);
    }
    let dir = resolve(dir_part, cwd)?;
    if !dir.is_dir() {
        return Err(Errno::ENOTDIR);
    }
    Ok((dir, name))
}
