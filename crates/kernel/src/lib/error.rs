// Kernel error handling and errno definitions

/// Error kinds surfaced by the kernel core.
///
/// These are the internal, subsystem-level kinds; the VFS/file-descriptor
/// surface speaks POSIX `Errno` and converts via `From`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// PMM, buddy or heap exhausted
    OutOfMemory,
    /// Path component, FAT entry or partition absent
    NotFound,
    /// Misaligned address, zero-size allocation, FD out of range
    InvalidArgument,
    /// Double-map, double-free, free of a non-tracked frame
    InvalidState,
    /// Block device read/write failure
    IoError,
    /// FAT signature mismatch, bad MBR/GPT metadata
    CorruptedMetadata,
    /// FAT root directory full, no free cluster
    NoSpace,
    /// Operation on the wrong vnode kind
    NotSupported,
}

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    EPERM = 1,       // Operation not permitted
    ENOENT = 2,      // No such file or directory
    EIO = 5,         // I/O error
    EBADF = 9,       // Bad file descriptor
    ENOMEM = 12,     // Out of memory
    EFAULT = 14,     // Bad address
    EBUSY = 16,      // Device or resource busy
    EEXIST = 17,     // File exists
    ENODEV = 19,     // No such device
    ENOTDIR = 20,    // Not a directory
    EISDIR = 21,     // Is a directory
    EINVAL = 22,     // Invalid argument
    EMFILE = 24,     // Too many open files
    ENOSPC = 28,     // No space left on device
    ESPIPE = 29,     // Illegal seek
    EROFS = 30,      // Read-only file system
    ENAMETOOLONG = 36, // File name too long
    ENOSYS = 38,     // Function not implemented
    ENOTEMPTY = 39,  // Directory not empty
    EUCLEAN = 117,   // Structure needs cleaning (corrupted metadata)
}

/// Result type used across the VFS and block layers.
pub type Result<T> = core::result::Result<T, Errno>;

impl From<KernelError> for Errno {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::OutOfMemory => Errno::ENOMEM,
            KernelError::NotFound => Errno::ENOENT,
            KernelError::InvalidArgument => Errno::EINVAL,
            KernelError::InvalidState => Errno::EBUSY,
            KernelError::IoError => Errno::EIO,
            KernelError::CorruptedMetadata => Errno::EUCLEAN,
            KernelError::NoSpace => Errno::ENOSPC,
            KernelError::NotSupported => Errno::ENOSYS,
        }
    }
}

impl Errno {
    pub fn as_isize(self) -> isize {
        -(self as i32 as isize)
    }

    /// Get a static string description of the error
    pub fn description(self) -> &'static str {
        match self {
            Errno::EPERM => "Operation not permitted",
            Errno::ENOENT => "No such file or directory",
            Errno::EIO => "I/O error",
            Errno::EBADF => "Bad file descriptor",
            Errno::ENOMEM => "Out of memory",
            Errno::EFAULT => "Bad address",
            Errno::EBUSY => "Device or resource busy",
            Errno::EEXIST => "File exists",
            Errno::ENODEV => "No such device",
            Errno::ENOTDIR => "Not a directory",
            Errno::EISDIR => "Is a directory",
            Errno::EINVAL => "Invalid argument",
            Errno::EMFILE => "Too many open files",
            Errno::ENOSPC => "No space left on device",
            Errno::ESPIPE => "Illegal seek",
            Errno::EROFS => "Read-only file system",
            Errno::ENAMETOOLONG => "File name too long",
            Errno::ENOSYS => "Function not implemented",
            Errno::ENOTEMPTY => "Directory not empty",
            Errno::EUCLEAN => "Structure needs cleaning",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_error_to_errno() {
        assert_eq!(Errno::from(KernelError::OutOfMemory), Errno::ENOMEM);
        assert_eq!(Errno::from(KernelError::NotFound), Errno::ENOENT);
        assert_eq!(Errno::from(KernelError::CorruptedMetadata), Errno::EUCLEAN);
        assert_eq!(Errno::from(KernelError::NoSpace), Errno::ENOSPC);
    }

    #[test]
    fn test_errno_is_negative_as_isize() {
        assert_eq!(Errno::ENOENT.as_isize(), -2);
        assert_eq!(Errno::EINVAL.as_isize(), -22);
    }
}
