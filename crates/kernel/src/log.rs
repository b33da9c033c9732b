//! Kernel logging
//!
//! Leveled logging with a runtime filter. The formatter only depends on
//! byte sinks: every record goes to COM1, and to the VGA text console once
//! it is registered. Hosted test builds swallow the output.
//!
//! # Usage
//!
//! ```rust,ignore
//! crate::info!("scheduler initialized");
//! crate::warn!("FAT: fs_type string disagrees with cluster count");
//! crate::debug!("buddy: split order {} block at {:#x}", order, addr);
//! ```

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicU8, Ordering};

/// Log level enum
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Critical errors that prevent operation
    Error = 0,
    /// Warning conditions that should be addressed
    Warn = 1,
    /// Informational messages about normal operation
    Info = 2,
    /// Debugging information
    Debug = 3,
    /// Detailed trace information
    Trace = 4,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }

    fn prefix(&self) -> &'static str {
        match self {
            Self::Error => "[ERROR] ",
            Self::Warn => "[WARN]  ",
            Self::Info => "[INFO]  ",
            Self::Debug => "[DEBUG] ",
            Self::Trace => "[TRACE] ",
        }
    }
}

/// Global log level (default: INFO)
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

/// Set global log level
pub fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Get current log level
pub fn get_level() -> LogLevel {
    match LOG_LEVEL.load(Ordering::Relaxed) {
        0 => LogLevel::Error,
        1 => LogLevel::Warn,
        2 => LogLevel::Info,
        3 => LogLevel::Debug,
        _ => LogLevel::Trace,
    }
}

/// Check if a log level is enabled
#[inline]
pub fn is_enabled(level: LogLevel) -> bool {
    level <= get_level()
}

/// Byte sink adapter over the active consoles.
struct Sink;

impl Write for Sink {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        write_bytes(s.as_bytes());
        Ok(())
    }
}

/// Push raw bytes to every active console.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn write_bytes(bytes: &[u8]) {
    crate::arch::x86_64::serial::write_bytes(bytes);
    crate::drivers::vga::write_bytes(bytes);
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn write_bytes(_bytes: &[u8]) {}

/// Emit one formatted record. Used by the level macros; not meant to be
/// called directly.
pub fn log_record(level: LogLevel, args: fmt::Arguments<'_>) {
    if !is_enabled(level) {
        return;
    }
    let mut sink = Sink;
    let _ = sink.write_str(level.prefix());
    let _ = sink.write_fmt(args);
    let _ = sink.write_str("\n");
}

/// Emit formatted text with no level prefix (panic path, register dumps).
pub fn log_raw(args: fmt::Arguments<'_>) {
    let mut sink = Sink;
    let _ = sink.write_fmt(args);
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::log::log_record($crate::log::LogLevel::Error, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::log::log_record($crate::log::LogLevel::Warn, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::log::log_record($crate::log::LogLevel::Info, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::log::log_record($crate::log::LogLevel::Debug, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {
        $crate::log::log_record($crate::log::LogLevel::Trace, format_args!($($arg)*))
    };
}

/// Unprefixed print to the consoles (register dumps, banners).
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {
        $crate::log::log_raw(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kprintln {
    () => { $crate::kprint!("\n") };
    ($($arg:tt)*) => {{
        $crate::log::log_raw(format_args!($($arg)*));
        $crate::kprint!("\n");
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_filtering() {
        set_level(LogLevel::Warn);
        assert!(is_enabled(LogLevel::Error));
        assert!(is_enabled(LogLevel::Warn));
        assert!(!is_enabled(LogLevel::Info));
        set_level(LogLevel::Info);
        assert!(is_enabled(LogLevel::Info));
        assert!(!is_enabled(LogLevel::Debug));
    }

    #[test]
    fn test_level_names() {
        assert_eq!(LogLevel::Error.as_str(), "ERROR");
        assert_eq!(LogLevel::Trace.as_str(), "TRACE");
    }
}
