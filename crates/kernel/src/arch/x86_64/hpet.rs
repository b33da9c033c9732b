//! # HPET (High Precision Event Timer)
//!
//! The HPET is discovered through its ACPI table, which reports a 4 KiB
//! MMIO block (inside the identity map). Only the main counter is used:
//! it provides a monotonic reference with a period reported in
//! femtoseconds, good for sanity-checking the calibrated APIC timer and
//! for sub-tick delays.
//!
//! ## Register block (byte offsets)
//!
//! ```text
//! 0x000  General Capabilities / ID  (bits 63:32 = counter period, fs)
//! 0x010  General Configuration      (bit 0 = enable)
//! 0x0F0  Main Counter Value
//! ```
//!
//! Comparator interrupts are not programmed; the tick comes from the PIT
//! or the APIC timer.

use core::ptr::{read_volatile, write_volatile};
use core::sync::atomic::{AtomicU64, Ordering};

const REG_CAPABILITIES: u64 = 0x000;
const REG_CONFIGURATION: u64 = 0x010;
const REG_MAIN_COUNTER: u64 = 0x0F0;

/// General configuration: overall enable.
const CFG_ENABLE: u64 = 1 << 0;

/// MMIO base once initialized (0 = absent).
static HPET_BASE: AtomicU64 = AtomicU64::new(0);
/// Main counter period in femtoseconds.
static HPET_PERIOD_FS: AtomicU64 = AtomicU64::new(0);

unsafe fn read_reg(offset: u64) -> u64 {
    let base = HPET_BASE.load(Ordering::Relaxed);
    read_volatile((base + offset) as *const u64)
}

unsafe fn write_reg(offset: u64, value: u64) {
    let base = HPET_BASE.load(Ordering::Relaxed);
    write_volatile((base + offset) as *mut u64, value);
}

/// Enable the HPET main counter at the ACPI-reported base.
///
/// # Safety
///
/// `base` must be the HPET MMIO block and must be mapped.
pub unsafe fn init(base: u64) {
    HPET_BASE.store(base, Ordering::Relaxed);

    let caps = read_reg(REG_CAPABILITIES);
    let period_fs = caps >> 32;
    if period_fs == 0 || period_fs > 100_000_000 {
        // Period of zero or >100ns signals a broken table.
        crate::warn!("hpet: implausible period {} fs, ignoring device", period_fs);
        HPET_BASE.store(0, Ordering::Relaxed);
        return;
    }
    HPET_PERIOD_FS.store(period_fs, Ordering::Relaxed);

    let cfg = read_reg(REG_CONFIGURATION);
    write_reg(REG_CONFIGURATION, cfg | CFG_ENABLE);

    crate::info!(
        "hpet: enabled at {:#x}, period {} fs ({} MHz)",
        base,
        period_fs,
        1_000_000_000 / period_fs.max(1)
    );
}

/// Is an HPET available and running?
pub fn available() -> bool {
    HPET_BASE.load(Ordering::Relaxed) != 0
}

/// Raw main counter value.
pub fn counter() -> u64 {
    if !available() {
        return 0;
    }
    unsafe { read_reg(REG_MAIN_COUNTER) }
}

/// Nanoseconds since the counter was enabled.
pub fn elapsed_ns() -> u64 {
    let period = HPET_PERIOD_FS.load(Ordering::Relaxed);
    if period == 0 {
        return 0;
    }
    counter().saturating_mul(period) / 1_000_000
}

/// Busy-wait using the main counter.
pub fn busy_wait_ms(ms: u64) {
    let start = elapsed_ns();
    let target = start + ms * 1_000_000;
    while elapsed_ns() < target {
        core::hint::spin_loop();
    }
}
