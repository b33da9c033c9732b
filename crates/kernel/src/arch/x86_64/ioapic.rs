//! # IO-APIC
//!
//! The IO-APIC routes external interrupt lines (GSIs) to local APIC
//! vectors. Its MMIO window is two registers: an index at offset 0x00 and
//! a data window at 0x10; everything else is indirect.
//!
//! ```text
//! Index 0x00  ID
//! Index 0x01  Version (bits 16-23 = max redirection entry)
//! Index 0x10 + 2*n  Redirection entry n, low dword
//! Index 0x11 + 2*n  Redirection entry n, high dword
//! ```
//!
//! A redirection entry:
//!
//! ```text
//! bits 0-7    vector
//! bits 8-10   delivery mode (0 = fixed)
//! bit  11     destination mode (0 = physical)
//! bit  13     polarity (0 = active high)
//! bit  15     trigger (0 = edge)
//! bit  16     mask
//! bits 56-63  destination APIC ID (high dword bits 24-31)
//! ```
//!
//! Every entry starts masked; a line opens only when a handler has been
//! registered for its vector. Entries are written low dword first so the
//! mask bit lands before the destination changes.
//!
//! The base address comes from the MADT (0xFEC00000 architecturally).

use core::ptr::{read_volatile, write_volatile};

const IOREGSEL: u64 = 0x00;
const IOWIN: u64 = 0x10;

const REG_VERSION: u32 = 0x01;
const REG_REDIR_BASE: u32 = 0x10;

/// Redirection entry: mask bit.
const REDIR_MASKED: u64 = 1 << 16;

pub struct IoApic {
    base: u64,
    /// First GSI this IO-APIC serves.
    gsi_base: u32,
    /// Number of redirection entries.
    entries: u32,
}

impl IoApic {
    /// Bring up an IO-APIC at `base` with every line masked.
    ///
    /// # Safety
    ///
    /// `base` must be the IO-APIC MMIO block reported by the MADT and
    /// must be mapped.
    pub unsafe fn new(base: u64, gsi_base: u32) -> Self {
        let mut ioapic = Self {
            base,
            gsi_base,
            entries: 0,
        };
        let version = ioapic.read(REG_VERSION);
        ioapic.entries = ((version >> 16) & 0xFF) + 1;

        for entry in 0..ioapic.entries {
            ioapic.write_redirect(entry, REDIR_MASKED);
        }

        crate::info!(
            "ioapic: base {:#x}, GSI {}..{}, {} entries masked",
            base,
            gsi_base,
            gsi_base + ioapic.entries - 1,
            ioapic.entries
        );
        ioapic
    }

    unsafe fn read(&self, reg: u32) -> u32 {
        write_volatile((self.base + IOREGSEL) as *mut u32, reg);
        read_volatile((self.base + IOWIN) as *const u32)
    }

    unsafe fn write(&self, reg: u32, value: u32) {
        write_volatile((self.base + IOREGSEL) as *mut u32, reg);
        write_volatile((self.base + IOWIN) as *mut u32, value);
    }

    /// Write one 64-bit redirection entry, low half first.
    unsafe fn write_redirect(&self, entry: u32, value: u64) {
        let reg = REG_REDIR_BASE + 2 * entry;
        self.write(reg, value as u32);
        self.write(reg + 1, (value >> 32) as u32);
    }

    unsafe fn read_redirect(&self, entry: u32) -> u64 {
        let reg = REG_REDIR_BASE + 2 * entry;
        let low = self.read(reg) as u64;
        let high = self.read(reg + 1) as u64;
        (high << 32) | low
    }

    /// Does this IO-APIC serve the GSI?
    pub fn serves(&self, gsi: u32) -> bool {
        gsi >= self.gsi_base && gsi < self.gsi_base + self.entries
    }

    /// Route a GSI to a vector on a destination APIC, edge-triggered,
    /// active-high, fixed delivery - still masked.
    pub fn configure(&self, gsi: u32, vector: u8, dest_apic_id: u32) {
        if !self.serves(gsi) {
            return;
        }
        let entry = gsi - self.gsi_base;
        let value = vector as u64 | REDIR_MASKED | ((dest_apic_id as u64) << 56);
        unsafe {
            self.write_redirect(entry, value);
        }
    }

    /// Unmask a GSI. The caller guarantees a handler is registered.
    pub fn unmask(&self, gsi: u32) {
        if !self.serves(gsi) {
            return;
        }
        let entry = gsi - self.gsi_base;
        unsafe {
            let value = self.read_redirect(entry);
            self.write_redirect(entry, value & !REDIR_MASKED);
        }
    }

    /// Mask a GSI.
    pub fn mask(&self, gsi: u32) {
        if !self.serves(gsi) {
            return;
        }
        let entry = gsi - self.gsi_base;
        unsafe {
            let value = self.read_redirect(entry);
            self.write_redirect(entry, value | REDIR_MASKED);
        }
    }

    /// Mask every line (controller teardown).
    pub fn mask_all(&self) {
        for entry in 0..self.entries {
            unsafe {
                let value = self.read_redirect(entry);
                self.write_redirect(entry, value | REDIR_MASKED);
            }
        }
    }
}
