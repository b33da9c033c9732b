//! # ACPI table discovery
//!
//! Just enough ACPI to wire up the interrupt and timer hardware: locate
//! the RSDP, walk the RSDT/XSDT, and pull out the MADT (local APIC
//! address, IO-APICs, interrupt source overrides), the HPET base and the
//! FADT's presence. No AML, no power management.
//!
//! ```text
//! RSDP ("RSD PTR ", scanned in the EBDA and 0xE0000..0xFFFFF)
//!     ↓
//! RSDT (rev 0, 32-bit pointers) or XSDT (rev 2+, 64-bit pointers)
//!     ↓
//! ┌───────────┬─────────┬──────────┐
//! │   MADT    │  HPET   │   FADT   │
//! └───────────┴─────────┴──────────┘
//! ```
//!
//! All tables are checksummed (bytes sum to 0 mod 256); a bad checksum
//! rejects the table rather than trusting a torn pointer.

use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

/// One IO-APIC as described by the MADT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoApicInfo {
    pub id: u8,
    pub addr: u64,
    pub gsi_base: u32,
}

/// Legacy IRQ → GSI rerouting from the MADT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceOverride {
    pub source_irq: u8,
    pub gsi: u32,
}

#[derive(Debug, Default)]
pub struct AcpiInfo {
    pub lapic_addr: u64,
    pub ioapics: heapless::Vec<IoApicInfo, 8>,
    pub overrides: heapless::Vec<SourceOverride, 16>,
    pub hpet_base: Option<u64>,
    pub fadt_present: bool,
}

static ACPI: Mutex<AcpiInfo> = Mutex::new(AcpiInfo {
    lapic_addr: 0,
    ioapics: heapless::Vec::new(),
    overrides: heapless::Vec::new(),
    hpet_base: None,
    fadt_present: false,
});

/// Set once init() found a valid RSDP.
static RSDP_ADDR: AtomicU64 = AtomicU64::new(0);

/// Sum of all table bytes must be 0 mod 256.
fn checksum_ok(bytes: &[u8]) -> bool {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b)) == 0
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

/// Parse a MADT body (the full table bytes, header included) into `info`.
///
/// Entry stream starts at offset 44 after `(lapic_addr, flags)`; each
/// entry is `(type, length, payload)`.
fn parse_madt(table: &[u8], info: &mut AcpiInfo) {
    if table.len() < 44 {
        return;
    }
    info.lapic_addr = read_u32(table, 36) as u64;

    let mut offset = 44usize;
    while offset + 2 <= table.len() {
        let entry_type = table[offset];
        let length = table[offset + 1] as usize;
        if length < 2 || offset + length > table.len() {
            break;
        }
        let entry = &table[offset..offset + length];
        match entry_type {
            // 0: processor local APIC - single-CPU kernel, count only.
            1 => {
                // IO-APIC: id, reserved, addr, gsi base
                if length >= 12 {
                    let ioapic = IoApicInfo {
                        id: entry[2],
                        addr: read_u32(entry, 4) as u64,
                        gsi_base: read_u32(entry, 8),
                    };
                    let _ = info.ioapics.push(ioapic);
                }
            }
            2 => {
                // Interrupt source override
                if length >= 10 {
                    let so = SourceOverride {
                        source_irq: entry[3],
                        gsi: read_u32(entry, 4),
                    };
                    let _ = info.overrides.push(so);
                }
            }
            5 => {
                // 64-bit local APIC address override
                if length >= 12 {
                    info.lapic_addr = read_u64(entry, 4);
                }
            }
            _ => {}
        }
        offset += length;
    }
}

/// Parse an HPET table body: the GAS block's address lives at offset 44.
fn parse_hpet(table: &[u8], info: &mut AcpiInfo) {
    if table.len() >= 52 {
        info.hpet_base = Some(read_u64(table, 44));
    }
}

#[cfg(target_os = "none")]
mod discovery {
    use super::*;

    /// "RSD PTR " anchor, 16-byte aligned.
    const RSDP_SIGNATURE: &[u8; 8] = b"RSD PTR ";

    unsafe fn table_bytes(addr: u64) -> Option<&'static [u8]> {
        let header = core::slice::from_raw_parts(addr as *const u8, 36);
        let length = super::read_u32(header, 4) as usize;
        if length < 36 || length > 0x10000 {
            return None;
        }
        let table = core::slice::from_raw_parts(addr as *const u8, length);
        if !super::checksum_ok(table) {
            crate::warn!("acpi: table at {:#x} fails checksum", addr);
            return None;
        }
        Some(table)
    }

    unsafe fn find_rsdp() -> Option<u64> {
        // EBDA segment pointer lives at 0x40E; scan its first KiB.
        let ebda = (core::ptr::read_volatile(0x40E as *const u16) as u64) << 4;
        if ebda >= 0x80000 && ebda < 0xA0000 {
            if let Some(addr) = scan_region(ebda, ebda + 1024) {
                return Some(addr);
            }
        }
        // BIOS read-only area.
        scan_region(0xE0000, 0x100000)
    }

    unsafe fn scan_region(start: u64, end: u64) -> Option<u64> {
        let mut addr = start & !0xF;
        while addr + 20 <= end {
            let candidate = core::slice::from_raw_parts(addr as *const u8, 20);
            if &candidate[0..8] == RSDP_SIGNATURE && super::checksum_ok(candidate) {
                return Some(addr);
            }
            addr += 16;
        }
        None
    }

    /// Locate the RSDP and walk the root table.
    pub unsafe fn run(info: &mut AcpiInfo) -> Option<u64> {
        let rsdp_addr = find_rsdp()?;
        let rsdp = core::slice::from_raw_parts(rsdp_addr as *const u8, 36);
        let revision = rsdp[15];

        // Prefer the XSDT when ACPI 2.0+ and the extended checksum holds.
        let (root_addr, wide) = if revision >= 2 && super::checksum_ok(&rsdp[0..36]) {
            (super::read_u64(rsdp, 24), true)
        } else {
            (super::read_u32(rsdp, 16) as u64, false)
        };

        let root = table_bytes(root_addr)?;
        let ptr_size = if wide { 8 } else { 4 };
        let mut offset = 36usize;
        while offset + ptr_size <= root.len() {
            let table_addr = if wide {
                super::read_u64(root, offset)
            } else {
                super::read_u32(root, offset) as u64
            };
            offset += ptr_size;
            let table = match table_bytes(table_addr) {
                Some(t) => t,
                None => continue,
            };
            match &table[0..4] {
                b"APIC" => super::parse_madt(table, info),
                b"HPET" => super::parse_hpet(table, info),
                b"FACP" => info.fadt_present = true,
                _ => {}
            }
        }
        Some(rsdp_addr)
    }
}

/// Discover the ACPI tables. Safe to call on machines without ACPI; the
/// caller falls back to architectural defaults.
pub fn init() {
    #[cfg(target_os = "none")]
    {
        let mut info = ACPI.lock();
        match unsafe { discovery::run(&mut info) } {
            Some(rsdp) => {
                RSDP_ADDR.store(rsdp, Ordering::Relaxed);
                crate::info!(
                    "acpi: RSDP at {:#x}, lapic {:#x}, {} ioapic(s), hpet {:?}",
                    rsdp,
                    info.lapic_addr,
                    info.ioapics.len(),
                    info.hpet_base
                );
            }
            None => crate::warn!("acpi: no RSDP found, using architectural defaults"),
        }
    }
}

/// Run `f` over the discovered tables.
pub fn with_info<R>(f: impl FnOnce(&AcpiInfo) -> R) -> R {
    f(&ACPI.lock())
}

/// The GSI a legacy IRQ is routed to (identity unless the MADT overrides).
pub fn irq_to_gsi(irq: u8) -> u32 {
    with_info(|info| {
        info.overrides
            .iter()
            .find(|o| o.source_irq == irq)
            .map(|o| o.gsi)
            .unwrap_or(irq as u32)
    })
}

/// Was an RSDP found?
pub fn available() -> bool {
    RSDP_ADDR.load(Ordering::Relaxed) != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn madt_with(entries: &[&[u8]]) -> Vec<u8> {
        let mut table = vec![0u8; 44];
        table[0..4].copy_from_slice(b"APIC");
        table[36..40].copy_from_slice(&0xFEE0_0000u32.to_le_bytes());
        for e in entries {
            table.extend_from_slice(e);
        }
        let len = (table.len() as u32).to_le_bytes();
        table[4..8].copy_from_slice(&len);
        table
    }

    #[test]
    fn test_checksum() {
        let mut bytes = vec![1u8, 2, 3];
        let fix = 0u8.wrapping_sub(6);
        bytes.push(fix);
        assert!(checksum_ok(&bytes));
        bytes[0] = 2;
        assert!(!checksum_ok(&bytes));
    }

    #[test]
    fn test_madt_ioapic_and_override() {
        let ioapic_entry: &[u8] = &[
            1, 12, // type, length
            9, 0, // id, reserved
            0x00, 0x00, 0xC0, 0xFE, // addr 0xFEC00000
            0, 0, 0, 0, // gsi base 0
        ];
        let override_entry: &[u8] = &[
            2, 10, // type, length
            0, 0, // bus, source irq 0
            2, 0, 0, 0, // gsi 2
            0, 0, // flags
        ];
        let table = madt_with(&[ioapic_entry, override_entry]);

        let mut info = AcpiInfo::default();
        parse_madt(&table, &mut info);
        assert_eq!(info.lapic_addr, 0xFEE0_0000);
        assert_eq!(info.ioapics.len(), 1);
        assert_eq!(info.ioapics[0].addr, 0xFEC0_0000);
        assert_eq!(info.ioapics[0].id, 9);
        assert_eq!(info.overrides.len(), 1);
        assert_eq!(info.overrides[0].source_irq, 0);
        assert_eq!(info.overrides[0].gsi, 2);
    }

    #[test]
    fn test_madt_lapic_address_override() {
        let override64: &[u8] = &[
            5, 12, 0, 0, // type, length, reserved
            0, 0, 0, 0xFE, 1, 0, 0, 0, // addr 0x1FE000000
        ];
        let table = madt_with(&[override64]);
        let mut info = AcpiInfo::default();
        parse_madt(&table, &mut info);
        assert_eq!(info.lapic_addr, 0x1_FE00_0000);
    }

    #[test]
    fn test_truncated_madt_entry_stops_parse() {
        let bogus: &[u8] = &[1, 40, 0, 0]; // claims 40 bytes, provides 4
        let table = madt_with(&[bogus]);
        let mut info = AcpiInfo::default();
        parse_madt(&table, &mut info);
        assert!(info.ioapics.is_empty());
    }
}
