//! # Global Descriptor Table (GDT)
//!
//! Segmentation is flat in long mode, but the GDT is still load-bearing:
//! the CPU needs valid code/data descriptors for CS/SS and a TSS
//! descriptor for privilege transitions and the IST.
//!
//! ## Layout
//!
//! ```text
//! Index  Selector  Segment          DPL
//! -----  --------  ---------------  ---
//! 0      0x00      Null             -
//! 1      0x08      Kernel code 64   0
//! 2      0x10      Kernel data      0
//! 3      0x18      User data        3   (reserved, no user mode yet)
//! 4      0x20      User code 64     3   (reserved)
//! 5      0x28      TSS              0   (16-byte descriptor)
//! ```
//!
//! User descriptors are installed but unused; they keep the layout stable
//! for a future user mode (SYSRET requires user data directly below user
//! code).

use lazy_static::lazy_static;
use x86_64::instructions::segmentation::{Segment, CS, DS, ES, FS, GS, SS};
use x86_64::instructions::tables::load_tss;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();

        let kernel_code_selector = gdt.add_entry(Descriptor::kernel_code_segment());
        let kernel_data_selector = gdt.add_entry(Descriptor::kernel_data_segment());
        let user_data_selector = gdt.add_entry(Descriptor::user_data_segment());
        let user_code_selector = gdt.add_entry(Descriptor::user_code_segment());
        let tss_selector = gdt.add_entry(Descriptor::tss_segment(&super::tss::TSS));

        (
            gdt,
            Selectors {
                kernel_code_selector,
                kernel_data_selector,
                user_code_selector,
                user_data_selector,
                tss_selector,
            },
        )
    };
}

struct Selectors {
    kernel_code_selector: SegmentSelector,
    kernel_data_selector: SegmentSelector,
    user_code_selector: SegmentSelector,
    user_data_selector: SegmentSelector,
    tss_selector: SegmentSelector,
}

/// Load the GDT, reload every segment register and `ltr` the TSS.
///
/// # Safety
///
/// Must be called exactly once during early boot, with interrupts
/// disabled, before the IDT is loaded (the double-fault IST entry only
/// works with this TSS active).
pub unsafe fn init_gdt() {
    GDT.0.load();

    CS::set_reg(GDT.1.kernel_code_selector);
    DS::set_reg(GDT.1.kernel_data_selector);
    ES::set_reg(GDT.1.kernel_data_selector);
    SS::set_reg(GDT.1.kernel_data_selector);
    FS::set_reg(GDT.1.kernel_data_selector);
    GS::set_reg(GDT.1.kernel_data_selector);

    load_tss(GDT.1.tss_selector);

    crate::info!("gdt: loaded, TSS selector {:#x}", GDT.1.tss_selector.0);
}

/// Kernel code selector (0x08).
pub fn kernel_code_selector() -> SegmentSelector {
    GDT.1.kernel_code_selector
}

/// Kernel data selector (0x10).
pub fn kernel_data_selector() -> SegmentSelector {
    GDT.1.kernel_data_selector
}

/// TSS selector (0x28).
pub fn tss_selector() -> SegmentSelector {
    GDT.1.tss_selector
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_values_match_layout() {
        // The wire-level selector values are part of the kernel ABI
        // (the boot stub's far jump and the IDT entries rely on them).
        assert_eq!(kernel_code_selector().0, 0x08);
        assert_eq!(kernel_data_selector().0, 0x10);
        assert_eq!(tss_selector().0, 0x28);
    }

    #[test]
    fn test_privilege_levels() {
        assert_eq!(kernel_code_selector().rpl(), x86_64::PrivilegeLevel::Ring0);
        assert_eq!(GDT.1.user_code_selector.rpl(), x86_64::PrivilegeLevel::Ring3);
        assert_eq!(GDT.1.user_data_selector.rpl(), x86_64::PrivilegeLevel::Ring3);
        // SYSRET layout: user data immediately below user code.
        assert_eq!(
            GDT.1.user_code_selector.index(),
            GDT.1.user_data_selector.index() + 1
        );
    }
}
