//! # x86_64 Paging & Virtual Memory Manager
//!
//! 4-level page-table management: PML4 → PDPT → PD → PT, indexed by
//! virtual-address bits [47:39], [38:30], [29:21], [20:12].
//!
//! ```text
//! 63    48 47      39 38      30 29      21 20      12 11       0
//! +--------+---------+---------+---------+---------+------------+
//! | Sign   | PML4    | PDPT    | PD      | PT      | Offset     |
//! +--------+---------+---------+---------+---------+------------+
//! ```
//!
//! The kernel runs on a single address space whose first 4 GiB are
//! identity-mapped with 2 MiB large pages, so a physical address doubles
//! as a virtual one for table walks, frame zeroing and MMIO. Missing
//! intermediate tables are allocated zeroed from the PMM on demand.
//!
//! ## Invariants
//!
//! - `translate(v) == v` for every `v` inside the initial identity map.
//! - A mapped frame is never simultaneously on a PMM free list.
//! - `map_page` never silently overwrites: an occupied slot fails unless
//!   the caller passes `overwrite`.
//! - Table mutations run with interrupts masked and end with `invlpg`.
//!
//! Empty intermediate tables are not reclaimed on `unmap_page`; the cost
//! is bounded and the bookkeeping is not worth it on this kernel's scale.

use crate::config::IDENTITY_MAP_GIB;
use crate::lib::error::KernelError;
use crate::mm::{self, ZoneType, PAGE_SIZE};
use spin::Mutex;
use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::structures::paging::{PageTable, PageTableFlags, PhysFrame};
use x86_64::PhysAddr;

/// 2 MiB, the large-page size at PD level.
pub const HUGE_PAGE_SIZE: u64 = 2 * 1024 * 1024;

/// One kernel address space: a PML4 and the tables hanging off it.
pub struct AddressSpace {
    pml4_phys: u64,
}

impl AddressSpace {
    /// Allocate an empty address space. The PML4 frame is zeroed.
    pub fn new() -> Result<Self, KernelError> {
        let pml4_phys = alloc_table()?;
        Ok(Self { pml4_phys })
    }

    /// Physical address of the PML4 (the CR3 value).
    pub fn pml4_phys(&self) -> u64 {
        self.pml4_phys
    }

    /// Identity-map the first [`IDENTITY_MAP_GIB`] GiB with 2 MiB pages.
    pub fn init_identity(&mut self) -> Result<(), KernelError> {
        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::GLOBAL;
        let mut addr: u64 = 0;
        let end = IDENTITY_MAP_GIB * 1024 * 1024 * 1024;
        while addr < end {
            self.map_huge_page(addr, addr, flags)?;
            addr += HUGE_PAGE_SIZE;
        }
        Ok(())
    }

    /// Install a 2 MiB mapping at PD level. Both addresses must be 2 MiB
    /// aligned.
    pub fn map_huge_page(
        &mut self,
        virt: u64,
        phys: u64,
        flags: PageTableFlags,
    ) -> Result<(), KernelError> {
        if virt % HUGE_PAGE_SIZE != 0 || phys % HUGE_PAGE_SIZE != 0 {
            return Err(KernelError::InvalidArgument);
        }
        let pml4 = table_mut(self.pml4_phys);
        let pdpt = next_table_or_alloc(&mut pml4[pml4_index(virt)])?;
        let pd = next_table_or_alloc(&mut pdpt[pdpt_index(virt)])?;
        let entry = &mut pd[pd_index(virt)];
        if !entry.is_unused() {
            return Err(KernelError::InvalidState);
        }
        entry.set_addr(
            PhysAddr::new(phys),
            flags | PageTableFlags::HUGE_PAGE,
        );
        flush_tlb(virt);
        Ok(())
    }

    /// Map one 4 KiB page. Fails with `InvalidState` if the slot is
    /// occupied, unless `overwrite` is set.
    pub fn map_page(
        &mut self,
        virt: u64,
        phys: u64,
        flags: PageTableFlags,
        overwrite: bool,
    ) -> Result<(), KernelError> {
        if virt % PAGE_SIZE as u64 != 0 || phys % PAGE_SIZE as u64 != 0 {
            return Err(KernelError::InvalidArgument);
        }
        let pml4 = table_mut(self.pml4_phys);
        let pdpt = next_table_or_alloc(&mut pml4[pml4_index(virt)])?;
        let pd = next_table_or_alloc(&mut pdpt[pdpt_index(virt)])?;
        let pd_entry = &mut pd[pd_index(virt)];
        if pd_entry.flags().contains(PageTableFlags::HUGE_PAGE) {
            // A 2 MiB mapping already covers this address.
            return Err(KernelError::InvalidState);
        }
        let pt = next_table_or_alloc(pd_entry)?;
        let entry = &mut pt[pt_index(virt)];
        if !entry.is_unused() && !overwrite {
            return Err(KernelError::InvalidState);
        }
        entry.set_addr(PhysAddr::new(phys), flags | PageTableFlags::PRESENT);
        flush_tlb(virt);
        Ok(())
    }

    /// Clear the PT entry for `virt`. Upper-level tables are left in
    /// place even when they become empty.
    pub fn unmap_page(&mut self, virt: u64) -> Result<(), KernelError> {
        if virt % PAGE_SIZE as u64 != 0 {
            return Err(KernelError::InvalidArgument);
        }
        let pml4 = table_mut(self.pml4_phys);
        let pdpt = match next_table(&pml4[pml4_index(virt)]) {
            Some(t) => t,
            None => return Err(KernelError::NotFound),
        };
        let pd = match next_table(&pdpt[pdpt_index(virt)]) {
            Some(t) => t,
            None => return Err(KernelError::NotFound),
        };
        let pd_entry = &pd[pd_index(virt)];
        if pd_entry.flags().contains(PageTableFlags::HUGE_PAGE) {
            return Err(KernelError::NotSupported);
        }
        let pt = match next_table(pd_entry) {
            Some(t) => t,
            None => return Err(KernelError::NotFound),
        };
        let entry = &mut pt[pt_index(virt)];
        if entry.is_unused() {
            return Err(KernelError::NotFound);
        }
        entry.set_unused();
        flush_tlb(virt);
        Ok(())
    }

    /// Walk the tree; `None` if any level is non-present.
    pub fn translate(&self, virt: u64) -> Option<u64> {
        let pml4 = table_ref(self.pml4_phys);
        let pdpt = next_table(&pml4[pml4_index(virt)])?;
        let pdpt_entry = &pdpt[pdpt_index(virt)];
        if pdpt_entry.flags().contains(PageTableFlags::HUGE_PAGE) {
            // 1 GiB page (not produced by this kernel, but walkable).
            let base = pdpt_entry.addr().as_u64();
            return Some(base + (virt & (1024 * 1024 * 1024 - 1)));
        }
        let pd = next_table(pdpt_entry)?;
        let pd_entry = &pd[pd_index(virt)];
        if !pd_entry.flags().contains(PageTableFlags::PRESENT) {
            return None;
        }
        if pd_entry.flags().contains(PageTableFlags::HUGE_PAGE) {
            let base = pd_entry.addr().as_u64();
            return Some(base + (virt & (HUGE_PAGE_SIZE - 1)));
        }
        let pt = next_table(pd_entry)?;
        let entry = &pt[pt_index(virt)];
        if !entry.flags().contains(PageTableFlags::PRESENT) {
            return None;
        }
        Some(entry.addr().as_u64() + (virt & (PAGE_SIZE as u64 - 1)))
    }

    /// Map `size` bytes (page-multiple) of physically-contiguous memory.
    pub fn map_range(
        &mut self,
        virt: u64,
        phys: u64,
        size: u64,
        flags: PageTableFlags,
    ) -> Result<(), KernelError> {
        if size % PAGE_SIZE as u64 != 0 {
            return Err(KernelError::InvalidArgument);
        }
        let pages = size / PAGE_SIZE as u64;
        for i in 0..pages {
            self.map_page(
                virt + i * PAGE_SIZE as u64,
                phys + i * PAGE_SIZE as u64,
                flags,
                false,
            )?;
        }
        Ok(())
    }

    /// Load this address space into CR3.
    ///
    /// # Safety
    ///
    /// The space must map all code and data the CPU is about to touch;
    /// a bad PML4 triple-faults.
    pub unsafe fn activate(&self) {
        let frame = PhysFrame::containing_address(PhysAddr::new(self.pml4_phys));
        Cr3::write(frame, Cr3Flags::empty());
    }
}

/// Index helpers for the four levels.
#[inline]
fn pml4_index(virt: u64) -> usize {
    ((virt >> 39) & 0x1FF) as usize
}

#[inline]
fn pdpt_index(virt: u64) -> usize {
    ((virt >> 30) & 0x1FF) as usize
}

#[inline]
fn pd_index(virt: u64) -> usize {
    ((virt >> 21) & 0x1FF) as usize
}

#[inline]
fn pt_index(virt: u64) -> usize {
    ((virt >> 12) & 0x1FF) as usize
}

/// View a physical table frame through the identity map.
#[allow(clippy::mut_from_ref)]
fn table_mut(phys: u64) -> &'static mut PageTable {
    unsafe { &mut *(phys as *mut PageTable) }
}

fn table_ref(phys: u64) -> &'static PageTable {
    unsafe { &*(phys as *const PageTable) }
}

/// Allocate a zeroed page-table frame. Table allocation always zeroes,
/// regardless of the PMM's general (unspecified) zeroing behavior.
fn alloc_table() -> Result<u64, KernelError> {
    let pa = mm::alloc_page(ZoneType::Normal)?;
    mm::zero_page(pa);
    Ok(pa)
}

fn next_table(entry: &x86_64::structures::paging::page_table::PageTableEntry) -> Option<&'static mut PageTable> {
    if !entry.flags().contains(PageTableFlags::PRESENT) {
        return None;
    }
    Some(table_mut(entry.addr().as_u64()))
}

fn next_table_or_alloc(
    entry: &mut x86_64::structures::paging::page_table::PageTableEntry,
) -> Result<&'static mut PageTable, KernelError> {
    if entry.flags().contains(PageTableFlags::PRESENT) {
        return Ok(table_mut(entry.addr().as_u64()));
    }
    let table_phys = alloc_table()?;
    entry.set_addr(
        PhysAddr::new(table_phys),
        PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
    );
    Ok(table_mut(table_phys))
}

/// Invalidate one TLB entry.
#[inline]
fn flush_tlb(virt: u64) {
    #[cfg(target_os = "none")]
    x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(virt));
    #[cfg(not(target_os = "none"))]
    let _ = virt;
}

/// Global kernel address space
static KERNEL_SPACE: Mutex<Option<AddressSpace>> = Mutex::new(None);

/// Build the kernel address space, identity-map the low gigabytes and
/// install CR3. Requires the PMM.
pub fn init_vmm() -> Result<(), KernelError> {
    let mut space = AddressSpace::new()?;
    space.init_identity()?;
    unsafe {
        space.activate();
    }
    crate::info!(
        "vmm: identity map 0..{} GiB installed, CR3 = {:#x}",
        IDENTITY_MAP_GIB,
        space.pml4_phys()
    );
    *KERNEL_SPACE.lock() = Some(space);
    Ok(())
}

fn with_kernel_space<R>(
    f: impl FnOnce(&mut AddressSpace) -> Result<R, KernelError>,
) -> Result<R, KernelError> {
    crate::arch::without_interrupts(|| {
        let mut guard = KERNEL_SPACE.lock();
        match guard.as_mut() {
            Some(space) => f(space),
            None => Err(KernelError::InvalidState),
        }
    })
}

/// Map one page into the kernel address space.
pub fn map_page(virt: u64, phys: u64, flags: PageTableFlags) -> Result<(), KernelError> {
    with_kernel_space(|s| s.map_page(virt, phys, flags, false))
}

/// Unmap one page from the kernel address space.
pub fn unmap_page(virt: u64) -> Result<(), KernelError> {
    with_kernel_space(|s| s.unmap_page(virt))
}

/// Translate a kernel virtual address.
pub fn translate(virt: u64) -> Option<u64> {
    crate::arch::without_interrupts(|| {
        KERNEL_SPACE.lock().as_ref().and_then(|s| s.translate(virt))
    })
}

/// Map a physically-contiguous range into the kernel address space.
pub fn map_range(virt: u64, phys: u64, size: u64, flags: PageTableFlags) -> Result<(), KernelError> {
    with_kernel_space(|s| s.map_range(virt, phys, size, flags))
}
