/// Physical Memory Manager
///
/// Owns every 4 KiB frame the bootloader reported as available. The memory
/// map is cut at the DMA (16 MiB) and NORMAL (4 GiB) boundaries into
/// zones; everything below 2 MiB stays reserved for the kernel image and
/// boot structures. Frames the map did not advertise as available - and
/// the kernel image and boot modules, which usually sit inside an
/// available range - are marked allocated before the allocator goes live.
///
/// All public operations run with interrupts masked; critical sections are
/// short and bounded. Allocation failures return errors, never panic.
/// Freeing a frame no zone tracks is a fatal invariant violation
/// (debug-assert).

use super::page::{page_align_down, page_align_up, PhysAddr, MAX_ORDER, PAGE_SIZE};
use super::zone::{Zone, ZoneType};
use crate::boot::BootInfo;
use crate::config::{MAX_ZONES, RESERVED_LOW_BYTES};
use crate::lib::error::KernelError;
use alloc::vec::Vec;
use spin::Mutex;

pub struct Pmm {
    zones: Vec<Zone>,
}

impl Pmm {
    /// Build the zone set from `(base, length, usable)` memory-map data and
    /// mark the `reserved` ranges allocated.
    pub fn new(
        available: &[(PhysAddr, u64)],
        reserved: &[(PhysAddr, PhysAddr)],
    ) -> Self {
        let mut zones = Vec::new();

        for &(base, length) in available {
            let mut start = page_align_up(base.max(RESERVED_LOW_BYTES));
            let end = page_align_down(base + length);
            if end <= start {
                continue;
            }

            // Cut the range at zone boundaries.
            while start < end {
                let kind = ZoneType::classify(start);
                let zone_end = end.min(kind.limit());
                if zone_end == start {
                    break;
                }
                if zones.len() == MAX_ZONES {
                    crate::warn!(
                        "pmm: zone table full, dropping {:#x}..{:#x}",
                        start,
                        end
                    );
                    break;
                }
                zones.push(Zone::new(start, zone_end - start, kind));
                start = zone_end;
            }
        }

        let mut pmm = Self { zones };
        for &(start, end) in reserved {
            pmm.reserve_range(start, end);
        }

        for zone in &pmm.zones {
            crate::info!(
                "pmm: zone {:?} {:#x}..{:#x} ({} KiB free)",
                zone.kind(),
                zone.base(),
                zone.base() + zone.length(),
                zone.free_frames() * PAGE_SIZE / 1024
            );
        }

        pmm
    }

    fn reserve_range(&mut self, start: PhysAddr, end: PhysAddr) {
        for zone in &mut self.zones {
            zone.reserve_range(start, end);
        }
    }

    /// Allocate one frame. The preferred zone's bitmap is tried first,
    /// then its buddy at order 0, then NORMAL zones, then any zone.
    pub fn alloc_page(&mut self, preferred: ZoneType) -> Result<PhysAddr, KernelError> {
        let fallback_kinds: [ZoneType; 3] = [preferred, ZoneType::Normal, ZoneType::High];
        for (pass, kind) in fallback_kinds.iter().enumerate() {
            // The final pass takes anything, not just HIGH.
            for zone in &mut self.zones {
                let eligible = if pass == 2 {
                    true
                } else {
                    zone.kind() == *kind
                };
                if !eligible {
                    continue;
                }
                if let Some(pa) = zone.alloc_page() {
                    return Ok(pa);
                }
            }
        }
        Err(KernelError::OutOfMemory)
    }

    /// Free a frame previously returned by `alloc_page`.
    pub fn free_page(&mut self, pa: PhysAddr) -> Result<(), KernelError> {
        if pa % PAGE_SIZE as u64 != 0 {
            return Err(KernelError::InvalidArgument);
        }
        for zone in &mut self.zones {
            if zone.contains(pa) {
                return zone.free_page(pa);
            }
        }
        debug_assert!(false, "free of untracked frame {:#x}", pa);
        Err(KernelError::InvalidState)
    }

    /// Allocate 2^order contiguous frames from the requested zone's buddy.
    pub fn alloc_contiguous(
        &mut self,
        order: u8,
        kind: ZoneType,
    ) -> Result<PhysAddr, KernelError> {
        if order > MAX_ORDER {
            return Err(KernelError::InvalidArgument);
        }
        for zone in &mut self.zones {
            if zone.kind() != kind {
                continue;
            }
            if let Some(pa) = zone.alloc_contiguous(order) {
                return Ok(pa);
            }
        }
        Err(KernelError::OutOfMemory)
    }

    /// Free a 2^order run; the buddy merges iff its sibling is in range and
    /// free at the same order.
    pub fn free_contiguous(&mut self, pa: PhysAddr, order: u8) -> Result<(), KernelError> {
        for zone in &mut self.zones {
            if zone.contains(pa) {
                return zone.free_contiguous(pa, order);
            }
        }
        debug_assert!(false, "contiguous free of untracked frame {:#x}", pa);
        Err(KernelError::InvalidState)
    }

    pub fn free_frames(&self) -> usize {
        self.zones.iter().map(|z| z.free_frames()).sum()
    }

    pub fn total_frames(&self) -> usize {
        self.zones.iter().map(|z| z.total_frames()).sum()
    }

    pub fn zone_count(&self) -> usize {
        self.zones.len()
    }

    /// Self-test hook: is this exact buddy block free in its zone?
    pub fn is_free_block(&self, pa: PhysAddr, order: u8) -> bool {
        self.zones
            .iter()
            .any(|z| z.contains(pa) && z.is_free_block(pa, order))
    }
}

/// Global physical memory manager
static PMM: Mutex<Option<Pmm>> = Mutex::new(None);

/// Initialize the PMM from boot information.
pub fn init_pmm(boot_info: &BootInfo<'_>) {
    let mut available: heapless::Vec<(PhysAddr, u64), { crate::boot::MAX_MEMORY_REGIONS }> =
        heapless::Vec::new();
    for region in boot_info.memory_map.iter() {
        if region.kind.is_usable() {
            let _ = available.push((region.base, region.length));
        }
    }

    let mut reserved: heapless::Vec<(PhysAddr, PhysAddr), 24> = heapless::Vec::new();
    let _ = reserved.push(kernel_image_range());
    for module in boot_info.modules.iter() {
        let _ = reserved.push((module.start, module.end));
    }

    let pmm = Pmm::new(&available, &reserved);
    crate::info!(
        "pmm: {} zones, {} MiB managed",
        pmm.zone_count(),
        pmm.total_frames() * PAGE_SIZE / (1024 * 1024)
    );
    *PMM.lock() = Some(pmm);
}

/// Physical range occupied by the kernel image (linker symbols).
#[cfg(target_os = "none")]
fn kernel_image_range() -> (PhysAddr, PhysAddr) {
    extern "C" {
        static __kernel_start: u8;
        static __kernel_end: u8;
    }
    unsafe {
        (
            core::ptr::addr_of!(__kernel_start) as u64,
            core::ptr::addr_of!(__kernel_end) as u64,
        )
    }
}

#[cfg(not(target_os = "none"))]
fn kernel_image_range() -> (PhysAddr, PhysAddr) {
    (0, 0)
}

/// Run `f` against the initialized PMM with interrupts masked.
fn with_pmm<R>(f: impl FnOnce(&mut Pmm) -> Result<R, KernelError>) -> Result<R, KernelError> {
    crate::arch::without_interrupts(|| {
        let mut guard = PMM.lock();
        match guard.as_mut() {
            Some(pmm) => f(pmm),
            None => Err(KernelError::InvalidState),
        }
    })
}

/// Allocate one frame. Contents are unspecified; callers that need zeroed
/// memory must call [`zero_page`] explicitly.
pub fn alloc_page(preferred: ZoneType) -> Result<PhysAddr, KernelError> {
    with_pmm(|pmm| pmm.alloc_page(preferred))
}

/// Free one frame.
pub fn free_page(pa: PhysAddr) -> Result<(), KernelError> {
    with_pmm(|pmm| pmm.free_page(pa))
}

/// Allocate 2^order contiguous frames.
pub fn alloc_contiguous(order: u8, kind: ZoneType) -> Result<PhysAddr, KernelError> {
    with_pmm(|pmm| pmm.alloc_contiguous(order, kind))
}

/// Free 2^order contiguous frames.
pub fn free_contiguous(pa: PhysAddr, order: u8) -> Result<(), KernelError> {
    with_pmm(|pmm| pmm.free_contiguous(pa, order))
}

/// Total free frames across all zones.
pub fn free_frames() -> usize {
    crate::arch::without_interrupts(|| PMM.lock().as_ref().map_or(0, |p| p.free_frames()))
}

/// Self-test hook: is this exact buddy block free?
pub fn is_free_block(pa: PhysAddr, order: u8) -> bool {
    crate::arch::without_interrupts(|| {
        PMM.lock().as_ref().map_or(false, |p| p.is_free_block(pa, order))
    })
}

/// Zero a frame through the identity map.
#[cfg(target_os = "none")]
pub fn zero_page(pa: PhysAddr) {
    unsafe {
        core::ptr::write_bytes(pa as *mut u8, 0, PAGE_SIZE);
    }
}

#[cfg(not(target_os = "none"))]
pub fn zero_page(_pa: PhysAddr) {}

#[cfg(test)]
mod tests {
    use super::*;

    /// 128 MiB of RAM split across the DMA boundary, as a BIOS memory map
    /// would report it.
    fn test_pmm() -> Pmm {
        Pmm::new(
            &[(0x0, 0x9F000), (0x100000, 0x8000000 - 0x100000)],
            &[],
        )
    }

    #[test]
    fn test_zone_splitting_at_boundaries() {
        let pmm = test_pmm();
        // Low 0x9F000 range vanishes under the 2 MiB clamp; the big range
        // splits into DMA (2..16 MiB) and NORMAL (16..128 MiB).
        assert_eq!(pmm.zone_count(), 2);
    }

    #[test]
    fn test_alloc_prefers_requested_zone() {
        let mut pmm = test_pmm();
        let pa = pmm.alloc_page(ZoneType::Dma).unwrap();
        assert!(pa < super::super::zone::DMA_LIMIT);
        let pa = pmm.alloc_page(ZoneType::Normal).unwrap();
        assert!(pa >= super::super::zone::DMA_LIMIT);
        pmm.free_page(pa).unwrap();
    }

    #[test]
    fn test_fallback_to_other_zones() {
        // Only a NORMAL zone exists; HIGH requests must still succeed.
        let mut pmm = Pmm::new(&[(0x1000000, 0x1000000)], &[]);
        let pa = pmm.alloc_page(ZoneType::High).unwrap();
        assert!(pa >= 0x1000000);
    }

    #[test]
    fn test_round_trip_restores_free_count() {
        let mut pmm = test_pmm();
        let initial = pmm.free_frames();
        let mut pages = Vec::new();
        for _ in 0..512 {
            pages.push(pmm.alloc_page(ZoneType::Normal).unwrap());
        }
        assert_eq!(pmm.free_frames(), initial - 512);
        // Free in reverse order.
        for pa in pages.into_iter().rev() {
            pmm.free_page(pa).unwrap();
        }
        assert_eq!(pmm.free_frames(), initial);
    }

    #[test]
    fn test_contiguous_2mib_alignment_and_exhaustion() {
        let mut pmm = Pmm::new(&[(0x1000000, 0x1000000)], &[]);
        let mut blocks = Vec::new();
        loop {
            match pmm.alloc_contiguous(9, ZoneType::Normal) {
                Ok(pa) => {
                    assert_eq!(pa % (2 * 1024 * 1024), 0);
                    blocks.push(pa);
                }
                Err(e) => {
                    assert_eq!(e, KernelError::OutOfMemory);
                    break;
                }
            }
        }
        assert!(!blocks.is_empty());
        for pa in blocks {
            pmm.free_contiguous(pa, 9).unwrap();
        }
    }

    #[test]
    fn test_reserved_ranges_never_allocated() {
        let reserved = (0x2000000u64, 0x2100000u64);
        let mut pmm = Pmm::new(&[(0x1000000, 0x2000000)], &[reserved]);
        loop {
            match pmm.alloc_page(ZoneType::Normal) {
                Ok(pa) => assert!(
                    !(reserved.0..reserved.1).contains(&pa),
                    "reserved frame {:#x} handed out",
                    pa
                ),
                Err(_) => break,
            }
        }
    }

    #[test]
    #[should_panic(expected = "untracked frame")]
    fn test_free_untracked_frame_asserts() {
        let mut pmm = test_pmm();
        let _ = pmm.free_page(0xFFFF_0000);
    }

    #[test]
    fn test_misaligned_free_rejected() {
        let mut pmm = test_pmm();
        assert_eq!(
            pmm.free_page(0x1000001),
            Err(KernelError::InvalidArgument)
        );
    }
}
