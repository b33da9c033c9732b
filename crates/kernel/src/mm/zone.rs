/// Physical memory zones
///
/// A zone is a contiguous physical range classified by hardware
/// reachability:
///
/// | Zone   | Upper bound   | Rationale                      |
/// |--------|---------------|--------------------------------|
/// | DMA    | 16 MiB        | Legacy ISA-DMA-reachable       |
/// | NORMAL | 4 GiB         | Default                        |
/// | HIGH   | top of RAM    | Above the 32-bit limit         |
///
/// Each zone owns a frame bitmap (the fast single-frame path) and a buddy
/// allocator (the contiguous path). The two are non-overlapping views over
/// the same frames: every frame is free-in-bitmap, allocated, or held by a
/// buddy free list, never more than one at a time. A per-frame ownership
/// bit records which side a frame belongs to so that `free_page` routes
/// unambiguously.

use super::bitmap::Bitmap;
use super::buddy::BuddyAllocator;
use super::page::{pa_to_pfn, pfn_to_pa, PhysAddr, MAX_ORDER, PAGE_SIZE};
use crate::config::SINGLE_POOL_MAX_FRAMES;
use crate::lib::error::KernelError;

/// DMA zone upper bound (16 MiB)
pub const DMA_LIMIT: u64 = 16 * 1024 * 1024;

/// NORMAL zone upper bound (4 GiB)
pub const NORMAL_LIMIT: u64 = 4 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneType {
    Dma,
    Normal,
    High,
}

impl ZoneType {
    /// Classify the zone an address belongs to.
    pub fn classify(pa: PhysAddr) -> Self {
        if pa < DMA_LIMIT {
            ZoneType::Dma
        } else if pa < NORMAL_LIMIT {
            ZoneType::Normal
        } else {
            ZoneType::High
        }
    }

    /// Exclusive upper bound of the zone containing `pa`'s class.
    pub fn limit(self) -> u64 {
        match self {
            ZoneType::Dma => DMA_LIMIT,
            ZoneType::Normal => NORMAL_LIMIT,
            ZoneType::High => u64::MAX,
        }
    }
}

pub struct Zone {
    kind: ZoneType,
    base: PhysAddr,
    frames: usize,
    /// Single-frame pool state: bit clear = free single frame.
    /// Frames owned by the buddy side are permanently set here.
    single_map: Bitmap,
    /// Ownership: bit set = frame is managed by the buddy allocator.
    buddy_owned: Bitmap,
    buddy: BuddyAllocator,
}

impl Zone {
    /// Build a zone over `[base, base + length)` and seed its allocators.
    ///
    /// The leading frames (up to an eighth of the zone, capped) become the
    /// single-frame bitmap pool; the remainder is seeded into the buddy as
    /// the largest naturally-aligned power-of-two blocks that fit. Frames
    /// that cannot join an aligned block of order >= 1 fall back to the
    /// single pool.
    pub fn new(base: PhysAddr, length: u64, kind: ZoneType) -> Self {
        debug_assert!(base % PAGE_SIZE as u64 == 0);
        debug_assert!(length % PAGE_SIZE as u64 == 0);

        let base_pfn = pa_to_pfn(base);
        let frames = (length as usize) / PAGE_SIZE;

        let mut single_map = Bitmap::new_all_set(frames);
        let mut buddy_owned = Bitmap::new_all_set(frames);
        let mut buddy = BuddyAllocator::new(base_pfn, frames);

        let single_reserve = (frames / 8).clamp(frames.min(16), SINGLE_POOL_MAX_FRAMES);
        for i in 0..single_reserve.min(frames) {
            single_map.clear(i);
            buddy_owned.clear(i);
        }

        // Seed the buddy with maximal aligned blocks over the remainder.
        let mut pfn = base_pfn + single_reserve.min(frames);
        let end_pfn = base_pfn + frames;
        while pfn < end_pfn {
            let remaining = end_pfn - pfn;
            let mut order = 0u8;
            while order < MAX_ORDER {
                let next = 1usize << (order + 1);
                if next > remaining || pfn % next != 0 {
                    break;
                }
                order += 1;
            }
            if order == 0 {
                // An isolated frame; give it to the single pool.
                single_map.clear(pfn - base_pfn);
                buddy_owned.clear(pfn - base_pfn);
                pfn += 1;
                continue;
            }
            buddy.push_block(pfn, order);
            pfn += 1usize << order;
        }

        Self {
            kind,
            base,
            frames,
            single_map,
            buddy_owned,
            buddy,
        }
    }

    pub fn kind(&self) -> ZoneType {
        self.kind
    }

    pub fn base(&self) -> PhysAddr {
        self.base
    }

    pub fn length(&self) -> u64 {
        (self.frames * PAGE_SIZE) as u64
    }

    pub fn contains(&self, pa: PhysAddr) -> bool {
        pa >= self.base && pa < self.base + self.length()
    }

    #[inline]
    fn rel(&self, pa: PhysAddr) -> usize {
        pa_to_pfn(pa) - pa_to_pfn(self.base)
    }

    /// Allocate a single frame: bitmap pool first, buddy order 0 second.
    pub fn alloc_page(&mut self) -> Option<PhysAddr> {
        if let Some(bit) = self.single_map.alloc() {
            return Some(self.base + (bit * PAGE_SIZE) as u64);
        }
        self.buddy.alloc(0)
    }

    /// Allocate a 2^order frame run from the buddy.
    pub fn alloc_contiguous(&mut self, order: u8) -> Option<PhysAddr> {
        self.buddy.alloc(order)
    }

    /// Free a single frame, routing to whichever side allocated it.
    pub fn free_page(&mut self, pa: PhysAddr) -> Result<(), KernelError> {
        debug_assert!(self.contains(pa));
        let rel = self.rel(pa);
        if self.buddy_owned.is_set(rel) {
            self.buddy.free(pa, 0);
            return Ok(());
        }
        if !self.single_map.is_set(rel) {
            debug_assert!(false, "double free of frame {:#x}", pa);
            return Err(KernelError::InvalidState);
        }
        self.single_map.clear(rel);
        Ok(())
    }

    /// Free a 2^order run back to the buddy.
    pub fn free_contiguous(&mut self, pa: PhysAddr, order: u8) -> Result<(), KernelError> {
        debug_assert!(self.contains(pa));
        let rel = self.rel(pa);
        if !self.buddy_owned.is_set(rel) {
            debug_assert!(false, "contiguous free of non-buddy frame {:#x}", pa);
            return Err(KernelError::InvalidState);
        }
        self.buddy.free(pa, order);
        Ok(())
    }

    /// Mark every frame intersecting `[start, end)` as allocated. Used at
    /// init for ranges the bootloader did not advertise as available
    /// (kernel image, modules, ACPI data).
    pub fn reserve_range(&mut self, start: PhysAddr, end: PhysAddr) {
        let lo = start.max(self.base);
        let hi = end.min(self.base + self.length());
        if lo >= hi {
            return;
        }
        let first = pa_to_pfn(super::page::page_align_down(lo));
        let last = pa_to_pfn(super::page::page_align_up(hi));
        for pfn in first..last {
            let rel = pfn - pa_to_pfn(self.base);
            if self.buddy_owned.is_set(rel) {
                if self.buddy.reserve_frame(pfn) {
                    // The frame leaves the buddy side; it will re-enter
                    // circulation through the single pool if ever freed.
                    self.buddy_owned.clear(rel);
                    self.single_map.set(rel);
                }
                // If no free block covered it, it was already allocated.
            } else {
                self.single_map.set(rel);
            }
        }
        crate::debug!(
            "zone {:?}: reserved {:#x}..{:#x}",
            self.kind,
            pfn_to_pa(first),
            pfn_to_pa(last)
        );
    }

    /// Frames currently free (both pools).
    pub fn free_frames(&self) -> usize {
        self.single_map.count_clear() + self.buddy.free_frames()
    }

    pub fn total_frames(&self) -> usize {
        self.frames
    }

    /// Is this exact buddy block currently free? (self-test hook)
    pub fn is_free_block(&self, pa: PhysAddr, order: u8) -> bool {
        self.buddy.is_free_block(pa_to_pfn(pa), order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(ZoneType::classify(0), ZoneType::Dma);
        assert_eq!(ZoneType::classify(DMA_LIMIT - 1), ZoneType::Dma);
        assert_eq!(ZoneType::classify(DMA_LIMIT), ZoneType::Normal);
        assert_eq!(ZoneType::classify(NORMAL_LIMIT), ZoneType::High);
    }

    #[test]
    fn test_zone_round_trip() {
        // 1 MiB zone at 32 MiB: singles plus buddy blocks.
        let mut zone = Zone::new(0x2000000, 0x100000, ZoneType::Normal);
        let initial = zone.free_frames();
        assert_eq!(initial, 256);

        let mut pages = alloc::vec::Vec::new();
        for _ in 0..initial {
            pages.push(zone.alloc_page().expect("zone exhausted early"));
        }
        assert!(zone.alloc_page().is_none());

        // Free in a scrambled order.
        pages.reverse();
        let mid = pages.split_off(initial / 2);
        for pa in mid.into_iter().chain(pages.into_iter()) {
            zone.free_page(pa).unwrap();
        }
        assert_eq!(zone.free_frames(), initial);
    }

    #[test]
    fn test_alloc_prefers_single_pool() {
        let mut zone = Zone::new(0x2000000, 0x100000, ZoneType::Normal);
        // 256 frames => 32-frame single reserve at the zone base.
        let pa = zone.alloc_page().unwrap();
        assert_eq!(pa, 0x2000000);
    }

    #[test]
    fn test_contiguous_round_trip() {
        let mut zone = Zone::new(0x2000000, 0x400000, ZoneType::Normal);
        let pa = zone.alloc_contiguous(9).expect("no 2 MiB block");
        assert_eq!(pa % (2 * 1024 * 1024), 0);
        zone.free_contiguous(pa, 9).unwrap();
        let again = zone.alloc_contiguous(9).unwrap();
        assert_eq!(pa, again);
    }

    #[test]
    fn test_reserve_range_excludes_frames() {
        let mut zone = Zone::new(0x2000000, 0x100000, ZoneType::Normal);
        let before = zone.free_frames();
        // Reserve 16 frames somewhere in the buddy region.
        zone.reserve_range(0x2040000, 0x2050000);
        assert_eq!(zone.free_frames(), before - 16);

        let mut seen = alloc::vec::Vec::new();
        while let Some(pa) = zone.alloc_page() {
            assert!(
                !(0x2040000..0x2050000).contains(&pa),
                "reserved frame {:#x} handed out",
                pa
            );
            seen.push(pa);
        }
        assert_eq!(seen.len(), before - 16);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_asserts() {
        let mut zone = Zone::new(0x2000000, 0x100000, ZoneType::Normal);
        let pa = zone.alloc_page().unwrap();
        zone.free_page(pa).unwrap();
        let _ = zone.free_page(pa);
    }
}
