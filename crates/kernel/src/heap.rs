//! Kernel heap
//!
//! A segregated-fit allocator: one fixed-size chunk pool per power-of-two
//! class from 8 bytes to 32 KiB, each pool occupying its own contiguous
//! virtual region with an allocation bitmap. A pointer therefore maps to
//! at most one pool and `free` is a handful of range checks. Requests
//! above the largest class go straight to the buddy allocator, with a
//! side registry recording the order per pointer.
//!
//! Before the PMM and VMM are online, a small static bootstrap heap
//! (`linked_list_allocator` over a .bss array) serves the early
//! allocations - the zone bitmaps and buddy free lists themselves live
//! there. The `GlobalAlloc` impl routes by readiness on alloc and by
//! pointer range on dealloc, and tracks allocation statistics.
//!
//! Out-of-memory returns null; callers decide policy. The allocator never
//! panics.

use crate::config::{BOOTSTRAP_HEAP_SIZE, HEAP_POOL_BASE, HEAP_POOL_SPAN};
use crate::lib::error::KernelError;
use crate::mm::bitmap::Bitmap;
use crate::mm::{self, ZoneType, PAGE_SIZE};
use alloc::collections::BTreeMap;
use core::alloc::{GlobalAlloc, Layout};
use core::sync::atomic::{AtomicBool, Ordering};
use linked_list_allocator::LockedHeap;
use spin::Mutex;

/// Chunk classes. Every pool is aligned to its chunk size.
pub const POOL_SIZES: [usize; 13] = [
    8, 16, 32, 64, 128, 256, 512, 1024, 2048, 4096, 8192, 16384, 32768,
];

/// One fixed-size chunk pool over a contiguous virtual region.
pub struct ChunkPool {
    chunk_size: usize,
    base: u64,
    chunks: usize,
    map: Bitmap,
}

impl ChunkPool {
    pub fn new(chunk_size: usize, base: u64, span: usize) -> Self {
        debug_assert!(base % chunk_size as u64 == 0);
        let chunks = span / chunk_size;
        Self {
            chunk_size,
            base,
            chunks,
            map: Bitmap::new_all_clear(chunks),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    #[inline]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.base + (self.chunks * self.chunk_size) as u64
    }

    pub fn alloc(&mut self) -> Option<u64> {
        let idx = self.map.alloc()?;
        Some(self.base + (idx * self.chunk_size) as u64)
    }

    /// Free a chunk. Returns `InvalidState` on double free and
    /// `InvalidArgument` for a pointer that is not chunk-aligned.
    pub fn free(&mut self, addr: u64) -> Result<(), KernelError> {
        let offset = (addr - self.base) as usize;
        if offset % self.chunk_size != 0 {
            return Err(KernelError::InvalidArgument);
        }
        let idx = offset / self.chunk_size;
        if !self.map.is_set(idx) {
            debug_assert!(false, "heap double free at {:#x}", addr);
            return Err(KernelError::InvalidState);
        }
        self.map.clear(idx);
        Ok(())
    }

    pub fn free_chunks(&self) -> usize {
        self.map.count_clear()
    }
}

struct PoolHeap {
    pools: alloc::vec::Vec<ChunkPool>,
}

impl PoolHeap {
    /// Smallest pool index whose chunk size satisfies `size` and `align`.
    fn pick_class(size: usize, align: usize) -> Option<usize> {
        let need = size.max(align);
        POOL_SIZES.iter().position(|&n| n >= need)
    }

    fn alloc(&mut self, size: usize, align: usize) -> Option<u64> {
        let first = Self::pick_class(size, align)?;
        // A full pool falls through to the next class up.
        for class in first..self.pools.len() {
            if let Some(addr) = self.pools[class].alloc() {
                return Some(addr);
            }
        }
        None
    }

    /// Linear probe of pool ranges; the pool whose region contains the
    /// pointer owns it.
    fn free(&mut self, addr: u64) -> Result<(), KernelError> {
        for pool in &mut self.pools {
            if pool.contains(addr) {
                return pool.free(addr);
            }
        }
        Err(KernelError::NotFound)
    }

    fn chunk_size_of(&self, addr: u64) -> Option<usize> {
        self.pools
            .iter()
            .find(|p| p.contains(addr))
            .map(|p| p.chunk_size())
    }
}

/// Bootstrap heap backing store (.bss)
#[repr(align(64))]
struct BootstrapArena([u8; BOOTSTRAP_HEAP_SIZE]);

static mut BOOTSTRAP_MEMORY: BootstrapArena = BootstrapArena([0; BOOTSTRAP_HEAP_SIZE]);

/// Early allocator used until `init_heap` has run.
static BOOTSTRAP: LockedHeap = LockedHeap::empty();

static BOOTSTRAP_READY: AtomicBool = AtomicBool::new(false);
static POOLS_READY: AtomicBool = AtomicBool::new(false);

static POOLS: Mutex<Option<PoolHeap>> = Mutex::new(None);

/// Buddy-backed large allocations: pointer -> order.
static LARGE: Mutex<BTreeMap<u64, u8>> = Mutex::new(BTreeMap::new());

/// Heap statistics for monitoring and debugging
#[derive(Default)]
pub struct HeapStats {
    pub total_allocations: usize,
    pub total_deallocations: usize,
    pub current_allocated: usize,
    pub peak_allocated: usize,
    pub allocation_failures: usize,
}

static HEAP_STATS: Mutex<HeapStats> = Mutex::new(HeapStats {
    total_allocations: 0,
    total_deallocations: 0,
    current_allocated: 0,
    peak_allocated: 0,
    allocation_failures: 0,
});

/// Initialize the bootstrap heap. Must run before anything allocates.
pub fn init_bootstrap_heap() {
    if BOOTSTRAP_READY.swap(true, Ordering::SeqCst) {
        return;
    }
    unsafe {
        let arena = core::ptr::addr_of_mut!(BOOTSTRAP_MEMORY);
        let start = core::ptr::addr_of_mut!((*arena).0) as *mut u8;
        BOOTSTRAP.lock().init(start, BOOTSTRAP_HEAP_SIZE);
    }
    crate::info!(
        "heap: bootstrap heap online ({} KiB)",
        BOOTSTRAP_HEAP_SIZE / 1024
    );
}

/// Bring the chunk pools online. Requires the PMM and VMM: each pool's
/// virtual region is backed by freshly-allocated frames.
pub fn init_heap() -> Result<(), KernelError> {
    if POOLS_READY.load(Ordering::SeqCst) {
        return Ok(());
    }

    let mut pools = alloc::vec::Vec::with_capacity(POOL_SIZES.len());
    for (i, &chunk_size) in POOL_SIZES.iter().enumerate() {
        let base = HEAP_POOL_BASE + (i * HEAP_POOL_SPAN) as u64;
        map_pool_region(base, HEAP_POOL_SPAN)?;
        pools.push(ChunkPool::new(chunk_size, base, HEAP_POOL_SPAN));
    }

    *POOLS.lock() = Some(PoolHeap { pools });
    POOLS_READY.store(true, Ordering::SeqCst);
    crate::info!(
        "heap: {} chunk pools online ({} KiB each)",
        POOL_SIZES.len(),
        HEAP_POOL_SPAN / 1024
    );
    Ok(())
}

#[cfg(target_os = "none")]
fn map_pool_region(base: u64, span: usize) -> Result<(), KernelError> {
    use x86_64::structures::paging::PageTableFlags;

    let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE;
    let pages = span / PAGE_SIZE;
    for i in 0..pages {
        let pa = mm::alloc_page(ZoneType::Normal)?;
        crate::arch::x86_64::paging::map_page(base + (i * PAGE_SIZE) as u64, pa, flags)?;
    }
    Ok(())
}

#[cfg(not(target_os = "none"))]
fn map_pool_region(_base: u64, _span: usize) -> Result<(), KernelError> {
    Ok(())
}

fn in_bootstrap(addr: u64) -> bool {
    let start = unsafe { core::ptr::addr_of!(BOOTSTRAP_MEMORY) as u64 };
    addr >= start && addr < start + BOOTSTRAP_HEAP_SIZE as u64
}

/// Order needed for a buddy-backed allocation of `size` bytes.
fn large_order(size: usize) -> Option<u8> {
    let frames = size.div_ceil(PAGE_SIZE);
    let mut order = 0u8;
    while (1usize << order) < frames {
        order += 1;
        if order > mm::MAX_ORDER {
            return None;
        }
    }
    Some(order)
}

fn alloc_large(layout: Layout) -> Option<u64> {
    let order = large_order(layout.size())?;
    if layout.align() > PAGE_SIZE << order {
        return None;
    }
    let pa = mm::alloc_contiguous(order, ZoneType::Normal).ok()?;
    // Identity-mapped, so the physical address is the pointer. The
    // registry insert may itself allocate a tree node; the registry lock
    // is never held across that, and interrupts are masked so IRQ-context
    // allocations cannot interleave.
    crate::arch::without_interrupts(|| {
        LARGE.lock().insert(pa, order);
    });
    Some(pa)
}

fn free_large(addr: u64) -> bool {
    let order = {
        let removed = crate::arch::without_interrupts(|| LARGE.lock().remove(&addr));
        match removed {
            Some(order) => order,
            None => return false,
        }
    };
    let _ = mm::free_contiguous(addr, order);
    true
}

/// Explicit allocation API. Returns null when out of memory; requires the
/// chunk pools (early callers go through the global allocator instead).
pub fn kmalloc(size: usize, align: usize) -> *mut u8 {
    if size == 0 || !POOLS_READY.load(Ordering::SeqCst) {
        return core::ptr::null_mut();
    }
    let addr = if size <= POOL_SIZES[POOL_SIZES.len() - 1] {
        crate::arch::without_interrupts(|| {
            POOLS.lock().as_mut().and_then(|p| p.alloc(size, align))
        })
    } else {
        match Layout::from_size_align(size, align.max(1)) {
            Ok(layout) => alloc_large(layout),
            Err(_) => None,
        }
    };
    match addr {
        Some(a) => a as *mut u8,
        None => core::ptr::null_mut(),
    }
}

/// Free a pointer obtained from `kmalloc`/`krealloc`.
pub fn kfree(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    let addr = ptr as u64;
    let freed = crate::arch::without_interrupts(|| {
        POOLS
            .lock()
            .as_mut()
            .map_or(false, |p| p.free(addr).is_ok())
    });
    if !freed && !free_large(addr) {
        debug_assert!(false, "kfree of unknown pointer {:#x}", addr);
    }
}

/// Resize an allocation. Growth within the current chunk is free;
/// otherwise allocate-copy-free, bounded by the smaller of the two sizes.
pub fn krealloc(ptr: *mut u8, new_size: usize) -> *mut u8 {
    if ptr.is_null() {
        return kmalloc(new_size, 8);
    }
    let addr = ptr as u64;
    let old_size = crate::arch::without_interrupts(|| {
        POOLS.lock().as_ref().and_then(|p| p.chunk_size_of(addr))
    })
    .or_else(|| {
        crate::arch::without_interrupts(|| {
            LARGE.lock().get(&addr).map(|&order| PAGE_SIZE << order)
        })
    });
    let old_size = match old_size {
        Some(s) => s,
        None => return core::ptr::null_mut(),
    };
    if new_size <= old_size {
        return ptr;
    }
    let new_ptr = kmalloc(new_size, 8);
    if new_ptr.is_null() {
        return core::ptr::null_mut();
    }
    unsafe {
        core::ptr::copy_nonoverlapping(ptr, new_ptr, old_size.min(new_size));
    }
    kfree(ptr);
    new_ptr
}

/// The global allocator: bootstrap heap first, chunk pools once online.
pub struct KernelAllocator;

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = if !POOLS_READY.load(Ordering::SeqCst) {
            crate::arch::without_interrupts(|| BOOTSTRAP.alloc(layout))
        } else if layout.size() > POOL_SIZES[POOL_SIZES.len() - 1] {
            match alloc_large(layout) {
                Some(addr) => addr as *mut u8,
                None => core::ptr::null_mut(),
            }
        } else {
            let addr = crate::arch::without_interrupts(|| {
                POOLS
                    .lock()
                    .as_mut()
                    .and_then(|p| p.alloc(layout.size(), layout.align()))
            });
            match addr {
                Some(a) => a as *mut u8,
                None => core::ptr::null_mut(),
            }
        };

        crate::arch::without_interrupts(|| {
            let mut stats = HEAP_STATS.lock();
            if ptr.is_null() {
                stats.allocation_failures += 1;
            } else {
                stats.total_allocations += 1;
                stats.current_allocated += layout.size();
                if stats.current_allocated > stats.peak_allocated {
                    stats.peak_allocated = stats.current_allocated;
                }
            }
        });
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let addr = ptr as u64;
        if in_bootstrap(addr) {
            crate::arch::without_interrupts(|| BOOTSTRAP.dealloc(ptr, layout));
        } else {
            let freed = crate::arch::without_interrupts(|| {
                POOLS
                    .lock()
                    .as_mut()
                    .map_or(false, |p| p.free(addr).is_ok())
            });
            if !freed && !free_large(addr) {
                debug_assert!(false, "dealloc of unknown pointer {:#x}", addr);
            }
        }

        crate::arch::without_interrupts(|| {
            let mut stats = HEAP_STATS.lock();
            stats.total_deallocations += 1;
            stats.current_allocated = stats.current_allocated.saturating_sub(layout.size());
        });
    }
}

#[cfg(all(target_os = "none", not(test)))]
#[global_allocator]
static ALLOCATOR: KernelAllocator = KernelAllocator;

#[cfg(all(target_os = "none", not(test)))]
#[alloc_error_handler]
fn alloc_error(layout: Layout) -> ! {
    panic!("kernel heap exhausted: failed to allocate {:?}", layout)
}

/// Snapshot of the allocation statistics.
pub fn stats() -> HeapStats {
    crate::arch::without_interrupts(|| {
    let s = HEAP_STATS.lock();
    HeapStats {
        total_allocations: s.total_allocations,
        total_deallocations: s.total_deallocations,
        current_allocated: s.current_allocated,
        peak_allocated: s.peak_allocated,
        allocation_failures: s.allocation_failures,
    }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pools() -> PoolHeap {
        let mut pools = alloc::vec::Vec::new();
        for (i, &chunk_size) in POOL_SIZES.iter().enumerate() {
            let base = HEAP_POOL_BASE + (i * HEAP_POOL_SPAN) as u64;
            pools.push(ChunkPool::new(chunk_size, base, HEAP_POOL_SPAN));
        }
        PoolHeap { pools }
    }

    #[test]
    fn test_pick_class_smallest_fit() {
        assert_eq!(PoolHeap::pick_class(1, 1), Some(0)); // 8
        assert_eq!(PoolHeap::pick_class(8, 1), Some(0));
        assert_eq!(PoolHeap::pick_class(9, 1), Some(1)); // 16
        assert_eq!(PoolHeap::pick_class(4096, 1), Some(9));
        assert_eq!(PoolHeap::pick_class(32768, 1), Some(12));
        assert_eq!(PoolHeap::pick_class(32769, 1), None);
    }

    #[test]
    fn test_align_rounds_to_larger_class() {
        // 10 bytes with 64-byte alignment must come from the 64 pool.
        assert_eq!(PoolHeap::pick_class(10, 64), Some(3));
    }

    #[test]
    fn test_chunk_addresses_aligned() {
        let mut pools = test_pools();
        for _ in 0..100 {
            let addr = pools.alloc(100, 8).unwrap();
            assert_eq!(addr % 128, 0); // 100 -> 128-byte class
        }
    }

    #[test]
    fn test_no_two_live_allocations_overlap() {
        let mut pools = test_pools();
        let mut ranges: alloc::vec::Vec<(u64, u64)> = alloc::vec::Vec::new();
        let sizes = [1usize, 8, 24, 100, 500, 2000, 5000, 32768];
        for _ in 0..8 {
            for &size in &sizes {
                let addr = pools.alloc(size, 8).unwrap();
                let range = (addr, addr + size as u64);
                for &(lo, hi) in &ranges {
                    assert!(range.1 <= lo || range.0 >= hi, "overlap detected");
                }
                ranges.push(range);
            }
        }
        for (lo, _) in ranges {
            pools.free(lo).unwrap();
        }
    }

    #[test]
    fn test_free_by_range_probe() {
        let mut pools = test_pools();
        let small = pools.alloc(8, 1).unwrap();
        let big = pools.alloc(30000, 1).unwrap();
        assert_eq!(pools.chunk_size_of(small), Some(8));
        assert_eq!(pools.chunk_size_of(big), Some(32768));
        pools.free(big).unwrap();
        pools.free(small).unwrap();
        assert!(pools.free(0xDEAD_0000).is_err());
    }

    #[test]
    fn test_pool_reuse_after_free() {
        let mut pools = test_pools();
        let a = pools.alloc(64, 1).unwrap();
        pools.free(a).unwrap();
        let b = pools.alloc(64, 1).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_large_order_math() {
        assert_eq!(large_order(1), Some(0));
        assert_eq!(large_order(4096), Some(0));
        assert_eq!(large_order(4097), Some(1));
        assert_eq!(large_order(40000), Some(4)); // 10 frames -> order 4
        assert_eq!(large_order(4 * 1024 * 1024), Some(10));
        assert_eq!(large_order(5 * 1024 * 1024), None); // beyond MAX_ORDER
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_asserts() {
        let mut pools = test_pools();
        let a = pools.alloc(64, 1).unwrap();
        pools.free(a).unwrap();
        let _ = pools.free(a);
    }
}
