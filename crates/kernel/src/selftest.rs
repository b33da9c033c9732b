//! In-kernel self tests
//!
//! Boot-time property suite behind the `selftest` feature: each check
//! runs against the live kernel (real page tables, real allocators, a
//! RAM disk for the filesystem pass) and logs one PASS/FAIL line. The
//! suite leaves the system in a usable state - everything it allocates,
//! maps or mounts is released again.

#![allow(dead_code)]

use core::sync::atomic::{AtomicU32, Ordering};

static PASSED: AtomicU32 = AtomicU32::new(0);
static FAILED: AtomicU32 = AtomicU32::new(0);

fn report(name: &str, ok: bool) {
    if ok {
        PASSED.fetch_add(1, Ordering::Relaxed);
        crate::info!("selftest: PASS {}", name);
    } else {
        FAILED.fetch_add(1, Ordering::Relaxed);
        crate::error!("selftest: FAIL {}", name);
    }
}

/// Run every check. Called once, late in bring-up, with interrupts still
/// disabled (the scheduler check enables them itself).
pub fn run_all() {
    crate::info!("selftest: starting");

    report("pmm round trip", pmm_round_trip());
    report("buddy coalescing", buddy_coalescing());
    #[cfg(target_arch = "x86_64")]
    report("vmm identity map", vmm_identity());
    #[cfg(target_arch = "x86_64")]
    report("vmm map/translate/unmap", vmm_round_trip());
    report("heap non-overlap", heap_non_overlap());
    report("fd table monotonicity", fd_monotonicity());
    report("fat round trip", fat_round_trip());
    #[cfg(target_arch = "x86_64")]
    report("scheduler alternation", scheduler_alternation());

    crate::info!(
        "selftest: {} passed, {} failed",
        PASSED.load(Ordering::Relaxed),
        FAILED.load(Ordering::Relaxed)
    );
}

/// Property 1: allocate N frames, free them in reverse, and the free
/// count returns to its starting value.
fn pmm_round_trip() -> bool {
    use crate::mm::{self, ZoneType};

    let before = mm::pmm::free_frames();
    let mut pages = alloc::vec::Vec::new();
    for _ in 0..64 {
        match mm::alloc_page(ZoneType::Normal) {
            Ok(pa) => pages.push(pa),
            Err(_) => return false,
        }
    }
    if mm::pmm::free_frames() != before - 64 {
        return false;
    }
    for pa in pages.into_iter().rev() {
        if mm::free_page(pa).is_err() {
            return false;
        }
    }
    mm::pmm::free_frames() == before
}

/// Property 2: freeing both halves of a split block restores the larger
/// block on the free list.
fn buddy_coalescing() -> bool {
    use crate::mm::{self, ZoneType};

    let a = match mm::alloc_contiguous(9, ZoneType::Normal) {
        Ok(pa) => pa,
        Err(_) => return false,
    };
    if a % (2 * 1024 * 1024) != 0 {
        return false;
    }
    if mm::free_contiguous(a, 9).is_err() {
        return false;
    }
    // The freed 2 MiB block (or its parent after a merge) is free again.
    mm::pmm::is_free_block(a, 9) || mm::pmm::is_free_block(a & !(4 * 1024 * 1024 - 1), 10)
}

/// Property 3: the initial identity map translates to itself.
#[cfg(target_arch = "x86_64")]
fn vmm_identity() -> bool {
    use crate::arch::x86_64::paging::translate;

    let probes = [
        0x10_0000u64,     // kernel image
        0x20_0000,        // first allocatable frame
        0xB8000,          // VGA text buffer
        0xFEC0_0000,      // IO-APIC MMIO
        0xFEE0_0000,      // LAPIC MMIO
        0x3FFF_F000,      // high in the identity span
    ];
    probes.iter().all(|&v| translate(v) == Some(v))
}

/// Property 4: map, touch, translate, unmap.
#[cfg(target_arch = "x86_64")]
fn vmm_round_trip() -> bool {
    use crate::arch::x86_64::paging::{map_page, translate, unmap_page};
    use crate::mm::{self, ZoneType};
    use x86_64::structures::paging::PageTableFlags;

    let virt = 0xFFFF_FF70_0000_0000u64;
    let phys = match mm::alloc_page(ZoneType::Normal) {
        Ok(pa) => pa,
        Err(_) => return false,
    };

    let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
    if map_page(virt, phys, flags).is_err() {
        return false;
    }
    // Double-mapping without `overwrite` must be refused.
    let double_map_refused = map_page(virt, phys, flags).is_err();

    // Write through the new mapping, read back through the identity map.
    unsafe {
        core::ptr::write_volatile(virt as *mut u8, 0x5A);
    }
    let seen = unsafe { core::ptr::read_volatile(phys as *const u8) };

    let translated = translate(virt) == Some(phys);
    let unmapped = unmap_page(virt).is_ok() && translate(virt).is_none();

    let _ = mm::free_page(phys);
    double_map_refused && seen == 0x5A && translated && unmapped
}

/// Property 5: no two live heap allocations overlap.
fn heap_non_overlap() -> bool {
    use crate::heap::{kfree, kmalloc};

    let sizes = [8usize, 33, 128, 1000, 4096, 20000];
    let mut live: alloc::vec::Vec<(u64, u64)> = alloc::vec::Vec::new();
    let mut ptrs = alloc::vec::Vec::new();

    for round in 0..8 {
        for &size in &sizes {
            let ptr = kmalloc(size, 8);
            if ptr.is_null() {
                return false;
            }
            // Scribble over the whole range; overlap would corrupt a
            // neighbour and fail its pattern check below.
            unsafe {
                core::ptr::write_bytes(ptr, round as u8 ^ 0x5A, size);
            }
            let range = (ptr as u64, ptr as u64 + size as u64);
            for &(lo, hi) in &live {
                if range.0 < hi && lo < range.1 {
                    return false;
                }
            }
            live.push(range);
            ptrs.push((ptr, size, round as u8 ^ 0x5A));
        }
    }

    let mut ok = true;
    for (ptr, size, pattern) in ptrs {
        for i in 0..size {
            if unsafe { core::ptr::read(ptr.add(i)) } != pattern {
                ok = false;
            }
        }
        kfree(ptr);
    }
    ok
}

/// Property 6: `allocate` returns the lowest free descriptor index.
fn fd_monotonicity() -> bool {
    use crate::vfs::{self, OpenFlags};

    let a = match vfs::open("/dev/console", OpenFlags::O_WRONLY) {
        Ok(fd) => fd,
        Err(_) => return false,
    };
    let b = match vfs::open("/dev/console", OpenFlags::O_WRONLY) {
        Ok(fd) => fd,
        Err(_) => return false,
    };
    let c = match vfs::open("/dev/console", OpenFlags::O_WRONLY) {
        Ok(fd) => fd,
        Err(_) => return false,
    };
    let sequential = b == a + 1 && c == b + 1;

    // Closing the middle one frees exactly that index for the next open.
    let _ = vfs::close(b);
    let reused = vfs::open("/dev/console", OpenFlags::O_WRONLY) == Ok(b);

    let _ = vfs::close(a);
    let _ = vfs::close(b);
    let _ = vfs::close(c);
    sequential && reused
}

/// Property 9: bytes written to a fresh FAT file read back identically,
/// through the full VFS path on a RAM disk.
fn fat_round_trip() -> bool {
    use crate::vfs::{self, OpenFlags, Whence};

    let image = blank_fat12_image();
    let device = crate::block::ramdisk::register_ramdisk("ram0", image);

    if vfs::mkdir("/mnt/selftest").is_err() {
        return false;
    }
    if vfs::probe_and_mount(&device, "/mnt/selftest").is_err() {
        return false;
    }

    let payload = b"Hi Kestrel\n";
    let fd = match vfs::open(
        "/mnt/selftest/HELLO.TXT",
        OpenFlags::O_RDWR | OpenFlags::O_CREAT,
    ) {
        Ok(fd) => fd,
        Err(_) => return false,
    };
    if vfs::write(fd, payload) != Ok(payload.len()) {
        return false;
    }
    if vfs::lseek(fd, 0, Whence::Set) != Ok(0) {
        return false;
    }
    let mut buf = [0u8; 32];
    let n = match vfs::read(fd, &mut buf) {
        Ok(n) => n,
        Err(_) => return false,
    };
    // A second read sits at EOF.
    let eof = vfs::read(fd, &mut buf[n..]) == Ok(0);
    let _ = vfs::close(fd);

    n == payload.len() && &buf[..n] == payload && eof
}

/// A minimal blank FAT12 volume (128 data sectors) for the round trip.
fn blank_fat12_image() -> alloc::vec::Vec<u8> {
    let data_sectors = 128u32;
    let reserved = 1u32;
    let fat_count = 2u32;
    let root_entries = 64u32;
    let root_sectors = root_entries * 32 / 512;
    let spf = (((data_sectors + 2) * 3).div_ceil(2)).div_ceil(512);
    let total = reserved + fat_count * spf + root_sectors + data_sectors;

    let mut image = alloc::vec![0u8; (total as usize) * 512];
    image[11..13].copy_from_slice(&512u16.to_le_bytes());
    image[13] = 1; // sectors per cluster
    image[14..16].copy_from_slice(&(reserved as u16).to_le_bytes());
    image[16] = fat_count as u8;
    image[17..19].copy_from_slice(&(root_entries as u16).to_le_bytes());
    image[19..21].copy_from_slice(&(total as u16).to_le_bytes());
    image[22..24].copy_from_slice(&(spf as u16).to_le_bytes());
    image[54..62].copy_from_slice(b"FAT12   ");
    image[510] = 0x55;
    image[511] = 0xAA;
    for copy in 0..fat_count {
        let base = ((reserved + copy * spf) as usize) * 512;
        image[base] = 0xF8;
        image[base + 1] = 0xFF;
        image[base + 2] = 0xFF;
    }
    image
}

/// Properties 7/8 in miniature: two spawned tasks alternate under the
/// timer, and both complete.
#[cfg(target_arch = "x86_64")]
fn scheduler_alternation() -> bool {
    use core::sync::atomic::AtomicU8;

    static DONE: AtomicU8 = AtomicU8::new(0);
    static TRACE: spin::Mutex<heapless::Vec<u8, 32>> = spin::Mutex::new(heapless::Vec::new());

    fn task_a() {
        for _ in 0..5 {
            let _ = TRACE.lock().push(b'a');
            crate::sched::yield_now();
        }
        DONE.fetch_add(1, Ordering::SeqCst);
    }

    fn task_b() {
        for _ in 0..5 {
            let _ = TRACE.lock().push(b'b');
            crate::sched::yield_now();
        }
        DONE.fetch_add(1, Ordering::SeqCst);
    }

    if crate::sched::spawn("selftest-a", task_a).is_none() {
        return false;
    }
    if crate::sched::spawn("selftest-b", task_b).is_none() {
        return false;
    }

    // Drive the tasks from the idle context until they finish or the
    // clock says something is stuck.
    let deadline = crate::time::ticks() + 200;
    crate::arch::interrupts_enable();
    while DONE.load(Ordering::SeqCst) < 2 {
        if crate::time::ticks() > deadline {
            crate::arch::interrupts_disable();
            return false;
        }
        crate::arch::enable_and_halt();
        crate::sched::preempt_if_pending();
    }
    crate::arch::interrupts_disable();

    // Strict a/b alternation: both tasks yield after every character.
    let trace = TRACE.lock();
    let alternating = trace
        .windows(2)
        .all(|w| w[0] != w[1]);
    trace.len() == 10 && alternating
}
