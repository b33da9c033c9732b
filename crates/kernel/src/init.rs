//! Kernel bring-up
//!
//! Initialization runs in strict dependency order: boot-info reader,
//! physical memory, virtual memory, heap, GDT/TSS, IDT, interrupt
//! controller, tick source, scheduler - then the loosely-coupled storage
//! stack (block devices, partitions, VFS, filesystem probes). Interrupts
//! stay disabled until every subsystem on the IRQ path is live.

use crate::boot::{multiboot2, BootInfo};

/// Entry from the boot stub. Never returns: the boot context ends its
/// life as the scheduler's idle task.
pub fn kernel_main(magic: u32, mbi_addr: u64) -> ! {
    // The earliest allocations (zone bitmaps, boot-info copies) come from
    // the static bootstrap heap.
    crate::heap::init_bootstrap_heap();

    #[cfg(target_arch = "x86_64")]
    crate::arch::x86_64::serial::init();

    crate::kprintln!();
    crate::kprintln!("Kestrel kernel starting");

    // A: boot information
    let boot_info = match unsafe { multiboot2::parse(magic, mbi_addr as *const u8) } {
        Ok(info) => info,
        Err(e) => panic!("bad Multiboot2 information structure: {:?}", e),
    };
    log_boot_info(&boot_info);

    // Text console only if the loader left us in VGA text mode.
    if boot_info.framebuffer.is_none() {
        crate::drivers::vga::init();
        crate::info!("console: VGA text mode at 0xB8000");
    }

    #[cfg(target_arch = "x86_64")]
    bring_up(&boot_info);

    // J/K/L: storage stack.
    #[cfg(target_arch = "x86_64")]
    crate::arch::x86_64::ata::init();
    if let Err(e) = crate::vfs::init_vfs() {
        panic!("VFS initialization failed: {:?}", e);
    }
    mount_detected_filesystems();

    #[cfg(feature = "selftest")]
    crate::selftest::run_all();

    crate::info!("bring-up complete, entering idle loop");
    crate::arch::interrupts_enable();
    crate::sched::enter_idle_loop()
}

#[cfg(target_arch = "x86_64")]
fn bring_up(boot_info: &BootInfo<'_>) {
    use crate::arch::x86_64::{acpi, controller, gdt, hpet, idt, paging, rtc};

    rtc::log_boot_time();

    // B: physical memory
    crate::mm::init_pmm(boot_info);

    // C: virtual memory (identity map + CR3)
    if let Err(e) = paging::init_vmm() {
        panic!("VMM initialization failed: {:?}", e);
    }

    // D: kernel heap (chunk pools over PMM + VMM)
    if let Err(e) = crate::heap::init_heap() {
        panic!("heap initialization failed: {:?}", e);
    }

    // E/F: descriptor tables and exception vectors
    unsafe {
        gdt::init_gdt();
    }
    idt::init_idt();

    // G: interrupt controller - PIC first, then the APIC upgrade now
    // that the heap (and with it the MMIO mappings) is available.
    unsafe {
        controller::init_pic();
    }
    acpi::init();
    acpi::with_info(|info| {
        if let Some(base) = info.hpet_base {
            unsafe { hpet::init(base) };
        }
    });
    controller::upgrade_to_apic();

    // H: tick source
    crate::time::init();

    // I: scheduler
    crate::sched::init();
}

fn log_boot_info(boot_info: &BootInfo<'_>) {
    crate::info!(
        "boot: {:?} via {}, {} MiB usable RAM",
        boot_info.boot_mode,
        boot_info.bootloader_name.unwrap_or("unknown loader"),
        boot_info.available_bytes() / (1024 * 1024)
    );
    if let Some(cmdline) = boot_info.cmdline {
        if !cmdline.is_empty() {
            crate::info!("boot: cmdline \"{}\"", cmdline);
        }
    }
    for region in boot_info.memory_map.iter() {
        crate::debug!(
            "boot: mmap {:#012x}..{:#012x} {:?}",
            region.base,
            region.end(),
            region.kind
        );
    }
    if let Some(fb) = &boot_info.framebuffer {
        crate::info!(
            "boot: framebuffer {}x{}x{} at {:#x} ({:?})",
            fb.width,
            fb.height,
            fb.bpp,
            fb.addr,
            fb.kind
        );
    }
    if boot_info.efi_boot_services {
        crate::warn!("boot: EFI boot services were not exited");
    }
}

/// Offer every registered device to the filesystem probes; successful
/// mounts land under /mnt. Whole disks with partition tables fail the
/// probes and are skipped; their partitions are offered individually.
fn mount_detected_filesystems() {
    for device in crate::block::all_devices() {
        let path = alloc::format!("/mnt/{}", device.name);
        if crate::vfs::mkdir(&path).is_err() {
            continue;
        }
        match crate::vfs::probe_and_mount(&device, &path) {
            Ok(fs_type) => crate::info!("vfs: {} mounted at {} ({})", device.name, path, fs_type),
            Err(_) => {
                // No recognised filesystem; drop the empty mountpoint.
                let _ = crate::vfs::unlink(&path);
            }
        }
    }
}
