// Kernel panic path
//
// A panic is presented exactly like a fatal CPU exception: the panic block
// goes to the serial port and the VGA console, then the CPU halts with
// interrupts masked. Debug-time invariant violations (double free, free of
// an untracked frame) funnel through here as well.

use core::panic::PanicInfo;
use core::sync::atomic::{AtomicBool, Ordering};

/// Global panic state - prevents recursive panics
static PANICKING: AtomicBool = AtomicBool::new(false);

/// Format and emit the panic block, then halt forever.
pub fn panic_main(info: &PanicInfo) -> ! {
    // A panic raised while printing a panic gets the short treatment.
    if PANICKING.swap(true, Ordering::SeqCst) {
        crate::log::write_bytes(b"\n!!! RECURSIVE PANIC !!!\n");
        halt_forever();
    }

    crate::arch::interrupts_disable();

    crate::kprintln!();
    crate::kprintln!("================================================================");
    crate::kprintln!("KERNEL PANIC");
    crate::kprintln!("================================================================");

    if let Some(location) = info.location() {
        crate::kprintln!(
            "  at {}:{}:{}",
            location.file(),
            location.line(),
            location.column()
        );
    }
    crate::kprintln!("  {}", info.message());

    crate::kprintln!("================================================================");
    crate::kprintln!("System halted.");

    halt_forever()
}

/// Mask interrupts and halt the CPU forever.
pub fn halt_forever() -> ! {
    crate::arch::interrupts_disable();
    loop {
        crate::arch::halt();
    }
}

#[cfg(all(target_os = "none", not(test)))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    panic_main(info)
}
