// Architecture support
//
// Kestrel targets x86_64 only; the helpers below are the portable face the
// rest of the kernel sees. Hosted test builds get no-op stand-ins so the
// architecture-neutral cores can run anywhere.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

/// Disable maskable interrupts (`cli`).
#[inline]
pub fn interrupts_disable() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    ::x86_64::instructions::interrupts::disable();
}

/// Enable maskable interrupts (`sti`).
#[inline]
pub fn interrupts_enable() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    ::x86_64::instructions::interrupts::enable();
}

/// Are interrupts currently enabled?
#[inline]
pub fn interrupts_enabled() -> bool {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        ::x86_64::instructions::interrupts::are_enabled()
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        false
    }
}

/// Run `f` with interrupts masked, restoring the previous state afterwards.
///
/// This is the kernel's single mutual-exclusion primitive against IRQ
/// context; critical sections must stay short and bounded.
#[inline]
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        ::x86_64::instructions::interrupts::without_interrupts(f)
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        f()
    }
}

/// Halt the CPU until the next interrupt (`hlt`).
#[inline]
pub fn halt() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    ::x86_64::instructions::hlt();
}

/// Enable interrupts and halt - the idle-task body.
#[inline]
pub fn enable_and_halt() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    ::x86_64::instructions::interrupts::enable_and_hlt();
}
