//! Context switch primitive
//!
//! The switch saves the callee-saved registers on the outgoing task's
//! stack, stores its RSP, and loads the incoming task's RSP. Everything
//! else - the interrupt frame included, when the switch happens on the
//! IRQ return path - already lives on the stack, so resuming a task is
//! `ret` back into whatever it was doing (and eventually `iretq` if an
//! interrupt started the switch).
//!
//! A brand-new task's stack is primed to look exactly like a suspended
//! one: six zeroed callee-saved slots and a return address pointing at
//! the entry trampoline.

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
core::arch::global_asm!(
    ".section .text",
    ".global context_switch",
    // fn context_switch(prev_rsp_slot: *mut u64 /* rdi */, next_rsp: u64 /* rsi */)
    "context_switch:",
    "    push rbp",
    "    push rbx",
    "    push r12",
    "    push r13",
    "    push r14",
    "    push r15",
    "    mov [rdi], rsp",
    "    mov rsp, rsi",
    "    pop r15",
    "    pop r14",
    "    pop r13",
    "    pop r12",
    "    pop rbx",
    "    pop rbp",
    "    ret",
);

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
extern "C" {
    /// Switch stacks: save RSP through `prev_rsp_slot`, load `next_rsp`.
    ///
    /// Must be called with interrupts disabled. Returns when the previous
    /// task is switched back in.
    pub fn context_switch(prev_rsp_slot: *mut u64, next_rsp: u64);
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub unsafe fn context_switch(_prev_rsp_slot: *mut u64, _next_rsp: u64) {}

/// Number of 8-byte callee-saved slots the switch pushes.
pub const SAVED_REGS: usize = 6;

/// Prime a fresh kernel stack so that switching to it enters `entry`.
///
/// Returns the RSP to store as the task's saved stack pointer.
pub fn prime_stack(stack_top: u64, entry: u64) -> u64 {
    // Align down, then lay out: [zeros x6][entry].
    let top = stack_top & !0xF;
    let mut rsp = top;
    unsafe {
        rsp -= 8;
        write_stack(rsp, entry);
        for _ in 0..SAVED_REGS {
            rsp -= 8;
            write_stack(rsp, 0);
        }
    }
    rsp
}

#[cfg(target_os = "none")]
unsafe fn write_stack(addr: u64, value: u64) {
    core::ptr::write(addr as *mut u64, value);
}

#[cfg(not(target_os = "none"))]
unsafe fn write_stack(_addr: u64, _value: u64) {}
