//! # Task State Segment (TSS)
//!
//! In 64-bit mode the TSS carries no task state; it exists for two things:
//!
//! 1. **RSP0** - the kernel stack the CPU switches to on a privilege
//!    transition.
//! 2. **IST1..IST7** - dedicated stacks for vectors that must never run on
//!    a possibly-corrupt kernel stack.
//!
//! IST assignment:
//!
//! | Vector | Name          | IST |
//! |--------|---------------|-----|
//! | 8      | Double Fault  | 1   |
//! | 2      | NMI           | 2   |
//! | 18     | Machine Check | 3   |
//! | others | -             | 0 (RSP0) |
//!
//! A double fault on the main stack would otherwise escalate straight to a
//! triple fault and reset the machine. All stacks are 16 KiB, statically
//! allocated, 16-byte aligned.

use crate::config::KERNEL_STACK_SIZE;
use lazy_static::lazy_static;
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

/// IST slot (0-based, so hardware IST1) for the double fault handler.
pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

/// IST slot (hardware IST2) for the NMI handler.
pub const NMI_IST_INDEX: u16 = 1;

/// IST slot (hardware IST3) for the machine check handler.
pub const MACHINE_CHECK_IST_INDEX: u16 = 2;

/// Stack storage with the alignment the x86_64 ABI expects.
#[repr(align(16))]
struct Stack([u8; KERNEL_STACK_SIZE]);

impl Stack {
    const fn new() -> Self {
        Stack([0; KERNEL_STACK_SIZE])
    }

    fn top(&self) -> VirtAddr {
        let start = self.0.as_ptr() as u64;
        // Stacks grow down; hand out the exclusive end.
        VirtAddr::new(start + KERNEL_STACK_SIZE as u64)
    }
}

/// RSP0: the boot/kernel stack used on privilege transitions.
static PRIVILEGE_STACK: Stack = Stack::new();

/// The seven IST stacks. Only the first three are assigned to vectors;
/// the rest are wired up so future handlers can claim a slot without
/// touching the TSS layout.
static IST_STACKS: [Stack; 7] = [
    Stack::new(),
    Stack::new(),
    Stack::new(),
    Stack::new(),
    Stack::new(),
    Stack::new(),
    Stack::new(),
];

lazy_static! {
    /// Global TSS instance, referenced by the GDT's TSS descriptor.
    pub static ref TSS: TaskStateSegment = {
        let mut tss = TaskStateSegment::new();
        tss.privilege_stack_table[0] = PRIVILEGE_STACK.top();
        for (i, stack) in IST_STACKS.iter().enumerate() {
            tss.interrupt_stack_table[i] = stack.top();
        }
        tss
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ist_stacks_distinct_and_aligned() {
        let interrupt_stack_table = TSS.interrupt_stack_table;
        let mut tops: alloc::vec::Vec<u64> = interrupt_stack_table
            .iter()
            .map(|v| v.as_u64())
            .collect();
        tops.push(TSS.privilege_stack_table[0].as_u64());
        for &top in &tops {
            assert_eq!(top % 16, 0);
        }
        let before = tops.len();
        tops.sort_unstable();
        tops.dedup();
        assert_eq!(tops.len(), before, "stacks must not alias");
    }
}
