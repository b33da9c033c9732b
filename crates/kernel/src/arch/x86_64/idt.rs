//! # Interrupt Descriptor Table (IDT)
//!
//! 256 gate descriptors:
//!
//! | Range      | Assignment                                        |
//! |------------|---------------------------------------------------|
//! | 0x00–0x1F  | CPU exceptions (fixed by the architecture)        |
//! | 0x20–0x2F  | Legacy IRQ 0..15 (PIC or remapped IO-APIC lines)  |
//! | 0x30       | Local APIC timer                                  |
//! | 0x31–0xFE  | Available for additional devices / IPIs           |
//! | 0xFF       | APIC spurious                                     |
//!
//! Every exception is fatal: the handler prints a structured dump (vector,
//! error code, RIP/CS/RFLAGS/RSP/SS, CR2 for page faults) and halts with
//! interrupts masked. There is no demand paging, so page faults are bugs
//! too. The double fault, NMI and machine check handlers run on dedicated
//! IST stacks.
//!
//! Hardware vectors compute `irq = vector - 0x20`, dispatch through the
//! handler registry, send EOI to the active controller, and finally give
//! the scheduler its shot at preempting on the return path.

use super::tss::{DOUBLE_FAULT_IST_INDEX, MACHINE_CHECK_IST_INDEX, NMI_IST_INDEX};
use lazy_static::lazy_static;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

/// First hardware IRQ vector (PIC master remap base).
pub const IRQ_BASE_VECTOR: u8 = 0x20;

/// Local APIC timer vector.
pub const APIC_TIMER_VECTOR: u8 = 0x30;

/// APIC spurious vector. Fixed at 0xFF; the low nibble must read all-ones
/// on old local APICs.
pub const SPURIOUS_VECTOR: u8 = 0xFF;

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();

        // CPU exceptions (0-31)
        idt.divide_error.set_handler_fn(divide_error_handler);
        idt.debug.set_handler_fn(debug_handler);
        idt.overflow.set_handler_fn(overflow_handler);
        idt.bound_range_exceeded.set_handler_fn(bound_range_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.device_not_available.set_handler_fn(device_not_available_handler);
        idt.invalid_tss.set_handler_fn(invalid_tss_handler);
        idt.segment_not_present.set_handler_fn(segment_not_present_handler);
        idt.stack_segment_fault.set_handler_fn(stack_segment_handler);
        idt.general_protection_fault.set_handler_fn(gp_fault_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.x87_floating_point.set_handler_fn(x87_handler);
        idt.alignment_check.set_handler_fn(alignment_check_handler);
        idt.simd_floating_point.set_handler_fn(simd_handler);
        idt.virtualization.set_handler_fn(virtualization_handler);

        // Breakpoint is the one recoverable exception: log and continue.
        idt.breakpoint.set_handler_fn(breakpoint_handler);

        // The fatal-with-IST trio.
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(DOUBLE_FAULT_IST_INDEX);
            idt.non_maskable_interrupt
                .set_handler_fn(nmi_handler)
                .set_stack_index(NMI_IST_INDEX);
            idt.machine_check
                .set_handler_fn(machine_check_handler)
                .set_stack_index(MACHINE_CHECK_IST_INDEX);
        }

        // Hardware IRQs 0..15 at 0x20..0x2F.
        idt[(IRQ_BASE_VECTOR + 0) as usize].set_handler_fn(irq0_handler);
        idt[(IRQ_BASE_VECTOR + 1) as usize].set_handler_fn(irq1_handler);
        idt[(IRQ_BASE_VECTOR + 2) as usize].set_handler_fn(irq2_handler);
        idt[(IRQ_BASE_VECTOR + 3) as usize].set_handler_fn(irq3_handler);
        idt[(IRQ_BASE_VECTOR + 4) as usize].set_handler_fn(irq4_handler);
        idt[(IRQ_BASE_VECTOR + 5) as usize].set_handler_fn(irq5_handler);
        idt[(IRQ_BASE_VECTOR + 6) as usize].set_handler_fn(irq6_handler);
        idt[(IRQ_BASE_VECTOR + 7) as usize].set_handler_fn(irq7_handler);
        idt[(IRQ_BASE_VECTOR + 8) as usize].set_handler_fn(irq8_handler);
        idt[(IRQ_BASE_VECTOR + 9) as usize].set_handler_fn(irq9_handler);
        idt[(IRQ_BASE_VECTOR + 10) as usize].set_handler_fn(irq10_handler);
        idt[(IRQ_BASE_VECTOR + 11) as usize].set_handler_fn(irq11_handler);
        idt[(IRQ_BASE_VECTOR + 12) as usize].set_handler_fn(irq12_handler);
        idt[(IRQ_BASE_VECTOR + 13) as usize].set_handler_fn(irq13_handler);
        idt[(IRQ_BASE_VECTOR + 14) as usize].set_handler_fn(irq14_handler);
        idt[(IRQ_BASE_VECTOR + 15) as usize].set_handler_fn(irq15_handler);

        // Local APIC timer and spurious.
        idt[APIC_TIMER_VECTOR as usize].set_handler_fn(apic_timer_handler);
        idt[SPURIOUS_VECTOR as usize].set_handler_fn(spurious_handler);

        idt
    };
}

/// Load the IDT. GDT and TSS must already be live (the IST indices point
/// into the active TSS).
pub fn init_idt() {
    IDT.load();
    crate::info!("idt: 256 gates loaded");
}

//
// Fatal exception path
//

/// Dump the machine state the handler ABI preserves and halt forever.
fn fatal_exception(
    name: &str,
    vector: u8,
    error_code: Option<u64>,
    frame: &InterruptStackFrame,
) -> ! {
    crate::kprintln!();
    crate::kprintln!("================================================================");
    crate::kprintln!("FATAL EXCEPTION: {} (vector {})", name, vector);
    if let Some(code) = error_code {
        crate::kprintln!("  error code: {:#018x}", code);
    }
    crate::kprintln!("  RIP:    {:#018x}", frame.instruction_pointer.as_u64());
    crate::kprintln!("  CS:     {:#06x}", frame.code_segment);
    crate::kprintln!("  RFLAGS: {:#018x}", frame.cpu_flags);
    crate::kprintln!("  RSP:    {:#018x}", frame.stack_pointer.as_u64());
    crate::kprintln!("  SS:     {:#06x}", frame.stack_segment);
    crate::kprintln!("================================================================");
    crate::lib::panic::halt_forever()
}

//
// Exception handlers
//

extern "x86-interrupt" fn divide_error_handler(frame: InterruptStackFrame) {
    fatal_exception("DIVIDE ERROR", 0, None, &frame)
}

extern "x86-interrupt" fn debug_handler(frame: InterruptStackFrame) {
    fatal_exception("DEBUG", 1, None, &frame)
}

extern "x86-interrupt" fn nmi_handler(frame: InterruptStackFrame) {
    fatal_exception("NON-MASKABLE INTERRUPT", 2, None, &frame)
}

/// INT3 - the only recoverable exception; debuggers depend on it.
extern "x86-interrupt" fn breakpoint_handler(frame: InterruptStackFrame) {
    crate::warn!(
        "breakpoint at {:#x}",
        frame.instruction_pointer.as_u64()
    );
}

extern "x86-interrupt" fn overflow_handler(frame: InterruptStackFrame) {
    fatal_exception("OVERFLOW", 4, None, &frame)
}

extern "x86-interrupt" fn bound_range_handler(frame: InterruptStackFrame) {
    fatal_exception("BOUND RANGE EXCEEDED", 5, None, &frame)
}

extern "x86-interrupt" fn invalid_opcode_handler(frame: InterruptStackFrame) {
    fatal_exception("INVALID OPCODE", 6, None, &frame)
}

extern "x86-interrupt" fn device_not_available_handler(frame: InterruptStackFrame) {
    fatal_exception("DEVICE NOT AVAILABLE", 7, None, &frame)
}

extern "x86-interrupt" fn double_fault_handler(frame: InterruptStackFrame, error_code: u64) -> ! {
    fatal_exception("DOUBLE FAULT", 8, Some(error_code), &frame)
}

extern "x86-interrupt" fn invalid_tss_handler(frame: InterruptStackFrame, error_code: u64) {
    fatal_exception("INVALID TSS", 10, Some(error_code), &frame)
}

extern "x86-interrupt" fn segment_not_present_handler(frame: InterruptStackFrame, error_code: u64) {
    fatal_exception("SEGMENT NOT PRESENT", 11, Some(error_code), &frame)
}

extern "x86-interrupt" fn stack_segment_handler(frame: InterruptStackFrame, error_code: u64) {
    fatal_exception("STACK SEGMENT FAULT", 12, Some(error_code), &frame)
}

extern "x86-interrupt" fn gp_fault_handler(frame: InterruptStackFrame, error_code: u64) {
    fatal_exception("GENERAL PROTECTION FAULT", 13, Some(error_code), &frame)
}

/// Page faults are fatal: there is no demand paging, so any fault is a
/// kernel bug. CR2 carries the faulting address.
extern "x86-interrupt" fn page_fault_handler(
    frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    let cr2 = x86_64::registers::control::Cr2::read();
    crate::kprintln!();
    crate::kprintln!("PAGE FAULT accessing {:#018x}", cr2.as_u64());
    fatal_exception("PAGE FAULT", 14, Some(error_code.bits()), &frame)
}

extern "x86-interrupt" fn x87_handler(frame: InterruptStackFrame) {
    fatal_exception("x87 FLOATING POINT", 16, None, &frame)
}

extern "x86-interrupt" fn alignment_check_handler(frame: InterruptStackFrame, error_code: u64) {
    fatal_exception("ALIGNMENT CHECK", 17, Some(error_code), &frame)
}

extern "x86-interrupt" fn machine_check_handler(frame: InterruptStackFrame) -> ! {
    fatal_exception("MACHINE CHECK", 18, None, &frame)
}

extern "x86-interrupt" fn simd_handler(frame: InterruptStackFrame) {
    fatal_exception("SIMD FLOATING POINT", 19, None, &frame)
}

extern "x86-interrupt" fn virtualization_handler(frame: InterruptStackFrame) {
    fatal_exception("VIRTUALIZATION", 20, None, &frame)
}

//
// Hardware IRQ path
//

/// Common tail for every hardware IRQ: dispatch, EOI, then let the
/// scheduler act on a pending reschedule from the return path.
fn irq_common(irq: u8) {
    // Spurious IRQ 7/15 under the 8259: checked against the ISR before
    // dispatch; a spurious line gets no handler and a partial EOI.
    if (irq == 7 || irq == 15) && super::controller::handle_spurious(irq) {
        return;
    }
    crate::interrupts::dispatch(irq);
    super::controller::end_of_interrupt(irq);
    crate::sched::preempt_if_pending();
}

macro_rules! irq_handler {
    ($name:ident, $irq:expr) => {
        extern "x86-interrupt" fn $name(_frame: InterruptStackFrame) {
            irq_common($irq);
        }
    };
}

irq_handler!(irq0_handler, 0);
irq_handler!(irq1_handler, 1);
irq_handler!(irq2_handler, 2);
irq_handler!(irq3_handler, 3);
irq_handler!(irq4_handler, 4);
irq_handler!(irq5_handler, 5);
irq_handler!(irq6_handler, 6);
irq_handler!(irq7_handler, 7);
irq_handler!(irq8_handler, 8);
irq_handler!(irq9_handler, 9);
irq_handler!(irq10_handler, 10);
irq_handler!(irq11_handler, 11);
irq_handler!(irq12_handler, 12);
irq_handler!(irq13_handler, 13);
irq_handler!(irq14_handler, 14);
irq_handler!(irq15_handler, 15);

/// The local APIC timer dispatches on the timer line like the PIT does,
/// so the tick path is controller-agnostic.
extern "x86-interrupt" fn apic_timer_handler(_frame: InterruptStackFrame) {
    crate::interrupts::dispatch(crate::interrupts::TIMER_IRQ);
    super::controller::end_of_interrupt(crate::interrupts::TIMER_IRQ);
    crate::sched::preempt_if_pending();
}

/// APIC spurious vector: no EOI, no work.
extern "x86-interrupt" fn spurious_handler(_frame: InterruptStackFrame) {}
