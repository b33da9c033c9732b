//! # Legacy PIC (8259A Programmable Interrupt Controller)
//!
//! Two cascaded 8259As provide the 15 usable legacy IRQ lines:
//!
//! ```text
//! Master PIC (0x20-0x21)          Slave PIC (0xA0-0xA1)
//! ┌─────────────────┐             ┌─────────────────┐
//! │ IRQ 0 - Timer   │             │ IRQ  8 - RTC    │
//! │ IRQ 1 - Keyboard│             │ IRQ  9 - Free   │
//! │ IRQ 2 - Cascade │────────────►│ IRQ 10 - Free   │
//! │ IRQ 3 - COM2    │             │ IRQ 11 - Free   │
//! │ IRQ 4 - COM1    │             │ IRQ 12 - Mouse  │
//! │ IRQ 5 - LPT2    │             │ IRQ 13 - FPU    │
//! │ IRQ 6 - Floppy  │             │ IRQ 14 - ATA 1  │
//! │ IRQ 7 - LPT1    │             │ IRQ 15 - ATA 2  │
//! └─────────────────┘             └─────────────────┘
//! ```
//!
//! At power-on the PICs deliver IRQs on vectors 0..15, colliding with CPU
//! exceptions; initialization remaps them to 0x20/0x28 via the ICW1-4
//! sequence. The PIC stays in service until the memory managers are far
//! enough along for the APIC to take over, and remains the fallback on
//! machines without one.
//!
//! ## Spurious IRQs
//!
//! A line 7 or 15 interrupt may be spurious (noise on the request line).
//! The In-Service Register disambiguates: if the line's ISR bit is clear,
//! the IRQ never entered service. A spurious IRQ 7 gets no EOI at all; a
//! spurious IRQ 15 still needs an EOI on the *master*, whose cascade line
//! did enter service.

use spin::Mutex;
use x86_64::instructions::port::Port;

/// Master PIC command port
const PIC1_COMMAND: u16 = 0x20;
/// Master PIC data port
const PIC1_DATA: u16 = 0x21;
/// Slave PIC command port
const PIC2_COMMAND: u16 = 0xA0;
/// Slave PIC data port
const PIC2_DATA: u16 = 0xA1;

/// End of Interrupt command
const CMD_EOI: u8 = 0x20;
/// Read In-Service Register command
const CMD_READ_ISR: u8 = 0x0B;

const ICW1_INIT: u8 = 0x10;
const ICW1_ICW4: u8 = 0x01;
const ICW4_8086: u8 = 0x01;

/// Master PIC vector offset (IRQ 0-7 → 0x20-0x27)
pub const PIC1_OFFSET: u8 = 0x20;
/// Slave PIC vector offset (IRQ 8-15 → 0x28-0x2F)
pub const PIC2_OFFSET: u8 = 0x28;

/// Chained PIC (8259A) controller
pub struct ChainedPics {
    master_command: Port<u8>,
    master_data: Port<u8>,
    slave_command: Port<u8>,
    slave_data: Port<u8>,
    master_offset: u8,
    slave_offset: u8,
}

impl ChainedPics {
    pub const fn new(master_offset: u8, slave_offset: u8) -> Self {
        Self {
            master_command: Port::new(PIC1_COMMAND),
            master_data: Port::new(PIC1_DATA),
            slave_command: Port::new(PIC2_COMMAND),
            slave_data: Port::new(PIC2_DATA),
            master_offset,
            slave_offset,
        }
    }

    /// Remap both PICs to the configured offsets (ICW1-4) and mask every
    /// line.
    ///
    /// # Safety
    ///
    /// Must run with interrupts disabled; a half-programmed PIC delivers
    /// garbage vectors.
    pub unsafe fn initialize(&mut self) {
        // ICW1: start initialization, ICW4 follows
        self.master_command.write(ICW1_INIT | ICW1_ICW4);
        io_wait();
        self.slave_command.write(ICW1_INIT | ICW1_ICW4);
        io_wait();

        // ICW2: vector offsets
        self.master_data.write(self.master_offset);
        io_wait();
        self.slave_data.write(self.slave_offset);
        io_wait();

        // ICW3: slave on master line 2; cascade identity 2
        self.master_data.write(0x04);
        io_wait();
        self.slave_data.write(0x02);
        io_wait();

        // ICW4: 8086 mode
        self.master_data.write(ICW4_8086);
        io_wait();
        self.slave_data.write(ICW4_8086);
        io_wait();

        // Everything masked until a handler registers.
        self.master_data.write(0xFF);
        self.slave_data.write(0xFF);
    }

    /// Unmask one IRQ line. Unmasking a slave line also opens the cascade.
    ///
    /// # Safety
    ///
    /// A handler must be registered before the line is opened.
    pub unsafe fn unmask(&mut self, irq: u8) {
        if irq < 8 {
            let mask = self.master_data.read();
            self.master_data.write(mask & !(1 << irq));
        } else {
            let line = irq - 8;
            let mask = self.slave_data.read();
            self.slave_data.write(mask & !(1 << line));

            let master_mask = self.master_data.read();
            self.master_data.write(master_mask & !(1 << 2));
        }
    }

    /// Mask one IRQ line.
    pub unsafe fn mask(&mut self, irq: u8) {
        if irq < 8 {
            let mask = self.master_data.read();
            self.master_data.write(mask | (1 << irq));
        } else {
            let line = irq - 8;
            let mask = self.slave_data.read();
            self.slave_data.write(mask | (1 << line));
        }
    }

    /// Send EOI for an IRQ line: slave first (if the line is the slave's),
    /// then master.
    ///
    /// # Safety
    ///
    /// Exactly once per serviced interrupt.
    pub unsafe fn end_of_interrupt(&mut self, irq: u8) {
        if irq >= 8 {
            self.slave_command.write(CMD_EOI);
        }
        self.master_command.write(CMD_EOI);
    }

    /// Spurious check for lines 7 and 15 against the ISR. Returns true if
    /// the interrupt never entered service; the required partial EOI has
    /// then already been sent.
    pub unsafe fn check_spurious(&mut self, irq: u8) -> bool {
        match irq {
            7 => {
                self.master_command.write(CMD_READ_ISR);
                let isr = self.master_command.read();
                (isr & 0x80) == 0
            }
            15 => {
                self.slave_command.write(CMD_READ_ISR);
                let isr = self.slave_command.read();
                if (isr & 0x80) == 0 {
                    // The cascade line on the master did enter service.
                    self.master_command.write(CMD_EOI);
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }

    /// Mask everything (transition to APIC mode).
    pub unsafe fn disable(&mut self) {
        self.master_data.write(0xFF);
        self.slave_data.write(0xFF);
    }
}

/// Global PIC instance
pub static PICS: Mutex<ChainedPics> = Mutex::new(ChainedPics::new(PIC1_OFFSET, PIC2_OFFSET));

/// Remap and mask the PICs.
///
/// # Safety
///
/// Once, with interrupts disabled, after the IDT is loaded.
pub unsafe fn init() {
    PICS.lock().initialize();
    crate::info!(
        "pic: 8259A remapped, IRQ 0-7 -> {:#x}.., IRQ 8-15 -> {:#x}..",
        PIC1_OFFSET,
        PIC2_OFFSET
    );
}

/// I/O wait - short delay for PIC programming
///
/// The PIC requires a small delay between commands. We use an I/O port
/// write to port 0x80 (unused diagnostic port) as a short delay.
#[inline]
fn io_wait() {
    unsafe {
        Port::<u8>::new(0x80).write(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_offsets() {
        // IRQ vectors must land in the 0x20..0x30 window the IDT reserves.
        assert_eq!(PIC1_OFFSET, 0x20);
        assert_eq!(PIC2_OFFSET, 0x28);
        assert_eq!(PIC2_OFFSET - PIC1_OFFSET, 8);
    }
}
