//! # 16550 UART Serial Driver
//!
//! COM1 is the kernel's primary log sink; it is the first device brought up
//! so that every later subsystem can report. The 16550 is programmed for
//! 115200 baud, 8 data bits, no parity, 1 stop bit.
//!
//! ## Register Map (offset from base port)
//!
//! ```text
//! Offset  DLAB=0  DLAB=1   Read/Write  Description
//! ------  ------  -------  ----------  -----------
//! 0       RBR     DLL      R / W       Receiver Buffer / Divisor Latch Low
//! 1       IER     DLH      R / W       Interrupt Enable / Divisor Latch High
//! 2       IIR/FCR -        R / W       Interrupt Ident / FIFO Control
//! 3       LCR     LCR      R / W       Line Control (bit 7 = DLAB)
//! 4       MCR     MCR      R / W       Modem Control
//! 5       LSR     LSR      R           Line Status (bit 5 = THR empty)
//! ```

use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort;

/// COM1 base I/O port (0x3F8)
pub const COM1_PORT: u16 = 0x3F8;

/// COM2 base I/O port (0x2F8)
pub const COM2_PORT: u16 = 0x2F8;

lazy_static! {
    /// Global COM1 serial port instance
    pub static ref SERIAL1: Mutex<SerialPort> = {
        let mut serial_port = unsafe { SerialPort::new(COM1_PORT) };
        serial_port.init();
        Mutex::new(serial_port)
    };
}

/// Initialize the serial console.
///
/// Forces the lazy initialization so the very first log line does not pay
/// for it while holding some other lock.
pub fn init() {
    let _ = &*SERIAL1;
}

/// Write raw bytes to COM1.
///
/// Interrupt-safe: takes the port lock with interrupts masked so an IRQ
/// handler logging mid-line cannot deadlock against the interrupted writer.
pub fn write_bytes(bytes: &[u8]) {
    crate::arch::without_interrupts(|| {
        let mut port = SERIAL1.lock();
        for &b in bytes {
            port.send(b);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_constants() {
        // The legacy port assignments are fixed by the PC platform.
        assert_eq!(COM1_PORT, 0x3F8);
        assert_eq!(COM2_PORT, 0x2F8);
    }
}
