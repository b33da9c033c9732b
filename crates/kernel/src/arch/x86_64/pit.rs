//! # PIT (Programmable Interval Timer) - Intel 8253/8254
//!
//! The PIT is the bring-up timer: it needs no discovery, no MMIO and no
//! calibration, so it drives the tick while the memory managers come up
//! and stays the fallback on machines without a usable APIC. It is also
//! the reference clock for calibrating the APIC timer.
//!
//! ## Channels and ports
//!
//! ```text
//! 0x40  Channel 0 data  - system timer, wired to IRQ 0
//! 0x41  Channel 1 data  - DRAM refresh (legacy, unused)
//! 0x42  Channel 2 data  - PC speaker / gated timing
//! 0x43  Mode/command register (write-only)
//! ```
//!
//! The input clock is fixed at 1.193182 MHz; a 16-bit divisor selects the
//! output rate: `divisor = 1193182 / hz`. For the 100 Hz system tick the
//! divisor is 11932 (~10 ms per tick).
//!
//! Channel 2 runs one-shot delays without interrupts: its gate sits on
//! port 0x61 bit 0 and its output is readable at port 0x61 bit 5, which
//! is exactly what the APIC calibration loop needs.

use x86_64::instructions::port::Port;

/// PIT input frequency in Hz.
pub const PIT_FREQUENCY: u32 = 1_193_182;

const CH0_DATA: u16 = 0x40;
const CH2_DATA: u16 = 0x42;
const MODE_CMD: u16 = 0x43;
/// NMI status / PC speaker control; gates channel 2.
const PORT_61: u16 = 0x61;

/// Channel 0, lobyte/hibyte, mode 3 (square wave), binary.
const CMD_CH0_SQUARE: u8 = 0x36;
/// Channel 2, lobyte/hibyte, mode 0 (terminal count), binary.
const CMD_CH2_ONESHOT: u8 = 0xB0;

/// Program channel 0 as the periodic system tick at `hz`.
///
/// # Safety
///
/// Reprogramming while the timer IRQ is unmasked produces a torn period;
/// call with the line masked.
pub unsafe fn start_periodic(hz: u32) {
    let divisor = (PIT_FREQUENCY / hz).clamp(1, 65535) as u16;
    let mut cmd: Port<u8> = Port::new(MODE_CMD);
    let mut data: Port<u8> = Port::new(CH0_DATA);
    cmd.write(CMD_CH0_SQUARE);
    data.write((divisor & 0xFF) as u8);
    data.write((divisor >> 8) as u8);
    crate::info!("pit: channel 0 periodic at {} Hz (divisor {})", hz, divisor);
}

/// Busy-wait `ms` milliseconds on channel 2, no interrupts involved.
///
/// Used as the independent reference for APIC timer calibration.
pub fn busy_wait_ms(ms: u32) {
    for _ in 0..ms {
        unsafe {
            wait_one_ms();
        }
    }
}

unsafe fn wait_one_ms() {
    let mut port61: Port<u8> = Port::new(PORT_61);
    let mut cmd: Port<u8> = Port::new(MODE_CMD);
    let mut data: Port<u8> = Port::new(CH2_DATA);

    // Gate channel 2 on, speaker output off.
    let gate = port61.read();
    port61.write((gate & !0x02) | 0x01);

    // One-shot terminal count of 1 ms.
    let count = (PIT_FREQUENCY / 1000) as u16;
    cmd.write(CMD_CH2_ONESHOT);
    data.write((count & 0xFF) as u8);
    data.write((count >> 8) as u8);

    // Output goes high at terminal count.
    while port61.read() & 0x20 == 0 {
        core::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_divisor_for_common_rates() {
        assert_eq!(PIT_FREQUENCY / 100, 11931); // ~10 ms tick
        assert_eq!(PIT_FREQUENCY / 1000, 1193); // ~1 ms
        // 18.2 Hz (BIOS default) needs the full 16-bit range.
        assert!(PIT_FREQUENCY / 19 < 65536);
    }
}
