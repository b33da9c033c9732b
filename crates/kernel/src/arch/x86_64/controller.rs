//! # Interrupt controller selection
//!
//! The machine has up to three ways to deliver device interrupts, and the
//! kernel picks one at runtime:
//!
//! | Signals                  | Active controller      |
//! |--------------------------|------------------------|
//! | x2APIC + heap ready      | x2APIC + IO-APIC       |
//! | APIC + heap ready        | LAPIC + IO-APIC        |
//! | otherwise                | 8259 PIC               |
//!
//! The heap-readiness gate exists because the APIC and IO-APIC live in
//! MMIO regions the VMM must cover, and the VMM needs the PMM; until that
//! point in bring-up the PIC carries the timer IRQ on its own. The
//! upgrade disables the outgoing controller before enabling the new one,
//! and is a single swap of the global.
//!
//! Uniform operations: `mask`, `unmask`, `end_of_interrupt`, plus the
//! 8259's spurious-line handling. IRQ lines stay masked until a handler
//! registers.

use super::apic::{ApicMode, LocalApic};
use super::ioapic::IoApic;
use super::{acpi, pic};
use spin::Mutex;

/// The active interrupt controller.
pub enum Controller {
    /// Legacy 8259 pair.
    Pic8259,
    /// Local APIC (xAPIC or x2APIC) with IO-APICs routing the GSIs.
    Apic {
        lapic: LocalApic,
        ioapics: heapless::Vec<IoApic, 8>,
    },
}

static ACTIVE: Mutex<Option<Controller>> = Mutex::new(None);

/// Bring up the boot-time controller: the remapped, fully-masked PIC.
///
/// # Safety
///
/// Interrupts disabled; IDT loaded.
pub unsafe fn init_pic() {
    pic::init();
    *ACTIVE.lock() = Some(Controller::Pic8259);
}

/// Decision table, evaluated once the heap is up. Returns the APIC mode
/// to upgrade into, or `None` to stay on the PIC.
fn select_upgrade() -> Option<ApicMode> {
    if super::cpu::has_x2apic() {
        Some(ApicMode::X2Apic)
    } else if super::cpu::has_apic() {
        Some(ApicMode::XApic)
    } else {
        None
    }
}

/// Switch from the PIC to the APIC + IO-APIC if the CPU has one.
///
/// Requires heap and VMM (MMIO access). Lines previously unmasked on the
/// PIC are re-routed and re-opened on the IO-APIC.
pub fn upgrade_to_apic() {
    let mode = match select_upgrade() {
        Some(mode) => mode,
        None => {
            crate::info!("intc: no APIC on this CPU, staying on the 8259 PIC");
            return;
        }
    };

    crate::arch::without_interrupts(|| {
        let mut active = ACTIVE.lock();

        // Quiesce the outgoing controller first.
        if matches!(active.as_ref(), Some(Controller::Pic8259)) {
            unsafe { pic::PICS.lock().disable() };
        }

        let lapic = unsafe { LocalApic::new(mode) };
        let lapic_id = lapic.id();

        let mut ioapics: heapless::Vec<IoApic, 8> = heapless::Vec::new();
        acpi::with_info(|info| {
            for io in info.ioapics.iter() {
                let ioapic = unsafe { IoApic::new(io.addr, io.gsi_base) };
                if ioapics.push(ioapic).is_err() {
                    crate::warn!("intc: too many IO-APICs, ignoring extras");
                    break;
                }
            }
        });
        if ioapics.is_empty() {
            // No MADT entry; fall back to the architectural address.
            let ioapic = unsafe { IoApic::new(0xFEC0_0000, 0) };
            let _ = ioapics.push(ioapic);
        }

        // Route every line that already has a handler.
        for irq in 0..16u8 {
            if crate::interrupts::has_handler(irq) {
                route_and_unmask(&ioapics, irq, lapic_id);
            }
        }

        *active = Some(Controller::Apic { lapic, ioapics });
    });

    crate::info!("intc: switched to {:?} + IO-APIC", mode);
}

fn route_and_unmask(ioapics: &heapless::Vec<IoApic, 8>, irq: u8, lapic_id: u32) {
    let gsi = acpi::irq_to_gsi(irq);
    let vector = super::idt::IRQ_BASE_VECTOR + irq;
    for ioapic in ioapics.iter() {
        if ioapic.serves(gsi) {
            ioapic.configure(gsi, vector, lapic_id);
            ioapic.unmask(gsi);
            return;
        }
    }
    crate::warn!("intc: no IO-APIC serves GSI {}", gsi);
}

/// Unmask an IRQ line on the active controller.
pub fn unmask(irq: u8) {
    crate::arch::without_interrupts(|| {
        let mut active = ACTIVE.lock();
        match active.as_mut() {
            Some(Controller::Pic8259) => unsafe { pic::PICS.lock().unmask(irq) },
            Some(Controller::Apic { lapic, ioapics }) => {
                let id = lapic.id();
                route_and_unmask(ioapics, irq, id);
            }
            None => {}
        }
    });
}

/// Mask an IRQ line on the active controller.
pub fn mask(irq: u8) {
    crate::arch::without_interrupts(|| {
        let mut active = ACTIVE.lock();
        match active.as_mut() {
            Some(Controller::Pic8259) => unsafe { pic::PICS.lock().mask(irq) },
            Some(Controller::Apic { ioapics, .. }) => {
                let gsi = acpi::irq_to_gsi(irq);
                for ioapic in ioapics.iter() {
                    if ioapic.serves(gsi) {
                        ioapic.mask(gsi);
                    }
                }
            }
            None => {}
        }
    });
}

/// Send End-Of-Interrupt for a serviced line. Called from IRQ context
/// with interrupts already masked.
pub fn end_of_interrupt(irq: u8) {
    let active = ACTIVE.lock();
    match active.as_ref() {
        Some(Controller::Pic8259) => unsafe { pic::PICS.lock().end_of_interrupt(irq) },
        Some(Controller::Apic { lapic, .. }) => lapic.eoi(),
        None => {}
    }
}

/// 8259 spurious check for lines 7/15. Returns true when the IRQ was
/// spurious and fully handled (partial EOI included). Never spurious in
/// APIC mode (the spurious vector is separate there).
pub fn handle_spurious(irq: u8) -> bool {
    let active = ACTIVE.lock();
    match active.as_ref() {
        Some(Controller::Pic8259) => {
            let spurious = unsafe { pic::PICS.lock().check_spurious(irq) };
            if spurious {
                crate::debug!("pic: spurious IRQ {}", irq);
            }
            spurious
        }
        _ => false,
    }
}

/// Is the APIC path active?
pub fn apic_active() -> bool {
    matches!(ACTIVE.lock().as_ref(), Some(Controller::Apic { .. }))
}

/// Start the periodic tick on the active controller's timer: the local
/// APIC timer in APIC mode, the PIT behind IRQ 0 otherwise.
pub fn start_timer(hz: u32) {
    let period_ms = (1000 / hz).max(1);
    let apic_timer = crate::arch::without_interrupts(|| {
        let mut active = ACTIVE.lock();
        match active.as_mut() {
            Some(Controller::Apic { lapic, .. }) => {
                lapic.start_periodic_timer(super::idt::APIC_TIMER_VECTOR, period_ms);
                true
            }
            _ => unsafe {
                super::pit::start_periodic(hz);
                false
            },
        }
    });
    // The LAPIC timer delivers on its own vector; only the PIT needs the
    // legacy IRQ 0 line opened. Unmasking it in APIC mode would let the
    // firmware-default PIT rate bleed into the tick count.
    if !apic_timer {
        unmask(crate::interrupts::TIMER_IRQ);
    }
}
