//! IRQ handler registry
//!
//! Hardware interrupt vectors funnel into this table: the per-vector stubs
//! compute `irq = vector - 0x20` and dispatch here, then send EOI to the
//! active controller. Lines without a handler are logged and dropped.

use spin::Mutex;

/// Dispatchable lines: legacy IRQ 0..15 plus the APIC-local vectors the
/// kernel routes through the same table (timer, spurious, future IPIs).
pub const MAX_IRQ_HANDLERS: usize = 64;

/// IRQ line of the system timer (PIT or IO-APIC-routed, and the local
/// APIC timer is dispatched on the same line).
pub const TIMER_IRQ: u8 = 0;

pub trait InterruptHandler: Send + Sync {
    fn handle_interrupt(&self, irq: u8);
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InterruptError {
    InvalidIrq,
    AlreadyRegistered,
    HandlerNotFound,
}

struct Registry {
    handlers: [Option<&'static dyn InterruptHandler>; MAX_IRQ_HANDLERS],
}

impl Registry {
    const fn new() -> Self {
        Self {
            handlers: [None; MAX_IRQ_HANDLERS],
        }
    }
}

static REGISTRY: Mutex<Registry> = Mutex::new(Registry::new());

/// Register a handler for an IRQ line. The line stays masked at the
/// controller until a handler exists; the caller unmasks afterwards.
pub fn register_handler(
    irq: u8,
    handler: &'static dyn InterruptHandler,
) -> Result<(), InterruptError> {
    if irq as usize >= MAX_IRQ_HANDLERS {
        return Err(InterruptError::InvalidIrq);
    }
    crate::arch::without_interrupts(|| {
        let mut registry = REGISTRY.lock();
        if registry.handlers[irq as usize].is_some() {
            return Err(InterruptError::AlreadyRegistered);
        }
        registry.handlers[irq as usize] = Some(handler);
        Ok(())
    })
}

/// Remove a handler.
pub fn unregister_handler(irq: u8) -> Result<(), InterruptError> {
    if irq as usize >= MAX_IRQ_HANDLERS {
        return Err(InterruptError::InvalidIrq);
    }
    crate::arch::without_interrupts(|| {
        let mut registry = REGISTRY.lock();
        if registry.handlers[irq as usize].is_none() {
            return Err(InterruptError::HandlerNotFound);
        }
        registry.handlers[irq as usize] = None;
        Ok(())
    })
}

/// Is a handler registered for this line?
pub fn has_handler(irq: u8) -> bool {
    (irq as usize) < MAX_IRQ_HANDLERS && REGISTRY.lock().handlers[irq as usize].is_some()
}

/// Dispatch one IRQ. Runs in interrupt context with interrupts masked.
pub fn dispatch(irq: u8) {
    let handler = {
        let registry = REGISTRY.lock();
        if irq as usize >= MAX_IRQ_HANDLERS {
            None
        } else {
            registry.handlers[irq as usize]
        }
    };
    match handler {
        Some(h) => h.handle_interrupt(irq),
        None => crate::warn!("irq: unhandled line {}", irq),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};

    struct CountingHandler {
        hits: AtomicU32,
    }

    impl InterruptHandler for CountingHandler {
        fn handle_interrupt(&self, _irq: u8) {
            self.hits.fetch_add(1, Ordering::SeqCst);
        }
    }

    static TEST_HANDLER: CountingHandler = CountingHandler {
        hits: AtomicU32::new(0),
    };

    #[test]
    fn test_register_dispatch_unregister() {
        register_handler(42, &TEST_HANDLER).unwrap();
        assert!(has_handler(42));
        assert_eq!(
            register_handler(42, &TEST_HANDLER),
            Err(InterruptError::AlreadyRegistered)
        );
        dispatch(42);
        dispatch(42);
        assert_eq!(TEST_HANDLER.hits.load(Ordering::SeqCst), 2);
        unregister_handler(42).unwrap();
        assert!(!has_handler(42));
        assert_eq!(
            unregister_handler(42),
            Err(InterruptError::HandlerNotFound)
        );
    }

    #[test]
    fn test_out_of_range_rejected() {
        assert_eq!(
            register_handler(200, &TEST_HANDLER),
            Err(InterruptError::InvalidIrq)
        );
        // Dispatching an unknown line must not panic.
        dispatch(200);
    }
}
