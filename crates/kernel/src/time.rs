//! Monotonic tick accounting
//!
//! Whichever timer is active (PIT at bring-up, local APIC timer once the
//! controller upgrades) fires on the timer line at [`TICK_HZ`]; the
//! handler increments the global tick counter, runs the scheduler hook,
//! and the dispatch tail EOIs. The counter never goes backwards.

use crate::config::TICK_HZ;
use crate::interrupts::{InterruptHandler, TIMER_IRQ};
use core::sync::atomic::{AtomicU64, Ordering};

static TICK_COUNT: AtomicU64 = AtomicU64::new(0);

/// Which hardware drives the tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickSource {
    Pit,
    ApicTimer,
}

static TICK_SOURCE: spin::Mutex<TickSource> = spin::Mutex::new(TickSource::Pit);

/// Ticks since the timer was started.
pub fn ticks() -> u64 {
    TICK_COUNT.load(Ordering::Relaxed)
}

/// Milliseconds since the timer was started (tick granularity).
pub fn uptime_ms() -> u64 {
    ticks() * (1000 / TICK_HZ as u64)
}

/// The timer-IRQ handler: count, then scheduling.
struct TimerTick;

impl InterruptHandler for TimerTick {
    fn handle_interrupt(&self, _irq: u8) {
        TICK_COUNT.fetch_add(1, Ordering::Relaxed);
        crate::sched::on_tick();
    }
}

static TIMER_TICK: TimerTick = TimerTick;

/// Register the tick handler and start the periodic timer on the active
/// controller.
pub fn init() {
    if let Err(e) = crate::interrupts::register_handler(TIMER_IRQ, &TIMER_TICK) {
        crate::error!("time: timer handler registration failed: {:?}", e);
        return;
    }
    start(TickSource::Pit);
}

/// (Re)start the tick on the given source. Used again after the
/// controller upgrade switches the tick to the APIC timer.
#[cfg(target_arch = "x86_64")]
pub fn start(source: TickSource) {
    *TICK_SOURCE.lock() = source;
    crate::arch::x86_64::controller::start_timer(TICK_HZ);
    crate::info!("time: tick at {} Hz from {:?}", TICK_HZ, source);
}

#[cfg(not(target_arch = "x86_64"))]
pub fn start(source: TickSource) {
    *TICK_SOURCE.lock() = source;
}

/// Active tick source.
pub fn source() -> TickSource {
    *TICK_SOURCE.lock()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_counter_monotonic() {
        let before = ticks();
        TICK_COUNT.fetch_add(3, Ordering::Relaxed);
        assert!(ticks() >= before + 3);
    }

    #[test]
    fn test_uptime_granularity() {
        // 100 Hz -> 10 ms per tick.
        assert_eq!(1000 / TICK_HZ as u64, 10);
    }
}
