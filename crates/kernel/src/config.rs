//! Compile-time kernel configuration.
//!
//! Every tunable the subsystems share lives here so the boot path, the
//! allocators and the scheduler cannot drift apart.

/// Timer tick rate in Hz. The PIT is programmed to this rate at bring-up;
/// the APIC timer is calibrated to match when it takes over.
pub const TICK_HZ: u32 = 100;

/// Default scheduling quantum, in ticks.
pub const DEFAULT_QUANTUM: u32 = 5;

/// Span of the boot-time identity map, in GiB. MMIO for the LAPIC
/// (0xFEE00000), IO-APIC (0xFEC00000) and HPET all fall inside it.
pub const IDENTITY_MAP_GIB: u64 = 4;

/// Physical memory below this address is never handed to the allocators:
/// the kernel image, boot structures and legacy firmware areas live there.
pub const RESERVED_LOW_BYTES: u64 = 2 * 1024 * 1024;

/// Maximum number of physical zones (memory-map ranges cut at the
/// DMA/NORMAL/HIGH boundaries).
pub const MAX_ZONES: usize = 16;

/// Per-zone cap on frames reserved for the single-frame bitmap pool.
pub const SINGLE_POOL_MAX_FRAMES: usize = 1024;

/// Kernel stack size for tasks and interrupt stacks (16 KiB).
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

/// Virtual base of the heap's chunk-pool region.
pub const HEAP_POOL_BASE: u64 = 0xFFFF_FF80_0000_0000;

/// Virtual span reserved for each chunk pool (1 MiB per size class).
pub const HEAP_POOL_SPAN: usize = 1024 * 1024;

/// Bootstrap heap size, carved from .bss and used before the PMM is up.
pub const BOOTSTRAP_HEAP_SIZE: usize = 1024 * 1024;
