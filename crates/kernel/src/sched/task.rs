//! Task structure and lifecycle states

use crate::config::{DEFAULT_QUANTUM, KERNEL_STACK_SIZE};
use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec;

pub type TaskId = u64;

/// Task lifecycle:
///
/// ```text
///         spawn
///           │
///           ▼
///        Ready ──pick──▶ Running ──preempt──▶ Ready
///           ▲               │
///           │               ├─sleep n ticks──▶ Sleeping ──ripe──▶ Ready
///           │               │
///           │               └─block──────────▶ Blocked ──wake──▶ Ready
///           │
///         (exit) ──▶ Terminated (reaped by the scheduler)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Blocked,
    Sleeping,
    Terminated,
}

pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub state: TaskState,
    /// Saved stack pointer while the task is switched out.
    pub saved_rsp: u64,
    /// Owned kernel stack; `None` for the bootstrap/idle task, which
    /// keeps running on the boot stack.
    pub kernel_stack: Option<Box<[u8]>>,
    /// Entry point, consumed by the first dispatch.
    pub entry: Option<fn()>,
    /// Remaining quantum in ticks.
    pub time_slice_ticks: u32,
    /// Absolute tick at which a sleeping task becomes ripe.
    pub wake_up_tick: u64,
}

impl Task {
    /// Create a task with a fresh kernel stack primed to enter the
    /// scheduler trampoline.
    pub fn new(id: TaskId, name: String, entry: fn(), trampoline: u64) -> Self {
        let stack = vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice();
        let stack_top = stack.as_ptr() as u64 + KERNEL_STACK_SIZE as u64;
        let saved_rsp = super::context::prime_stack(stack_top, trampoline);
        Self {
            id,
            name,
            state: TaskState::Ready,
            saved_rsp,
            kernel_stack: Some(stack),
            entry: Some(entry),
            time_slice_ticks: DEFAULT_QUANTUM,
            wake_up_tick: 0,
        }
    }

    /// Wrap the already-running boot context as a task (the idle task).
    pub fn from_boot_context(id: TaskId, name: String) -> Self {
        Self {
            id,
            name,
            state: TaskState::Running,
            saved_rsp: 0,
            kernel_stack: None,
            entry: None,
            time_slice_ticks: DEFAULT_QUANTUM,
            wake_up_tick: 0,
        }
    }
}
