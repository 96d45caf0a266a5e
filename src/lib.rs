//! # Filament: Cooperative Fiber Scheduler
//!
//! A lightweight, non-preemptive fiber scheduler for single-core
//! microcontrollers. It exists for two jobs:
//!
//! 1. **ISR decoupling**: message-bus events raised in interrupt context
//!    are handed to application callbacks on fiber stacks, via
//!    [`kernel::fork_on_block`], without allocating unless the callback
//!    actually blocks.
//! 2. **Async building blocks**: [`kernel::fiber_sleep`],
//!    [`kernel::fiber_wait_for_event`] and fire-and-forget
//!    [`kernel::create_fiber`] handlers give higher-level code a simple
//!    primitive for asynchronous behavior.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   Application fibers                     │
//! ├──────────────────────────────────────────────────────────┤
//! │                Kernel API (kernel.rs)                    │
//! │  scheduler_init · create_fiber · fiber_sleep ·           │
//! │  fiber_wait_for_event · fork_on_block · release_fiber    │
//! ├───────────────┬───────────────────┬──────────────────────┤
//! │  Scheduler    │  Fiber records    │  Queues / Sync       │
//! │  scheduler.rs │  fiber.rs         │  queue.rs · sync.rs  │
//! │  ─ tick()     │  ─ record + pool  │  ─ intrusive lists   │
//! │  ─ event()    │  ─ heap stacks    │  ─ critical sections │
//! │  ─ schedule() │  ─ role flags     │                      │
//! ├───────────────┴───────────────────┴──────────────────────┤
//! │              Arch port (arch/cortex_m0.rs)               │
//! │   context save/restore/swap · stack park and unpark      │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Scheduling model
//!
//! Single-core, cooperative, round-robin. A fiber runs until it reaches an
//! explicit yield point: `fiber_sleep`, `fiber_wait_for_event`, `schedule`,
//! `release_fiber`, or the return path of a fork-on-block handler that
//! blocked. The timer tick and the message bus, both at ISR priority, are
//! the only asynchronous mutators; they wake sleepers and waiters back onto
//! the run queue. When nothing is runnable, a standalone idle fiber sleeps
//! the core and runs background maintenance.
//!
//! ## Memory model
//!
//! - Fiber records and stacks come from the heap (the integrator supplies a
//!   `#[global_allocator]`), but records are never freed: retired fibers
//!   park on a pool queue with their stacks attached and are recycled, so
//!   steady-state operation performs no allocation at all.
//! - All fibers execute on the single hardware stack; their heap buffers
//!   hold the parked copies of suspended stacks.
//! - The heap is never entered with interrupts disabled.

#![no_std]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod fiber;
pub mod kernel;
pub mod queue;
pub mod scheduler;
pub mod sync;

pub use kernel::{
    create_fiber, create_fiber_with, fiber_sleep, fiber_wait_for_event, fork_on_block,
    fork_on_block_with, release_fiber, release_fiber_param, schedule, scheduler_event,
    scheduler_init, scheduler_running, scheduler_tick, set_data_pending, set_low_power_hook,
    set_system_tasks_hook, FiberHandle,
};
pub use scheduler::Event;

use core::fmt;

/// Failures surfaced by fiber creation and the ISR-callable entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The heap could not supply a fiber record or stack.
    OutOfMemory,
    /// `scheduler_init` has not run yet.
    NotStarted,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::OutOfMemory => write!(f, "out of memory"),
            Error::NotStarted => write!(f, "scheduler not started"),
        }
    }
}
