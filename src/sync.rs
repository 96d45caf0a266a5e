//! # Synchronization Primitives
//!
//! Interrupt-safe critical section abstraction. All shared scheduler state
//! (queue linkage, the tick counter, the process flag byte) must be accessed
//! within a critical section to prevent races between fiber code and the
//! timer / message-bus interrupt handlers.
//!
//! The bracket is provided by the `critical-section` crate: on a single-core
//! Cortex-M target the implementation comes from `cortex-m`'s
//! `critical-section-single-core` feature (a plain disable/restore of
//! interrupts); host unit tests use the `std` implementation instead.

use critical_section::{with, CriticalSection};

/// Execute a closure within a critical section (interrupts disabled).
///
/// Brackets nest, and the previous interrupt state is restored when the
/// closure returns, including on early return.
///
/// # Usage
/// ```ignore
/// sync::critical_section(|_cs| {
///     // Access shared state safely
/// });
/// ```
///
/// # Performance
/// Keep critical sections as short as possible to minimize interrupt
/// latency. In particular, the heap must never be entered while interrupts
/// are disabled.
#[inline]
pub fn critical_section<F, R>(f: F) -> R
where
    F: FnOnce(CriticalSection<'_>) -> R,
{
    with(f)
}
