//! # Configuration
//!
//! Compile-time constants governing the fiber scheduler. All limits are
//! fixed at compile time; the only runtime allocation is fiber records and
//! their stacks.

/// Period of the scheduler tick in milliseconds. The timer ISR is expected
/// to call `scheduler_tick()` at this rate; it is the granularity of
/// `fiber_sleep()`. Sleeps complete no earlier than requested, but may
/// complete up to one tick period late.
pub const TICK_PERIOD_MS: u32 = 6;

/// Initial stack allocation for each fiber, in bytes. Records recycled
/// through the pool keep whatever size they last grew to; a fiber whose
/// live stack outgrows its buffer is given the smallest power-of-two
/// doubling that fits.
pub const STACK_SIZE: usize = 512;

/// Wildcard event source: a fiber waiting on this id is woken by an event
/// from any source. Must be distinct from every real event id.
pub const ID_ANY: u16 = 0;

/// Wildcard event value: a fiber waiting on this value is woken by an event
/// carrying any value. Must be distinct from every real event value.
pub const VALUE_ANY: u16 = 0;
