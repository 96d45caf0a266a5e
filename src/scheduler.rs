//! # Scheduler
//!
//! Core state machine for the cooperative fiber scheduler: the five queues,
//! the millisecond tick, blocking primitives, fork-on-block materialization,
//! and round-robin selection.
//!
//! ## Queue discipline
//!
//! At each yield point:
//! 1. **Blocking primitives** move the blocked fiber from the run queue to
//!    the sleep or wait queue, then enter [`Scheduler::schedule`]
//! 2. **`scheduler_tick()`** (timer ISR) advances `ticks` and moves expired
//!    sleepers back to the run queue
//! 3. **`scheduler_event()`** (message bus) moves matching waiters back to
//!    the run queue
//! 4. **`schedule()`** round-robins across the run queue, falling back to
//!    the idle fiber when it is empty, and hands control to the
//!    context-switch primitive
//!
//! ## Fork-on-block
//!
//! Handlers are usually short and finish without blocking, so a fiber per
//! invocation is wasted allocation. `fork_on_block` instead snapshots the
//! caller's registers and runs the handler inline; only when the handler
//! actually blocks does `schedule()` materialize a fiber around it:
//!
//! ```text
//!   IDLE ──set FOB, call handler──► FOB_ACTIVE
//!   FOB_ACTIVE ──handler returned──► IDLE          (no fiber created)
//!   FOB_ACTIVE ──handler blocked───► PARENT        (continuation parked in
//!                                                   the forked fiber; the
//!                                                   caller resumes from its
//!                                                   snapshot)
//! ```
//!
//! The forked fiber finishes the handler later, observes its CHILD flag,
//! and recycles itself into the pool.

use core::ptr;

use crate::arch;
use crate::config;
use crate::fiber::{Fiber, FLAG_CHILD, FLAG_FOB, FLAG_PARENT};
use crate::queue::{self, FiberQueue};
use crate::sync;
use crate::Error;

// ---------------------------------------------------------------------------
// Process flags
// ---------------------------------------------------------------------------

/// Set once `scheduler_init` has completed.
pub const FLAG_RUNNING: u8 = 0x01;

/// A collaborator has buffered data the idle path must service; the
/// scheduler prefers the idle fiber while this is set.
pub const FLAG_DATA_PENDING: u8 = 0x02;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Event record delivered by the message bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    /// Originating component id.
    pub source: u16,
    /// Event-specific value.
    pub value: u16,
}

// ---------------------------------------------------------------------------
// Scheduler state
// ---------------------------------------------------------------------------

/// The central scheduler state: queue heads, the current and forked fibers,
/// the tick counter, and the process flag byte. Stored as a global in
/// `kernel.rs`; it must not move while any fiber is linked (queue
/// back-pointers point into it).
pub struct Scheduler {
    /// Runnable fibers, round-robined by `schedule()`.
    pub run_queue: FiberQueue,

    /// Fibers waiting for a wake-at tick stored in their `context` word.
    pub sleep_queue: FiberQueue,

    /// Fibers waiting for an event matching the filter in their `context`.
    pub wait_queue: FiberQueue,

    /// Retired records awaiting reuse, stacks still attached.
    pub pool: FiberQueue,

    /// The fiber whose execution context is live. Off-queue while held by
    /// the scheduler itself; on the sleep/wait queue while blocked.
    pub current: *mut Fiber,

    /// Record allocated by a blocking primitive to absorb a fork-on-block
    /// suspension; consumed by `schedule()` when it materializes the fork.
    pub forked: *mut Fiber,

    /// The idle fiber. Never linked into any queue; selected directly when
    /// there is nothing to run.
    pub idle: *mut Fiber,

    /// Milliseconds since `scheduler_init`, advanced only by `tick()`.
    pub ticks: u32,

    /// Process flag byte ([`FLAG_RUNNING`], [`FLAG_DATA_PENDING`]).
    pub flags: u8,

    /// Template context for newly created fibers, built on first creation
    /// and copied ever after. Creation can then happen from interrupt
    /// context, where snapshotting the live stack would be unsafe.
    empty_context: Option<arch::Context>,
}

impl Scheduler {
    pub const fn new() -> Self {
        Scheduler {
            run_queue: FiberQueue::new(),
            sleep_queue: FiberQueue::new(),
            wait_queue: FiberQueue::new(),
            pool: FiberQueue::new(),
            current: ptr::null_mut(),
            forked: ptr::null_mut(),
            idle: ptr::null_mut(),
            ticks: 0,
            flags: 0,
            empty_context: None,
        }
    }

    // -----------------------------------------------------------------------
    // Record allocation
    // -----------------------------------------------------------------------

    /// Hand out a fiber record with zeroed flags, preferring an O(1) pop
    /// from the pool. Falls through to the heap on a pool miss; by then the
    /// critical section has been exited, since allocation must never run
    /// with interrupts disabled.
    pub(crate) fn get_fiber_context(&mut self) -> Option<*mut Fiber> {
        let pooled = sync::critical_section(|_| {
            let head = self.pool.head();
            if head.is_null() {
                None
            } else {
                unsafe { queue::dequeue(head) };
                Some(head)
            }
        });

        let f = match pooled {
            Some(f) => f,
            None => Fiber::allocate()?.as_ptr(),
        };

        unsafe { (*f).flags = 0 };
        Some(f)
    }

    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    /// Allocate a record, write the trampoline `frame` words at the base of
    /// its stack, seed its saved context, and make it runnable.
    ///
    /// `trampoline` is the address the new fiber starts at; it dispatches
    /// through the frame.
    pub(crate) fn create(&mut self, frame: &[usize], trampoline: usize) -> Result<*mut Fiber, Error> {
        let f = self.get_fiber_context().ok_or(Error::OutOfMemory)?;

        unsafe {
            let base = (*f).stack.bottom() as *mut usize;
            for (i, word) in frame.iter().enumerate() {
                base.add(i).write(*word);
            }

            self.seed_context(f, trampoline);
            self.run_queue.push(f);
        }

        Ok(f)
    }

    /// Initialize a new fiber's saved context from the cached template,
    /// building the template on first use. The only per-fiber fixup is the
    /// return-address register, pointed at the trampoline.
    unsafe fn seed_context(&mut self, f: *mut Fiber, trampoline: usize) {
        unsafe {
            match self.empty_context {
                Some(template) => (*f).regs = template,
                None => {
                    arch::save_context(&mut (*f).regs, (*f).stack.top());
                    (*f).regs.sp = arch::stack_base();
                    self.empty_context = Some((*f).regs);
                }
            }
            (*f).regs.lr = trampoline;
        }
    }

    // -----------------------------------------------------------------------
    // Blocking primitives
    // -----------------------------------------------------------------------

    /// The fiber a blocking primitive should park: normally the current
    /// fiber, but inside a fork-on-block handler a fresh record absorbs the
    /// block so the caller can be resumed from its snapshot. When that
    /// allocation fails, the current fiber blocks as a best effort and the
    /// optimization is simply not applied.
    fn block_target(&mut self) -> *mut Fiber {
        if unsafe { (*self.current).flags } & FLAG_FOB != 0 {
            match self.get_fiber_context() {
                Some(f) => {
                    self.forked = f;
                    return f;
                }
                None => {
                    log::warn!("fiber: no memory to fork, blocking in place");
                    self.forked = ptr::null_mut();
                }
            }
        }
        self.current
    }

    /// Block for at least `ms` milliseconds. The wake-at tick is stored in
    /// the fiber's `context` word; the tick handler makes it runnable again
    /// once the deadline passes. No promise is made about when it is next
    /// scheduled after that.
    pub fn sleep(&mut self, ms: u32) {
        let f = self.block_target();

        unsafe {
            (*f).context = self.ticks.wrapping_add(ms);
            queue::dequeue(f);
            self.sleep_queue.push(f);
        }

        self.schedule();
    }

    /// Block until an event matching `(id, value)` is delivered. Either
    /// side may be the wildcard ([`config::ID_ANY`] / [`config::VALUE_ANY`]).
    /// The filter is packed into the fiber's `context` word: value in the
    /// high half, id in the low half.
    pub fn wait_for_event(&mut self, id: u16, value: u16) {
        let f = self.block_target();

        unsafe {
            (*f).context = (value as u32) << 16 | id as u32;
            queue::dequeue(f);
            self.wait_queue.push(f);
        }

        self.schedule();
    }

    // -----------------------------------------------------------------------
    // Wake sources (ISR context)
    // -----------------------------------------------------------------------

    /// Timer callback, once every [`config::TICK_PERIOD_MS`] milliseconds.
    /// Advances the clock and makes every expired sleeper runnable.
    pub fn tick(&mut self) {
        self.ticks = self.ticks.wrapping_add(config::TICK_PERIOD_MS);

        let mut f = self.sleep_queue.head();
        while !f.is_null() {
            // Waking rewrites linkage; read the successor first.
            let next = unsafe { (*f).next };

            if self.ticks >= unsafe { (*f).context } {
                unsafe {
                    queue::dequeue(f);
                    self.run_queue.push(f);
                }
            }

            f = next;
        }
    }

    /// Message-bus callback: makes every waiter whose filter matches `evt`
    /// runnable.
    pub fn event(&mut self, evt: Event) {
        let mut f = self.wait_queue.head();
        while !f.is_null() {
            let next = unsafe { (*f).next };

            let filter = unsafe { (*f).context };
            let id = (filter & 0xFFFF) as u16;
            let value = (filter >> 16) as u16;

            if (id == config::ID_ANY || id == evt.source)
                && (value == config::VALUE_ANY || value == evt.value)
            {
                unsafe {
                    queue::dequeue(f);
                    self.run_queue.push(f);
                }
            }

            f = next;
        }
    }

    // -----------------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------------

    /// Retire the current fiber into the pool and find something else to
    /// do. The record keeps its stack and is handed out again by
    /// `get_fiber_context`.
    pub fn release(&mut self) {
        unsafe {
            queue::dequeue(self.current);
            self.pool.push(self.current);
        }

        self.schedule();
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    /// Yield: materialize a pending fork, pick the next runnable fiber
    /// round-robin (idle when there is none), and switch to it.
    pub fn schedule(&mut self) {
        let old = self.current;

        unsafe {
            // A blocking call made inside a fork-on-block handler arrives
            // here with FOB still set and a record waiting in `forked`: park
            // the handler's continuation in that record, then resume the
            // original caller from its register snapshot.
            if (*self.current).flags & FLAG_FOB != 0 && !self.forked.is_null() {
                let forked = self.forked;
                self.forked = ptr::null_mut();

                verify_stack_size(forked);

                (*self.current).flags |= FLAG_PARENT;
                (*forked).flags |= FLAG_CHILD;

                // Suspension point: control passes through here twice. The
                // first pass is the original fiber; the second is the forked
                // fiber being scheduled in later, with `current` pointing at
                // it.
                arch::save_context(&mut (*forked).regs, (*forked).stack.top());

                if (*self.current).flags & FLAG_PARENT != 0 {
                    // Original fiber: fall back into the handler's snapshot.
                    // Does not return here.
                    arch::restore_register_context(&(*self.current).regs);
                } else {
                    // Forked fiber, running for the first time: hand control
                    // straight back to the blocking primitive that called us.
                    return;
                }
            }

            // Round robin across the runnables; idle when there is nothing
            // to do, or when a pending data read wants the idle path run.
            self.current = if self.run_queue.is_empty() || self.flags & FLAG_DATA_PENDING != 0 {
                self.idle
            } else if (*self.current).queue == &mut self.run_queue as *mut FiberQueue {
                if (*self.current).next.is_null() {
                    self.run_queue.head()
                } else {
                    (*self.current).next
                }
            } else {
                self.run_queue.head()
            };

            // Skip the swap overhead when there is only one thing to run.
            if self.current != old {
                verify_stack_size(old);

                arch::swap_context(
                    &mut (*old).regs,
                    &(*self.current).regs,
                    (*old).stack.top(),
                    (*self.current).stack.top(),
                );
            }
        }
    }
}

/// Grow `f`'s stack buffer if the live hardware stack has outgrown it.
/// Called just before `f`'s stack is parked by a context save. The sole
/// stack-growing mechanism; shrinking is never performed.
///
/// # Safety
/// `f` must point to a live record.
pub(crate) unsafe fn verify_stack_size(f: *mut Fiber) {
    let depth = arch::stack_depth();
    unsafe {
        if (*f).stack.size() < depth {
            (*f).stack.grow_to(depth);
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;

    /// Schedulers under test are boxed so the intrusive back-pointers stay
    /// valid for the whole test.
    fn scheduler() -> Box<Scheduler> {
        Box::new(Scheduler::new())
    }

    fn on_queue(f: *mut Fiber, q: &FiberQueue) -> bool {
        unsafe { (*f).queue == q as *const FiberQueue as *mut FiberQueue }
    }

    #[test]
    fn tick_wakes_only_expired_sleepers() {
        let mut s = scheduler();
        let f = s.get_fiber_context().unwrap();

        unsafe {
            (*f).context = 100;
            s.sleep_queue.push(f);
        }

        // One tick short of the deadline: still parked.
        s.ticks = 93;
        s.tick();
        assert_eq!(s.ticks, 99);
        assert!(on_queue(f, &s.sleep_queue));

        // Deadline reached: runnable.
        s.tick();
        assert_eq!(s.ticks, 105);
        assert!(on_queue(f, &s.run_queue));
    }

    #[test]
    fn tick_walk_survives_waking_several() {
        let mut s = scheduler();
        let a = s.get_fiber_context().unwrap();
        let b = s.get_fiber_context().unwrap();
        let c = s.get_fiber_context().unwrap();

        unsafe {
            (*a).context = 10;
            (*b).context = 1000;
            (*c).context = 10;
            s.sleep_queue.push(a);
            s.sleep_queue.push(b);
            s.sleep_queue.push(c);
        }

        s.ticks = 96;
        s.tick();

        assert!(on_queue(a, &s.run_queue));
        assert!(on_queue(c, &s.run_queue));
        assert!(on_queue(b, &s.sleep_queue));
        assert_eq!(s.sleep_queue.head(), b);
    }

    #[test]
    fn event_filter_matches_exact_and_wildcards() {
        let mut s = scheduler();
        let f = s.get_fiber_context().unwrap();

        // Waiting on (id = 5, value = any).
        unsafe {
            (*f).context = (config::VALUE_ANY as u32) << 16 | 5;
            s.wait_queue.push(f);
        }

        // Wrong source: still waiting.
        s.event(Event { source: 4, value: 1 });
        assert!(on_queue(f, &s.wait_queue));

        // Matching source, any value: woken.
        s.event(Event { source: 5, value: 7 });
        assert!(on_queue(f, &s.run_queue));
    }

    #[test]
    fn event_filter_uses_full_sixteen_bit_fields() {
        let mut s = scheduler();
        let f = s.get_fiber_context().unwrap();

        // High bytes of both halves must participate in the match.
        unsafe {
            (*f).context = 0x1234_u32 << 16 | 0x5678;
            s.wait_queue.push(f);
        }

        s.event(Event {
            source: 0x5678,
            value: 0x1200,
        });
        assert!(on_queue(f, &s.wait_queue));

        s.event(Event {
            source: 0x5678,
            value: 0x1234,
        });
        assert!(on_queue(f, &s.run_queue));
    }

    #[test]
    fn wait_for_event_packs_filter_and_parks() {
        let mut s = scheduler();
        let f = s.get_fiber_context().unwrap();
        let idle = s.get_fiber_context().unwrap();

        unsafe { s.run_queue.push(f) };
        s.current = f;
        s.idle = idle;

        s.wait_for_event(0x0102, 0x0304);

        assert!(on_queue(f, &s.wait_queue));
        assert_eq!(unsafe { (*f).context }, 0x0304_0102);
        // Nothing else runnable: the idle fiber was selected.
        assert_eq!(s.current, idle);
    }

    #[test]
    fn sleep_parks_current_with_deadline() {
        let mut s = scheduler();
        let f = s.get_fiber_context().unwrap();
        let idle = s.get_fiber_context().unwrap();

        unsafe { s.run_queue.push(f) };
        s.current = f;
        s.idle = idle;
        s.ticks = 40;

        s.sleep(100);

        assert!(on_queue(f, &s.sleep_queue));
        assert_eq!(unsafe { (*f).context }, 140);
        assert_eq!(s.current, idle);
    }

    #[test]
    fn round_robin_cycles_runnables() {
        let mut s = scheduler();
        let a = s.get_fiber_context().unwrap();
        let b = s.get_fiber_context().unwrap();

        unsafe {
            s.run_queue.push(a);
            s.run_queue.push(b);
        }
        s.current = a;

        // a is the tail, so its successor wraps to the head.
        s.schedule();
        assert_eq!(s.current, b);

        s.schedule();
        assert_eq!(s.current, a);

        s.schedule();
        assert_eq!(s.current, b);
    }

    #[test]
    fn idle_selected_when_run_queue_empty() {
        let mut s = scheduler();
        let f = s.get_fiber_context().unwrap();
        let idle = s.get_fiber_context().unwrap();

        s.current = f;
        s.idle = idle;

        s.schedule();
        assert_eq!(s.current, idle);
    }

    #[test]
    fn data_pending_prefers_idle_over_runnables() {
        let mut s = scheduler();
        let a = s.get_fiber_context().unwrap();
        let idle = s.get_fiber_context().unwrap();

        unsafe { s.run_queue.push(a) };
        s.current = a;
        s.idle = idle;
        s.flags |= FLAG_DATA_PENDING;

        s.schedule();
        assert_eq!(s.current, idle);

        s.flags &= !FLAG_DATA_PENDING;
        s.schedule();
        assert_eq!(s.current, a);
    }

    #[test]
    fn create_seeds_frame_and_caches_template() {
        let mut s = scheduler();

        let first = s.create(&[0x1111, 0x2222], 0xAAAA).unwrap();
        let template = s.empty_context.expect("template cached on first create");
        assert_eq!(template.sp, arch::stack_base());

        unsafe {
            let base = (*first).stack.bottom() as *const usize;
            assert_eq!(base.read(), 0x1111);
            assert_eq!(base.add(1).read(), 0x2222);
            assert!(on_queue(first, &s.run_queue));
            assert_eq!((*first).flags, 0);
        }

        // Later creations copy the template; only the resume address moves.
        let second = s.create(&[0x3333, 0x4444, 0x5555], 0xBBBB).unwrap();
        unsafe {
            let expected = arch::Context {
                lr: 0xBBBB,
                ..template
            };
            assert_eq!((*second).regs, expected);
            let base = (*second).stack.bottom() as *const usize;
            assert_eq!(base.add(2).read(), 0x5555);
        }
    }

    #[test]
    fn release_recycles_record_through_pool() {
        let mut s = scheduler();
        let f = s.get_fiber_context().unwrap();
        let idle = s.get_fiber_context().unwrap();

        unsafe { s.run_queue.push(f) };
        s.current = f;
        s.idle = idle;
        unsafe { (*f).flags = FLAG_CHILD };

        s.release();

        assert!(on_queue(f, &s.pool));
        assert_eq!(s.current, idle);

        // The next allocation is an O(1) pop of the same record, flags
        // zeroed.
        let recycled = s.get_fiber_context().unwrap();
        assert_eq!(recycled, f);
        assert_eq!(unsafe { (*recycled).flags }, 0);
        assert!(s.pool.is_empty());
    }

    #[test]
    fn block_target_is_current_outside_fork() {
        let mut s = scheduler();
        let f = s.get_fiber_context().unwrap();
        s.current = f;

        assert_eq!(s.block_target(), f);
        assert!(s.forked.is_null());
    }

    #[test]
    fn block_target_forks_fresh_record_in_fob_mode() {
        let mut s = scheduler();
        let f = s.get_fiber_context().unwrap();
        let spare = s.get_fiber_context().unwrap();

        unsafe {
            s.pool.push(spare);
            (*f).flags = FLAG_FOB;
        }
        s.current = f;

        // The pooled record absorbs the block; the caller's fiber does not.
        let target = s.block_target();
        assert_eq!(target, spare);
        assert_eq!(s.forked, spare);
    }
}
