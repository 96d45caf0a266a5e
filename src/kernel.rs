//! # Kernel
//!
//! Global scheduler instance and the public fiber API.
//!
//! ## Startup sequence
//!
//! ```text
//! firmware main()
//!   ├─► kernel::scheduler_init()     ← fiber built around the caller,
//!   │                                  idle fiber created and parked
//!   ├─► kernel::create_fiber(..)     ← application fibers (×N)
//!   └─► application loop / fiber_sleep()
//!
//! timer ISR  ──► kernel::scheduler_tick()
//! message bus ─► kernel::scheduler_event(evt) / kernel::fork_on_block(..)
//! ```
//!
//! Every entry point that can be reached before `scheduler_init` checks the
//! published scheduler pointer and backs out with [`Error::NotStarted`] (or
//! silently, for the `fn()` paths) instead of touching uninitialized state.

use core::mem;
use core::ptr::{self, NonNull};

use crate::arch;
use crate::fiber::{Fiber, FLAG_CHILD, FLAG_FOB, FLAG_PARENT};
use crate::queue;
use crate::scheduler::{Event, Scheduler, FLAG_DATA_PENDING, FLAG_RUNNING};
use crate::sync;
use crate::Error;

// ---------------------------------------------------------------------------
// Global scheduler instance
// ---------------------------------------------------------------------------

/// Global scheduler state.
///
/// # Safety
/// Mutated from fiber context and from the tick/event ISRs; all queue
/// linkage updates happen inside critical sections, and the rest is
/// serialized by the single-core cooperative model.
static mut SCHEDULER: Scheduler = Scheduler::new();

/// Published by `scheduler_init` once the scheduler is usable; every public
/// entry point goes through it.
static mut SCHEDULER_PTR: *mut Scheduler = ptr::null_mut();

/// Optional replacement for the plain wait-for-interrupt in the idle loop
/// (e.g. a radio-aware low-power wait).
static mut LOW_POWER_HOOK: Option<fn()> = None;

/// Optional background maintenance hook run by the idle fiber between
/// sleeps.
static mut SYSTEM_TASKS_HOOK: Option<fn()> = None;

fn scheduler() -> Result<&'static mut Scheduler, Error> {
    unsafe {
        if SCHEDULER_PTR.is_null() {
            return Err(Error::NotStarted);
        }
        Ok(&mut *SCHEDULER_PTR)
    }
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Opaque handle to a scheduled fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiberHandle(NonNull<Fiber>);

impl FiberHandle {
    pub fn as_ptr(&self) -> *mut Fiber {
        self.0.as_ptr()
    }
}

// ---------------------------------------------------------------------------
// Initialization
// ---------------------------------------------------------------------------

/// Initialize the fiber scheduler.
///
/// Builds a fiber context around the calling execution and enqueues it as
/// the first runnable, creates and parks the idle fiber, then publishes the
/// scheduler for the ISR entry points. Must be called once, from the main
/// execution, before interrupts that feed the scheduler are enabled.
///
/// Calling it again is a no-op.
pub fn scheduler_init() -> Result<(), Error> {
    unsafe {
        if !SCHEDULER_PTR.is_null() {
            return Ok(());
        }

        let sched = &mut *ptr::addr_of_mut!(SCHEDULER);

        // A fiber around the caller: the record exists so the current
        // execution can be parked like any other fiber.
        let first = sched.get_fiber_context().ok_or(Error::OutOfMemory)?;
        sched.current = first;
        sched.run_queue.push(first);

        // Seed the record by swapping to ourselves: a save immediately
        // resumed, leaving a valid parked image behind.
        arch::swap_context(
            &mut (*first).regs,
            &(*first).regs,
            (*first).stack.top(),
            (*first).stack.top(),
        );

        // The idle fiber is created like any other, then held off-queue; the
        // scheduler installs it directly when the run queue is empty.
        let idle = sched.create(
            &[idle_task as usize, release_fiber as usize],
            launch_new_fiber as usize,
        )?;
        queue::dequeue(idle);
        sched.idle = idle;

        sched.flags |= FLAG_RUNNING;
        SCHEDULER_PTR = ptr::addr_of_mut!(SCHEDULER);
    }

    log::debug!(
        "fiber: scheduler online, tick period {} ms",
        crate::config::TICK_PERIOD_MS
    );
    Ok(())
}

/// Whether `scheduler_init` has completed.
pub fn scheduler_running() -> bool {
    unsafe { !SCHEDULER_PTR.is_null() && (*SCHEDULER_PTR).flags & FLAG_RUNNING != 0 }
}

// ---------------------------------------------------------------------------
// Creation
// ---------------------------------------------------------------------------

/// Create a fiber running `entry`, then `completion` when `entry` returns.
/// The record comes from the pool when one is available.
///
/// Safe to call from interrupt context once the first fiber has ever been
/// created (the context template is built on first use and copied ever
/// after).
pub fn create_fiber(entry: fn(), completion: fn()) -> Result<FiberHandle, Error> {
    let sched = scheduler()?;
    let f = sched.create(
        &[entry as usize, completion as usize],
        launch_new_fiber as usize,
    )?;
    Ok(FiberHandle(unsafe { NonNull::new_unchecked(f) }))
}

/// Create a fiber running `entry(param)`, then `completion(param)` when the
/// entry returns.
pub fn create_fiber_with(
    entry: fn(*mut ()),
    param: *mut (),
    completion: fn(*mut ()),
) -> Result<FiberHandle, Error> {
    let sched = scheduler()?;
    let f = sched.create(
        &[entry as usize, param as usize, completion as usize],
        launch_new_fiber_param as usize,
    )?;
    Ok(FiberHandle(unsafe { NonNull::new_unchecked(f) }))
}

// ---------------------------------------------------------------------------
// Launch trampolines
// ---------------------------------------------------------------------------

/// Nominal entry point of every parameterless fiber: dispatches through the
/// `[entry, completion]` frame at the base of the fiber's own stack.
extern "C" fn launch_new_fiber() -> ! {
    let (entry, completion) = unsafe {
        let sched = &mut *SCHEDULER_PTR;
        let base = (*sched.current).stack.bottom() as *const usize;
        (
            mem::transmute::<usize, fn()>(base.read()),
            mem::transmute::<usize, fn()>(base.add(1).read()),
        )
    };

    entry();
    completion();

    // The completion routine normally recycles the fiber; make certain.
    release_fiber();
    loop {
        arch::wait_for_interrupt();
    }
}

/// Entry point of parameterized fibers: dispatches through the
/// `[entry, param, completion]` frame.
extern "C" fn launch_new_fiber_param() -> ! {
    let (entry, param, completion) = unsafe {
        let sched = &mut *SCHEDULER_PTR;
        let base = (*sched.current).stack.bottom() as *const usize;
        (
            mem::transmute::<usize, fn(*mut ())>(base.read()),
            base.add(1).read() as *mut (),
            mem::transmute::<usize, fn(*mut ())>(base.add(2).read()),
        )
    };

    entry(param);
    completion(param);

    release_fiber();
    loop {
        arch::wait_for_interrupt();
    }
}

// ---------------------------------------------------------------------------
// Blocking primitives
// ---------------------------------------------------------------------------

/// Block the calling fiber for at least `ms` milliseconds. Granularity is
/// the scheduler tick; there is no promise about when the fiber is next
/// scheduled after the deadline.
pub fn fiber_sleep(ms: u32) {
    if let Ok(sched) = scheduler() {
        sched.sleep(ms);
    }
}

/// Block the calling fiber until an event matching `(id, value)` arrives.
/// [`crate::config::ID_ANY`] / [`crate::config::VALUE_ANY`] match anything.
pub fn fiber_wait_for_event(id: u16, value: u16) {
    if let Ok(sched) = scheduler() {
        sched.wait_for_event(id, value);
    }
}

// ---------------------------------------------------------------------------
// Fork-on-block
// ---------------------------------------------------------------------------

/// Run `handler` asynchronously, without allocating a fiber unless it
/// actually blocks.
///
/// The caller's registers are snapshotted and the handler is called
/// directly. If it returns without blocking, nothing was allocated and the
/// call was an ordinary function call. If it blocks, the scheduler parks
/// the handler's continuation in a fresh fiber and resumes the caller from
/// the snapshot, as if the handler had completed synchronously.
pub fn fork_on_block(handler: fn()) {
    let Ok(sched) = scheduler() else { return };

    unsafe {
        if (*sched.current).flags & FLAG_FOB != 0 {
            // Already absorbing a block: no nesting, just give the handler
            // its own fiber.
            let _ = create_fiber(handler, release_fiber);
            return;
        }

        arch::save_register_context(&mut (*sched.current).regs);

        // Re-entry point: execution arrives here a second time if the
        // handler blocked and the scheduler restored our snapshot.
        if (*sched.current).flags & FLAG_PARENT != 0 {
            (*sched.current).flags &= !(FLAG_FOB | FLAG_PARENT);
            return;
        }

        (*sched.current).flags |= FLAG_FOB;
        handler();
        (*sched.current).flags &= !FLAG_FOB;

        // If the handler blocked, this path is now running as the forked
        // fiber finishing the absorbed continuation: recycle it.
        if (*sched.current).flags & FLAG_CHILD != 0 {
            release_fiber();
        }
    }
}

/// Parameterized [`fork_on_block`].
pub fn fork_on_block_with(handler: fn(*mut ()), param: *mut ()) {
    let Ok(sched) = scheduler() else { return };

    unsafe {
        if (*sched.current).flags & FLAG_FOB != 0 {
            let _ = create_fiber_with(handler, param, release_fiber_param);
            return;
        }

        arch::save_register_context(&mut (*sched.current).regs);

        if (*sched.current).flags & FLAG_PARENT != 0 {
            (*sched.current).flags &= !(FLAG_FOB | FLAG_PARENT);
            return;
        }

        (*sched.current).flags |= FLAG_FOB;
        handler(param);
        (*sched.current).flags &= !FLAG_FOB;

        if (*sched.current).flags & FLAG_CHILD != 0 {
            release_fiber();
        }
    }
}

// ---------------------------------------------------------------------------
// Completion and yield
// ---------------------------------------------------------------------------

/// Exit point for all fibers: return the current record to the pool and
/// yield. A fiber reaching the end of its entry function lands here via its
/// trampoline.
pub fn release_fiber() {
    if let Ok(sched) = scheduler() {
        sched.release();
    }
}

/// [`release_fiber`] with the signature of a parameterized completion
/// routine, for use as a default completion.
pub fn release_fiber_param(_param: *mut ()) {
    release_fiber();
}

/// Yield the processor: the calling fiber keeps its place on the run queue
/// and is resumed round-robin.
pub fn schedule() {
    if let Ok(sched) = scheduler() {
        sched.schedule();
    }
}

// ---------------------------------------------------------------------------
// ISR entry points
// ---------------------------------------------------------------------------

/// Timer callback. Call from the timer ISR every
/// [`crate::config::TICK_PERIOD_MS`] milliseconds.
pub fn scheduler_tick() {
    if let Ok(sched) = scheduler() {
        sched.tick();
    }
}

/// Event callback. Call from the message bus whenever an event is raised.
pub fn scheduler_event(evt: Event) {
    if let Ok(sched) = scheduler() {
        sched.event(evt);
    }
}

// ---------------------------------------------------------------------------
// Process flags and idle hooks
// ---------------------------------------------------------------------------

/// Mark (or clear) buffered data that the idle path must service; while
/// set, `schedule()` prefers the idle fiber over the run queue.
pub fn set_data_pending(pending: bool) {
    if let Ok(sched) = scheduler() {
        sync::critical_section(|_| {
            if pending {
                sched.flags |= FLAG_DATA_PENDING;
            } else {
                sched.flags &= !FLAG_DATA_PENDING;
            }
        });
    }
}

/// Install a low-power wait used by the idle fiber in place of the plain
/// wait-for-interrupt (e.g. a radio-stack-aware sleep).
pub fn set_low_power_hook(hook: fn()) {
    sync::critical_section(|_| unsafe { LOW_POWER_HOOK = Some(hook) });
}

/// Install the background maintenance hook run by the idle fiber after
/// every wakeup.
pub fn set_system_tasks_hook(hook: fn()) {
    sync::critical_section(|_| unsafe { SYSTEM_TASKS_HOOK = Some(hook) });
}

/// Idle fiber body: low-power sleep, background maintenance, yield. Runs
/// only when the run queue is empty (or a data read is pending), and never
/// appears on any queue.
fn idle_task() {
    loop {
        match unsafe { LOW_POWER_HOOK } {
            Some(wait) => wait(),
            None => arch::wait_for_interrupt(),
        }

        if let Some(tasks) = unsafe { SYSTEM_TASKS_HOOK } {
            tasks();
        }

        schedule();
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static HANDLER_RUNS: AtomicUsize = AtomicUsize::new(0);

    fn counting_handler() {
        HANDLER_RUNS.fetch_add(1, Ordering::SeqCst);
    }

    fn noop() {}

    /// One test exercises the process-wide instance end to end; everything
    /// else drives private `Scheduler` values to stay independent of global
    /// state.
    #[test]
    fn global_scheduler_lifecycle() {
        assert!(!scheduler_running());
        assert_eq!(create_fiber(noop, noop).unwrap_err(), Error::NotStarted);

        scheduler_init().expect("init failed");
        assert!(scheduler_running());
        scheduler_init().expect("re-init must be a no-op");

        let sched = scheduler().unwrap();
        let first = sched.current;

        // The caller's fiber is the only runnable; the idle fiber is parked
        // off-queue.
        assert!(!sched.run_queue.is_empty());
        assert!(!sched.idle.is_null());
        assert!(unsafe { (*sched.idle).queue.is_null() });

        // A created fiber joins the run queue with a trampoline frame.
        let handle = create_fiber(noop, noop).expect("create failed");
        let f = handle.as_ptr();
        unsafe {
            let base = (*f).stack.bottom() as *const usize;
            assert_eq!(base.read(), noop as usize);
            assert_eq!((*f).regs.lr, launch_new_fiber as usize);
        }

        // A fork-on-block handler that never blocks runs inline: no record
        // is allocated and every role flag is clear afterwards.
        let pool_was_empty = sched.pool.is_empty();
        fork_on_block(counting_handler);
        assert_eq!(HANDLER_RUNS.load(Ordering::SeqCst), 1);
        assert_eq!(unsafe { (*sched.current).flags }, 0);
        assert_eq!(sched.pool.is_empty(), pool_was_empty);
        assert!(sched.forked.is_null());
        assert_eq!(sched.current, first);

        // Ticks advance only through the tick entry point.
        let before = sched.ticks;
        scheduler_tick();
        assert_eq!(sched.ticks, before + crate::config::TICK_PERIOD_MS);
    }
}
