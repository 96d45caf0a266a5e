//! # Hosted Port Layer
//!
//! Stand-in context operations for non-embedded targets, used by the unit
//! tests and docs builds. Snapshots are deterministic and no control is
//! actually transferred: `swap_context` leaves execution with the caller,
//! which lets tests drive the scheduler's queue and selection logic and
//! observe every state transition.
//!
//! `restore_register_context` cannot be emulated without a real register
//! file; tests are structured so it is never reached.

/// Saved register context, mirroring the embedded port's layout with
/// host-width words so trampoline addresses fit.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Context {
    pub r4: usize,
    pub r5: usize,
    pub r6: usize,
    pub r7: usize,
    pub r8: usize,
    pub r9: usize,
    pub r10: usize,
    pub r11: usize,
    pub sp: usize,
    pub lr: usize,
}

impl Context {
    pub const fn empty() -> Self {
        Context {
            r4: 0,
            r5: 0,
            r6: 0,
            r7: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            sp: 0,
            lr: 0,
        }
    }
}

/// Nominal stack base; only compared against, never dereferenced.
pub const STACK_BASE: usize = 0x2000_4000;

/// The host has no fixed-base fiber stack, so the live depth is always
/// reported as zero and `verify_stack_size` never grows anything.
#[inline]
pub fn stack_depth() -> usize {
    0
}

#[inline]
pub fn stack_base() -> usize {
    STACK_BASE
}

#[inline]
pub fn wait_for_interrupt() {
    core::hint::spin_loop();
}

/// Deterministic full snapshot: zeroed registers with SP pointed at the
/// fiber buffer top. Returns exactly once on the host.
///
/// # Safety
/// `ctx` must be a valid context slot.
pub unsafe fn save_context(ctx: *mut Context, stack_top: usize) {
    let mut snapshot = Context::empty();
    snapshot.sp = stack_top;
    unsafe { ctx.write(snapshot) };
}

/// Register snapshot; returns exactly once on the host.
///
/// # Safety
/// `ctx` must be a valid context slot.
pub unsafe fn save_register_context(ctx: *mut Context) {
    unsafe { ctx.write(Context::empty()) };
}

/// Not emulated on the host.
///
/// # Safety
/// Never sound to call here; exists so the scheduler compiles unchanged.
pub unsafe fn restore_register_context(_ctx: *const Context) -> ! {
    unreachable!("register restore requires the embedded port");
}

/// No-op on the host: execution stays with the caller, which observes the
/// scheduler's state as if it were the incoming fiber.
///
/// # Safety
/// Pointers must be valid context slots.
pub unsafe fn swap_context(
    _out: *mut Context,
    _inp: *const Context,
    _out_stack_top: usize,
    _in_stack_top: usize,
) {
}
