//! # Cortex-M0 Port Layer
//!
//! Context operations for the ARM Cortex-M0 (Thumb-1). Fibers share the
//! single hardware stack below [`STACK_BASE`]; a context save parks the
//! registers in the fiber's [`Context`] and copies the live stack into the
//! fiber's heap buffer, and a restore reverses both.
//!
//! ## Saved state
//!
//! Only the callee-saved registers, SP and LR are captured. Caller-saved
//! registers are dead across the call boundary by the AAPCS, so a snapshot
//! taken at a call site needs nothing more to resume correctly.
//!
//! ## Stack copy
//!
//! ```text
//!        STACK_BASE ──►┌────────────┐        fiber.stack.top() ──►┌───────┐
//!                      │ live frames │  save / park ─────────────►│ copy  │
//!              SP ──►  └────────────┘ ◄───────────── restore      └───────┘
//! ```
//!
//! The copy loops run entirely in registers, so they are safe even while
//! the destination overlaps the region below the current stack pointer.

use core::arch::naked_asm;

/// Base of the hardware stack: the initial MSP, at the top of RAM on an
/// nRF51-class part (16 KiB at `0x2000_0000`). Every fiber's live stack
/// grows down from here.
pub const STACK_BASE: usize = 0x2000_4000;

/// Saved register context: callee-saved r4–r11, the stack pointer, and the
/// resume address (LR at the time of the snapshot).
///
/// Field order is load-bearing: the assembly below stores and loads the
/// struct as a flat word array.
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
    /// All-zero context, seeded later by `save_context` or a template copy.
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

/// Current depth of the live hardware stack in bytes.
#[inline]
pub fn stack_depth() -> usize {
    STACK_BASE - cortex_m::register::msp::read() as usize
}

/// Base address the live stack grows down from.
#[inline]
pub fn stack_base() -> usize {
    STACK_BASE
}

/// Sleep the core until the next interrupt.
#[inline]
pub fn wait_for_interrupt() {
    cortex_m::asm::wfi();
}

/// Full context save: registers into `ctx`, live stack parked into the
/// buffer ending at `stack_top`. Returns normally now, and once more when
/// the snapshot is scheduled back in.
///
/// # Safety
/// `ctx` must be a valid context slot and `stack_top` the top of a buffer
/// large enough for the current stack depth.
#[unsafe(naked)]
pub unsafe extern "C" fn save_context(ctx: *mut Context, stack_top: usize) {
    naked_asm!(
        // r0 = ctx, r1 = stack_top.
        // Registers into the context slot, low then high, then SP/LR.
        "stmia r0!, {{r4-r7}}",
        "mov r2, r8",
        "mov r3, r9",
        "stmia r0!, {{r2-r3}}",
        "mov r2, r10",
        "mov r3, r11",
        "stmia r0!, {{r2-r3}}",
        "mov r2, sp",
        "mov r3, lr",
        "stmia r0!, {{r2-r3}}",
        // Park the live stack: [sp, STACK_BASE) into the buffer ending at
        // stack_top. r2 still holds the snapshot SP.
        "push {{r4, r5}}",
        "ldr r3, ={base}",
        "subs r4, r3, r2",
        "subs r1, r1, r4",
        "cmp r2, r3",
        "beq 3f",
        "2:",
        "ldr r4, [r2]",
        "str r4, [r1]",
        "adds r2, #4",
        "adds r1, #4",
        "cmp r2, r3",
        "bne 2b",
        "3:",
        "pop {{r4, r5}}",
        "bx lr",
        base = const STACK_BASE
    );
}

/// Register-only snapshot for the fork-on-block re-entry point. LR in the
/// snapshot addresses the instruction after this call.
///
/// # Safety
/// `ctx` must be a valid context slot.
#[unsafe(naked)]
pub unsafe extern "C" fn save_register_context(ctx: *mut Context) {
    naked_asm!(
        "stmia r0!, {{r4-r7}}",
        "mov r2, r8",
        "mov r3, r9",
        "stmia r0!, {{r2-r3}}",
        "mov r2, r10",
        "mov r3, r11",
        "stmia r0!, {{r2-r3}}",
        "mov r2, sp",
        "mov r3, lr",
        "stmia r0!, {{r2-r3}}",
        "bx lr"
    );
}

/// Resume a register-only snapshot. Control continues at the snapshot's LR;
/// this call does not return.
///
/// # Safety
/// `ctx` must hold a snapshot taken by [`save_register_context`] whose
/// stack frames are still intact.
#[unsafe(naked)]
pub unsafe extern "C" fn restore_register_context(ctx: *const Context) -> ! {
    naked_asm!(
        "ldr r2, [r0, #16]",
        "mov r8, r2",
        "ldr r2, [r0, #20]",
        "mov r9, r2",
        "ldr r2, [r0, #24]",
        "mov r10, r2",
        "ldr r2, [r0, #28]",
        "mov r11, r2",
        "ldr r2, [r0, #32]",
        "mov sp, r2",
        "ldr r2, [r0, #36]",
        "mov lr, r2",
        "ldmia r0!, {{r4-r7}}",
        "bx lr"
    );
}

/// Atomic save-then-restore: park the outgoing fiber (registers + stack),
/// unpark the incoming fiber, and transfer control to it.
///
/// # Safety
/// Both context slots and stack tops must describe live fibers; the
/// outgoing buffer must be large enough for the current stack depth (the
/// scheduler calls `verify_stack_size` first).
#[unsafe(naked)]
pub unsafe extern "C" fn swap_context(
    out: *mut Context,
    inp: *const Context,
    out_stack_top: usize,
    in_stack_top: usize,
) {
    naked_asm!(
        // r0 = out ctx, r1 = in ctx, r2 = out_stack_top, r3 = in_stack_top.
        // 1. Outgoing registers into the out slot.
        "stmia r0!, {{r4-r7}}",
        "mov r4, r8",
        "mov r5, r9",
        "mov r6, r10",
        "mov r7, r11",
        "stmia r0!, {{r4-r7}}",
        "mov r4, sp",
        "mov r5, lr",
        "stmia r0!, {{r4-r5}}",
        // 2. Park the outgoing stack: [sp, STACK_BASE) to the buffer ending
        //    at out_stack_top. r4-r7 are free now; the saved values live in
        //    the out slot.
        "mov r4, sp",
        "ldr r5, ={base}",
        "subs r6, r5, r4",
        "subs r2, r2, r6",
        "cmp r4, r5",
        "beq 3f",
        "2:",
        "ldr r7, [r4]",
        "str r7, [r2]",
        "adds r4, #4",
        "adds r2, #4",
        "cmp r4, r5",
        "bne 2b",
        "3:",
        // 4. Unpark the incoming stack: buffer ending at in_stack_top onto
        //    [in.sp, STACK_BASE). Register-only loop; no stack access while
        //    the live region is being rewritten.
        "ldr r4, [r1, #32]",
        "ldr r5, ={base}",
        "subs r6, r5, r4",
        "subs r3, r3, r6",
        "cmp r4, r5",
        "beq 5f",
        "4:",
        "ldr r7, [r3]",
        "str r7, [r4]",
        "adds r3, #4",
        "adds r4, #4",
        "cmp r4, r5",
        "bne 4b",
        "5:",
        // 6. Incoming registers, SP and LR, then resume the incoming fiber.
        "ldr r4, [r1, #16]",
        "mov r8, r4",
        "ldr r4, [r1, #20]",
        "mov r9, r4",
        "ldr r4, [r1, #24]",
        "mov r10, r4",
        "ldr r4, [r1, #28]",
        "mov r11, r4",
        "ldr r4, [r1, #32]",
        "mov sp, r4",
        "ldr r4, [r1, #36]",
        "mov lr, r4",
        "ldmia r1!, {{r4-r7}}",
        "bx lr",
        base = const STACK_BASE
    );
}
