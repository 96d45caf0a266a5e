//! # Architecture Port Layer
//!
//! The scheduler consumes four context operations from the active port:
//!
//! - `save_context(ctx, stack_top)`: full snapshot, registers plus a copy
//!   of the live hardware stack parked into the fiber buffer ending at
//!   `stack_top`. Restoring the snapshot resumes at the instruction after
//!   the call.
//! - `save_register_context(ctx)`: registers only, with the return-address
//!   register pointing at the instruction after the call. The snapshot may
//!   be re-entered.
//! - `restore_register_context(ctx)`: inverse of the above; does not
//!   return to its caller.
//! - `swap_context(out, in, out_top, in_top)`: atomic save-then-restore;
//!   park the outgoing fiber's stack and registers, unpark the incoming
//!   fiber's, and transfer control.
//!
//! All fibers execute on the same physical stack, growing down from a fixed
//! base; their heap buffers only hold suspended copies. That is why new
//! contexts are seeded with `stack_base()` as their stack pointer, and why
//! stack sizing is measured against the live hardware stack
//! (`stack_depth()`) rather than any per-fiber region.
//!
//! The Cortex-M0 port implements the contract in Thumb-1 assembly. The
//! hosted port stands in on every other target so the scheduler's state
//! machine stays observable under `cargo test`; it performs no real
//! transfer of control.

#[cfg(all(target_arch = "arm", target_os = "none"))]
mod cortex_m0;
#[cfg(all(target_arch = "arm", target_os = "none"))]
pub use cortex_m0::*;

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
mod hosted;
#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub use hosted::*;
