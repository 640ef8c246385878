//! The entry points that interpret call payloads and trap causes.

use crate::arch::regs::{AbortRegs, SvcRegs};

use super::smc::SmcArgs;

/// Identifies which exception vector an abort was taken through.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AbortType {
    Undef,
    Prefetch,
    Data
}

/// The services the dispatcher forwards work to.
///
/// A single implementation is installed once during boot and then shared by every core, so implementations must be safe to call from any
/// core concurrently.
pub trait ThreadHandlers: Sync {
    /// Runs a standard call inside a freshly allocated thread. The answer is written back into `args`.
    fn stdcall(&self, args: &mut SmcArgs);

    /// Answers a fast call synchronously, without a thread.
    fn fastcall(&self, args: &mut SmcArgs);

    fn fiq(&self);

    fn svc(&self, regs: &mut SvcRegs);

    fn abort(&self, abort_type: AbortType, regs: &mut AbortRegs);
}

/// Checks the guard words at the ends of the dispatcher's stacks.
///
/// Implementations should halt the system when a canary has been overwritten rather than returning.
pub trait StackCanaries: Sync {
    fn check(&self);
}
