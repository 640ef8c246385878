//! The secure thread dispatcher.
//!
//! This module multiplexes a small fixed pool of secure threads across the cores that enter the secure world. A standard call from the
//! normal world is given a free thread and runs inside it; the thread can step back out to the normal world to have it perform an RPC,
//! and is resumed on whichever core the normal world uses to deliver the answer.
//!
//! The state machine itself lives in [`ThreadManager`]. The functions here drive the process-wide instance on behalf of the calling core
//! and perform the architecture-level switches the manager leaves to its caller.

use core::ffi::c_void;
use core::ptr::NonNull;

use crate::arch;
use crate::arch::regs::{AbortRegs, Cpsr, SvcRegs, ThreadCtxRegs};
use crate::arch::VirtAddr;

pub mod core_local;
pub mod handlers;
pub mod manager;
pub mod rpc;
pub mod smc;
pub mod table;

pub use self::handlers::{AbortType, StackCanaries, ThreadHandlers};
pub use self::manager::{NoActiveThread, SmcOutcome, StackId, StackInitError, ThreadManager, THREAD_ABT_STACK, THREAD_TMP_STACK};
pub use self::rpc::{RpcArgs, RpcClient};
pub use self::smc::SmcArgs;
pub use self::table::{ThreadFlags, ThreadId, ThreadSpecificData, ThreadState};

static THREADS: ThreadManager = ThreadManager::new();

/// Returns the process-wide thread manager.
pub fn manager() -> &'static ThreadManager {
    &THREADS
}

/// Installs the dispatcher's handlers and the secure vector table.
///
/// # Safety
///
/// This function must be called exactly once, from the boot core, before any secure monitor call is dispatched and before any other core
/// enters the secure world.
pub unsafe fn init_handlers(handlers: &'static dyn ThreadHandlers) {
    THREADS.init_handlers(handlers);
    arch::init_vbar();
}

/// Installs the stack canary check.
pub fn init_canaries(canaries: &'static dyn StackCanaries) {
    THREADS.init_canaries(canaries);
}

/// Registers the top of a stack for the calling core. `id` is a thread id, [`THREAD_TMP_STACK`] or [`THREAD_ABT_STACK`].
///
/// # Safety
///
/// See [`ThreadManager::init_stack`].
pub unsafe fn init_stack(id: u32, sp: VirtAddr) -> Result<(), StackInitError> {
    THREADS.init_stack(arch::core_pos(), StackId::from_raw(id), sp)
}

pub fn tmp_stack() -> VirtAddr {
    THREADS.tmp_stack(arch::core_pos())
}

/// Handles a secure monitor call on the calling core. Returns only if the call was answered without switching into a thread.
pub fn handle_smc_call(args: &mut SmcArgs) {
    if let SmcOutcome::Resume(regs) = THREADS.handle_smc_call(arch::core_pos(), args) {
        // SAFETY: The manager has just bound this core to the thread owning regs, and no lock is held at this point.
        unsafe { arch::resume(&regs) }
    }
}

/// Body of the standard call entry point, running inside the thread allocated for the call.
pub fn std_smc_entry(args: &mut SmcArgs) {
    THREADS.run_stdcall(arch::core_pos(), args);
}

pub fn state_suspend(flags: ThreadFlags, cpsr: Cpsr, pc: u32) -> ThreadId {
    THREADS.state_suspend(arch::core_pos(), flags, cpsr, pc)
}

pub fn state_free() {
    THREADS.state_free(arch::core_pos());
}

/// Runs `f` on the saved registers of the thread running on the calling core.
pub fn with_ctx_regs<U>(f: impl FnOnce(&mut ThreadCtxRegs) -> U) -> U {
    THREADS.with_ctx_regs(arch::core_pos(), f)
}

pub fn set_tsd(tsd: ThreadSpecificData) -> Result<(), NoActiveThread> {
    THREADS.set_tsd(arch::core_pos(), tsd)
}

pub fn tsd() -> Option<NonNull<c_void>> {
    THREADS.tsd(arch::core_pos())
}

pub fn release_tsd() -> Result<(), NoActiveThread> {
    THREADS.release_tsd(arch::core_pos())
}

/// Returns an RPC client for code running inside a thread.
pub fn rpc_client() -> RpcClient<arch::ArchRpc> {
    RpcClient::new(arch::ArchRpc)
}

pub fn handle_fiq() {
    THREADS.handle_fiq();
}

pub fn handle_svc(regs: &mut SvcRegs) {
    THREADS.handle_svc(regs);
}

pub fn handle_abort(abort_type: AbortType, regs: &mut AbortRegs) {
    THREADS.handle_abort(abort_type, regs);
}
