//! Host simulation of the architecture API.
//!
//! Used when building for anything other than an ARM target, and for unit tests. Each host thread plays the part of one core: it has its
//! own core position, interrupt mask and banked exception stacks. The primitives that would leave the current execution context (resuming a
//! thread, yielding to the normal world) have no host equivalent and are unimplemented; callers that need to observe those transitions
//! drive [`ThreadManager`](crate::thread::ThreadManager) directly.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};

use super::regs::{ThreadCtxRegs, VirtAddr};
use crate::thread::rpc::{RpcArgs, RpcYield};
use crate::thread::ThreadFlags;

pub mod interrupt;

/// The address reported for the standard call entry point.
pub const HOST_STDCALL_ENTRY: u32 = 0x0e10_0000;

/// The banked exception stack pointers of one simulated core.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ExceptionStacks {
    pub irq: VirtAddr,
    pub fiq: VirtAddr,
    pub abt: VirtAddr
}

std::thread_local! {
    static CORE_POS: Cell<usize> = const { Cell::new(0) };
    static EXCEPTION_STACKS: Cell<ExceptionStacks> = Cell::new(ExceptionStacks::default());
}

static VBAR_INSTALLED: AtomicBool = AtomicBool::new(false);

pub fn core_pos() -> usize {
    CORE_POS.with(|pos| pos.get())
}

/// Makes the calling host thread act as core `core` from now on.
pub fn set_core_pos(core: usize) {
    CORE_POS.with(|pos| pos.set(core));
}

pub fn stdcall_entry() -> u32 {
    HOST_STDCALL_ENTRY
}

/// Returns the exception stacks registered by the calling host thread.
pub fn exception_stacks() -> ExceptionStacks {
    EXCEPTION_STACKS.with(|stacks| stacks.get())
}

fn update_exception_stacks(f: impl FnOnce(&mut ExceptionStacks)) {
    EXCEPTION_STACKS.with(|stacks| {
        let mut val = stacks.get();
        f(&mut val);
        stacks.set(val);
    });
}

pub unsafe fn set_irq_sp(sp: VirtAddr) {
    update_exception_stacks(|stacks| stacks.irq = sp);
}

pub unsafe fn set_fiq_sp(sp: VirtAddr) {
    update_exception_stacks(|stacks| stacks.fiq = sp);
}

pub unsafe fn set_abt_sp(sp: VirtAddr) {
    update_exception_stacks(|stacks| stacks.abt = sp);
}

pub unsafe fn init_vbar() {
    VBAR_INSTALLED.store(true, Ordering::Release);
}

pub fn vbar_installed() -> bool {
    VBAR_INSTALLED.load(Ordering::Acquire)
}

pub unsafe fn resume(regs: &ThreadCtxRegs) -> ! {
    unimplemented!("cannot resume a secure thread on the host (pc {:#x})", regs.pc)
}

pub struct ArchRpc;

impl RpcYield for ArchRpc {
    fn rpc(&self, _flags: ThreadFlags, _args: &mut RpcArgs) {
        unimplemented!("cannot yield to the normal world on the host")
    }
}
