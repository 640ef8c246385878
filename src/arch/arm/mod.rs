//! ARMv7-A backend.
//!
//! The context switch itself is implemented in assembly by the platform (`thread_a32.S`); this module only declares those entry points and
//! provides the few single-instruction accessors that are simpler to write inline.

use core::arch::asm;

use super::regs::{ThreadCtxRegs, VirtAddr};
use crate::thread::rpc::{RpcArgs, RpcYield};
use crate::thread::ThreadFlags;

mod entry;
pub mod interrupt;

const MPIDR_CPU_MASK: u32 = 0xff;

extern "C" {
    fn thread_resume(regs: *const ThreadCtxRegs) -> !;
    fn thread_rpc(flags: u32, args: *mut u32);
    fn thread_stdcall_entry();
    fn thread_set_irq_sp(sp: u32);
    fn thread_set_fiq_sp(sp: u32);
    fn thread_set_abt_sp(sp: u32);
    fn thread_init_vbar();
}

fn read_mpidr() -> u32 {
    let mpidr: u32;

    // SAFETY: Reading MPIDR has no side effects.
    unsafe {
        asm!("mrc p15, 0, {}, c0, c0, 5", out(reg) mpidr, options(nomem, nostack, preserves_flags));
    }

    mpidr
}

/// Returns the linear position of the calling core.
pub fn core_pos() -> usize {
    (read_mpidr() & MPIDR_CPU_MASK) as usize
}

/// Returns the address at which new standard calls start executing. Bit 0 is set if the entry point is Thumb code.
pub fn stdcall_entry() -> u32 {
    thread_stdcall_entry as usize as u32
}

/// Points the banked IRQ-mode stack pointer of the calling core at `sp`.
///
/// # Safety
///
/// `sp` must be the top of a stack reserved for this core's IRQ mode.
pub unsafe fn set_irq_sp(sp: VirtAddr) {
    thread_set_irq_sp(sp.as_u32());
}

/// Points the banked FIQ-mode stack pointer of the calling core at `sp`.
///
/// # Safety
///
/// `sp` must be the top of a stack reserved for this core's FIQ mode.
pub unsafe fn set_fiq_sp(sp: VirtAddr) {
    thread_set_fiq_sp(sp.as_u32());
}

/// Points the banked abort-mode stack pointer of the calling core at `sp`.
///
/// # Safety
///
/// `sp` must be the top of a stack reserved for this core's abort mode.
pub unsafe fn set_abt_sp(sp: VirtAddr) {
    thread_set_abt_sp(sp.as_u32());
}

/// Installs the secure vector table on the calling core.
///
/// # Safety
///
/// The thread handlers must have been installed, since the vectors dispatch straight into them.
pub unsafe fn init_vbar() {
    thread_init_vbar();
}

/// Loads `regs` and jumps into the thread they describe. The thread later re-enters the dispatcher through an SMC exit path rather than
/// returning here.
///
/// # Safety
///
/// The calling core must have just been bound to the thread owning `regs`, and no lock guard may be live.
pub unsafe fn resume(regs: &ThreadCtxRegs) -> ! {
    thread_resume(regs)
}

/// The real "yield to the normal world" primitive: saves the current thread, suspends it and exits through the secure monitor. Returns
/// once a matching resume call has reactivated this thread, with the answer in `args`.
pub struct ArchRpc;

impl RpcYield for ArchRpc {
    fn rpc(&self, flags: ThreadFlags, args: &mut RpcArgs) {
        // SAFETY: Only reachable from code running inside an active thread, which is the only context thread_rpc supports.
        unsafe { thread_rpc(flags.bits(), args.as_mut_ptr()) }
    }
}
