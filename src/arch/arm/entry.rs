//! Symbols called from the platform's assembly vectors and context switch code.

use crate::arch::regs::{AbortRegs, Cpsr, SvcRegs};
use crate::thread::{self, AbortType, SmcArgs, ThreadFlags};

const ABORT_TYPE_UNDEF: u32 = 0;
const ABORT_TYPE_PREFETCH: u32 = 1;
const ABORT_TYPE_DATA: u32 = 2;

#[no_mangle]
extern "C" fn thread_handle_smc_call(args: &mut SmcArgs) {
    thread::handle_smc_call(args);
}

#[no_mangle]
extern "C" fn thread_std_smc_handler(args: &mut SmcArgs) {
    thread::std_smc_entry(args);
}

#[no_mangle]
extern "C" fn thread_state_suspend(flags: u32, cpsr: u32, pc: u32) -> u32 {
    thread::state_suspend(ThreadFlags::from_bits_truncate(flags), Cpsr::from_bits_retain(cpsr), pc) as u32
}

#[no_mangle]
extern "C" fn thread_state_free() {
    thread::state_free();
}

#[no_mangle]
extern "C" fn thread_get_tmp_sp() -> u32 {
    thread::tmp_stack().as_u32()
}

#[no_mangle]
extern "C" fn thread_fiq_handler() {
    thread::handle_fiq();
}

#[no_mangle]
extern "C" fn thread_svc_handler(regs: &mut SvcRegs) {
    thread::handle_svc(regs);
}

#[no_mangle]
extern "C" fn thread_abort_handler(abort_type: u32, regs: &mut AbortRegs) {
    let abort_type = match abort_type {
        ABORT_TYPE_UNDEF => AbortType::Undef,
        ABORT_TYPE_PREFETCH => AbortType::Prefetch,
        ABORT_TYPE_DATA => AbortType::Data,
        _ => panic!("abort vector reported unknown abort type {}", abort_type)
    };

    thread::handle_abort(abort_type, regs);
}
