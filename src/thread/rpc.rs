//! Requests a running thread makes of the normal world.
//!
//! An RPC leaves the secure world entirely: the thread is suspended, the request words travel out in `a0..a2` of the monitor call's return
//! and the thread id in `a3`. The normal world later issues a return-from-RPC call naming the same thread, whose `a1` and `a2` come back as
//! words 1 and 2 of the request array.

use crate::arch::regs::ThreadCtxRegs;
use crate::arch::PhysAddr;

use super::smc::{RETURN_RPC_ALLOC, RETURN_RPC_CMD, RETURN_RPC_FREE, RETURN_RPC_IRQ};
use super::ThreadFlags;

pub const RPC_NUM_ARGS: usize = 3;

/// The words of one RPC. Word 0 is the request code on the way out; words 1 and 2 carry parameters out and results back.
pub type RpcArgs = [u32; RPC_NUM_ARGS];

/// Suspends the calling thread, hands `args` to the normal world and returns once the thread has been resumed, with `args` updated from
/// the resuming call.
pub trait RpcYield {
    fn rpc(&self, flags: ThreadFlags, args: &mut RpcArgs);
}

impl<R: RpcYield + ?Sized> RpcYield for &R {
    fn rpc(&self, flags: ThreadFlags, args: &mut RpcArgs) {
        (**self).rpc(flags, args)
    }
}

/// The return half of an RPC: reads the result out of the registers the thread was resumed with.
pub fn complete_rpc(regs: &ThreadCtxRegs, args: &mut RpcArgs) {
    *args = [regs.r0, regs.r1, regs.r2];
}

/// The built-in requests used to negotiate shared memory with the normal world and to pass it commands.
pub struct RpcClient<R: RpcYield> {
    yielder: R
}

impl<R: RpcYield> RpcClient<R> {
    pub const fn new(yielder: R) -> RpcClient<R> {
        RpcClient { yielder }
    }

    fn call(&self, flags: ThreadFlags, code: u32, p1: u32, p2: u32) -> RpcArgs {
        let mut args = [code, p1, p2];

        self.yielder.rpc(flags, &mut args);
        args
    }

    /// Asks the normal world for a shared argument block of `arg_size` bytes and a payload block of `payload_size` bytes. Returns the
    /// physical addresses of both, either of which is zero if that allocation failed.
    pub fn alloc(&self, arg_size: u32, payload_size: u32) -> (PhysAddr, PhysAddr) {
        let args = self.call(ThreadFlags::COPY_ARGS_ON_RETURN, RETURN_RPC_ALLOC, arg_size, payload_size);

        (PhysAddr::new(args[1]), PhysAddr::new(args[2]))
    }

    /// Returns a pair of blocks obtained from [`RpcClient::alloc`].
    pub fn free(&self, arg: PhysAddr, payload: PhysAddr) {
        self.call(ThreadFlags::COPY_ARGS_ON_RETURN, RETURN_RPC_FREE, arg.as_u32(), payload.as_u32());
    }

    /// Asks the normal world to execute the command described by the argument block at `arg`. Returns the words of the resuming call.
    pub fn cmd(&self, arg: PhysAddr) -> RpcArgs {
        self.call(ThreadFlags::COPY_ARGS_ON_RETURN, RETURN_RPC_CMD, arg.as_u32(), 0)
    }

    /// Steps out so the normal world can service a pending foreign interrupt. The thread's registers are left alone on return.
    pub fn irq(&self) {
        self.call(ThreadFlags::empty(), RETURN_RPC_IRQ, 0, 0);
    }
}
