//! The secure monitor call record and the protocol values carried in it.
//!
//! A call value in `a0` is laid out as in the SMC calling convention:
//!
//! | bits  | meaning                                  |
//! |-------|------------------------------------------|
//! | 31    | 1 for a fast call, 0 for a standard call |
//! | 30    | 1 for the 64-bit calling convention      |
//! | 29:24 | owning service                           |
//! | 15:0  | function number                          |

use static_assertions::assert_eq_size;

pub const CALL_TYPE_FAST: u32 = 1 << 31;
pub const CALL_CONV_64: u32 = 1 << 30;
pub const OWNER_SHIFT: u32 = 24;
pub const OWNER_MASK: u32 = 0x3f;
pub const FUNC_MASK: u32 = 0xffff;

pub const OWNER_TRUSTED_OS: u32 = 50;

pub const fn call_val(fast: bool, conv_64: bool, owner: u32, func_num: u32) -> u32 {
    (if fast { CALL_TYPE_FAST } else { 0 })
        | (if conv_64 { CALL_CONV_64 } else { 0 })
        | ((owner & OWNER_MASK) << OWNER_SHIFT)
        | (func_num & FUNC_MASK)
}

/// Resumes a thread that was suspended to let the normal world service an RPC.
pub const CALL_RETURN_FROM_RPC: u32 = call_val(false, false, OWNER_TRUSTED_OS, 3);

pub const RETURN_OK: u32 = 0x0;
/// Another thread is already active, or every thread is in use.
pub const RETURN_EBUSY: u32 = 0x1;
/// A resume request named a thread that cannot be resumed by this caller.
pub const RETURN_ERESUME: u32 = 0x2;

pub const RETURN_RPC_PREFIX: u32 = 0xffff_0000;
pub const RPC_FUNC_ALLOC: u32 = 0;
pub const RPC_FUNC_FREE: u32 = 2;
pub const RPC_FUNC_IRQ: u32 = 4;
pub const RPC_FUNC_CMD: u32 = 5;

pub const fn rpc_val(func: u32) -> u32 {
    RETURN_RPC_PREFIX | (func & FUNC_MASK)
}

pub const RETURN_RPC_ALLOC: u32 = rpc_val(RPC_FUNC_ALLOC);
pub const RETURN_RPC_FREE: u32 = rpc_val(RPC_FUNC_FREE);
pub const RETURN_RPC_IRQ: u32 = rpc_val(RPC_FUNC_IRQ);
pub const RETURN_RPC_CMD: u32 = rpc_val(RPC_FUNC_CMD);

pub const fn is_fast_call(a0: u32) -> bool {
    a0 & CALL_TYPE_FAST != 0
}

pub const fn is_rpc_return(ret: u32) -> bool {
    ret & !FUNC_MASK == RETURN_RPC_PREFIX
}

/// The eight argument words of a secure monitor call, in both directions.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct SmcArgs {
    pub a0: u32,
    pub a1: u32,
    pub a2: u32,
    pub a3: u32,
    pub a4: u32,
    pub a5: u32,
    pub a6: u32,
    pub a7: u32
}

assert_eq_size!(SmcArgs, [u32; 8]);

impl SmcArgs {
    pub const fn new(words: [u32; 8]) -> SmcArgs {
        SmcArgs {
            a0: words[0],
            a1: words[1],
            a2: words[2],
            a3: words[3],
            a4: words[4],
            a5: words[5],
            a6: words[6],
            a7: words[7]
        }
    }

    pub fn words(&self) -> [u32; 8] {
        [self.a0, self.a1, self.a2, self.a3, self.a4, self.a5, self.a6, self.a7]
    }

    /// The hypervisor client that issued the call.
    pub fn client_id(&self) -> u32 {
        self.a7
    }

    /// Answers the call with `status` and nothing else. Every other word is cleared so no secure-world data leaks into a refusal.
    pub fn set_status(&mut self, status: u32) {
        *self = SmcArgs::new([status, 0, 0, 0, 0, 0, 0, 0]);
    }
}

/// How an incoming call is routed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SmcCall {
    /// Handled synchronously by the fastcall handler without a thread.
    Fast,
    /// Resumes the thread named in `a3`.
    ReturnFromRpc,
    /// Starts a new standard call on a free thread.
    Standard
}

impl SmcCall {
    pub fn classify(args: &SmcArgs) -> SmcCall {
        if is_fast_call(args.a0) {
            SmcCall::Fast
        } else if args.a0 == CALL_RETURN_FROM_RPC {
            SmcCall::ReturnFromRpc
        } else {
            SmcCall::Standard
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_call_values() {
        assert_eq!(0x3200_0003, CALL_RETURN_FROM_RPC);
        assert_eq!(0xffff_0005, RETURN_RPC_CMD);
        assert!(is_rpc_return(RETURN_RPC_ALLOC));
        assert!(!is_rpc_return(RETURN_EBUSY));
    }

    #[test]
    fn test_classify() {
        let mut args = SmcArgs::default();

        args.a0 = call_val(true, false, OWNER_TRUSTED_OS, 1);
        assert_eq!(SmcCall::Fast, SmcCall::classify(&args));

        args.a0 = CALL_RETURN_FROM_RPC;
        assert_eq!(SmcCall::ReturnFromRpc, SmcCall::classify(&args));

        args.a0 = call_val(false, false, OWNER_TRUSTED_OS, 4);
        assert_eq!(SmcCall::Standard, SmcCall::classify(&args));

        // A fast call with the same function number is still a fast call.
        args.a0 = CALL_RETURN_FROM_RPC | CALL_TYPE_FAST;
        assert_eq!(SmcCall::Fast, SmcCall::classify(&args));
    }

    #[test]
    fn test_set_status() {
        let mut args = SmcArgs::new([9, 8, 7, 6, 5, 4, 3, 2]);

        args.set_status(RETURN_EBUSY);

        assert_eq!([RETURN_EBUSY, 0, 0, 0, 0, 0, 0, 0], args.words());
    }
}
