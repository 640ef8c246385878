//! The fixed table of secure thread slots.
//!
//! Nothing here synchronizes by itself. The table only ever exists behind the manager's global lock, and every method assumes the caller
//! holds it.

use core::ffi::c_void;
use core::fmt;
use core::ptr::NonNull;

use bitflags::bitflags;

use crate::arch::regs::ThreadCtxRegs;
use crate::arch::VirtAddr;

/// Index of a slot in the thread table. This is the value handed to the normal world in `a3` when a thread suspends for an RPC.
pub type ThreadId = usize;

/// Represents the life-cycle state of a thread slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ThreadState {
    /// The slot holds no call and can be allocated to a new standard call.
    Free,
    /// The slot is executing, or about to execute, on the core whose tracker points at it.
    Active,
    /// The slot is waiting for the normal world to finish an RPC and resume it.
    Suspended
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct ThreadFlags: u32 {
        /// The next resume delivers an RPC result: copy a0-a3 of the resuming call into r0-r3. Consumed by that resume.
        const COPY_ARGS_ON_RETURN = 1 << 0;
    }
}

/// An opaque payload attached to the task running in a thread, together with the function that releases it.
///
/// The handle is move-only and lives in the thread table once attached. Other code only ever sees the data pointer, so the destructor can
/// run at most once.
pub struct ThreadSpecificData {
    data: NonNull<c_void>,
    free: unsafe fn(NonNull<c_void>)
}

// SAFETY: The payload is only reachable through the thread table lock, and only by the core running the owning thread.
unsafe impl Send for ThreadSpecificData {}

impl ThreadSpecificData {
    /// Wraps a payload and its destructor.
    ///
    /// # Safety
    ///
    /// `free` must be safe to call exactly once with `data`, from whichever core the owning thread happens to run on at the time.
    pub unsafe fn new(data: NonNull<c_void>, free: unsafe fn(NonNull<c_void>)) -> ThreadSpecificData {
        ThreadSpecificData { data, free }
    }

    pub fn data(&self) -> NonNull<c_void> {
        self.data
    }

    /// Runs the destructor, consuming the payload.
    pub(super) fn release(self) {
        // SAFETY: The constructor's contract guarantees this is the one call to free for this payload.
        unsafe { (self.free)(self.data) }
    }
}

impl fmt::Debug for ThreadSpecificData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadSpecificData").field("data", &self.data).finish_non_exhaustive()
    }
}

/// One slot of the thread table.
#[derive(Debug)]
pub struct ThreadCtx {
    state: ThreadState,
    flags: ThreadFlags,
    regs: ThreadCtxRegs,
    stack_va_end: VirtAddr,
    hyp_clnt_id: u32,
    tsd: Option<ThreadSpecificData>
}

impl ThreadCtx {
    pub const INIT: ThreadCtx = ThreadCtx {
        state: ThreadState::Free,
        flags: ThreadFlags::empty(),
        regs: ThreadCtxRegs::new(),
        stack_va_end: VirtAddr::zero(),
        hyp_clnt_id: 0,
        tsd: None
    };

    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub(super) fn set_state(&mut self, state: ThreadState) {
        self.state = state;
    }

    pub fn flags(&self) -> ThreadFlags {
        self.flags
    }

    pub(super) fn flags_mut(&mut self) -> &mut ThreadFlags {
        &mut self.flags
    }

    /// The saved register context. Stale while the thread is active, since the running core holds the live values.
    pub fn regs(&self) -> &ThreadCtxRegs {
        &self.regs
    }

    pub(super) fn regs_mut(&mut self) -> &mut ThreadCtxRegs {
        &mut self.regs
    }

    /// The top of this thread's private stack, or zero if none has been registered.
    pub fn stack_va_end(&self) -> VirtAddr {
        self.stack_va_end
    }

    pub(super) fn set_stack_va_end(&mut self, sp: VirtAddr) {
        self.stack_va_end = sp;
    }

    /// The client that allocated this thread. Only meaningful while the thread is not free.
    pub fn hyp_clnt_id(&self) -> u32 {
        self.hyp_clnt_id
    }

    pub(super) fn set_hyp_clnt_id(&mut self, id: u32) {
        self.hyp_clnt_id = id;
    }

    /// The payload attached to this thread, if any.
    pub fn tsd(&self) -> Option<NonNull<c_void>> {
        self.tsd.as_ref().map(|tsd| tsd.data())
    }

    pub(super) fn tsd_mut(&mut self) -> &mut Option<ThreadSpecificData> {
        &mut self.tsd
    }
}

pub struct ThreadTable<const N: usize> {
    threads: [ThreadCtx; N]
}

impl<const N: usize> ThreadTable<N> {
    pub const fn new() -> Self {
        ThreadTable { threads: [ThreadCtx::INIT; N] }
    }

    pub const fn len(&self) -> usize {
        N
    }

    pub fn get(&self, id: ThreadId) -> Option<&ThreadCtx> {
        self.threads.get(id)
    }

    pub fn get_mut(&mut self, id: ThreadId) -> Option<&mut ThreadCtx> {
        self.threads.get_mut(id)
    }

    /// Checks whether any thread, on any core, is active.
    pub fn has_active(&self) -> bool {
        self.threads.iter().any(|thread| thread.state == ThreadState::Active)
    }

    /// Returns the lowest-numbered free thread.
    pub fn first_free(&self) -> Option<ThreadId> {
        self.threads.iter().position(|thread| thread.state == ThreadState::Free)
    }

    pub fn count(&self, state: ThreadState) -> usize {
        self.threads.iter().filter(|thread| thread.state == state).count()
    }
}

impl<const N: usize> core::ops::Index<ThreadId> for ThreadTable<N> {
    type Output = ThreadCtx;

    fn index(&self, id: ThreadId) -> &ThreadCtx {
        &self.threads[id]
    }
}

impl<const N: usize> core::ops::IndexMut<ThreadId> for ThreadTable<N> {
    fn index_mut(&mut self, id: ThreadId) -> &mut ThreadCtx {
        &mut self.threads[id]
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_new_table_is_free() {
        let table: ThreadTable<3> = ThreadTable::new();

        assert_eq!(3, table.len());
        assert_eq!(3, table.count(ThreadState::Free));
        assert!(!table.has_active());
        assert_eq!(Some(0), table.first_free());
        assert!(table.get(3).is_none());
    }

    #[test]
    fn test_first_free_skips_used() {
        let mut table: ThreadTable<3> = ThreadTable::new();

        table[0].set_state(ThreadState::Suspended);
        table[1].set_state(ThreadState::Active);

        assert_eq!(Some(2), table.first_free());
        assert!(table.has_active());

        table[2].set_state(ThreadState::Suspended);
        assert_eq!(None, table.first_free());
    }

    #[test]
    fn test_tsd_release() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        static RELEASED: AtomicUsize = AtomicUsize::new(0);

        unsafe fn free(data: NonNull<c_void>) {
            RELEASED.store(data.as_ptr() as usize, Ordering::Relaxed);
        }

        let tsd = unsafe { ThreadSpecificData::new(NonNull::new(0x1000 as *mut c_void).unwrap(), free) };

        assert_eq!(0x1000, tsd.data().as_ptr() as usize);
        tsd.release();
        assert_eq!(0x1000, RELEASED.load(Ordering::Relaxed));
    }
}
