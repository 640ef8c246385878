//! Per-core dispatcher state.
//!
//! Each record is only ever written by its own core, so relaxed atomics are enough to let the records live in a shared static. Anything
//! that must be ordered against the thread table is updated while the global lock is held, which provides the ordering.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use super::table::ThreadId;
use crate::arch::VirtAddr;

const NO_THREAD: usize = usize::MAX;

/// The dispatcher state of one core.
#[derive(Debug)]
pub struct CoreLocal {
    curr_thread: AtomicUsize,
    tmp_stack_va_end: AtomicU32,
    irq_stack_va_end: AtomicU32,
    fiq_stack_va_end: AtomicU32,
    abt_stack_va_end: AtomicU32
}

impl CoreLocal {
    #[allow(clippy::declare_interior_mutable_const)]
    pub const INIT: CoreLocal = CoreLocal {
        curr_thread: AtomicUsize::new(NO_THREAD),
        tmp_stack_va_end: AtomicU32::new(0),
        irq_stack_va_end: AtomicU32::new(0),
        fiq_stack_va_end: AtomicU32::new(0),
        abt_stack_va_end: AtomicU32::new(0)
    };

    /// Returns the thread this core is running, if any.
    pub fn curr_thread(&self) -> Option<ThreadId> {
        match self.curr_thread.load(Ordering::Relaxed) {
            NO_THREAD => None,
            id => Some(id)
        }
    }

    pub(super) fn set_curr_thread(&self, id: Option<ThreadId>) {
        self.curr_thread.store(id.unwrap_or(NO_THREAD), Ordering::Relaxed);
    }

    /// The stack the dispatcher itself runs on while this core is outside any thread.
    pub fn tmp_stack(&self) -> VirtAddr {
        VirtAddr::new(self.tmp_stack_va_end.load(Ordering::Relaxed))
    }

    pub fn irq_stack(&self) -> VirtAddr {
        VirtAddr::new(self.irq_stack_va_end.load(Ordering::Relaxed))
    }

    pub fn fiq_stack(&self) -> VirtAddr {
        VirtAddr::new(self.fiq_stack_va_end.load(Ordering::Relaxed))
    }

    pub fn abt_stack(&self) -> VirtAddr {
        VirtAddr::new(self.abt_stack_va_end.load(Ordering::Relaxed))
    }

    /// Records the temporary stack. Interrupts taken outside a thread share it, so it doubles as the IRQ and FIQ stack.
    pub(super) fn set_tmp_stack(&self, sp: VirtAddr) {
        self.tmp_stack_va_end.store(sp.as_u32(), Ordering::Relaxed);
        self.irq_stack_va_end.store(sp.as_u32(), Ordering::Relaxed);
        self.fiq_stack_va_end.store(sp.as_u32(), Ordering::Relaxed);
    }

    pub(super) fn set_abt_stack(&self, sp: VirtAddr) {
        self.abt_stack_va_end.store(sp.as_u32(), Ordering::Relaxed);
    }
}

/// The records of every core, indexed by core position.
pub struct CoreLocals<const N: usize> {
    cores: [CoreLocal; N]
}

impl<const N: usize> CoreLocals<N> {
    pub const fn new() -> Self {
        CoreLocals { cores: [CoreLocal::INIT; N] }
    }

    /// Returns the record of `core`.
    ///
    /// # Panics
    ///
    /// Panics if `core` is not below the configured number of cores. A core outside that range means the platform was built with the wrong
    /// core count.
    pub fn get(&self, core: usize) -> &CoreLocal {
        assert!(core < N, "core {} is outside the {} configured cores", core, N);
        &self.cores[core]
    }
}
