//! Synchronization primitives suitable for use on data structures accessed from within exception handlers.
//!
//! The thread table is touched both from the secure monitor call path and from FIQ and abort handlers that may run on the same core. Using
//! a plain spinlock there could deadlock if the following series of events occurs:
//!
//! - The dispatcher acquires the spinlock on some core
//! - An FIQ is taken on that same core, temporarily interrupting it
//! - The FIQ handler attempts to acquire the same spinlock
//!
//! The core would then spin forever, since the dispatcher cannot continue until the FIQ handler returns. [`UninterruptibleSpinlock`]
//! avoids this by masking IRQ and FIQ on the current core before acquiring the lock and unmasking, once the guard is dropped, only the
//! interrupts that were unmasked before.
//!
//! Since the mask is held by a core rather than by a thread, a guard must never be held across a switch into or out of a secure thread.
//! Critical sections protected by these locks are expected to be a handful of loads and stores.

use core::ops::{Deref, DerefMut};

use crate::arch::interrupt;
use crate::arch::regs::Cpsr;

/// A guard that keeps IRQ and FIQ masked on the current CPU core while it exists.
///
/// Guards nest: each one remembers which of the two interrupts it had to mask and unmasks exactly those again, so an inner guard leaves
/// everything masked and the outermost one restores the mask it found.
pub struct InterruptDisabler {
    was_unmasked: Cpsr
}

impl InterruptDisabler {
    /// Masks interrupts on the local CPU core until the returned guard is dropped.
    pub fn new() -> InterruptDisabler {
        let was_unmasked = Cpsr::INTERRUPTS - interrupt::masked();

        if !was_unmasked.is_empty() {
            interrupt::mask(was_unmasked);
        }

        InterruptDisabler { was_unmasked }
    }

    /// Drops this guard without unmasking interrupts. Returns `true` if any interrupt would have been unmasked had this guard been dropped
    /// normally and `false` otherwise.
    pub fn drop_without_enable(self) -> bool {
        assert_eq!(Cpsr::INTERRUPTS, interrupt::masked());

        let was_unmasked = self.was_unmasked;
        core::mem::forget(self);

        !was_unmasked.is_empty()
    }
}

impl Default for InterruptDisabler {
    fn default() -> Self {
        InterruptDisabler::new()
    }
}

impl Drop for InterruptDisabler {
    fn drop(&mut self) {
        assert_eq!(Cpsr::INTERRUPTS, interrupt::masked());

        if !self.was_unmasked.is_empty() {
            interrupt::unmask(self.was_unmasked);
        }
    }
}

/// A spinlock that keeps interrupts masked on the local CPU core while it is locked.
#[derive(Debug)]
pub struct UninterruptibleSpinlock<T>(spin::Mutex<T>);

impl<T> UninterruptibleSpinlock<T> {
    /// Creates a new uninterruptible spinlock containing the provided value.
    pub const fn new(val: T) -> UninterruptibleSpinlock<T> {
        UninterruptibleSpinlock(spin::Mutex::new(val))
    }

    /// Checks whether this [`UninterruptibleSpinlock`] is currently locked.
    ///
    /// The return value is stale as soon as it is produced and must only be used for debugging and assertions.
    pub fn is_locked(&self) -> bool {
        self.0.is_locked()
    }

    /// Masks interrupts and locks this [`UninterruptibleSpinlock`], returning a guard that provides access to the underlying data. The
    /// returned guard will automatically unlock this spinlock and restore the interrupt mask once it is dropped.
    pub fn lock(&self) -> UninterruptibleSpinlockGuard<T> {
        let interrupt_disabler = InterruptDisabler::new();
        let guard = self.0.lock();

        UninterruptibleSpinlockGuard(guard, interrupt_disabler)
    }

    /// Masks interrupts and attempts to lock this [`UninterruptibleSpinlock`], returning a guard if successful. If the attempt fails, the
    /// interrupt mask is restored before returning.
    pub fn try_lock(&self) -> Option<UninterruptibleSpinlockGuard<T>> {
        let interrupt_disabler = InterruptDisabler::new();

        self.0
            .try_lock()
            .map(|guard| UninterruptibleSpinlockGuard(guard, interrupt_disabler))
    }

    /// Masks interrupts and locks this [`UninterruptibleSpinlock`], then calls the provided function with the underlying data. Once the
    /// callback returns, the spinlock is unlocked and the interrupt mask restored.
    pub fn with_lock<U>(&self, f: impl FnOnce(&mut T) -> U) -> U {
        let mut lock = self.lock();
        f(lock.deref_mut())
    }
}

/// A guard that provides access to an [`UninterruptibleSpinlock`]'s internals. Releases the spinlock (and restores the interrupt mask)
/// when dropped.
pub struct UninterruptibleSpinlockGuard<'a, T>(spin::MutexGuard<'a, T>, InterruptDisabler);

impl<'a, T> Deref for UninterruptibleSpinlockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.0.deref()
    }
}

impl<'a, T> DerefMut for UninterruptibleSpinlockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.deref_mut()
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn test_lock_masks_interrupts() {
        interrupt::enable();

        let lock = UninterruptibleSpinlock::new(0u32);

        {
            let mut guard = lock.lock();
            *guard += 1;
            assert!(!interrupt::are_enabled());
            assert!(lock.is_locked());
        }

        assert!(interrupt::are_enabled());
        assert!(!lock.is_locked());
        assert_eq!(1, lock.with_lock(|val| *val));
    }

    #[test]
    fn test_nested_disablers() {
        interrupt::enable();

        let outer = InterruptDisabler::new();
        let inner = InterruptDisabler::new();

        drop(inner);
        assert!(!interrupt::are_enabled());

        drop(outer);
        assert!(interrupt::are_enabled());
    }

    #[test]
    fn test_disabler_keeps_masked_state() {
        interrupt::disable();

        drop(InterruptDisabler::new());
        assert!(!interrupt::are_enabled());

        interrupt::enable();
    }

    #[test]
    fn test_lock_restores_partial_mask() {
        interrupt::enable();
        interrupt::mask(Cpsr::I);

        let lock = UninterruptibleSpinlock::new(());

        {
            let _guard = lock.lock();
            assert_eq!(Cpsr::INTERRUPTS, interrupt::masked());

            let inner = InterruptDisabler::new();
            assert!(!inner.drop_without_enable());
        }

        assert_eq!(Cpsr::I, interrupt::masked());

        interrupt::enable();
        interrupt::mask(Cpsr::F);
        drop(lock.lock());
        assert_eq!(Cpsr::F, interrupt::masked());

        interrupt::enable();
    }

    #[test]
    fn test_drop_without_enable() {
        interrupt::enable();

        let disabler = InterruptDisabler::new();
        assert!(disabler.drop_without_enable());
        assert!(!interrupt::are_enabled());

        interrupt::enable();
    }

    #[test]
    fn test_try_lock_contended() {
        interrupt::enable();

        let lock = UninterruptibleSpinlock::new(());
        let guard = lock.lock();

        assert!(lock.try_lock().is_none());
        drop(guard);

        assert!(interrupt::are_enabled());
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_lock_across_host_threads() {
        let lock = Arc::new(UninterruptibleSpinlock::new(0usize));

        let workers: std::vec::Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(4000, lock.with_lock(|val| *val));
    }
}
