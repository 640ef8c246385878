//! Synchronization primitives for inter-core communication and locking.
//!
//! The dispatcher only ever needs short, non-blocking critical sections, so everything here is built on interrupt-masking spinlocks.

pub mod uninterruptible;

pub use uninterruptible::{InterruptDisabler, UninterruptibleSpinlock};
