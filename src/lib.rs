//! The secure-world thread dispatcher of a TrustZone TEE kernel.
//!
//! The normal world enters through [`thread::handle_smc_call`]; everything else in this crate exists to support the thread state machine
//! behind it.

#![no_std]

#[cfg(any(test, not(all(target_arch = "arm", feature = "real_arch_api", not(feature = "host_arch_api")))))]
extern crate std;

pub mod arch;
pub mod config;
pub mod log;
pub mod options;
pub mod sync;
pub mod thread;
pub mod util;
