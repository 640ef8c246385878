//! The boundary between the dispatcher and register-level code.
//!
//! Everything that actually changes processor mode, touches banked registers or jumps into a thread lives behind this module. The register
//! layouts in [`regs`] are shared by every backend since they describe what the assembly entry points save and restore.

pub mod regs;

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "arm", feature = "real_arch_api", not(feature = "host_arch_api")))] {
        mod arm;
        pub use self::arm::*;
    } else {
        mod host;
        pub use self::host::*;
    }
}

pub use regs::{PhysAddr, VirtAddr};
