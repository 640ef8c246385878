//! Register layouts shared with the assembly entry and exit paths.
//!
//! These structures are read and written directly by assembly, so their layouts are fixed and checked at compile time.

use core::fmt;

use bitflags::bitflags;
use static_assertions::{assert_eq_size, const_assert_eq};

/// A 32-bit secure-world virtual address.
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(u32);

impl VirtAddr {
    pub const fn new(val: u32) -> VirtAddr {
        VirtAddr(val)
    }

    pub const fn zero() -> VirtAddr {
        VirtAddr(0)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#010x})", self.0)
    }
}

/// A 32-bit physical address, as exchanged with the normal world in RPC words.
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(u32);

impl PhysAddr {
    pub const fn new(val: u32) -> PhysAddr {
        PhysAddr(val)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#010x})", self.0)
    }
}

/// ARMv7 processor modes, as encoded in CPSR bits 4:0.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum CpuMode {
    Usr = 0x10,
    Fiq = 0x11,
    Irq = 0x12,
    Svc = 0x13,
    Mon = 0x16,
    Abt = 0x17,
    Und = 0x1b,
    Sys = 0x1f
}

impl CpuMode {
    pub const MASK: u32 = 0x1f;

    pub fn from_bits(bits: u32) -> Option<CpuMode> {
        Some(match bits & CpuMode::MASK {
            0x10 => CpuMode::Usr,
            0x11 => CpuMode::Fiq,
            0x12 => CpuMode::Irq,
            0x13 => CpuMode::Svc,
            0x16 => CpuMode::Mon,
            0x17 => CpuMode::Abt,
            0x1b => CpuMode::Und,
            0x1f => CpuMode::Sys,
            _ => return None
        })
    }
}

bitflags! {
    /// Program status register bits. The mode field is not a flag and is handled through [`Cpsr::with_mode`] and [`Cpsr::mode`].
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct Cpsr: u32 {
        /// Thumb execution state.
        const T = 1 << 5;
        /// FIQ mask.
        const F = 1 << 6;
        /// IRQ mask.
        const I = 1 << 7;
        /// Asynchronous abort mask.
        const A = 1 << 8;

        const _ = !0;
    }
}

impl Cpsr {
    /// The two interrupt mask bits, which the lock and the arch interrupt code manage as a set.
    pub const INTERRUPTS: Cpsr = Cpsr::I.union(Cpsr::F);

    /// A status value in the given mode with every exception unmasked and ARM execution state.
    pub const fn with_mode(mode: CpuMode) -> Cpsr {
        Cpsr::from_bits_retain(mode as u32)
    }

    pub fn mode(self) -> Option<CpuMode> {
        CpuMode::from_bits(self.bits())
    }
}

/// The saved execution context of a secure thread.
///
/// While a thread is suspended this is its resume point; when it is resumed the assembly `thread_resume` routine loads every field and
/// returns into `pc` with `cpsr`.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct ThreadCtxRegs {
    pub usr_sp: u32,
    pub usr_lr: u32,
    pub svc_spsr: u32,
    pub svc_sp: u32,
    pub svc_lr: u32,
    pub r0: u32,
    pub r1: u32,
    pub r2: u32,
    pub r3: u32,
    pub r4: u32,
    pub r5: u32,
    pub r6: u32,
    pub r7: u32,
    pub r8: u32,
    pub r9: u32,
    pub r10: u32,
    pub r11: u32,
    pub r12: u32,
    pub pc: u32,
    pub cpsr: u32
}

assert_eq_size!(ThreadCtxRegs, [u32; 20]);
const_assert_eq!(core::mem::align_of::<ThreadCtxRegs>(), 4);

impl ThreadCtxRegs {
    pub const fn new() -> ThreadCtxRegs {
        ThreadCtxRegs {
            usr_sp: 0,
            usr_lr: 0,
            svc_spsr: 0,
            svc_sp: 0,
            svc_lr: 0,
            r0: 0,
            r1: 0,
            r2: 0,
            r3: 0,
            r4: 0,
            r5: 0,
            r6: 0,
            r7: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            pc: 0,
            cpsr: 0
        }
    }

    /// Returns r0-r7, the registers used to pass call arguments.
    pub fn args(&self) -> [u32; 8] {
        [self.r0, self.r1, self.r2, self.r3, self.r4, self.r5, self.r6, self.r7]
    }

    /// Writes `args` into consecutive argument registers starting at r0.
    ///
    /// # Panics
    ///
    /// Panics if more than eight values are given.
    pub fn set_args(&mut self, args: &[u32]) {
        assert!(args.len() <= 8, "at most r0-r7 carry arguments");

        let regs = [
            &mut self.r0,
            &mut self.r1,
            &mut self.r2,
            &mut self.r3,
            &mut self.r4,
            &mut self.r5,
            &mut self.r6,
            &mut self.r7
        ];

        for (reg, &val) in regs.into_iter().zip(args) {
            *reg = val;
        }
    }

    pub fn cpsr(&self) -> Cpsr {
        Cpsr::from_bits_retain(self.cpsr)
    }
}

/// Registers saved on entry to the SVC handler.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct SvcRegs {
    pub r0: u32,
    pub r1: u32,
    pub r2: u32,
    pub r3: u32,
    pub r4: u32,
    pub r5: u32,
    pub r6: u32,
    pub r7: u32,
    pub lr: u32,
    pub spsr: u32
}

assert_eq_size!(SvcRegs, [u32; 10]);

/// Registers saved on entry to the undefined-instruction, prefetch-abort and data-abort handlers.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct AbortRegs {
    pub usr_sp: u32,
    pub usr_lr: u32,
    pub pad: u32,
    pub spsr: u32,
    pub elr: u32,
    pub r0: u32,
    pub r1: u32,
    pub r2: u32,
    pub r3: u32,
    pub r4: u32,
    pub r5: u32,
    pub r6: u32,
    pub r7: u32,
    pub r8: u32,
    pub r9: u32,
    pub r10: u32,
    pub r11: u32,
    pub ip: u32
}

assert_eq_size!(AbortRegs, [u32; 18]);
