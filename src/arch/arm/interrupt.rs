//! IRQ and FIQ masking through CPSR.
//!
//! The mask is handled as a subset of [`Cpsr::INTERRUPTS`] so that code which masked only one of the two can have exactly that state put
//! back.

use core::arch::asm;

use crate::arch::regs::Cpsr;

fn read_cpsr() -> Cpsr {
    let cpsr: u32;

    // SAFETY: Reading CPSR has no side effects.
    unsafe {
        asm!("mrs {}, cpsr", out(reg) cpsr, options(nomem, nostack, preserves_flags));
    }

    Cpsr::from_bits_retain(cpsr)
}

/// Returns which of IRQ and FIQ are currently masked.
pub fn masked() -> Cpsr {
    read_cpsr() & Cpsr::INTERRUPTS
}

/// Checks whether both IRQ and FIQ are unmasked.
pub fn are_enabled() -> bool {
    masked().is_empty()
}

/// Masks the interrupts in `bits`, leaving the others as they are.
pub fn mask(bits: Cpsr) {
    let bits = bits & Cpsr::INTERRUPTS;

    // SAFETY: Masking interrupts cannot violate memory safety.
    unsafe {
        if bits == Cpsr::INTERRUPTS {
            asm!("cpsid if", options(nomem, nostack));
        } else if bits == Cpsr::I {
            asm!("cpsid i", options(nomem, nostack));
        } else if bits == Cpsr::F {
            asm!("cpsid f", options(nomem, nostack));
        }
    }
}

/// Unmasks the interrupts in `bits`, leaving the others as they are.
pub fn unmask(bits: Cpsr) {
    let bits = bits & Cpsr::INTERRUPTS;

    // SAFETY: Unmasking interrupts cannot violate memory safety on its own.
    unsafe {
        if bits == Cpsr::INTERRUPTS {
            asm!("cpsie if", options(nomem, nostack));
        } else if bits == Cpsr::I {
            asm!("cpsie i", options(nomem, nostack));
        } else if bits == Cpsr::F {
            asm!("cpsie f", options(nomem, nostack));
        }
    }
}

pub fn enable() {
    unmask(Cpsr::INTERRUPTS);
}

pub fn disable() {
    mask(Cpsr::INTERRUPTS);
}
