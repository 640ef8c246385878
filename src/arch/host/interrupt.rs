use std::cell::Cell;

use crate::arch::regs::Cpsr;

std::thread_local! {
    static MASKED: Cell<Cpsr> = const { Cell::new(Cpsr::empty()) };
}

pub fn masked() -> Cpsr {
    MASKED.with(|masked| masked.get())
}

pub fn are_enabled() -> bool {
    masked().is_empty()
}

pub fn mask(bits: Cpsr) {
    MASKED.with(|masked| masked.set(masked.get() | (bits & Cpsr::INTERRUPTS)));
}

pub fn unmask(bits: Cpsr) {
    MASKED.with(|masked| masked.set(masked.get() - bits));
}

pub fn enable() {
    unmask(Cpsr::INTERRUPTS);
}

pub fn disable() {
    mask(Cpsr::INTERRUPTS);
}
