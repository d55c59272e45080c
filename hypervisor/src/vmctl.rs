//! Vendor-neutral helpers layered on top of [`HardwareVt`].
//!
//! `vmctl.h`'s `vmctl_func` table bundled roughly thirty function pointers
//! covering both truly vendor-specific operations (`start_vm`, `vminit`) and
//! operations that are the same recipe on every vendor once the handful of
//! primitives in [`HardwareVt`] exist (injecting a page fault is "write CR2,
//! then queue the exception" on both VMX and SVM). This module is the latter
//! half: small free functions built only from the [`HardwareVt`] trait, so
//! `dispatch.rs` calls one vendor-neutral helper instead of branching on the
//! active backend.

use crate::hardware_vt::HardwareVt;
use log::error;
use x86::irq::PAGE_FAULT_VECTOR;

/// Injects a page fault into the guest with the given error code, having
/// first loaded the faulting address into CR2. Mirrors `generate_pagefault`.
///
/// The vector is injected through [`HardwareVt::inject_exception`]; CR2 is
/// not part of that call because, unlike the VMCS/VMCB guest-state fields,
/// it is a plain machine register the processor does not save/restore
/// across VM exit/entry on either vendor, so it is always live and simply
/// needs to hold the right value before entry.
pub(crate) fn generate_pagefault(vt: &mut dyn HardwareVt, error_code: u32, cr2: u64) {
    // Safety: CR2 is not consumed by the CPU until the injected #PF is
    // delivered on the next VM entry, which happens strictly after this call.
    unsafe { x86::controlregs::cr2_write(cr2) };
    vt.inject_exception(PAGE_FAULT_VECTOR, Some(error_code));
}

/// Injects an external interrupt vector, requesting an interrupt window
/// first if the guest currently has interrupts masked. Mirrors
/// `generate_external_int`.
pub(crate) fn generate_external_int(vt: &mut dyn HardwareVt, vector: u8) {
    vt.inject_external_interrupt(vector);
}

/// Reads a general purpose register by its [`GeneralRegister`] selector.
/// Mirrors `read_general_reg`/`write_general_reg`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GeneralRegister {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

pub(crate) fn read_general_reg(vt: &dyn HardwareVt, reg: GeneralRegister) -> u64 {
    let regs = vt.registers();
    match reg {
        GeneralRegister::Rax => regs.rax,
        GeneralRegister::Rbx => regs.rbx,
        GeneralRegister::Rcx => regs.rcx,
        GeneralRegister::Rdx => regs.rdx,
        GeneralRegister::Rbp => regs.rbp,
        GeneralRegister::Rsi => regs.rsi,
        GeneralRegister::Rdi => regs.rdi,
        GeneralRegister::R8 => regs.r8,
        GeneralRegister::R9 => regs.r9,
        GeneralRegister::R10 => regs.r10,
        GeneralRegister::R11 => regs.r11,
        GeneralRegister::R12 => regs.r12,
        GeneralRegister::R13 => regs.r13,
        GeneralRegister::R14 => regs.r14,
        GeneralRegister::R15 => regs.r15,
    }
}

pub(crate) fn write_general_reg(vt: &mut dyn HardwareVt, reg: GeneralRegister, val: u64) {
    let regs = vt.registers_mut();
    match reg {
        GeneralRegister::Rax => regs.rax = val,
        GeneralRegister::Rbx => regs.rbx = val,
        GeneralRegister::Rcx => regs.rcx = val,
        GeneralRegister::Rdx => regs.rdx = val,
        GeneralRegister::Rbp => regs.rbp = val,
        GeneralRegister::Rsi => regs.rsi = val,
        GeneralRegister::Rdi => regs.rdi = val,
        GeneralRegister::R8 => regs.r8 = val,
        GeneralRegister::R9 => regs.r9 = val,
        GeneralRegister::R10 => regs.r10 = val,
        GeneralRegister::R11 => regs.r11 = val,
        GeneralRegister::R12 => regs.r12 = val,
        GeneralRegister::R13 => regs.r13 = val,
        GeneralRegister::R14 => regs.r14 = val,
        GeneralRegister::R15 => regs.r15 = val,
    }
}

/// Logs every general purpose register plus RIP/RFLAGS at `error` level.
/// Mirrors `panic_dump`, called right before the dispatcher gives up on an
/// exit it cannot handle.
pub(crate) fn panic_dump(vt: &dyn HardwareVt) {
    let r = vt.registers();
    error!(
        "rip={:#018x} rflags={:#018x} rsp={:#018x}",
        r.rip, r.rflags, r.rsp
    );
    error!(
        "rax={:#018x} rbx={:#018x} rcx={:#018x} rdx={:#018x}",
        r.rax, r.rbx, r.rcx, r.rdx
    );
    error!(
        "rsi={:#018x} rdi={:#018x} rbp={:#018x}",
        r.rsi, r.rdi, r.rbp
    );
    error!(
        "r8={:#018x} r9={:#018x} r10={:#018x} r11={:#018x}",
        r.r8, r.r9, r.r10, r.r11
    );
    error!(
        "r12={:#018x} r13={:#018x} r14={:#018x} r15={:#018x}",
        r.r12, r.r13, r.r14, r.r15
    );
}
