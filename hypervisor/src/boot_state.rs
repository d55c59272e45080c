//! Capture of the processor state at the moment the hypervisor installs
//! itself underneath the already-running host OS.
//!
//! Unlike replaying a previously recorded memory/register image from a
//! snapshot file, this hypervisor has exactly one guest: whatever OS called into
//! `efi_main`. The register file below is captured live, immediately before
//! `HardwareVt::initialize`/`revert_registers`, so the very first VM entry
//! resumes the host exactly where firmware handed it control. The field
//! layout is kept because the caller passes it straight into `vmcs::guest::*`
//! and VMCB state-save-area writes that expect this shape.

use crate::x86_instructions::{cr0, cr3, cr4, rdmsr, sgdt, sidt};
use x86::{
    dtables::DescriptorTablePointer,
    segmentation::{cs, ds, es, fs, gs, ss},
};

/// The collection of register values captured at install time. Mirrors the
/// register block a memory-snapshot format would otherwise store on disk.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BootState {
    pub(crate) gdtr: DescriptorTablePointer<u64>,
    pub(crate) idtr: DescriptorTablePointer<u64>,
    pub(crate) es: u16,
    pub(crate) cs: u16,
    pub(crate) ss: u16,
    pub(crate) ds: u16,
    pub(crate) fs: u16,
    pub(crate) gs: u16,
    pub(crate) ldtr: u16,
    pub(crate) tr: u16,
    pub(crate) efer: u64,
    pub(crate) sysenter_cs: u64,
    pub(crate) cr0: u64,
    pub(crate) cr3: u64,
    pub(crate) cr4: u64,
    pub(crate) fs_base: u64,
    pub(crate) gs_base: u64,
    pub(crate) ldtr_base: u64,
    pub(crate) tr_base: u64,
    pub(crate) rsp: u64,
    pub(crate) rip: u64,
    pub(crate) rflags: u64,
    pub(crate) sysenter_esp: u64,
    pub(crate) sysenter_eip: u64,
    pub(crate) rax: u64,
    pub(crate) rbx: u64,
    pub(crate) rcx: u64,
    pub(crate) rdx: u64,
    pub(crate) rdi: u64,
    pub(crate) rsi: u64,
    pub(crate) rbp: u64,
    pub(crate) r8: u64,
    pub(crate) r9: u64,
    pub(crate) r10: u64,
    pub(crate) r11: u64,
    pub(crate) r12: u64,
    pub(crate) r13: u64,
    pub(crate) r14: u64,
    pub(crate) r15: u64,
}

impl BootState {
    /// Captures the state of the current processor. `resume_rip`/`resume_rsp`
    /// are the address and stack the guest should continue from, normally
    /// the return address and stack of the call into `efi_main`.
    pub(crate) fn capture(resume_rip: u64, resume_rsp: u64, resume_rflags: u64) -> Self {
        let mut gdtr = DescriptorTablePointer::<u64>::default();
        let mut idtr = DescriptorTablePointer::<u64>::default();
        sgdt(&mut gdtr);
        sidt(&mut idtr);

        Self {
            gdtr,
            idtr,
            es: es().bits(),
            cs: cs().bits(),
            ss: ss().bits(),
            ds: ds().bits(),
            fs: fs().bits(),
            gs: gs().bits(),
            ldtr: 0,
            tr: 0,
            efer: rdmsr(x86::msr::IA32_EFER),
            sysenter_cs: rdmsr(x86::msr::IA32_SYSENTER_CS),
            cr0: cr0().bits() as u64,
            cr3: cr3(),
            cr4: cr4().bits() as u64,
            fs_base: rdmsr(x86::msr::IA32_FS_BASE),
            gs_base: rdmsr(x86::msr::IA32_GS_BASE),
            ldtr_base: 0,
            tr_base: 0,
            rsp: resume_rsp,
            rip: resume_rip,
            rflags: resume_rflags,
            sysenter_esp: rdmsr(x86::msr::IA32_SYSENTER_ESP),
            sysenter_eip: rdmsr(x86::msr::IA32_SYSENTER_EIP),
            rax: 0,
            rbx: 0,
            rcx: 0,
            rdx: 0,
            rdi: 0,
            rsi: 0,
            rbp: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}
