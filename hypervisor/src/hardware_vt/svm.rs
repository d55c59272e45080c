//! The module containing the [`Svm`] type, which implements the
//! [`hardware_vt::HardwareVt`] trait for AMD processors.
//!
//! The Secure Virtual Machine (SVM) extension implements AMD Virtualization
//! (AMD-V), the hardware assisted virtualization technology on AMD processors.
//!
//! All references to external resources (denoted with "See:") refers to
//! "AMD64 Architecture Programmer’s Manual Volume 2: System Programming"
//! Revision 3.40 (January 2023) at
//! <https://developer.amd.com/resources/developer-guides-manuals/> unless
//! otherwise stated.

use super::{
    get_segment_descriptor_value, get_segment_limit, GuestRegisters,
    NestedPagingStructureEntryFlags, NestedPagingStructureEntryType, VmExitReason,
};
use crate::{
    boot_state::BootState,
    hardware_vt::{
        self, ExceptionQualification, GuestException, IoQualification, MovCrAccess,
        MovCrQualification, MsrQualification, NestedPageFaultQualification,
    },
    x86_instructions::{rdmsr, wrmsr},
};
use alloc::boxed::Box;
use core::{
    arch::global_asm,
    ptr::{addr_of, addr_of_mut},
};
use x86::irq;

/// SVM-specific data to represent a guest.
#[derive(derivative::Derivative)]
#[derivative(Debug, Default)]
pub(crate) struct Svm {
    vmcb: Box<Vmcb>,
    #[derivative(Debug = "ignore")]
    host_state: Box<HostStateArea>,
    #[derivative(Debug = "ignore")]
    iopm: Box<IopmBitmap>,
    #[derivative(Debug = "ignore")]
    msrpm: Box<MsrpmBitmap>,
    registers: GuestRegisters,
}

impl hardware_vt::HardwareVt for Svm {
    /// Enables SVM on the current processor.
    fn enable(&mut self) {
        const EFER_SVME: u64 = 1 << 12;

        // Enable SVM. We assume the processor is compatible with this.
        // See: 15.4 Enabling SVM
        wrmsr(x86::msr::IA32_EFER, rdmsr(x86::msr::IA32_EFER) | EFER_SVME);
    }

    /// Configures SVM. We intercept #BP, #UD, #PF, external interrupt, the
    /// PAUSE instruction, shutdown, and enable nested paging.
    fn initialize(&mut self, nested_pml4_addr: u64) {
        const SVM_INTERCEPT_MISC1_INTR: u32 = 1 << 0;
        const SVM_INTERCEPT_MISC1_CPUID: u32 = 1 << 18;
        const SVM_INTERCEPT_MISC1_PAUSE: u32 = 1 << 23;
        const SVM_INTERCEPT_MISC1_HLT: u32 = 1 << 24;
        const SVM_INTERCEPT_MISC1_INVLPG: u32 = 1 << 25;
        const SVM_INTERCEPT_MISC1_IOIO_PROT: u32 = 1 << 27;
        const SVM_INTERCEPT_MISC1_MSR_PROT: u32 = 1 << 28;
        const SVM_INTERCEPT_MISC1_SHUTDOWN: u32 = 1 << 31;
        const SVM_INTERCEPT_MISC2_VMRUN: u32 = 1 << 0;
        const SVM_INTERCEPT_MISC2_VMMCALL: u32 = 1 << 1;
        const SVM_INTERCEPT_MISC2_XSETBV: u32 = 1 << 13;
        const SVM_NP_ENABLE_NP_ENABLE: u64 = 1 << 0;
        const SVM_MSR_VM_HSAVE_PA: u32 = 0xc001_0117;
        // Trap MOV to/from CR0, CR3 and CR4.
        const CR_INTERCEPT_CR0: u16 = 1 << 0;
        const CR_INTERCEPT_CR3: u16 = 1 << 3;
        const CR_INTERCEPT_CR4: u16 = 1 << 4;

        // Need to specify the address of the host state-save area before executing
        // the VMRUN instruction. The host state-save area is where the processor
        // saves the host (ie, current) register values on execution of `VMRUN`.
        //
        // "The VMRUN instruction saves some host processor state information in
        //  the host state-save area in main memory at the physical address
        //  specified in the VM_HSAVE_PA MSR".
        // See: 15.5.1 Basic Operation
        wrmsr(SVM_MSR_VM_HSAVE_PA, addr_of!(*self.host_state) as u64);

        // Intercept external interrupts, the PAUSE instruction and shutdown.
        // Additionally, intercept the VMRUN instruction which is a HW requirement.
        //
        // We intercept external interrupts and PAUSE as an attempt to gain control
        // even if the guest is in an infinite loop, although this is not a perfect
        // solution. PAUSE causes #VMEXIT when it is executed u16::MAX times.
        //
        // We also intercept shutdown to prevent the guest from causing system
        // reset. We want to abort the guest instead. Note that, on Intel, event
        // that would normally cause system reset, eg, triple fault, are
        // intercepted by default.
        //
        // See: 15.13.1 INTR Intercept
        // See: 15.14.3 Shutdown Intercept
        // See: 15.14.4 Pause Intercept Filtering
        self.vmcb.control_area.intercept_misc1 = SVM_INTERCEPT_MISC1_INTR
            | SVM_INTERCEPT_MISC1_CPUID
            | SVM_INTERCEPT_MISC1_PAUSE
            | SVM_INTERCEPT_MISC1_HLT
            | SVM_INTERCEPT_MISC1_INVLPG
            | SVM_INTERCEPT_MISC1_IOIO_PROT
            | SVM_INTERCEPT_MISC1_MSR_PROT
            | SVM_INTERCEPT_MISC1_SHUTDOWN;
        self.vmcb.control_area.intercept_misc2 =
            SVM_INTERCEPT_MISC2_VMRUN | SVM_INTERCEPT_MISC2_VMMCALL | SVM_INTERCEPT_MISC2_XSETBV;
        self.vmcb.control_area.pause_filter_count = u16::MAX;
        self.vmcb.control_area.intercept_cr_write = CR_INTERCEPT_CR0 | CR_INTERCEPT_CR3 | CR_INTERCEPT_CR4;
        self.vmcb.control_area.intercept_cr_read = CR_INTERCEPT_CR3;
        self.vmcb.control_area.iopm_base_pa = addr_of!(*self.iopm) as u64;
        self.vmcb.control_area.msrpm_base_pa = addr_of!(*self.msrpm) as u64;

        // Address Space Identifier (ASID) is useful when the given logical processor
        // runs more than one guests. We do not but still need to set non-zero value.
        // See: 15.16 TLB Control
        self.vmcb.control_area.guest_asid = 1;

        // Enable nested paging. This is done by:
        // - Setting the NP_ENABLE bit in VMCB, and
        // - Setting the base address of the nested PML4
        //
        // See: 15.25.3 Enabling Nested Paging
        self.vmcb.control_area.np_enable = SVM_NP_ENABLE_NP_ENABLE;
        self.vmcb.control_area.ncr3 = nested_pml4_addr;

        // Intercept #BP, #UD, #PF.
        // See: 15.12 Exception Intercepts
        self.vmcb.control_area.intercept_exception = (1u32 << irq::BREAKPOINT_VECTOR)
            | (1u32 << irq::INVALID_OPCODE_VECTOR)
            | (1u32 << irq::PAGE_FAULT_VECTOR);

        // Trap EFER so the software LMA shadow in the dispatcher sees every
        // write the guest makes to EFER.LME, not just the CR0.PG side of the
        // edge that flips EFER.LMA.
        const IA32_EFER: u32 = 0xc000_0080;
        self.msrpm.set(IA32_EFER, false, true);
    }

    /// Configures the guest states based on the captured boot-time state.
    fn revert_registers(&mut self, registers: &BootState) {
        const EFER_SVME: u64 = 1 << 12;
        const CR4_VMXE: u64 = 1 << 13;

        // Initialize guest registers from the captured state through VMCB.
        // Note that:
        // - SVME bit has to be set in the EFER.
        //   - See: 15.5.1 Basic Operation
        //     - and subsection "Canonicalization and Consistency Checks."
        // - VMXE bit must be cleared in CR4, because it does not exist on AMD.
        //   This matters when the processor that captured the state supports
        //   VMX rather than SVM.
        let guest_gdt = registers.gdtr.base as u64;
        self.vmcb.state_save_area.es_selector = registers.es;
        self.vmcb.state_save_area.cs_selector = registers.cs;
        self.vmcb.state_save_area.ss_selector = registers.ss;
        self.vmcb.state_save_area.ds_selector = registers.ds;
        self.vmcb.state_save_area.fs_selector = registers.fs;
        self.vmcb.state_save_area.gs_selector = registers.gs;
        self.vmcb.state_save_area.tr_selector = registers.tr;
        self.vmcb.state_save_area.ldtr_selector = registers.ldtr;
        self.vmcb.state_save_area.es_attrib = get_segment_access_right(guest_gdt, registers.es);
        self.vmcb.state_save_area.cs_attrib = get_segment_access_right(guest_gdt, registers.cs);
        self.vmcb.state_save_area.ss_attrib = get_segment_access_right(guest_gdt, registers.ss);
        self.vmcb.state_save_area.ds_attrib = get_segment_access_right(guest_gdt, registers.ds);
        self.vmcb.state_save_area.fs_attrib = get_segment_access_right(guest_gdt, registers.fs);
        self.vmcb.state_save_area.gs_attrib = get_segment_access_right(guest_gdt, registers.gs);
        self.vmcb.state_save_area.tr_attrib = get_segment_access_right(guest_gdt, registers.tr);
        self.vmcb.state_save_area.ldtr_attrib = get_segment_access_right(guest_gdt, registers.ldtr);
        self.vmcb.state_save_area.es_limit = get_segment_limit(guest_gdt, registers.es);
        self.vmcb.state_save_area.cs_limit = get_segment_limit(guest_gdt, registers.cs);
        self.vmcb.state_save_area.ss_limit = get_segment_limit(guest_gdt, registers.ss);
        self.vmcb.state_save_area.ds_limit = get_segment_limit(guest_gdt, registers.ds);
        self.vmcb.state_save_area.fs_limit = get_segment_limit(guest_gdt, registers.fs);
        self.vmcb.state_save_area.gs_limit = get_segment_limit(guest_gdt, registers.gs);
        self.vmcb.state_save_area.tr_limit = get_segment_limit(guest_gdt, registers.tr);
        self.vmcb.state_save_area.ldtr_limit = get_segment_limit(guest_gdt, registers.ldtr);
        self.vmcb.state_save_area.fs_base = registers.fs_base;
        self.vmcb.state_save_area.gs_base = registers.gs_base;
        self.vmcb.state_save_area.tr_base = registers.tr_base;
        self.vmcb.state_save_area.ldtr_base = registers.ldtr_base;
        self.vmcb.state_save_area.gdtr_base = registers.gdtr.base as u64;
        self.vmcb.state_save_area.gdtr_limit = u32::from(registers.gdtr.limit);
        self.vmcb.state_save_area.idtr_base = registers.idtr.base as u64;
        self.vmcb.state_save_area.idtr_limit = u32::from(registers.idtr.limit);
        self.vmcb.state_save_area.sysenter_cs = registers.sysenter_cs;
        self.vmcb.state_save_area.sysenter_esp = registers.sysenter_esp;
        self.vmcb.state_save_area.sysenter_eip = registers.sysenter_eip;
        self.vmcb.state_save_area.efer = registers.efer | EFER_SVME;
        self.vmcb.state_save_area.cr0 = registers.cr0;
        self.vmcb.state_save_area.cr3 = registers.cr3;
        self.vmcb.state_save_area.cr4 = registers.cr4 & !CR4_VMXE;
        self.vmcb.state_save_area.rip = registers.rip;
        self.vmcb.state_save_area.rsp = registers.rsp;
        self.vmcb.state_save_area.rflags = registers.rflags;
        self.vmcb.state_save_area.rax = registers.rax;
        self.vmcb.state_save_area.gpat = rdmsr(x86::msr::IA32_PAT);

        // Some registers are not managed by VMCB and needed to be manually saved
        // and loaded by software. General purpose registers are such examples.
        //
        // Note that RAX is managed within VMCB. See `StateSaveArea` and just above.
        self.registers.rbx = registers.rbx;
        self.registers.rcx = registers.rcx;
        self.registers.rdx = registers.rdx;
        self.registers.rdi = registers.rdi;
        self.registers.rsi = registers.rsi;
        self.registers.rbp = registers.rbp;
        self.registers.r8 = registers.r8;
        self.registers.r9 = registers.r9;
        self.registers.r10 = registers.r10;
        self.registers.r11 = registers.r11;
        self.registers.r12 = registers.r12;
        self.registers.r13 = registers.r13;
        self.registers.r14 = registers.r14;
        self.registers.r15 = registers.r15;
    }

    /// Executes the guest until it triggers #VMEXIT.
    fn run(&mut self) -> VmExitReason {
        const VMEXIT_CR0_READ: u64 = 0x00;
        const VMEXIT_CR15_READ: u64 = 0x0f;
        const VMEXIT_CR0_WRITE: u64 = 0x10;
        const VMEXIT_CR15_WRITE: u64 = 0x1f;
        const VMEXIT_EXCP0: u64 = 0x40;
        const VMEXIT_EXCP31: u64 = 0x5f;
        const VMEXIT_INTR: u64 = 0x60;
        const VMEXIT_INIT: u64 = 0x63;
        const VMEXIT_VINTR: u64 = 0x64;
        const VMEXIT_CPUID: u64 = 0x72;
        const VMEXIT_PAUSE: u64 = 0x77;
        const VMEXIT_HLT: u64 = 0x78;
        const VMEXIT_INVLPG: u64 = 0x79;
        const VMEXIT_IOIO: u64 = 0x7b;
        const VMEXIT_MSR: u64 = 0x7c;
        const VMEXIT_RESET: u64 = 0x7f;
        const VMEXIT_NPF: u64 = 0x400;
        const VMEXIT_VMMCALL: u64 = 0x81;
        const VMEXIT_XSETBV: u64 = 0x8d;

        // Run the VM until the #VMEXIT occurs.
        unsafe { run_vm_svm(&mut self.registers, addr_of_mut!(*self.vmcb)) };

        // #VMEXIT occurred. Copy the guest register values from VMCB so that
        // `self.registers` is complete and up to date.
        self.registers.rax = self.vmcb.state_save_area.rax;
        self.registers.rip = self.vmcb.state_save_area.rip;
        self.registers.rsp = self.vmcb.state_save_area.rsp;
        self.registers.rflags = self.vmcb.state_save_area.rflags;

        // We might have requested flushing TLB. Clear the request.
        self.vmcb.control_area.tlb_control = 0;

        // Handle #VMEXIT by translating it to the `VmExitReason` type.
        //
        // "On #VMEXIT, the processor:
        //  (...)
        //  - Saves the reason for exiting the guest in the VMCB's EXITCODE field."
        // See: 15.6 #VMEXIT
        //
        // For the list of possible exit codes,
        // See: Appendix C SVM Intercept Exit Codes
        match self.vmcb.control_area.exit_code {
            // See: 15.12 Exception Intercepts
            VMEXIT_EXCP0..=VMEXIT_EXCP31 => VmExitReason::Exception(ExceptionQualification {
                rip: self.registers.rip,
                exception_code: GuestException::try_from(
                    (self.vmcb.control_area.exit_code - VMEXIT_EXCP0) as u8,
                )
                .unwrap(),
                // For #PF, EXITINFO1 carries the P/W/U error code (EXITINFO2
                // carries CR2); other exceptions intercepted here do not use
                // EXITINFO1 this way but leave it at 0.
                error_code: self.vmcb.control_area.exit_info1 as u32,
            }),
            // See: 15.25.6 Nested versus Guest Page Faults, Fault Ordering
            VMEXIT_NPF => VmExitReason::NestedPageFault(NestedPageFaultQualification {
                rip: self.registers.rip,
                gpa: self.vmcb.control_area.exit_info2,
                missing_translation: (self.vmcb.control_area.exit_info1 & 0b1) == 0,
                write_access: (self.vmcb.control_area.exit_info1 & 0b10) != 0,
            }),
            // See: 15.13.1 INTR Intercept
            VMEXIT_INTR => {
                const EXITINTINFO_VALID_FLAG: u64 = 1 << 31;
                let info = self.vmcb.control_area.exit_int_info;
                let vector = (info & EXITINTINFO_VALID_FLAG != 0).then_some((info & 0xff) as u8);
                VmExitReason::ExternalInterruptOrPause(vector)
            }
            // See: 15.14.4 Pause Intercept Filtering
            VMEXIT_PAUSE => VmExitReason::ExternalInterruptOrPause(None),
            // See: 15.14.3 Shutdown Intercept
            VMEXIT_RESET | VMEXIT_INIT => VmExitReason::Shutdown(self.vmcb.control_area.exit_code),
            VMEXIT_CPUID => VmExitReason::Cpuid,
            VMEXIT_HLT => VmExitReason::Hlt,
            VMEXIT_INVLPG => VmExitReason::Invlpg(self.vmcb.control_area.exit_info1),
            VMEXIT_VMMCALL => VmExitReason::Vmcall,
            VMEXIT_XSETBV => VmExitReason::Xsetbv,
            // See: 15.10.1 MSR Intercepts
            VMEXIT_MSR => VmExitReason::Msr(MsrQualification {
                msr: self.registers.rcx as u32,
                is_write: self.vmcb.control_area.exit_info1 != 0,
            }),
            // See: 15.10.2 IOIO Intercepts, Table 15-2 IOIO_INFO Field Layout
            VMEXIT_IOIO => {
                let info = self.vmcb.control_area.exit_info1;
                VmExitReason::Io(IoQualification {
                    is_in: (info & 0b1) != 0,
                    string: (info & 0b10) != 0,
                    rep: (info & 0b100) != 0,
                    size: if (info & 0b1000) != 0 {
                        1
                    } else if (info & 0b1_0000) != 0 {
                        2
                    } else {
                        4
                    },
                    port: ((info >> 16) & 0xffff) as u16,
                })
            }
            // See: 15.11 CR Intercepts. GPR index is only meaningful when the
            // processor advertises decode assists; we read it unconditionally
            // since unsupported processors leave the low nibble zeroed.
            VMEXIT_CR0_READ..=VMEXIT_CR15_READ => VmExitReason::MovCr(MovCrQualification {
                cr: (self.vmcb.control_area.exit_code - VMEXIT_CR0_READ) as u8,
                gpr: (self.vmcb.control_area.exit_info1 & 0xf) as u8,
                access: MovCrAccess::Read,
            }),
            VMEXIT_CR0_WRITE..=VMEXIT_CR15_WRITE => VmExitReason::MovCr(MovCrQualification {
                cr: (self.vmcb.control_area.exit_code - VMEXIT_CR0_WRITE) as u8,
                gpr: (self.vmcb.control_area.exit_info1 & 0xf) as u8,
                access: MovCrAccess::Write,
            }),
            VMEXIT_VINTR => {
                const VINTR_V_IRQ_FLAG: u64 = 1 << 8;
                const INTERCEPT_MISC1_VINTR: u32 = 1 << 4;
                self.vmcb.control_area.vintr &= !VINTR_V_IRQ_FLAG;
                self.vmcb.control_area.intercept_misc1 &= !INTERCEPT_MISC1_VINTR;
                VmExitReason::InterruptWindow
            }
            // Anything else.
            _ => VmExitReason::Unexpected(self.vmcb.control_area.exit_code),
        }
    }

    /// Invalidates caches of the nested paging structures.
    fn invalidate_caches(&mut self) {
        // Flushes this guest's TLB entries.
        // See: Table 15-9. TLB Control Byte Encodings
        self.vmcb.control_area.tlb_control = 0b11;
    }

    /// Gets a flag value to be set to nested paging structure entries for the
    /// given entry types (eg, permissions).
    fn nps_entry_flags(
        &self,
        entry_type: NestedPagingStructureEntryType,
    ) -> NestedPagingStructureEntryFlags {
        // SVM uses the exact same layout as the standard paging structure entries
        // for nested paging structure entries. We also assume leaving the PWT, PCD, and
        // PAT bits zero in the entry results in the write-back memory type. Thus,
        // `NestedPagingStructureEntryType::Wb*` types results in the same permission
        // bits as `NestedPagingStructureEntryType::*` types.
        match entry_type {
            // Valid, Writeable, User
            NestedPagingStructureEntryType::Rwx | NestedPagingStructureEntryType::RwxWriteBack => {
                NestedPagingStructureEntryFlags {
                    permission: 0b111,
                    memory_type: 0,
                }
            }
            // Valid, NON writable, User
            NestedPagingStructureEntryType::RxWriteBack => NestedPagingStructureEntryFlags {
                permission: 0b101,
                memory_type: 0,
            },
        }
    }

    fn registers(&self) -> &GuestRegisters {
        &self.registers
    }

    fn registers_mut(&mut self) -> &mut GuestRegisters {
        &mut self.registers
    }

    fn read_cr(&self, which: u8) -> u64 {
        match which {
            0 => self.vmcb.state_save_area.cr0,
            3 => self.vmcb.state_save_area.cr3,
            4 => self.vmcb.state_save_area.cr4,
            _ => unreachable!("only CR0, CR3 and CR4 are virtualized"),
        }
    }

    fn write_cr(&mut self, which: u8, value: u64) {
        match which {
            0 => self.vmcb.state_save_area.cr0 = value,
            3 => self.vmcb.state_save_area.cr3 = value,
            4 => self.vmcb.state_save_area.cr4 = value,
            _ => unreachable!("only CR0, CR3 and CR4 are virtualized"),
        }
    }

    fn write_efer(&mut self, value: u64) {
        self.vmcb.state_save_area.efer = value;
    }

    fn advance_rip(&mut self, len: u64) {
        self.registers.rip += len;
        self.vmcb.state_save_area.rip = self.registers.rip;
    }

    fn inject_exception(&mut self, vector: u8, error_code: Option<u32>) {
        const EVENTINJ_VALID_FLAG: u64 = 1 << 31;
        const EVENTINJ_TYPE_EXCEPTION: u64 = 3 << 8;
        const EVENTINJ_VALID_ERROR_CODE_FLAG: u64 = 1 << 11;

        let mut event_inj = EVENTINJ_VALID_FLAG | EVENTINJ_TYPE_EXCEPTION | u64::from(vector);
        if let Some(code) = error_code {
            event_inj |= EVENTINJ_VALID_ERROR_CODE_FLAG | (u64::from(code) << 32);
        }
        self.vmcb.control_area.event_inj = event_inj;
    }

    fn inject_external_interrupt(&mut self, vector: u8) {
        const RFLAGS_IF_FLAG: u64 = 1 << 9;
        const EVENTINJ_VALID_FLAG: u64 = 1 << 31;
        const EVENTINJ_TYPE_EXTINT: u64 = 0 << 8;
        const VINTR_V_IRQ_FLAG: u64 = 1 << 8;
        const VINTR_V_IGN_TPR_FLAG: u64 = 1 << 20;
        const VINTR_V_INTR_MASKING_FLAG: u64 = 1 << 24;
        const VINTR_VECTOR_SHIFT: u64 = 32;
        const INTERCEPT_MISC1_VINTR: u32 = 1 << 4;

        if (self.vmcb.state_save_area.rflags & RFLAGS_IF_FLAG) == 0 {
            self.vmcb.control_area.vintr = VINTR_V_IRQ_FLAG
                | VINTR_V_IGN_TPR_FLAG
                | VINTR_V_INTR_MASKING_FLAG
                | (u64::from(vector) << VINTR_VECTOR_SHIFT);
            self.vmcb.control_area.intercept_misc1 |= INTERCEPT_MISC1_VINTR;
            return;
        }
        self.vmcb.control_area.event_inj =
            EVENTINJ_VALID_FLAG | EVENTINJ_TYPE_EXTINT | u64::from(vector);
    }

    fn set_io_intercept(&mut self, port: u16, intercept: bool) {
        self.iopm.set(port, intercept);
    }

    fn set_msr_intercept(&mut self, msr: u32, read: bool, write: bool) {
        self.msrpm.set(msr, read, write);
    }
}

impl Svm {
    pub(crate) fn new() -> Self {
        let vmcb = unsafe { Box::<Vmcb>::new_zeroed().assume_init() };
        let host_state = unsafe { Box::<HostStateArea>::new_zeroed().assume_init() };
        let iopm = unsafe { Box::<IopmBitmap>::new_zeroed().assume_init() };
        let msrpm = unsafe { Box::<MsrpmBitmap>::new_zeroed().assume_init() };
        Self {
            vmcb,
            host_state,
            iopm,
            msrpm,
            ..Default::default()
        }
    }
}

/// The virtual machine control block (VMCB), which describes a virtual machine
/// (guest) to be executed.
///
/// See: Appendix B Layout of VMCB
#[derive(Debug, Default)]
#[repr(C, align(4096))]
struct Vmcb {
    control_area: ControlArea,
    state_save_area: StateSaveArea,
}
const _: () = assert!(size_of::<Vmcb>() == 0x1000);

/// The "metadata" area where we can specify what operations to intercept and
/// can read details of #VMEXIT.
///
/// See: Table B-1. VMCB Layout, Control Area
#[derive(derivative::Derivative)]
#[derivative(Debug, Default)]
#[repr(C)]
struct ControlArea {
    intercept_cr_read: u16,   // +0x000
    intercept_cr_write: u16,  // +0x002
    intercept_dr_read: u16,   // +0x004
    intercept_dr_write: u16,  // +0x006
    intercept_exception: u32, // +0x008
    intercept_misc1: u32,     // +0x00c
    intercept_misc2: u32,     // +0x010
    intercept_misc3: u32,     // +0x014
    #[derivative(Debug = "ignore", Default(value = "[0; 36]"))]
    _padding1: [u8; 0x03c - 0x018], // +0x018
    pause_filter_threshold: u16, // +0x03c
    pause_filter_count: u16,  // +0x03e
    iopm_base_pa: u64,        // +0x040
    msrpm_base_pa: u64,       // +0x048
    tsc_offset: u64,          // +0x050
    guest_asid: u32,          // +0x058
    tlb_control: u32,         // +0x05c
    vintr: u64,               // +0x060
    interrupt_shadow: u64,    // +0x068
    exit_code: u64,           // +0x070
    exit_info1: u64,          // +0x078
    exit_info2: u64,          // +0x080
    exit_int_info: u64,       // +0x088
    np_enable: u64,           // +0x090
    avic_apic_bar: u64,       // +0x098
    guest_pa_pf_ghcb: u64,    // +0x0a0
    event_inj: u64,           // +0x0a8
    ncr3: u64,                // +0x0b0
    lbr_virtualization_enable: u64, // +0x0b8
    vmcb_clean: u64,          // +0x0c0
    nrip: u64,                // +0x0c8
    num_of_bytes_fetched: u8, // +0x0d0
    guest_instruction_bytes: [u8; 15], // +0x0d1
    avic_apic_backing_page_pointer: u64, // +0x0e0
    #[derivative(Debug = "ignore")]
    _padding2: u64, // +0x0e8
    avic_logical_table_pointer: u64, // +0x0f0
    avic_physical_table_pointer: u64, // +0x0f8
    #[derivative(Debug = "ignore")]
    _padding3: u64, // +0x100
    vmcb_save_state_pointer: u64, // +0x108
    #[derivative(Debug = "ignore", Default(value = "[0; 720]"))]
    _padding4: [u8; 0x3e0 - 0x110], // +0x110
    reserved_for_host: [u8; 0x20], // +0x3e0
}
const _: () = assert!(size_of::<ControlArea>() == 0x400);

/// The ares to specify and read guest register values.
///
/// See: Table B-2. VMCB Layout, State Save Area
#[derive(derivative::Derivative)]
#[derivative(Debug, Default)]
#[repr(C)]
struct StateSaveArea {
    es_selector: u16,   // +0x000
    es_attrib: u16,     // +0x002
    es_limit: u32,      // +0x004
    es_base: u64,       // +0x008
    cs_selector: u16,   // +0x010
    cs_attrib: u16,     // +0x012
    cs_limit: u32,      // +0x014
    cs_base: u64,       // +0x018
    ss_selector: u16,   // +0x020
    ss_attrib: u16,     // +0x022
    ss_limit: u32,      // +0x024
    ss_base: u64,       // +0x028
    ds_selector: u16,   // +0x030
    ds_attrib: u16,     // +0x032
    ds_limit: u32,      // +0x034
    ds_base: u64,       // +0x038
    fs_selector: u16,   // +0x040
    fs_attrib: u16,     // +0x042
    fs_limit: u32,      // +0x044
    fs_base: u64,       // +0x048
    gs_selector: u16,   // +0x050
    gs_attrib: u16,     // +0x052
    gs_limit: u32,      // +0x054
    gs_base: u64,       // +0x058
    gdtr_selector: u16, // +0x060
    gdtr_attrib: u16,   // +0x062
    gdtr_limit: u32,    // +0x064
    gdtr_base: u64,     // +0x068
    ldtr_selector: u16, // +0x070
    ldtr_attrib: u16,   // +0x072
    ldtr_limit: u32,    // +0x074
    ldtr_base: u64,     // +0x078
    idtr_selector: u16, // +0x080
    idtr_attrib: u16,   // +0x082
    idtr_limit: u32,    // +0x084
    idtr_base: u64,     // +0x088
    tr_selector: u16,   // +0x090
    tr_attrib: u16,     // +0x092
    tr_limit: u32,      // +0x094
    tr_base: u64,       // +0x098
    #[derivative(Debug = "ignore", Default(value = "[0; 43]"))]
    _padding1: [u8; 0x0cb - 0x0a0], // +0x0a0
    cpl: u8,            // +0x0cb
    #[derivative(Debug = "ignore")]
    _padding2: u32, // +0x0cc
    efer: u64,          // +0x0d0
    #[derivative(Debug = "ignore", Default(value = "[0; 112]"))]
    _padding3: [u8; 0x148 - 0x0d8], // +0x0d8
    cr4: u64,           // +0x148
    cr3: u64,           // +0x150
    cr0: u64,           // +0x158
    dr7: u64,           // +0x160
    dr6: u64,           // +0x168
    rflags: u64,        // +0x170
    rip: u64,           // +0x178
    #[derivative(Debug = "ignore", Default(value = "[0; 88]"))]
    _padding4: [u8; 0x1d8 - 0x180], // +0x180
    rsp: u64,           // +0x1d8
    s_cet: u64,         // +0x1e0
    ssp: u64,           // +0x1e8
    isst_addr: u64,     // +0x1f0
    rax: u64,           // +0x1f8
    star: u64,          // +0x200
    lstar: u64,         // +0x208
    cstar: u64,         // +0x210
    sf_mask: u64,       // +0x218
    kernel_gs_base: u64, // +0x220
    sysenter_cs: u64,   // +0x228
    sysenter_esp: u64,  // +0x230
    sysenter_eip: u64,  // +0x238
    cr2: u64,           // +0x240
    #[derivative(Debug = "ignore", Default(value = "[0; 32]"))]
    _padding5: [u8; 0x268 - 0x248], // +0x248
    gpat: u64,          // +0x268
    dbg_ctl: u64,       // +0x270
    br_from: u64,       // +0x278
    br_to: u64,         // +0x280
    last_excep_from: u64, // +0x288
    last_excep_to: u64, // +0x290
    #[derivative(Debug = "ignore", Default(value = "[0; 71]"))]
    _padding6: [u8; 0x2df - 0x298], // +0x298
    spec_ctl: u64,      // +0x2e0
}
const _: () = assert!(size_of::<StateSaveArea>() == 0x2e8);

/// 4KB block of memory where the host state is saved to on VMRUN and loaded
/// from on #VMEXIT.
///
/// See: 15.30.4 VM_HSAVE_PA MSR (C001_0117h)
// doc_markdown: clippy confused with "VM_HSAVE_PA"
#[allow(clippy::doc_markdown)]
#[repr(C, align(4096))]
struct HostStateArea([u8; 0x1000]);
const _: () = assert!(size_of::<HostStateArea>() == 0x1000);

impl Default for HostStateArea {
    fn default() -> Self {
        Self([0; 4096])
    }
}

/// The I/O permissions map (IOPM): one bit per port across the full 16-bit
/// port space, spanning two 4KB pages. A set bit traps both `IN` and `OUT`
/// on that port.
///
/// See: 15.10.2 IOIO Intercepts
#[repr(C, align(4096))]
struct IopmBitmap([u8; 0x2000]);

impl Default for IopmBitmap {
    fn default() -> Self {
        Self([0; 0x2000])
    }
}

impl IopmBitmap {
    fn set(&mut self, port: u16, intercept: bool) {
        let byte = (port / 8) as usize;
        let mask = 1u8 << (port % 8);
        if intercept {
            self.0[byte] |= mask;
        } else {
            self.0[byte] &= !mask;
        }
    }
}

/// The MSR permissions map (MSRPM): two bits (read, write) per MSR across
/// three 2KB ranges, padded out to two 4KB pages.
///
/// See: 15.10.1 MSR Intercepts
#[repr(C, align(4096))]
struct MsrpmBitmap([u8; 0x2000]);

impl Default for MsrpmBitmap {
    fn default() -> Self {
        Self([0; 0x2000])
    }
}

impl MsrpmBitmap {
    fn set(&mut self, msr: u32, read: bool, write: bool) {
        let (bit, range_offset) = if msr < 0x2000 {
            (msr, 0x000)
        } else if (0xC000_0000..0xC000_2000).contains(&msr) {
            (msr - 0xC000_0000, 0x800)
        } else if (0xC001_0000..0xC001_2000).contains(&msr) {
            (msr - 0xC001_0000, 0x1000)
        } else {
            return;
        };
        let byte = range_offset + (bit / 4) as usize;
        let read_bit = 1u8 << ((bit % 4) * 2);
        let write_bit = read_bit << 1;
        Self::apply(&mut self.0[byte], read_bit, read);
        Self::apply(&mut self.0[byte], write_bit, write);
    }

    fn apply(byte: &mut u8, mask: u8, set: bool) {
        if set {
            *byte |= mask;
        } else {
            *byte &= !mask;
        }
    }
}

extern "efiapi" {
    /// Runs the guest until #VMEXIT occurs.
    fn run_vm_svm(registers: &mut GuestRegisters, guest_vmcb_pa: *mut Vmcb);
}
global_asm!(include_str!("svm_run_vm.S"));

/// Returns the access rights of the given segment for SVM.
fn get_segment_access_right(table_base: u64, selector: u16) -> u16 {
    let descriptor_value = get_segment_descriptor_value(table_base, selector);

    // First, get the AVL, L, D/B and G bits, while excluding the "Seg. Limit 19:16"
    // bits. Then, get the Type, S, DPL and P bits. Finally, return those bits
    // without the "Seg. Limit 19:16" bits.
    // See: Figure 3-8. Segment Descriptor
    let ar = (descriptor_value >> 40) as u16;
    let upper_ar = (ar >> 4) & 0b1111_0000_0000;
    let lower_ar = ar & 0b1111_1111;
    lower_ar | upper_ar
}
