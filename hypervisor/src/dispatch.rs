//! The per-exit dispatcher: decodes a [`VmExitReason`] and carries out its
//! effect against one [`Vcpu`]. This is the vendor-neutral half of the
//! reference monitor's main loop; the vendor-specific half (reading the exit
//! reason off the VMCS/VMCB) already happened inside [`HardwareVt::run`].
//!
//! The surrounding per-physical-CPU loop (`schedule()`, the halt/timer
//! bookkeeping, calling [`HardwareVt::run`] and re-checking for injected
//! events) is not this module's concern; [`dispatch_exit`] is called once per
//! exit and returns what the loop should do next.

use crate::{
    exint_pass::ExintPass,
    hardware_vt::{
        GuestException, HardwareVt, IoQualification, MovCrAccess, MovCrQualification,
        MsrQualification, VmExitReason,
    },
    interp::{self, GuestCode, InterpResult, MAX_WINDOW_INSTRUCTIONS},
    paging::IdentityGuestMemory,
    vcpu::Vcpu,
    x86_instructions,
};
use log::{debug, warn};

/// IA32_PAT.
const MSR_PAT: u32 = 0x277;

/// IA32_EFER.
const MSR_EFER: u32 = x86::msr::IA32_EFER;

const EFER_LME: u64 = 1 << 8;
const EFER_LMA: u64 = 1 << 10;
const CR0_PG: u64 = 1 << 31;

/// What the surrounding per-physical-CPU loop should do after a single exit
/// was dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DispatchOutcome {
    /// Re-enter the guest on the next loop iteration.
    Resume,
    /// The guest executed `HLT`; only wake it on the next interrupt.
    Halt,
    /// The processor entered the shutdown state (eg triple fault). Fatal.
    Shutdown(u64),
    /// An exit reason with no handler fired. Fatal.
    Unhandled(u64),
    /// Re-enter the guest, but first broadcast an MMIO-cache invalidation
    /// through the registered [`crate::mmioclr::MmioClr`] callbacks. Kept
    /// separate from `Resume` because the invalidation has to run outside
    /// the per-vcpu registry lock this exit was dispatched under.
    ResumeAndClearMmio,
}

impl IdentityGuestMemory {
    fn write_guest_u8(&self, gphys: u64, value: u8) {
        // Safety: see `read_guest_u64`; the identity map keeps `gphys`
        // writable host-side whenever the guest itself could write it.
        unsafe { core::ptr::write(gphys as *mut u8, value) };
    }
}

impl GuestCode for IdentityGuestMemory {
    fn read_u8(&self, linear: u64) -> u8 {
        // Safe only because the bounded interpreter is used exclusively
        // before paging is enabled on the guest side, where linear and
        // physical addresses coincide.
        unsafe { core::ptr::read(linear as *const u8) }
    }
}

#[cfg(feature = "vmmcall_status")]
impl crate::status::GuestWriter for IdentityGuestMemory {
    fn write_u8(&mut self, linear: u64, value: u8) {
        IdentityGuestMemory::write_guest_u8(self, linear, value);
    }
}

/// Dispatches a single VM exit against `vcpu`. Mirrors the big
/// `switch (qual.exit_reason)` that sat at the core of the reference
/// monitor's `vmctl.vmexit` handler.
#[cfg_attr(not(feature = "vmmcall_status"), allow(unused_variables))]
pub(crate) fn dispatch_exit(
    vcpu: &mut Vcpu,
    mem: &IdentityGuestMemory,
    exint: &ExintPass,
    #[cfg(feature = "vmmcall_status")] status: &crate::status::StatusRegistry,
    reason: VmExitReason,
) -> DispatchOutcome {
    // Handlers that need the mainloop to skip the generic post-exit RIP
    // advance (eg because they already injected a fault instead of letting
    // the instruction retire) clear this back to `false` themselves.
    vcpu.updateip = true;

    match reason {
        VmExitReason::NestedPageFault(q) => {
            if !q.missing_translation {
                warn!("nested page fault with an established translation, gpa={:#x}", q.gpa);
            }
            vcpu.paging.handle_nested_page_fault(vcpu.vt.as_ref(), mem, q.gpa);
            let _ = q.write_access;
            DispatchOutcome::Resume
        }

        VmExitReason::Exception(q) => {
            dispatch_exception(vcpu, mem, q.exception_code, q.rip, q.error_code)
        }

        VmExitReason::Cpuid => {
            let regs = vcpu.vt.registers();
            let leaf = regs.rax as u32;
            let subleaf = regs.rcx as u32;
            let result = x86::cpuid::cpuid!(leaf, subleaf);
            let regs = vcpu.vt.registers_mut();
            regs.rax = u64::from(result.eax);
            regs.rbx = u64::from(result.ebx);
            regs.rcx = u64::from(result.ecx);
            regs.rdx = u64::from(result.edx);
            vcpu.vt.advance_rip(2);
            DispatchOutcome::Resume
        }

        VmExitReason::Io(q) => {
            dispatch_io(vcpu, &q);
            vcpu.vt.advance_rip(1);
            DispatchOutcome::Resume
        }

        VmExitReason::Msr(q) => {
            dispatch_msr(vcpu, &q);
            if vcpu.updateip {
                vcpu.vt.advance_rip(2);
            }
            DispatchOutcome::Resume
        }

        VmExitReason::MovCr(q) => {
            let clear_mmio = dispatch_mov_cr(vcpu, mem, &q);
            vcpu.vt.advance_rip(3);
            if clear_mmio {
                DispatchOutcome::ResumeAndClearMmio
            } else {
                DispatchOutcome::Resume
            }
        }

        VmExitReason::Invlpg(linear) => {
            // Without a per-page shadow invalidation entry point, the
            // conservative (if less efficient) correct response is to drop
            // every shadow translation; nested paging needs no software
            // invalidation at all since the ASID mechanism scopes the TLB.
            if !vcpu.paging.is_nested() {
                vcpu.paging.clear_all();
            }
            let _ = linear;
            vcpu.vt.advance_rip(3);
            DispatchOutcome::Resume
        }

        VmExitReason::Vmcall => {
            #[cfg(feature = "vmmcall_status")]
            {
                const STATUS_REQUEST_MAGIC: u64 = 0x5354_4154; // "STAT"
                if vcpu.vt.registers().rax == STATUS_REQUEST_MAGIC {
                    let mut writer = *mem;
                    let rax = crate::status::handle_status_vmmcall(status, vcpu.vt.as_mut(), &mut writer);
                    vcpu.vt.registers_mut().rax = rax;
                    vcpu.vt.advance_rip(3);
                }
            }
            vcpu.vt.registers_mut().rax = 0;
            vcpu.vt.advance_rip(3);
            DispatchOutcome::Resume
        }

        VmExitReason::Hlt => {
            vcpu.vt.advance_rip(1);
            vcpu.halt = true;
            DispatchOutcome::Halt
        }

        VmExitReason::Xsetbv => {
            let regs = vcpu.vt.registers();
            let index = regs.rcx as u32;
            let value = (regs.rdx << 32) | (regs.rax & 0xFFFF_FFFF);
            x86_instructions::xsetbv(index, value);
            vcpu.vt.advance_rip(3);
            DispatchOutcome::Resume
        }

        VmExitReason::InitSipi(q) => {
            // Routing INIT/SIPI between physical CPUs means virtualizing the
            // local APIC's ICR register, a subsystem this pass does not
            // build; the pragmatic response is to let the vCPU keep running
            // rather than silently drop the event.
            debug!("INIT/SIPI delivered, is_sipi={} vector={:#x}", q.is_sipi, q.vector);
            vcpu.halt = false;
            DispatchOutcome::Resume
        }

        VmExitReason::InterruptWindow => {
            // The window requested by a prior `inject_external_interrupt`
            // opened; the backend injects the pending vector on the next
            // entry on its own, nothing further to do here.
            DispatchOutcome::Resume
        }

        VmExitReason::ExternalInterruptOrPause(vector) => {
            // `PAUSE` (and backends that cannot report a vector) carry
            // `None`; nothing for the passthrough chain to filter there.
            if let Some(vector) = vector {
                match exint.run_callback_list(vector) {
                    Some(rewritten) => crate::vmctl::generate_external_int(vcpu.vt.as_mut(), rewritten),
                    None => {
                        // A filter claimed (and dropped) the vector: it is
                        // already handling the device behind it.
                    }
                }
            }
            DispatchOutcome::Resume
        }

        VmExitReason::TimerExpiration => DispatchOutcome::Resume,

        VmExitReason::Shutdown(code) => {
            crate::vmctl::panic_dump(vcpu.vt.as_ref());
            DispatchOutcome::Shutdown(code)
        }

        VmExitReason::Unexpected(code) => {
            crate::vmctl::panic_dump(vcpu.vt.as_ref());
            DispatchOutcome::Unhandled(code)
        }
    }
}

fn dispatch_exception(
    vcpu: &mut Vcpu,
    mem: &IdentityGuestMemory,
    exception: GuestException,
    rip: u64,
    error_code: u32,
) -> DispatchOutcome {
    match exception {
        GuestException::BreakPoint => {
            vcpu.vt.inject_exception(x86::irq::BREAKPOINT_VECTOR, None);
            DispatchOutcome::Resume
        }

        GuestException::InvalidOpcode => {
            if vcpu.interp_budget == 0 {
                vcpu.interp_budget = MAX_WINDOW_INSTRUCTIONS;
            }
            if vcpu.interp_budget > 0 {
                vcpu.interp_budget -= 1;
                match interp::step(vcpu.vt.as_mut(), mem) {
                    InterpResult::Handled => return DispatchOutcome::Resume,
                    InterpResult::Unsupported => {}
                }
            }
            vcpu.interp_budget = 0;
            vcpu.vt.inject_exception(x86::irq::INVALID_OPCODE_VECTOR, None);
            DispatchOutcome::Resume
        }

        GuestException::PageFault => {
            let cr2 = x86_instructions::cr2();
            if vcpu.paging.is_nested() {
                // Nested paging handles guest page faults transparently;
                // the monitor has no reason to intercept #PF while it is
                // active, so this would indicate the backend's exception
                // bitmap is misconfigured.
                warn!("page fault exit while nested paging is active, rip={rip:#x}");
                crate::vmctl::generate_pagefault(vcpu.vt.as_mut(), error_code, cr2);
                return DispatchOutcome::Resume;
            }
            let guest_cr3 = vcpu.vt.read_cr(3);
            match vcpu.paging.handle_shadow_page_fault(mem, guest_cr3, cr2, error_code) {
                crate::spt::PageFaultOutcome::Installed => {}
                crate::spt::PageFaultOutcome::Reflect(code) => {
                    crate::vmctl::generate_pagefault(vcpu.vt.as_mut(), code, cr2);
                }
            }
            DispatchOutcome::Resume
        }
    }
}

fn dispatch_io(vcpu: &mut Vcpu, q: &IoQualification) {
    if q.string || q.rep {
        // String/REP-prefixed IO would need the bounded interpreter to walk
        // the guest's (E)SI/(E)DI and count operand fetches; out of scope
        // for a passthrough hypervisor whose guest does not expect a device
        // behind these ports to behave differently once virtualized.
        warn!("string/rep IO on port {:#x} passed through as a single transfer", q.port);
    }
    if q.is_in {
        let value: u32 = match q.size {
            1 => u32::from(x86_instructions::inb(q.port)),
            2 => u32::from(x86_instructions::inw(q.port)),
            _ => x86_instructions::inl(q.port),
        };
        vcpu.vt.registers_mut().rax = u64::from(value);
    } else {
        let rax = vcpu.vt.registers().rax;
        match q.size {
            1 => x86_instructions::outb(q.port, rax as u8),
            2 => x86_instructions::outw(q.port, rax as u16),
            _ => x86_instructions::outl(q.port, rax as u32),
        }
    }
}

fn dispatch_msr(vcpu: &mut Vcpu, q: &MsrQualification) {
    if q.msr == MSR_PAT {
        if q.is_write {
            let regs = vcpu.vt.registers();
            let value = (regs.rdx << 32) | (regs.rax & 0xFFFF_FFFF);
            if !vcpu.cache.set_gpat(value) {
                inject_gp(vcpu);
            }
        } else {
            let value = vcpu.cache.get_gpat();
            split_edx_eax(vcpu.vt.registers_mut(), value);
        }
        return;
    }

    if q.msr == MSR_EFER {
        if q.is_write {
            let regs = vcpu.vt.registers();
            let value = (regs.rdx << 32) | (regs.rax & 0xFFFF_FFFF);
            let cr0 = vcpu.vt.read_cr(0);
            update_efer_lma(vcpu, cr0, value);
        } else {
            split_edx_eax(vcpu.vt.registers_mut(), vcpu.efer_shadow);
        }
        return;
    }

    if q.is_write {
        let regs = vcpu.vt.registers();
        let value = (regs.rdx << 32) | (regs.rax & 0xFFFF_FFFF);
        if crate::cache::is_mtrr_msr(q.msr) {
            if !vcpu.cache.set_gmtrr(q.msr, value) {
                inject_gp(vcpu);
            }
            return;
        }
        if crate::cache::is_amd_cache_msr(q.msr) {
            if !vcpu.cache.set_gmsr_amd(q.msr, value) {
                inject_gp(vcpu);
            }
            return;
        }
        x86_instructions::wrmsr(q.msr, value);
    } else if let Some(value) = vcpu.cache.get_gmtrr(q.msr).or_else(|| vcpu.cache.get_gmsr_amd(q.msr)) {
        split_edx_eax(vcpu.vt.registers_mut(), value);
    } else {
        let value = x86_instructions::rdmsr(q.msr);
        split_edx_eax(vcpu.vt.registers_mut(), value);
    }
}

/// Injects #GP for an MSR write a recognized handler rejected, and marks the
/// RIP as already settled: a fault means the instruction never retired, so
/// the mainloop must not advance past it the way a successful MSR write
/// would.
fn inject_gp(vcpu: &mut Vcpu) {
    vcpu.vt.inject_exception(x86::irq::GENERAL_PROTECTION_FAULT_VECTOR, Some(0));
    vcpu.updateip = false;
}

/// Recomputes EFER.LMA from `new_efer_base`'s LME bit and `cr0`'s PG bit,
/// and pushes the result into the backend only when it actually changes.
/// Real hardware performs this update automatically whenever the guest
/// executes a `MOV CR0` or `WRMSR` to EFER itself; this monitor writes both
/// registers into the guest-state area directly rather than letting the
/// guest's own instruction retire, so nothing else would ever flip LMA.
fn update_efer_lma(vcpu: &mut Vcpu, cr0: u64, new_efer_base: u64) {
    let lma = cr0 & CR0_PG != 0 && new_efer_base & EFER_LME != 0;
    let new_efer = if lma {
        new_efer_base | EFER_LMA
    } else {
        new_efer_base & !EFER_LMA
    };
    if new_efer != vcpu.efer_shadow {
        vcpu.efer_shadow = new_efer;
        vcpu.vt.write_efer(new_efer);
    }
}

fn split_edx_eax(regs: &mut crate::hardware_vt::GuestRegisters, value: u64) {
    regs.rax = value & 0xFFFF_FFFF;
    regs.rdx = value >> 32;
}

/// Dispatches a `MOV CR` exit, returning whether the mainloop should
/// broadcast an MMIO-cache invalidation afterwards (only ever true for a CR0
/// write, which may change the memory-type bits every cached NPT/shadow PTE
/// was built with).
fn dispatch_mov_cr(vcpu: &mut Vcpu, mem: &IdentityGuestMemory, q: &MovCrQualification) -> bool {
    match q.access {
        MovCrAccess::Write => {
            let value = read_gpr_by_index(vcpu.vt.registers(), q.gpr);
            match q.cr {
                3 => {
                    vcpu.paging.updatecr3(mem, value);
                    // Hardware CR3 must point at the shadow root, not the
                    // guest's own (software-only) root, whenever the shadow
                    // engine is active; nested paging writes guest CR3
                    // straight through instead.
                    let cr3 = vcpu.paging.shadow_root().unwrap_or(value);
                    vcpu.vt.write_cr(3, cr3);
                    false
                }
                0 => {
                    vcpu.vt.write_cr(0, value);
                    update_efer_lma(vcpu, value, vcpu.efer_shadow);
                    true
                }
                _ => {
                    vcpu.vt.write_cr(q.cr, value);
                    false
                }
            }
        }
        MovCrAccess::Read => {
            let value = vcpu.vt.read_cr(q.cr);
            write_gpr_by_index(vcpu.vt.registers_mut(), q.gpr, value);
            false
        }
    }
}

/// Maps a ModRM `reg`/`r/m` register index (0-15, standard x86 GPR order
/// with the REX extension) to its value. `vmctl::GeneralRegister` does not
/// cover RSP since it is rarely a `MOV CR` operand target, but the encoding
/// space allows it, so this stays a direct index instead.
fn read_gpr_by_index(regs: &crate::hardware_vt::GuestRegisters, index: u8) -> u64 {
    match index {
        0 => regs.rax,
        1 => regs.rcx,
        2 => regs.rdx,
        3 => regs.rbx,
        4 => regs.rsp,
        5 => regs.rbp,
        6 => regs.rsi,
        7 => regs.rdi,
        8 => regs.r8,
        9 => regs.r9,
        10 => regs.r10,
        11 => regs.r11,
        12 => regs.r12,
        13 => regs.r13,
        14 => regs.r14,
        15 => regs.r15,
        _ => unreachable!("ModRM register field is 4 bits"),
    }
}

fn write_gpr_by_index(regs: &mut crate::hardware_vt::GuestRegisters, index: u8, value: u64) {
    match index {
        0 => regs.rax = value,
        1 => regs.rcx = value,
        2 => regs.rdx = value,
        3 => regs.rbx = value,
        4 => regs.rsp = value,
        5 => regs.rbp = value,
        6 => regs.rsi = value,
        7 => regs.rdi = value,
        8 => regs.r8 = value,
        9 => regs.r9 = value,
        10 => regs.r10 = value,
        11 => regs.r11 = value,
        12 => regs.r12 = value,
        13 => regs.r13 = value,
        14 => regs.r14 = value,
        15 => regs.r15 = value,
        _ => unreachable!("ModRM register field is 4 bits"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware_vt::{
        ExceptionQualification, GuestRegisters, InitSipiQualification, MovCrQualification,
        MsrQualification, NestedPageFaultQualification, NestedPagingStructureEntryFlags,
        NestedPagingStructureEntryType,
    };
    use crate::paging::PagingEngine;

    #[derive(Debug)]
    struct FakeVt {
        regs: GuestRegisters,
        crs: [u64; 5],
    }

    impl FakeVt {
        fn new() -> Self {
            Self {
                regs: GuestRegisters::default(),
                crs: [0; 5],
            }
        }
    }

    impl HardwareVt for FakeVt {
        fn enable(&mut self) {}
        fn initialize(&mut self, _nested_pml4_addr: u64) {}
        fn revert_registers(&mut self, _state: &crate::boot_state::BootState) {}
        fn run(&mut self) -> VmExitReason {
            VmExitReason::Hlt
        }
        fn invalidate_caches(&mut self) {}
        fn nps_entry_flags(
            &self,
            _entry_type: NestedPagingStructureEntryType,
        ) -> NestedPagingStructureEntryFlags {
            NestedPagingStructureEntryFlags {
                permission: 0,
                memory_type: 0,
            }
        }
        fn registers(&self) -> &GuestRegisters {
            &self.regs
        }
        fn registers_mut(&mut self) -> &mut GuestRegisters {
            &mut self.regs
        }
        fn read_cr(&self, which: u8) -> u64 {
            self.crs[which as usize]
        }
        fn write_cr(&mut self, which: u8, value: u64) {
            self.crs[which as usize] = value;
        }
        fn advance_rip(&mut self, len: u64) {
            self.regs.rip += len;
        }
        fn inject_exception(&mut self, _vector: u8, _error_code: Option<u32>) {}
        fn inject_external_interrupt(&mut self, _vector: u8) {}
        fn set_io_intercept(&mut self, _port: u16, _intercept: bool) {}
        fn set_msr_intercept(&mut self, _msr: u32, _read: bool, _write: bool) {}
        fn write_efer(&mut self, _value: u64) {}
    }

    fn fake_vcpu(nested: bool) -> Vcpu {
        Vcpu {
            vt: alloc::boxed::Box::new(FakeVt::new()),
            cache: crate::cache::CacheData::default(),
            paging: PagingEngine::select(nested, 4),
            halt: false,
            initialized: false,
            tsc_offset: 0,
            updateip: false,
            efer_shadow: 0,
            interp_budget: 0,
        }
    }

    #[test]
    fn hlt_halts_the_vcpu_and_advances_rip() {
        let mut vcpu = fake_vcpu(true);
        let mem = IdentityGuestMemory;
        let exint = ExintPass::new();
        let outcome = dispatch_exit(
            &mut vcpu,
            &mem,
            &exint,
            #[cfg(feature = "vmmcall_status")]
            &crate::status::StatusRegistry::new(),
            VmExitReason::Hlt,
        );
        assert_eq!(outcome, DispatchOutcome::Halt);
        assert!(vcpu.halt);
        assert_eq!(vcpu.vt.registers().rip, 1);
    }

    #[test]
    fn nested_page_fault_installs_a_translation() {
        let mut vcpu = fake_vcpu(true);
        let mem = IdentityGuestMemory;
        let exint = ExintPass::new();
        let outcome = dispatch_exit(
            &mut vcpu,
            &mem,
            &exint,
            #[cfg(feature = "vmmcall_status")]
            &crate::status::StatusRegistry::new(),
            VmExitReason::NestedPageFault(NestedPageFaultQualification {
                rip: 0,
                gpa: 0x1000,
                missing_translation: true,
                write_access: false,
            }),
        );
        assert_eq!(outcome, DispatchOutcome::Resume);
    }

    #[test]
    fn breakpoint_exception_is_reflected_to_the_guest() {
        let mut vcpu = fake_vcpu(true);
        let mem = IdentityGuestMemory;
        let exint = ExintPass::new();
        let outcome = dispatch_exit(
            &mut vcpu,
            &mem,
            &exint,
            #[cfg(feature = "vmmcall_status")]
            &crate::status::StatusRegistry::new(),
            VmExitReason::Exception(ExceptionQualification {
                rip: 0x1000,
                exception_code: GuestException::BreakPoint,
                error_code: 0,
            }),
        );
        assert_eq!(outcome, DispatchOutcome::Resume);
    }

    #[test]
    fn mov_cr3_write_loads_the_shadow_root_into_hardware_cr3() {
        let mut vcpu = fake_vcpu(false);
        let mem = IdentityGuestMemory;
        vcpu.vt.registers_mut().rax = 0x1000;
        dispatch_mov_cr(
            &mut vcpu,
            &mem,
            &MovCrQualification {
                cr: 3,
                gpr: 0,
                access: MovCrAccess::Write,
            },
        );
        assert_eq!(vcpu.vt.read_cr(3), vcpu.paging.shadow_root().unwrap());
    }

    #[test]
    fn mov_cr0_write_requests_an_mmio_clear() {
        let mut vcpu = fake_vcpu(false);
        let mem = IdentityGuestMemory;
        vcpu.vt.registers_mut().rax = 0x8000_0011; // PG | WP | PE
        let clear_mmio = dispatch_mov_cr(
            &mut vcpu,
            &mem,
            &MovCrQualification {
                cr: 0,
                gpr: 0,
                access: MovCrAccess::Write,
            },
        );
        assert!(clear_mmio);
        assert_eq!(vcpu.vt.read_cr(0), 0x8000_0011);
    }

    #[test]
    fn efer_write_sets_lma_once_cr0_pg_and_efer_lme_are_both_set() {
        let mut vcpu = fake_vcpu(false);
        vcpu.vt.write_cr(0, CR0_PG);
        vcpu.vt.registers_mut().rax = EFER_LME & 0xFFFF_FFFF;
        vcpu.vt.registers_mut().rdx = EFER_LME >> 32;
        dispatch_msr(&mut vcpu, &MsrQualification { msr: MSR_EFER, is_write: true });
        assert_eq!(vcpu.efer_shadow, EFER_LME | EFER_LMA);
    }

    #[test]
    fn reserved_bit_mtrr_write_injects_gp_instead_of_committing() {
        let mut vcpu = fake_vcpu(false);
        vcpu.updateip = true;
        vcpu.vt.registers_mut().rax = 0b10; // reserved type encoding for MTRR_DEF_TYPE
        vcpu.vt.registers_mut().rdx = 0;
        dispatch_msr(&mut vcpu, &MsrQualification { msr: 0x2FF, is_write: true });
        assert!(!vcpu.updateip);
        assert_eq!(vcpu.cache.get_gmtrr(0x2FF), Some(0));
    }

    #[test]
    fn mov_cr_read_writes_back_into_the_requested_gpr() {
        let mut vcpu = fake_vcpu(true);
        let mem = IdentityGuestMemory;
        vcpu.vt.write_cr(4, 0x20);
        dispatch_mov_cr(
            &mut vcpu,
            &mem,
            &MovCrQualification {
                cr: 4,
                gpr: 3, // rbx
                access: MovCrAccess::Read,
            },
        );
        assert_eq!(vcpu.vt.registers().rbx, 0x20);
    }

    #[test]
    fn rdmsr_on_pat_returns_the_shadowed_value() {
        let mut vcpu = fake_vcpu(true);
        let expected = vcpu.cache.get_gpat();
        dispatch_msr(
            &mut vcpu,
            &MsrQualification {
                msr: MSR_PAT,
                is_write: false,
            },
        );
        let regs = vcpu.vt.registers();
        let got = (regs.rdx << 32) | (regs.rax & 0xFFFF_FFFF);
        assert_eq!(got, expected);
    }

    #[test]
    fn init_sipi_wakes_a_halted_vcpu() {
        let mut vcpu = fake_vcpu(true);
        vcpu.halt = true;
        let mem = IdentityGuestMemory;
        let exint = ExintPass::new();
        let outcome = dispatch_exit(
            &mut vcpu,
            &mem,
            &exint,
            #[cfg(feature = "vmmcall_status")]
            &crate::status::StatusRegistry::new(),
            VmExitReason::InitSipi(InitSipiQualification {
                is_sipi: true,
                vector: 0,
            }),
        );
        assert_eq!(outcome, DispatchOutcome::Resume);
        assert!(!vcpu.halt);
    }
}
