//! The module containing high-level execution flow of this project.
//!
//! Logic this module implements can be understood as implementation of a
//! hypervisor, the component responsible for configuring and running VMs. This
//! project installs itself under the already-running host on every logical
//! processor, then monitors it forever: the host (and whatever OS it later
//! boots) becomes the single guest running under VMX/SVM, and this module's
//! job is to bring hardware-assisted virtualization up without disturbing
//! that guest's forward progress.
//!
//! Any code running in and from this module must not exceed 32KB (0x8000) for
//! total stack usage. Application processors run with this much of stack.
//! Overflow silently causes memory corruption. Thus, large structures should be
//! allocated on heap. This is usually not an issue with a single core system
//! because the boot strap processor (ie, the processor 0) runs with 128KB of
//! stack.

use crate::{
    boot_state::BootState,
    cache::CacheData,
    config::{GUEST_EXEC_TIMEOUT_IN_TSC, NESTED_TABLE_CAPACITY},
    dispatch::{self, DispatchOutcome},
    exint_pass::ExintPass,
    hardware_vt::{svm::Svm, vmx::Vmx, HardwareVt},
    mmioclr::{ClearCallback, MmioClr},
    paging::{IdentityGuestMemory, PagingEngine},
    sched::{Scheduler, Tid},
    vcpu::{Vcpu, VcpuId, VcpuRegistry},
    x86_instructions::rdtsc,
};
#[cfg(feature = "vmmcall_status")]
use crate::status::StatusRegistry;
use alloc::boxed::Box;
use core::arch::asm;
use core::sync::atomic::{AtomicU32, Ordering};
use log::info;
use spin::Once;

/// State shared by every physical CPU's monitor thread: the scheduler, the
/// vCPU registry every physical CPU registers into, and the cross-cutting
/// external-interrupt and (optional) debug-status registries. One instance
/// is constructed on the boot strap processor and its address handed to
/// every application processor.
pub(crate) struct Monitor {
    scheduler: Scheduler,
    vcpus: VcpuRegistry,
    exint: ExintPass,
    mmioclr: MmioClr,
    #[cfg(feature = "vmmcall_status")]
    status: StatusRegistry,
    next_cpu_id: AtomicU32,
}

impl Monitor {
    pub(crate) fn new() -> Self {
        Self {
            scheduler: Scheduler::new(),
            vcpus: VcpuRegistry::new(),
            exint: ExintPass::new(),
            mmioclr: MmioClr::new(),
            #[cfg(feature = "vmmcall_status")]
            status: StatusRegistry::new(),
            next_cpu_id: AtomicU32::new(0),
        }
    }
}

/// Drops every shadow/nested-paging translation on every registered vcpu
/// whenever the MMIO-clear registry fires, the software equivalent of the
/// original's callback that `cpu_mmu_spt_clear_all` was wired into. Resolves
/// guest-frame -> host-frame caching the same way a CR0 write forcing a full
/// rebuild does, just from a caller-independent trigger instead of being
/// called directly from the CR0 handler.
struct SptClearOnMmioChange(&'static VcpuRegistry);

impl ClearCallback for SptClearOnMmioChange {
    fn clear(&self, _start: u64, _end: u64) -> bool {
        let mut cleared = false;
        self.0.for_each(|_id, vcpu| {
            if !vcpu.paging.is_nested() {
                vcpu.paging.clear_all();
                cleared = true;
            }
            false
        });
        cleared
    }
}

/// Brings hardware-assisted virtualization up on the calling physical CPU
/// and never returns on the host side: the processor spends the rest of its
/// life inside [`HardwareVt::run`]/[`dispatch::dispatch_exit`]. The
/// original, not-yet-virtualized execution context this function was called
/// from is resumed as the very first guest instruction once the first VM
/// entry happens, so to the caller (and anything it goes on to do, such as
/// returning `EFI_SUCCESS` to firmware and proceeding to boot an OS) nothing
/// observable has changed; it is simply now running inside a VM.
///
/// # Safety
/// Must be called with this exact call frame still live on the stack and
/// frame pointers enabled (`force-frame-pointers` in `.cargo/config.toml`):
/// the resume point is read out of `rbp`-relative offsets in this function's
/// own prologue, which only hold the caller's return address and stack
/// pointer for as long as this frame has not unwound.
#[inline(never)]
pub(crate) unsafe fn install_and_run(monitor: &'static Monitor) -> ! {
    let cpu_id = monitor.next_cpu_id.fetch_add(1, Ordering::SeqCst);

    static MMIOCLR_CALLBACK: Once<()> = Once::new();
    MMIOCLR_CALLBACK.call_once(|| {
        monitor.mmioclr.register(Box::new(SptClearOnMmioChange(&monitor.vcpus)));
    });

    // Safety: this function's own (never-inlined) prologue has already run
    // by the time this executes, so `rbp` points at our saved frame and
    // `[rbp+8]`/`rbp+16` hold our caller's return address and stack pointer,
    // exactly the values a plain `ret` out of this function would restore.
    let (resume_rip, resume_rsp, resume_rflags): (u64, u64, u64);
    unsafe {
        asm!(
            "mov {ret_addr}, [rbp + 8]",
            "lea {caller_rsp}, [rbp + 16]",
            "pushfq",
            "pop {rflags}",
            ret_addr = out(reg) resume_rip,
            caller_rsp = out(reg) resume_rsp,
            rflags = out(reg) resume_rflags,
            options(preserves_flags, nostack),
        );
    }
    let boot_state = BootState::capture(resume_rip, resume_rsp, resume_rflags);

    let vt: Box<dyn HardwareVt> = if is_intel() {
        info!("cpu {cpu_id}: processor is Intel, using VMX");
        Box::new(Vmx::new())
    } else {
        info!("cpu {cpu_id}: processor is AMD, using SVM");
        Box::new(Svm::new())
    };

    let mut vcpu = Vcpu {
        vt,
        cache: CacheData::default(),
        paging: PagingEngine::select(nested_paging_supported(), NESTED_TABLE_CAPACITY),
        halt: false,
        initialized: false,
        tsc_offset: 0,
        updateip: false,
        efer_shadow: boot_state.efer,
        interp_budget: 0,
    };

    vcpu.vt.enable();
    let nested_pml4_addr = vcpu.paging.nested_pml4_addr().map_or(0, |p| p as u64);
    vcpu.vt.initialize(nested_pml4_addr);
    vcpu.paging.map_1mb(vcpu.vt.as_ref());
    vcpu.vt.revert_registers(&boot_state);
    vcpu.initialized = true;

    let boot_tid = monitor.scheduler.init_boot_thread(cpu_id);
    let vcpu_id = monitor.vcpus.register(vcpu);
    info!("cpu {cpu_id}: vcpu {vcpu_id} entering the dispatch loop");

    run_dispatch_loop(monitor, vcpu_id, cpu_id, boot_tid)
}

/// Runs `vcpu_id` until the end of time, translating every VM exit through
/// [`dispatch::dispatch_exit`]. A `TimerExpiration`-worthy time slice simply
/// restarts the slice clock rather than handing the processor to another
/// vCPU: with exactly one guest per physical CPU there is nothing else this
/// processor could usefully run. The scheduler is still consulted at the top
/// of every iteration, exactly as `vmm_loop` calls `vcpu_schedule` before
/// resuming the guest; on this single-guest-per-core model it never yields
/// this thread out, but a thread `spawn`ed onto this CPU (were one ever
/// started) would be picked up here.
fn run_dispatch_loop(monitor: &Monitor, vcpu_id: VcpuId, cpu_id: u32, boot_tid: Tid) -> ! {
    let mem = IdentityGuestMemory;
    let mut slice_start_tsc = rdtsc();

    loop {
        if let Some((tid, entry, arg)) = monitor.scheduler.schedule(cpu_id, boot_tid, false) {
            info!("cpu {cpu_id}: scheduler handed us thread {tid}, running it inline");
            entry(arg);
        }

        let outcome = monitor.vcpus.with(vcpu_id, |vcpu| {
            let reason = vcpu.vt.run();
            dispatch::dispatch_exit(
                vcpu,
                &mem,
                &monitor.exint,
                #[cfg(feature = "vmmcall_status")]
                &monitor.status,
                reason,
            )
        });

        match outcome {
            DispatchOutcome::Resume => {
                if rdtsc() - slice_start_tsc > GUEST_EXEC_TIMEOUT_IN_TSC {
                    slice_start_tsc = rdtsc();
                }
            }
            DispatchOutcome::ResumeAndClearMmio => {
                monitor.mmioclr.clear_hmap(0, u64::MAX);
                if rdtsc() - slice_start_tsc > GUEST_EXEC_TIMEOUT_IN_TSC {
                    slice_start_tsc = rdtsc();
                }
            }
            DispatchOutcome::Halt => slice_start_tsc = rdtsc(),
            DispatchOutcome::Shutdown(code) => {
                panic!("vcpu {vcpu_id} entered the shutdown state, code={code:#x}");
            }
            DispatchOutcome::Unhandled(code) => {
                panic!("vcpu {vcpu_id} hit an unhandled VM exit, code={code:#x}");
            }
        }
    }
}

/// Checks whether the current processor is an Intel processor (as opposed to
/// AMD).
fn is_intel() -> bool {
    x86::cpuid::CpuId::new().get_vendor_info().unwrap().as_str() == "GenuineIntel"
}

/// Checks whether the current processor supports second-level address
/// translation (EPT on Intel, NPT on AMD), gating [`PagingEngine::select`]'s
/// choice between the nested-paging and shadow-page-table engines.
fn nested_paging_supported() -> bool {
    if is_intel() {
        // CPUID.1:ECX.VMX[bit 5]. Whether the running VMX implementation's
        // secondary proc-based controls can actually turn EPT on is a
        // further MSR check (`IA32_VMX_PROCBASED_CTLS2`); `vmx.rs`'s
        // `initialize` already assumes EPT is available on any CPU this
        // project targets; this gate only covers the coarse feature bit for
        // `PagingEngine::select`'s choice of engine.
        (x86::cpuid::cpuid!(0x1).ecx & (1 << 5)) != 0
    } else {
        // CPUID.8000_000A:EDX.NP[bit 0].
        (x86::cpuid::cpuid!(0x8000_000A).edx & 1) != 0
    }
}
