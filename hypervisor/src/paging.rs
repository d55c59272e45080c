//! Selects between the shadow-page-table engine and the nested-paging
//! engine for one vCPU and forwards the handful of calls the dispatcher and
//! the CR0/CR3/CR4 write handlers need, whichever engine is active. Ported
//! from `svm_paging.c`, which does exactly this branch
//! (`current->u.svm.np`) in front of `cpu_mmu_spt_*`/`svm_np_*`.

use crate::{
    hardware_vt::HardwareVt,
    npt::NestedPaging,
    spt::{GuestMemory, PageFaultOutcome, SptState},
};
use alloc::boxed::Box;

/// Guest physical memory backing this VM. For the single-guest,
/// install-under-a-running-host model this hypervisor targets, guest
/// physical addresses already equal host physical addresses outside the
/// handful of frames the SPT engine shadows, so `gp2hp` is the identity
/// function; reading a guest page table entry is a direct physical read.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct IdentityGuestMemory;

impl GuestMemory for IdentityGuestMemory {
    fn gp2hp(&self, gphys: u64) -> Option<u64> {
        Some(gphys)
    }

    fn read_guest_u64(&self, gphys: u64) -> u64 {
        // Safety: `gphys` is a physical address the guest itself can read
        // (it supplied it as a page-table entry), and this hypervisor's
        // identity map keeps it readable host-side too.
        unsafe { core::ptr::read(gphys as *const u64) }
    }
}

/// Which guest-memory virtualization strategy a vCPU uses. Mirrors the
/// `current->u.svm.np` / VT equivalent boolean, made explicit as an enum
/// since Rust does not need the two branches to share physical storage.
pub(crate) enum PagingEngine {
    Shadow(SptState),
    Nested(Box<NestedPaging>),
}

impl PagingEngine {
    /// Picks nested paging when the backend reports hardware support,
    /// otherwise falls back to the shadow engine. Mirrors
    /// `svm_nested_paging_available`'s gate plus `svm_paging_init`'s branch.
    pub(crate) fn select(nested_paging_available: bool, nested_table_capacity: usize) -> Self {
        if nested_paging_available {
            return Self::Nested(Box::new(NestedPaging::new(nested_table_capacity)));
        }
        #[cfg(feature = "spt_disable")]
        panic!("nested paging unavailable and the shadow page table fallback is disabled");
        #[cfg(not(feature = "spt_disable"))]
        Self::Shadow(SptState::new())
    }

    pub(crate) fn is_nested(&self) -> bool {
        matches!(self, Self::Nested(_))
    }

    /// Mirrors `svm_paging_updatecr3`: shadow engine rebuilds its root from
    /// the new guest CR3; nested paging has nothing to do, since guest CR3
    /// is simply the VMCS/VMCB guest field already written by the caller.
    pub(crate) fn updatecr3(&mut self, mem: &IdentityGuestMemory, guest_cr3: u64) {
        if let Self::Shadow(spt) = self {
            spt.updatecr3(mem, guest_cr3);
        }
    }

    /// Mirrors `svm_paging_tlbflush`/`cpu_mmu_spt_tlbflush`: the shadow
    /// engine drops its shadows, nested paging relies on the hardware ASID
    /// mechanism instead and does nothing here.
    pub(crate) fn tlbflush(&mut self) {
        if let Self::Shadow(spt) = self {
            spt.clear_all();
        }
    }

    /// Mirrors `svm_paging_clear_all`.
    pub(crate) fn clear_all(&mut self) {
        match self {
            Self::Shadow(spt) => spt.clear_all(),
            Self::Nested(_) => {
                // A flat nested-paging map never needs a full rebuild from
                // an MTRR/PAT change the way shadow PTE attributes do; the
                // memory-type bits embedded in existing entries simply
                // become stale until overwritten by the next `map` call.
            }
        }
    }

    /// Installs a translation for a nested page fault. Panics if shadow
    /// paging is active, mirroring `svm_paging_npf`'s
    /// `panic("nested page fault while np disabled")`: the hardware cannot
    /// produce this exit reason unless nested paging is enabled.
    pub(crate) fn handle_nested_page_fault(
        &mut self,
        vt: &dyn HardwareVt,
        mem: &IdentityGuestMemory,
        gpa: u64,
    ) {
        let Self::Nested(np) = self else {
            panic!("nested page fault while nested paging disabled");
        };
        let hpa = mem.gp2hp(gpa).expect("gp2hp must resolve every guest frame");
        np.map(
            vt,
            gpa,
            hpa,
            crate::hardware_vt::NestedPagingStructureEntryType::RwxWriteBack,
        );
    }

    /// Resolves a guest #PF against the shadow engine's own page-table walk.
    /// Panics if nested paging is active, mirroring
    /// [`Self::handle_nested_page_fault`]'s inverse panic: the hardware
    /// cannot produce a guest #PF exit while EPT/NPT is doing the
    /// translation instead.
    pub(crate) fn handle_shadow_page_fault(
        &mut self,
        mem: &IdentityGuestMemory,
        guest_cr3: u64,
        cr2: u64,
        error_code: u32,
    ) -> PageFaultOutcome {
        let Self::Shadow(spt) = self else {
            panic!("guest page fault exit while nested paging is active");
        };
        spt.pagefault(mem, guest_cr3, cr2, error_code)
    }

    /// Identity-maps the first megabyte. Mirrors `svm_paging_map_1mb`.
    pub(crate) fn map_1mb(&mut self, vt: &dyn HardwareVt) {
        if let Self::Nested(np) = self {
            np.map_1mb(vt);
        }
    }

    /// Root physical address to load into the backend's CR3/nested-CR3
    /// field, if the shadow engine owns translation (nested paging writes
    /// the guest CR3 straight through instead and never calls this).
    pub(crate) fn shadow_root(&self) -> Option<u64> {
        match self {
            Self::Shadow(spt) => Some(spt.cr3tbl_phys()),
            Self::Nested(_) => None,
        }
    }

    pub(crate) fn nested_pml4_addr(&mut self) -> Option<*mut crate::hardware_vt::NestedPagingStructure> {
        match self {
            Self::Nested(np) => Some(np.pml4_addr()),
            Self::Shadow(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_without_nested_support_uses_shadow_engine() {
        let engine = PagingEngine::select(false, 4);
        assert!(!engine.is_nested());
        assert!(engine.shadow_root().is_some());
    }

    #[test]
    fn select_with_nested_support_uses_nested_engine() {
        let engine = PagingEngine::select(true, 4);
        assert!(engine.is_nested());
        assert!(engine.shadow_root().is_none());
    }

    #[test]
    fn identity_guest_memory_maps_physical_equal_to_itself() {
        let mem = IdentityGuestMemory;
        assert_eq!(mem.gp2hp(0x1234_000), Some(0x1234_000));
    }
}
