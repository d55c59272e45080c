//! The nested-paging engine: a flat guest-physical -> host-physical map
//! built out of preallocated [`NestedPagingStructure`]s, used when the
//! processor provides EPT (Intel) or NPT (AMD) and the shadow page table
//! engine in `spt.rs` is bypassed entirely. Generalized from a
//! copy-on-write nested-paging walker into the flat 1:1-or-remapped
//! translation this hypervisor's guest-memory model needs.

use crate::hardware_vt::{
    HardwareVt, NestedPagingStructure, NestedPagingStructureEntry, NestedPagingStructureEntryType,
};
use alloc::boxed::Box;
use core::ptr::addr_of;
use x86::current::paging::BASE_PAGE_SIZE;

/// Owns the nested paging structures for one VM and builds GPA -> HPA
/// translations into them on demand, exactly as hardware would walk them.
pub(crate) struct NestedPaging {
    pml4: Box<NestedPagingStructure>,
    tables: Box<[NestedPagingStructure]>,
    used: usize,
}

impl NestedPaging {
    pub(crate) fn new(table_capacity: usize) -> Self {
        let pml4 = unsafe { Box::<NestedPagingStructure>::new_zeroed().assume_init() };
        let tables =
            unsafe { Box::<[NestedPagingStructure]>::new_zeroed_slice(table_capacity).assume_init() };
        Self {
            pml4,
            tables,
            used: 0,
        }
    }

    pub(crate) fn pml4_addr(&mut self) -> *mut NestedPagingStructure {
        self.pml4.as_mut() as *mut _
    }

    /// Installs (or overwrites) a translation for `gpa` -> `hpa` with the
    /// given permission class, walking/allocating PML4 -> PDPT -> PD -> PT
    /// the same way hardware does. Mirrors the NP-engine half of
    /// `svm_paging_npf`/the EPT-violation handler: on a nested page fault,
    /// the caller resolves `gpa` via `gmm.gp2hp` and calls this once.
    pub(crate) fn map(
        &mut self,
        vt: &dyn HardwareVt,
        gpa: u64,
        hpa: u64,
        entry_type: NestedPagingStructureEntryType,
    ) {
        let pml4i = ((gpa >> 39) & 0b1_1111_1111) as usize;
        let pdpti = ((gpa >> 30) & 0b1_1111_1111) as usize;
        let pdi = ((gpa >> 21) & 0b1_1111_1111) as usize;
        let pti = ((gpa >> 12) & 0b1_1111_1111) as usize;

        let pml4 = unsafe { (self.pml4.as_mut() as *mut NestedPagingStructure).as_mut() }.unwrap();
        let pml4e = self.walk_table(vt, pml4, pml4i);
        let pdpt = pml4e.next_table_mut();
        let pdpte = self.walk_table(vt, pdpt, pdpti);
        let pd = pdpte.next_table_mut();
        let pde = self.walk_table(vt, pd, pdi);
        let pt = pde.next_table_mut();

        let pte = &mut pt.entries[pti];
        let flags = vt.nps_entry_flags(entry_type);
        pte.set_translation(hpa, flags);
    }

    /// Identity-maps the first megabyte of guest physical memory, as real
    /// firmware/real-mode code expects to find it. Mirrors
    /// `cpu_mmu_spt_map_1mb`'s NP-engine counterpart.
    pub(crate) fn map_1mb(&mut self, vt: &dyn HardwareVt) {
        let mut gpa = 0u64;
        while gpa < 0x10_0000 {
            self.map(vt, gpa, gpa, NestedPagingStructureEntryType::RwxWriteBack);
            gpa += BASE_PAGE_SIZE as u64;
        }
    }

    fn walk_table<'a>(
        &mut self,
        vt: &dyn HardwareVt,
        table: &'a mut NestedPagingStructure,
        index: usize,
    ) -> &'a mut NestedPagingStructureEntry {
        let entry = &mut table.entries[index];
        if entry.pfn() == 0 {
            assert!(
                self.used < self.tables.len(),
                "all preallocated nested paging structures exhausted"
            );
            let next_table = addr_of!(self.tables[self.used]) as u64;
            entry.set_translation(next_table, vt.nps_entry_flags(NestedPagingStructureEntryType::Rwx));
            self.used += 1;
        }
        entry
    }
}
