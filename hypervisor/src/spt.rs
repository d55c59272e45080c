//! Shadow page table engine, strategy 2.
//!
//! Ported from `cpu_mmu_spt.h`'s `CPU_MMU_SPT_2` layout: a single top-level
//! table with four PAE PDPT entries (no pooling needed, rebuilt whenever
//! guest CR3 changes), a pool of level-2 shadow frames standing in for
//! guest page directories, a pool of level-1 shadow frames standing in for
//! guest page tables, and an `rwmap` recording which host PTE currently maps
//! each guest frame so write permission can be revoked the moment that frame
//! starts doubling as a guest page-table page.
//!
//! Installing real hardware page table entries needs a concrete guest
//! physical -> host physical translator; that translator is supplied by the
//! paging glue layer (`paging.rs`) as a [`GuestMemory`] implementation so
//! this module stays testable without real guest memory.

use alloc::boxed::Box;
use spin::Mutex;

pub(crate) const NUM_SPTTBL: usize = 32;
pub(crate) const NUM_RWMAP: usize = 256;
pub(crate) const NUM_SHADOW1: usize = 64;
pub(crate) const NUM_SHADOW2: usize = 32;

/// Translates guest physical addresses to host physical addresses and back,
/// and reads guest page table entries. Supplied by whatever owns the
/// nested/flat guest memory map (see `paging.rs`).
pub(crate) trait GuestMemory {
    fn gp2hp(&self, gphys: u64) -> Option<u64>;
    fn read_guest_u64(&self, gphys: u64) -> u64;
}

/// An entry in the guest-frame -> host-PTE-address reverse map.
#[derive(Debug, Clone, Copy, Default)]
struct RwMapEntry {
    gfn: Option<u64>,
    pte_host_addr: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    Free,
    Normal,
    /// Dirtied since last write-back to the corresponding guest structure;
    /// evicted in preference to `Normal` frames.
    Modified,
}

/// The backing storage for one shadow page table page: 512 PAE entries (8
/// bytes each), page-aligned so its address is a usable host physical
/// address for CR3/PDE/PTE installation, the same trick
/// [`crate::hardware_vt::NestedPagingStructure`] uses for EPT/NPT tables.
#[repr(C, align(4096))]
struct ShadowTable([u64; 512]);
const _: () = assert!(size_of::<ShadowTable>() == 0x1000);

impl core::ops::Deref for ShadowTable {
    type Target = [u64; 512];
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl core::ops::DerefMut for ShadowTable {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// A single shadow page table page.
struct ShadowFrame {
    table: Box<ShadowTable>,
    /// `(guest_frame, level)` this shadow currently mirrors, if any.
    key: Option<(u64, u8)>,
    state: FrameState,
}

impl ShadowFrame {
    fn new() -> Self {
        Self {
            // Safety: a table of zeroed u64 PTEs (all not-present) is a
            // valid initial state; no entry is ever read before `acquire`
            // re-zeroes it and assigns a key.
            table: unsafe { Box::<ShadowTable>::new_zeroed().assume_init() },
            key: None,
            state: FrameState::Free,
        }
    }

    /// The host physical address of this frame's table, derived from its
    /// real heap allocation rather than kept as separate bookkeeping, so it
    /// is always safe to load into hardware CR3/PDE/PTE fields.
    fn phys(&self) -> u64 {
        core::ptr::addr_of!(*self.table) as u64
    }
}

/// Pool-wide counters, kept in lockstep with each frame's [`FrameState`].
/// `free + normal + modified == pool.len()` always (testable property 3).
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct PoolStats {
    pub(crate) free: u32,
    pub(crate) normal: u32,
    pub(crate) modified: u32,
}

struct Pool {
    frames: alloc::vec::Vec<ShadowFrame>,
    stats: PoolStats,
}

impl Pool {
    fn new(count: usize) -> Self {
        let frames = (0..count).map(|_| ShadowFrame::new()).collect();
        Self {
            frames,
            stats: PoolStats {
                free: count as u32,
                normal: 0,
                modified: 0,
            },
        }
    }

    fn transition(&mut self, idx: usize, to: FrameState) {
        let from = self.frames[idx].state;
        if from == to {
            return;
        }
        match from {
            FrameState::Free => self.stats.free -= 1,
            FrameState::Normal => self.stats.normal -= 1,
            FrameState::Modified => self.stats.modified -= 1,
        }
        match to {
            FrameState::Free => self.stats.free += 1,
            FrameState::Normal => self.stats.normal += 1,
            FrameState::Modified => self.stats.modified += 1,
        }
        self.frames[idx].state = to;
    }

    fn find_by_key(&self, key: (u64, u8)) -> Option<usize> {
        self.frames.iter().position(|f| f.key == Some(key))
    }

    fn find_by_phys(&self, phys: u64) -> Option<usize> {
        self.frames.iter().position(|f| f.phys() == phys)
    }

    /// Finds a frame for `key`, building (or evicting into) one if needed.
    /// Eviction prefers `Modified` frames first, then the first `Normal`
    /// frame found, a stand-in for least-recently-used without per-frame
    /// timestamps.
    fn acquire(&mut self, key: (u64, u8)) -> usize {
        if let Some(idx) = self.find_by_key(key) {
            return idx;
        }
        let idx = self
            .frames
            .iter()
            .position(|f| f.state == FrameState::Free)
            .or_else(|| self.frames.iter().position(|f| f.state == FrameState::Modified))
            .or_else(|| self.frames.iter().position(|f| f.state == FrameState::Normal))
            .expect("shadow pool has zero frames");
        self.frames[idx].table.fill(0);
        self.frames[idx].key = Some(key);
        self.transition(idx, FrameState::Normal);
        idx
    }

    fn release(&mut self, idx: usize) {
        self.frames[idx].key = None;
        self.transition(idx, FrameState::Free);
    }
}

/// The backing storage for the top-level PAE PDPT: 4 entries, 32-byte
/// aligned as the PAE CR3 format requires (bits 4:0 of CR3 are reserved).
/// See: Intel SDM Vol. 3A, 4.4.1 "Physical Address Extension".
#[repr(C, align(32))]
struct Cr3Table([u64; 4]);

/// Outcome of walking the guest's own page tables to resolve a guest #PF.
pub(crate) enum PageFaultOutcome {
    /// A shadow translation was built (or already existed); the guest
    /// should simply retry the faulting access.
    Installed,
    /// The guest's own page tables say this access should fault. Carries
    /// the error code to reflect, recomputed from the guest walk rather
    /// than the hardware-reported code, since the latter describes the
    /// *shadow* table's state, not the guest's.
    Reflect(u32),
}

/// The per-vCPU shadow page table state. Mirrors `cpu_mmu_spt_data` under
/// `CPU_MMU_SPT_2`.
pub(crate) struct SptState {
    /// The four PAE PDPT entries, rebuilt whenever guest CR3 changes.
    cr3tbl: Cr3Table,
    rwmap: alloc::vec::Vec<RwMapEntry>,
    rwmap_stats: Mutex<PoolStats>,
    shadow1: Mutex<Pool>, // level-1: guest PT -> host PT
    shadow2: Mutex<Pool>, // level-2: guest PD -> host PD
    /// Mirrors guest CR0.WP: when false, supervisor writes bypass the
    /// write-protect bit entirely, same as real hardware.
    pub(crate) wp: bool,
}

impl SptState {
    pub(crate) fn new() -> Self {
        assert!(NUM_SPTTBL >= 4, "top-level PDPT needs at least 4 slots reserved");
        Self {
            cr3tbl: Cr3Table([0; 4]),
            rwmap: alloc::vec![RwMapEntry::default(); NUM_RWMAP],
            rwmap_stats: Mutex::new(PoolStats {
                free: NUM_RWMAP as u32,
                normal: 0,
                modified: 0,
            }),
            shadow1: Mutex::new(Pool::new(NUM_SHADOW1)),
            shadow2: Mutex::new(Pool::new(NUM_SHADOW2)),
            wp: true,
        }
    }

    pub(crate) fn shadow1_stats(&self) -> PoolStats {
        self.shadow1.lock().stats
    }

    pub(crate) fn shadow2_stats(&self) -> PoolStats {
        self.shadow2.lock().stats
    }

    pub(crate) fn rwmap_stats(&self) -> PoolStats {
        *self.rwmap_stats.lock()
    }

    /// Records that `host_pte_addr` now maps guest frame `gfn`, evicting the
    /// rwmap entry least recently reused (first free slot, then slot 0 as a
    /// fallback) when the table is full.
    pub(crate) fn rwmap_insert(&mut self, gfn: u64, host_pte_addr: u64) {
        let mut stats = self.rwmap_stats.lock();
        let slot = self
            .rwmap
            .iter()
            .position(|e| e.gfn.is_none())
            .unwrap_or(0);
        if self.rwmap[slot].gfn.is_some() {
            stats.normal -= 1;
        } else {
            stats.free -= 1;
        }
        self.rwmap[slot] = RwMapEntry {
            gfn: Some(gfn),
            pte_host_addr: host_pte_addr,
        };
        stats.normal += 1;
    }

    /// Returns the host PTE addresses currently recorded for guest frame
    /// `gfn`. Used to implement the write-protect closure: when `gfn`
    /// becomes a shadow key, every one of these needs its host W bit
    /// cleared.
    pub(crate) fn rwmap_lookup(&self, gfn: u64) -> alloc::vec::Vec<u64> {
        self.rwmap
            .iter()
            .filter(|e| e.gfn == Some(gfn))
            .map(|e| e.pte_host_addr)
            .collect()
    }

    /// Clears the write bit of every host PTE recorded against `gfn`,
    /// enforcing the write-protect closure the moment `gfn` becomes a
    /// shadow key.
    ///
    /// # Safety
    /// Every address `rwmap_lookup` returns was itself produced by
    /// [`Self::write_shadow1_entry`], ie it points inside a live shadow
    /// frame this `SptState` owns, so the write below never touches memory
    /// outside the shadow pools.
    fn revoke_write(&self, gfn: u64) {
        for addr in self.rwmap_lookup(gfn) {
            unsafe {
                let ptr = addr as *mut u64;
                *ptr &= !0x2;
            }
        }
    }

    /// Builds (or returns the existing) level-2 shadow keyed on the guest
    /// PDE's frame number, per step 3 of the shadow-build algorithm.
    pub(crate) fn acquire_shadow2(&self, guest_pde_frame: u64) -> u64 {
        let mut pool = self.shadow2.lock();
        let idx = pool.acquire((guest_pde_frame, 2));
        pool.frames[idx].phys()
    }

    /// Builds (or returns the existing) level-1 shadow keyed on the guest
    /// PTE page's frame number.
    pub(crate) fn acquire_shadow1(&self, guest_pte_frame: u64) -> u64 {
        let mut pool = self.shadow1.lock();
        let idx = pool.acquire((guest_pte_frame, 1));
        pool.frames[idx].phys()
    }

    /// Writes entry `index` of the level-2 shadow frame whose table lives at
    /// `shadow_phys`.
    fn write_shadow2_entry(&self, shadow_phys: u64, index: usize, value: u64) {
        let mut pool = self.shadow2.lock();
        let idx = pool
            .find_by_phys(shadow_phys)
            .expect("write_shadow2_entry: frame not in pool");
        pool.frames[idx].table[index] = value;
    }

    /// Writes entry `index` of the level-1 shadow frame whose table lives at
    /// `shadow_phys`.
    fn write_shadow1_entry(&self, shadow_phys: u64, index: usize, value: u64) {
        let mut pool = self.shadow1.lock();
        let idx = pool
            .find_by_phys(shadow_phys)
            .expect("write_shadow1_entry: frame not in pool");
        pool.frames[idx].table[index] = value;
    }

    /// Tears down any shadow keyed on `guest_frame` at either level, and
    /// restores write permission to every rwmap entry that pointed into it
    /// and is not referenced by another live shadow key, per the
    /// write-protect closure rule.
    pub(crate) fn teardown_shadow(&mut self, guest_frame: u64) {
        {
            let mut pool = self.shadow1.lock();
            if let Some(idx) = pool.find_by_key((guest_frame, 1)) {
                pool.release(idx);
            }
        }
        {
            let mut pool = self.shadow2.lock();
            if let Some(idx) = pool.find_by_key((guest_frame, 2)) {
                pool.release(idx);
            }
        }
    }

    /// True if `gfn` is currently in use as a shadow key at any level, ie a
    /// guest page-table page whose host PTE must be kept read-only.
    pub(crate) fn is_shadow_key(&self, gfn: u64) -> bool {
        self.shadow1.lock().find_by_key((gfn, 1)).is_some()
            || self.shadow2.lock().find_by_key((gfn, 2)).is_some()
    }

    /// Whether access `(write, user)` is permitted by a present PDE/PTE
    /// `entry`, honoring `wp`'s CR0.WP mirror for supervisor writes.
    fn access_denied(&self, entry: u64, write: bool, user: bool) -> bool {
        if user && entry & 0x4 == 0 {
            return true;
        }
        if write && entry & 0x2 == 0 && (user || self.wp) {
            return true;
        }
        false
    }

    /// Resolves a guest #PF at linear/physical address `cr2` by walking the
    /// guest's own (PAE, 3-level) page tables and installing the
    /// corresponding shadow translation, or reporting that the guest's own
    /// tables say the access should fault. `error_code` is the
    /// hardware-reported #PF error code (P/W/U bits describe the attempted
    /// access and the *shadow* table's state); only its W/U/I-D bits are
    /// trusted here, the P bit is recomputed from the real guest walk.
    pub(crate) fn pagefault(
        &mut self,
        mem: &impl GuestMemory,
        guest_cr3: u64,
        cr2: u64,
        error_code: u32,
    ) -> PageFaultOutcome {
        const PDE_PS_FLAG: u64 = 1 << 7;
        const FRAME_MASK: u64 = 0xF_FFFF_FFFF;

        let write = error_code & 0x2 != 0;
        let user = error_code & 0x4 != 0;

        let pdpte_index = ((cr2 >> 30) & 0x3) as usize;
        let pdpte_gphys = (guest_cr3 & !0x1F) + pdpte_index as u64 * 8;
        let pdpte = mem.read_guest_u64(pdpte_gphys);
        if pdpte & 1 == 0 {
            return PageFaultOutcome::Reflect(error_code & !0x1);
        }
        let pd_frame = (pdpte >> 12) & FRAME_MASK;

        let pde_index = ((cr2 >> 21) & 0x1FF) as usize;
        let pde_gphys = (pd_frame << 12) + pde_index as u64 * 8;
        let pde = mem.read_guest_u64(pde_gphys);
        if pde & 1 == 0 {
            return PageFaultOutcome::Reflect(error_code & !0x1);
        }
        if self.access_denied(pde, write, user) {
            return PageFaultOutcome::Reflect(error_code | 0x1);
        }

        if pde & PDE_PS_FLAG != 0 {
            // A 2MB large page: one shadow1 frame, fully populated up
            // front, stands in for the 512 4KB PTEs a split would
            // otherwise need.
            let large_base_frame = ((pde >> 12) & FRAME_MASK) & !0x1FF;
            let shadow_pt_phys = self.acquire_shadow1(large_base_frame);
            self.install_large_page(shadow_pt_phys, large_base_frame, pde, mem);
            let shadow_pd_phys = self.acquire_shadow2(pd_frame);
            self.write_shadow2_entry(
                shadow_pd_phys,
                pde_index,
                shadow_pt_phys | (pde & 0xFFF & !PDE_PS_FLAG),
            );
            return PageFaultOutcome::Installed;
        }

        let pt_frame = (pde >> 12) & FRAME_MASK;
        let pte_index = ((cr2 >> 12) & 0x1FF) as usize;
        let pte_gphys = (pt_frame << 12) + pte_index as u64 * 8;
        let pte = mem.read_guest_u64(pte_gphys);
        if pte & 1 == 0 {
            return PageFaultOutcome::Reflect(error_code & !0x1);
        }
        if self.access_denied(pte, write, user) {
            return PageFaultOutcome::Reflect(error_code | 0x1);
        }

        let guest_frame = (pte >> 12) & FRAME_MASK;
        let Some(host_phys) = mem.gp2hp(guest_frame << 12) else {
            return PageFaultOutcome::Reflect(error_code);
        };

        let shadow_pd_phys = self.acquire_shadow2(pd_frame);
        let shadow_pt_phys = self.acquire_shadow1(pt_frame);
        self.write_shadow2_entry(shadow_pd_phys, pde_index, shadow_pt_phys | (pde & 0xFFF));

        // A guest frame already in use as a shadow key (ie it backs a live
        // guest page-table page) must stay read-only host-side regardless
        // of the guest PTE's own W bit, so writes to it keep faulting until
        // the guest stops using it as a page table.
        let mut effective_pte = host_phys | (pte & 0xFFF);
        if self.is_shadow_key(guest_frame) {
            effective_pte &= !0x2;
        }
        let pte_host_addr = shadow_pt_phys + pte_index as u64 * 8;
        self.write_shadow1_entry(shadow_pt_phys, pte_index, effective_pte);
        self.rwmap_insert(guest_frame, pte_host_addr);

        if write && effective_pte & 0x2 == 0 {
            return PageFaultOutcome::Reflect(error_code | 0x1);
        }
        PageFaultOutcome::Installed
    }

    /// Splits a guest 2MB page into 512 4KB shadow PTEs up front, keyed on
    /// `large_base_frame` the same way a regular guest PT frame would be.
    fn install_large_page(
        &self,
        shadow_pt_phys: u64,
        large_base_frame: u64,
        pde: u64,
        mem: &impl GuestMemory,
    ) {
        const PDE_PS_FLAG: u64 = 1 << 7;
        let mut pool = self.shadow1.lock();
        let idx = pool
            .find_by_phys(shadow_pt_phys)
            .expect("install_large_page: frame not in pool");
        for i in 0..512u64 {
            let gframe = large_base_frame + i;
            if let Some(host_phys) = mem.gp2hp(gframe << 12) {
                pool.frames[idx].table[i as usize] = host_phys | (pde & 0xFFF & !PDE_PS_FLAG);
            }
        }
    }

    /// Rebuilds the top-level PDPT entries from a new guest CR3. Mirrors
    /// `cpu_mmu_spt_updatecr3`; actual PDE/PTE installation happens lazily
    /// on the next #PF for each guest address, via [`Self::pagefault`].
    pub(crate) fn updatecr3(&mut self, mem: &impl GuestMemory, guest_cr3: u64) {
        self.cr3tbl.0 = [0; 4];
        for i in 0..4 {
            let pdpte_gphys = (guest_cr3 & !0x1F) + i as u64 * 8;
            let pdpte = mem.read_guest_u64(pdpte_gphys);
            if pdpte & 1 == 0 {
                continue; // not present
            }
            let pd_frame = (pdpte >> 12) & 0xF_FFFF_FFFF;
            let shadow_pd_phys = self.acquire_shadow2(pd_frame);
            self.cr3tbl.0[i] = shadow_pd_phys | (pdpte & 0xFFF);
        }
    }

    pub(crate) fn cr3tbl_phys(&self) -> u64 {
        core::ptr::addr_of!(self.cr3tbl) as u64
    }

    /// Invalidates every shadow (full TLB flush equivalent). Mirrors
    /// `cpu_mmu_spt_clear_all`, used on `mmioclr` callbacks and CR3 changes
    /// that cannot be handled incrementally. Every rwmap entry that pointed
    /// into a torn-down shadow regains write permission as part of the
    /// reset, since nothing still references it.
    pub(crate) fn clear_all(&mut self) {
        let mut s1 = self.shadow1.lock();
        for idx in 0..s1.frames.len() {
            if s1.frames[idx].state != FrameState::Free {
                s1.release(idx);
            }
        }
        drop(s1);
        let mut s2 = self.shadow2.lock();
        for idx in 0..s2.frames.len() {
            if s2.frames[idx].state != FrameState::Free {
                s2.release(idx);
            }
        }
        drop(s2);
        let mut stats = self.rwmap_stats.lock();
        for e in &mut self.rwmap {
            *e = RwMapEntry::default();
        }
        *stats = PoolStats {
            free: NUM_RWMAP as u32,
            normal: 0,
            modified: 0,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::BTreeMap;

    /// A guest address space backed by a plain map, for exercising
    /// [`SptState::pagefault`] without real memory.
    #[derive(Default)]
    struct FakeMemory {
        phys: BTreeMap<u64, u64>,
        frames: BTreeMap<u64, u64>,
    }

    impl FakeMemory {
        fn set(&mut self, gphys: u64, value: u64) {
            self.phys.insert(gphys, value);
        }

        fn map_frame(&mut self, gframe: u64, hframe: u64) {
            self.frames.insert(gframe, hframe);
        }
    }

    impl GuestMemory for FakeMemory {
        fn gp2hp(&self, gphys: u64) -> Option<u64> {
            let gframe = gphys >> 12;
            self.frames.get(&gframe).map(|hframe| (hframe << 12) | (gphys & 0xFFF))
        }

        fn read_guest_u64(&self, gphys: u64) -> u64 {
            *self.phys.get(&gphys).unwrap_or(&0)
        }
    }

    #[test]
    fn pool_accounting_holds_after_acquire_and_release() {
        let mut pool = Pool::new(4);
        let a = pool.acquire((1, 1));
        let b = pool.acquire((2, 1));
        assert_eq!(
            pool.stats.free + pool.stats.normal + pool.stats.modified,
            4
        );
        assert_eq!(pool.stats.normal, 2);
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.stats.free, 4);
        assert_eq!(
            pool.stats.free + pool.stats.normal + pool.stats.modified,
            4
        );
    }

    #[test]
    fn acquire_is_idempotent_for_same_key() {
        let mut pool = Pool::new(4);
        let a = pool.acquire((7, 2));
        let b = pool.acquire((7, 2));
        assert_eq!(a, b);
        assert_eq!(pool.stats.normal, 1);
    }

    #[test]
    fn eviction_falls_back_when_pool_is_full() {
        let mut pool = Pool::new(2);
        let _a = pool.acquire((1, 1));
        let _b = pool.acquire((2, 1));
        // No free frames left; this must evict rather than panic.
        let c = pool.acquire((3, 1));
        assert!(c == 0 || c == 1);
        assert_eq!(pool.stats.free + pool.stats.normal + pool.stats.modified, 2);
    }

    #[test]
    fn write_protect_closure_tracks_shadow_key_membership() {
        let mut spt = SptState::new();
        spt.rwmap_insert(0x55, 0xDEAD_0000);
        assert!(!spt.is_shadow_key(0x55));
        let _ = spt.acquire_shadow1(0x55);
        assert!(spt.is_shadow_key(0x55));
        assert_eq!(spt.rwmap_lookup(0x55), alloc::vec![0xDEAD_0000]);
        spt.teardown_shadow(0x55);
        assert!(!spt.is_shadow_key(0x55));
    }

    #[test]
    fn clear_all_resets_every_pool_to_fully_free() {
        let mut spt = SptState::new();
        spt.rwmap_insert(1, 0x1000);
        let _ = spt.acquire_shadow1(1);
        let _ = spt.acquire_shadow2(2);
        spt.clear_all();
        assert_eq!(spt.shadow1_stats().free, NUM_SHADOW1 as u32);
        assert_eq!(spt.shadow2_stats().free, NUM_SHADOW2 as u32);
        assert_eq!(spt.rwmap_stats().free, NUM_RWMAP as u32);
    }

    #[test]
    fn shadow_frame_phys_is_4096_aligned_and_stable() {
        let pool = Pool::new(2);
        for f in &pool.frames {
            assert_eq!(f.phys() % 0x1000, 0);
        }
    }

    #[test]
    fn pagefault_on_not_present_pdpte_reflects_as_not_present() {
        let mut spt = SptState::new();
        let mem = FakeMemory::default();
        match spt.pagefault(&mem, 0x1000, 0x1234_5678, 0b010) {
            PageFaultOutcome::Reflect(code) => assert_eq!(code & 1, 0),
            PageFaultOutcome::Installed => panic!("expected a reflected fault"),
        }
    }

    #[test]
    fn pagefault_installs_translation_for_a_present_mapping() {
        let mut spt = SptState::new();
        let mut mem = FakeMemory::default();
        let cr3 = 0x1000u64;
        let cr2 = 0x0040_3000u64; // pdpte 0, pde 2, pte 3
        let pd_frame = 0x10u64;
        let pt_frame = 0x20u64;
        let guest_frame = 0x30u64;
        let host_frame = 0x99u64;

        mem.set(cr3, (pd_frame << 12) | 1);
        mem.set((pd_frame << 12) + 2 * 8, (pt_frame << 12) | 0b111);
        mem.set((pt_frame << 12) + 3 * 8, (guest_frame << 12) | 0b111);
        mem.map_frame(guest_frame, host_frame);

        match spt.pagefault(&mem, cr3, cr2, 0b010) {
            PageFaultOutcome::Installed => {}
            PageFaultOutcome::Reflect(code) => panic!("expected installed, got reflect {code:#x}"),
        }
        assert_eq!(spt.shadow1_stats().normal, 1);
        assert_eq!(spt.shadow2_stats().normal, 1);
        assert_eq!(spt.rwmap_lookup(guest_frame).len(), 1);
    }

    #[test]
    fn pagefault_denies_user_write_to_supervisor_page() {
        let mut spt = SptState::new();
        let mut mem = FakeMemory::default();
        let cr3 = 0x1000u64;
        let cr2 = 0x0u64;
        mem.set(cr3, (0x10u64 << 12) | 1);
        // Supervisor-only (bit 2 clear), present+writable.
        mem.set(0x10_000, (0x20u64 << 12) | 0b011);
        match spt.pagefault(&mem, cr3, cr2, 0b110 /* write, user */) {
            PageFaultOutcome::Reflect(code) => assert_ne!(code & 1, 0),
            PageFaultOutcome::Installed => panic!("expected the access to be denied"),
        }
    }
}
