//! The per-logical-processor virtual CPU and the registry of every vCPU the
//! reference monitor has brought up.
//!
//! Ported from `vcpu.c`/`vcpu.h`: the original keeps one global singly-linked
//! list (`vcpu_list_head`) built by `load_new_vcpu`, walked by
//! `vcpu_list_foreach` for broadcast operations such as TLB shootdown after
//! an MMIO region changes. Here the list is the same arena+index [`List1`]
//! used by the scheduler rather than raw `next` pointers.

use crate::{
    cache::CacheData,
    hardware_vt::HardwareVt,
    list::{Linked, List1, NIL},
    paging::PagingEngine,
};
use alloc::boxed::Box;
use spin::Mutex;

pub(crate) const MAX_VCPUS: usize = 64;

pub(crate) type VcpuId = u16;

/// One logical processor's view of its guest: the vendor backend, the cache
/// (MTRR/PAT) shadow, the paging engine and the handful of scalar fields
/// `vcpu.c` tracked directly on `struct vcpu`.
pub(crate) struct Vcpu {
    pub(crate) vt: Box<dyn HardwareVt>,
    pub(crate) cache: CacheData,
    pub(crate) paging: PagingEngine,
    pub(crate) halt: bool,
    pub(crate) initialized: bool,
    pub(crate) tsc_offset: u64,
    /// Whether the exit dispatcher should still run its generic post-exit
    /// RIP advance. Set `true` at the top of every `dispatch_exit` call and
    /// cleared by a handler that injects a fault instead of letting the
    /// instruction retire (the fault's own RIP is the faulting instruction,
    /// not the one past it).
    pub(crate) updateip: bool,
    /// Software shadow of the guest's last-written EFER, including the
    /// EFER.LMA bit this monitor maintains itself (see `dispatch::update_efer_lma`).
    pub(crate) efer_shadow: u64,
    /// Remaining tries in the current bounded emulation window (the
    /// dispatcher's fallback to the `interp` module before it gives up and
    /// single-steps in hardware instead).
    pub(crate) interp_budget: u32,
}

struct Slot {
    next: u16,
    prev: u16,
    vcpu: Option<Vcpu>,
}

impl Linked for Slot {
    fn next(&self) -> u16 {
        self.next
    }
    fn set_next(&mut self, v: u16) {
        self.next = v;
    }
    fn prev(&self) -> u16 {
        self.prev
    }
    fn set_prev(&mut self, v: u16) {
        self.prev = v;
    }
}

struct Inner {
    slots: Box<[Slot]>,
    free: List1,
    live: List1,
}

/// The registry every physical CPU's vCPU is registered into on startup.
/// Replaces `vcpu_list_head`/`vcpu_list_lock`.
pub(crate) struct VcpuRegistry {
    inner: Mutex<Inner>,
}

impl VcpuRegistry {
    pub(crate) fn new() -> Self {
        let mut slots = alloc::vec::Vec::with_capacity(MAX_VCPUS);
        let mut free = List1::new();
        for _ in 0..MAX_VCPUS {
            slots.push(Slot {
                next: NIL,
                prev: NIL,
                vcpu: None,
            });
        }
        let mut slots = slots.into_boxed_slice();
        for i in 0..MAX_VCPUS {
            free.push_back(&mut slots, i as u16);
        }
        Self {
            inner: Mutex::new(Inner {
                slots,
                free,
                live: List1::new(),
            }),
        }
    }

    /// Registers a newly brought-up vCPU. Mirrors `load_new_vcpu`.
    pub(crate) fn register(&self, vcpu: Vcpu) -> VcpuId {
        let mut inner = self.inner.lock();
        let idx = inner.free.pop_front(&mut inner.slots).expect("out of vcpu slots");
        inner.slots[idx as usize].vcpu = Some(vcpu);
        inner.live.push_back(&mut inner.slots, idx);
        idx
    }

    /// Calls `func` with every registered vCPU, stopping early if it returns
    /// `true`. Mirrors `vcpu_list_foreach`.
    pub(crate) fn for_each(&self, mut func: impl FnMut(VcpuId, &mut Vcpu) -> bool) {
        let mut inner = self.inner.lock();
        let ids: alloc::vec::Vec<u16> = inner.live.iter(&inner.slots).collect();
        for id in ids {
            let vcpu = inner.slots[id as usize].vcpu.as_mut().expect("live slot with no vcpu");
            if func(id, vcpu) {
                break;
            }
        }
    }

    /// Runs `func` against a single vCPU by id.
    pub(crate) fn with<R>(&self, id: VcpuId, func: impl FnOnce(&mut Vcpu) -> R) -> R {
        let mut inner = self.inner.lock();
        let vcpu = inner.slots[id as usize].vcpu.as_mut().expect("no vcpu registered at id");
        func(vcpu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware_vt::{
        GuestRegisters, NestedPagingStructureEntryFlags, NestedPagingStructureEntryType,
        VmExitReason,
    };
    use core::fmt;

    #[derive(Debug)]
    struct FakeVt;

    impl fmt::Debug for FakeVt {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("FakeVt")
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
            unimplemented!()
        }
        fn registers_mut(&mut self) -> &mut GuestRegisters {
            unimplemented!()
        }
        fn read_cr(&self, _which: u8) -> u64 {
            0
        }
        fn write_cr(&mut self, _which: u8, _value: u64) {}
        fn advance_rip(&mut self, _len: u64) {}
        fn inject_exception(&mut self, _vector: u8, _error_code: Option<u32>) {}
        fn inject_external_interrupt(&mut self, _vector: u8) {}
        fn set_io_intercept(&mut self, _port: u16, _intercept: bool) {}
        fn set_msr_intercept(&mut self, _msr: u32, _read: bool, _write: bool) {}
        fn write_efer(&mut self, _value: u64) {}
    }

    fn fake_vcpu() -> Vcpu {
        Vcpu {
            vt: Box::new(FakeVt),
            cache: CacheData::default(),
            paging: PagingEngine::select(true, 4),
            halt: false,
            initialized: false,
            tsc_offset: 0,
            updateip: false,
            efer_shadow: 0,
            interp_budget: 0,
        }
    }

    #[test]
    fn register_then_for_each_visits_every_vcpu() {
        let registry = VcpuRegistry::new();
        registry.register(fake_vcpu());
        registry.register(fake_vcpu());
        let mut count = 0;
        registry.for_each(|_id, _vcpu| {
            count += 1;
            false
        });
        assert_eq!(count, 2);
    }

    #[test]
    fn for_each_can_stop_early() {
        let registry = VcpuRegistry::new();
        let first = registry.register(fake_vcpu());
        registry.register(fake_vcpu());
        let mut visited = alloc::vec::Vec::new();
        registry.for_each(|id, _vcpu| {
            visited.push(id);
            true
        });
        assert_eq!(visited, alloc::vec![first]);
    }

    #[test]
    fn with_mutates_the_targeted_vcpu() {
        let registry = VcpuRegistry::new();
        let id = registry.register(fake_vcpu());
        registry.with(id, |vcpu| vcpu.halt = true);
        registry.with(id, |vcpu| assert!(vcpu.halt));
    }
}
