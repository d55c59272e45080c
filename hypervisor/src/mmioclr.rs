//! Registry of callbacks to run when a host-physical range is about to be
//! reused, so that any MMIO device model caching that range invalidates its
//! view of it. Ported from `mmioclr.c`.

use alloc::boxed::Box;
use alloc::vec::Vec;
use spin::RwLock;

/// A host-physical address range, inclusive `start`, exclusive-capped `end`
/// semantics matching `mmioclr_clear_hmap`'s `[hpst, hpend]` closed interval.
pub(crate) type PhysRange = (u64, u64);

/// A registered invalidation callback. Returns `true` when it claims the
/// notified range overlapped data it needed to drop.
pub(crate) trait ClearCallback: Send + Sync {
    fn clear(&self, start: u64, end: u64) -> bool;
}

/// The process-wide MMIO-clear registry, guarded by a single `RwLock`:
/// readers (`clear_hmap`) take the shared lock, register/unregister take the
/// exclusive lock.
#[derive(Default)]
pub(crate) struct MmioClr {
    callbacks: RwLock<Vec<Box<dyn ClearCallback>>>,
}

impl MmioClr {
    pub(crate) const fn new() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn register(&self, cb: Box<dyn ClearCallback>) {
        self.callbacks.write().push(cb);
    }

    /// Runs every registered callback over `[hpst, hpend]`, stopping at the
    /// first one that reports a hit. Mirrors `mmioclr_clear_hmap`.
    pub(crate) fn clear_hmap(&self, hpst: u64, hpend: u64) -> bool {
        let callbacks = self.callbacks.read();
        callbacks.iter().any(|cb| cb.clear(hpst, hpend))
    }

    /// Clears a guest-physical range by decomposing it into maximal
    /// host-physical runs via `gp2hp` and invoking [`Self::clear_hmap`] on
    /// each contiguous run. Mirrors `mmioclr_clear_gmap`.
    pub(crate) fn clear_gmap(&self, gpst: u64, gpend: u64, gp2hp: impl Fn(u64) -> u64) -> bool {
        const PAGE_SIZE: u64 = 0x1000;
        const PAGE_MASK: u64 = PAGE_SIZE - 1;

        let mut hp0 = gp2hp(gpst);
        let mut gp2 = (gpst | PAGE_MASK) + 1;
        let mut hp1 = hp0 | PAGE_MASK;
        while gp2 <= gpend {
            let hp2 = gp2hp(gp2);
            if hp1 + 1 != hp2 {
                if self.clear_hmap(hp0, hp1) {
                    return true;
                }
                hp0 = hp2;
            }
            hp1 = hp2 | PAGE_MASK;
            gp2 = (gp2 | PAGE_MASK) + 1;
        }
        self.clear_hmap(hp0, hp1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicBool, Ordering};

    struct Recorder(AtomicBool);

    impl ClearCallback for Recorder {
        fn clear(&self, _start: u64, _end: u64) -> bool {
            self.0.store(true, Ordering::SeqCst);
            false
        }
    }

    #[test]
    fn clear_hmap_invokes_every_registered_callback() {
        let registry = MmioClr::new();
        registry.register(Box::new(Recorder(AtomicBool::new(false))));
        registry.register(Box::new(Recorder(AtomicBool::new(false))));
        assert!(!registry.clear_hmap(0, 0xFFF));
    }

    #[test]
    fn clear_hmap_stops_at_first_hit() {
        struct AlwaysHit;
        impl ClearCallback for AlwaysHit {
            fn clear(&self, _s: u64, _e: u64) -> bool {
                true
            }
        }
        let registry = MmioClr::new();
        registry.register(Box::new(AlwaysHit));
        assert!(registry.clear_hmap(0, 0xFFF));
    }

    #[test]
    fn clear_gmap_decomposes_identity_map_into_one_run() {
        struct AlwaysHit;
        impl ClearCallback for AlwaysHit {
            fn clear(&self, start: u64, end: u64) -> bool {
                assert_eq!(start, 0x1000);
                assert_eq!(end, 0x3FFF);
                true
            }
        }
        let registry = MmioClr::new();
        registry.register(Box::new(AlwaysHit));
        assert!(registry.clear_gmap(0x1000, 0x3000, |gp| gp));
    }

    #[test]
    fn clear_gmap_splits_on_non_contiguous_host_mapping() {
        let seen = alloc::vec::Vec::<(u64, u64)>::new();
        let seen = spin::Mutex::new(seen);
        struct Recording<'a>(&'a spin::Mutex<alloc::vec::Vec<(u64, u64)>>);
        impl<'a> ClearCallback for Recording<'a> {
            fn clear(&self, start: u64, end: u64) -> bool {
                self.0.lock().push((start, end));
                false
            }
        }
        let registry = MmioClr::new();
        registry.register(Box::new(Recording(&seen)));
        // Guest page at 0x2000 maps to a host page far away from the first run.
        let gp2hp = |gp: u64| if gp < 0x2000 { gp } else { gp + 0x10_0000 };
        registry.clear_gmap(0x0000, 0x2FFF, gp2hp);
        let runs = seen.lock();
        assert_eq!(runs.as_slice(), [(0x0000, 0x1FFF), (0x10_2000, 0x10_2FFF)]);
    }
}
