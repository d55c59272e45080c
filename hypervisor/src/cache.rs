//! Shadow of the guest's MTRR/PAT/(AMD) SYSCFG cache-control state.
//!
//! The guest is allowed to read and write its own view of these registers,
//! but the memory type actually applied to nested paging structure entries
//! is computed here from the shadow, not from the hardware's own MTRRs
//! (which continue to reflect the host's physical memory map). Field names
//! and sizes are taken from `cache.h`.

pub(crate) const MTRR_VCNT_MAX: usize = 10;
pub(crate) const NUM_MTRR_FIX: usize = 11;

/// Memory types as encoded in MTRR/PAT entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MemoryType {
    Uncacheable,
    WriteCombining,
    WriteThrough,
    WriteProtect,
    WriteBack,
}

impl MemoryType {
    fn from_raw(v: u8) -> Self {
        match v & 0b111 {
            0 => Self::Uncacheable,
            1 => Self::WriteCombining,
            4 => Self::WriteThrough,
            5 => Self::WriteProtect,
            6 => Self::WriteBack,
            // Reserved encodings behave as uncacheable, the conservative
            // choice for an unimplemented memory type.
            _ => Self::Uncacheable,
        }
    }

    fn to_raw(self) -> u8 {
        match self {
            Self::Uncacheable => 0,
            Self::WriteCombining => 1,
            Self::WriteThrough => 4,
            Self::WriteProtect => 5,
            Self::WriteBack => 6,
        }
    }
}

/// The guest-visible register set: PAT, MTRR_DEF_TYPE, variable-range MTRRs,
/// fixed-range MTRRs, and (AMD only) SYSCFG/TOP_MEM2. Mirrors `cache_regs`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CacheRegs {
    pub(crate) pat_data: [u8; 8],
    pub(crate) mtrr_def_type: u64,
    pub(crate) mtrr_physbase: [u64; MTRR_VCNT_MAX],
    pub(crate) mtrr_physmask: [u64; MTRR_VCNT_MAX],
    pub(crate) mtrr_fix: [u64; NUM_MTRR_FIX],
    pub(crate) syscfg: u64,
    pub(crate) top_mem2: u64,
}

impl Default for CacheRegs {
    fn default() -> Self {
        Self {
            // Intel SDM default PAT value on reset.
            pat_data: [6, 4, 0, 0, 6, 4, 0, 0],
            mtrr_def_type: 0,
            mtrr_physbase: [0; MTRR_VCNT_MAX],
            mtrr_physmask: [0; MTRR_VCNT_MAX],
            mtrr_fix: [0; NUM_MTRR_FIX],
            syscfg: 0,
            top_mem2: 0,
        }
    }
}

/// Per-vCPU cache shadow state. Mirrors `cache_data`.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct CacheData {
    pub(crate) guest: CacheRegs,
    /// When set, fixed-range MTRR accesses pass straight through instead of
    /// being shadowed, used while MTRRs are not yet enabled.
    pub(crate) pass_mtrrfix: bool,
}

impl CacheData {
    pub(crate) fn get_gpat(&self) -> u64 {
        u64::from_le_bytes(self.guest.pat_data)
    }

    /// Writes the shadow PAT, rejecting a value that sets any of the
    /// reserved bits 7:3 of any of the 8 entries. Real hardware raises #GP
    /// on such a write; the caller is expected to inject it when this
    /// returns `false`.
    pub(crate) fn set_gpat(&mut self, pat: u64) -> bool {
        const RESERVED_BITS: u8 = 0xF8;
        if pat.to_le_bytes().iter().any(|b| b & RESERVED_BITS != 0) {
            return false;
        }
        self.guest.pat_data = pat.to_le_bytes();
        true
    }

    /// Returns the guest's declared memory type for `gphys` according to the
    /// shadowed variable-range MTRRs, falling back to `mtrr_def_type`'s
    /// default type when nothing matches. Mirrors `cache_get_gmtrr_type`.
    pub(crate) fn get_gmtrr_type(&self, gphys: u64) -> MemoryType {
        for i in 0..MTRR_VCNT_MAX {
            let mask = self.guest.mtrr_physmask[i];
            if mask & 0x800 == 0 {
                continue; // not valid
            }
            let mask_addr = mask & !0xFFF;
            let base = self.guest.mtrr_physbase[i] & !0xFFF;
            if gphys & mask_addr == base & mask_addr {
                return MemoryType::from_raw(self.guest.mtrr_physbase[i] as u8);
            }
        }
        MemoryType::from_raw(self.guest.mtrr_def_type as u8)
    }

    /// Composes the effective memory-type attribute for `gphys`, combining
    /// the MTRR-derived type with the guest-requested PAT attribute `gattr`
    /// (the PAT index bits of a leaf translation entry). Mirrors
    /// `cache_get_attr`.
    pub(crate) fn get_attr(&self, gphys: u64, gattr: u8) -> MemoryType {
        let pat_index = (gattr & 0b111) as usize;
        let pat_type = MemoryType::from_raw(self.guest.pat_data[pat_index]);
        let mtrr_type = self.get_gmtrr_type(gphys);
        // The weaker (more conservative) of the two always wins: UC beats
        // everything, then WT/WP, then WB is the strongest.
        combine(mtrr_type, pat_type)
    }

    pub(crate) fn gmtrrcap(&self) -> u64 {
        (MTRR_VCNT_MAX as u64) | 0x400 // fixed-range MTRRs supported
    }

    pub(crate) fn get_gmtrr(&self, msr_num: u32) -> Option<u64> {
        match msr_num {
            0x0FE => Some(self.gmtrrcap()),
            0x2FF => Some(self.guest.mtrr_def_type),
            0x200..=0x20F => {
                let i = ((msr_num - 0x200) / 2) as usize;
                if i >= MTRR_VCNT_MAX {
                    return None;
                }
                Some(if msr_num % 2 == 0 {
                    self.guest.mtrr_physbase[i]
                } else {
                    self.guest.mtrr_physmask[i]
                })
            }
            0x250 | 0x258 | 0x259 | 0x268..=0x26F => {
                Some(self.guest.mtrr_fix[fixed_mtrr_index(msr_num)])
            }
            _ => None,
        }
    }

    /// Writes a shadowed MTRR register, validating reserved bits and memory
    /// type encodings the way real hardware does. Returns `false` both when
    /// `msr_num` is not one of ours (the caller should fall through to a
    /// real `wrmsr`) and when it is ours but the value violates a reserved
    /// field (the caller should inject #GP instead).
    pub(crate) fn set_gmtrr(&mut self, msr_num: u32, value: u64) -> bool {
        match msr_num {
            0x2FF => {
                // Bits 63:12 and 9:3 are reserved; bits 11/10 are E/FE.
                const RESERVED: u64 = !0xFFFu64 | 0x3F8;
                if value & RESERVED != 0 || !is_valid_mtrr_type(value as u8) {
                    return false;
                }
                self.guest.mtrr_def_type = value;
                true
            }
            0x200..=0x20F => {
                let i = ((msr_num - 0x200) / 2) as usize;
                if i >= MTRR_VCNT_MAX {
                    return false;
                }
                if msr_num % 2 == 0 {
                    // PhysBase: bits 11:3 reserved, bits 2:0 a valid type.
                    if value & 0xFF8 != 0 || !is_valid_mtrr_type(value as u8) {
                        return false;
                    }
                    self.guest.mtrr_physbase[i] = value;
                } else {
                    // PhysMask: bits 10:0 reserved, bit 11 is the V flag.
                    if value & 0x7FF != 0 {
                        return false;
                    }
                    self.guest.mtrr_physmask[i] = value;
                }
                true
            }
            0x250 | 0x258 | 0x259 | 0x268..=0x26F => {
                if value.to_le_bytes().iter().any(|&b| !is_valid_mtrr_type(b)) {
                    return false;
                }
                self.guest.mtrr_fix[fixed_mtrr_index(msr_num)] = value;
                true
            }
            _ => false,
        }
    }

    /// AMD-only SYSCFG (`0xC001_0010`) and TOP_MEM2 (`0xC001_001D`).
    pub(crate) fn get_gmsr_amd(&self, msr_num: u32) -> Option<u64> {
        match msr_num {
            0xC001_0010 => Some(self.guest.syscfg),
            0xC001_001D => Some(self.guest.top_mem2),
            _ => None,
        }
    }

    pub(crate) fn set_gmsr_amd(&mut self, msr_num: u32, value: u64) -> bool {
        match msr_num {
            0xC001_0010 => {
                self.guest.syscfg = value;
                true
            }
            0xC001_001D => {
                self.guest.top_mem2 = value;
                true
            }
            _ => false,
        }
    }

    /// True when every page in `[gphys, gphys + size)` would be assigned the
    /// same MTRR-derived memory type, ie a nested-paging entry can cover the
    /// whole range with a single attribute. Mirrors `cache_gmtrr_type_equal`.
    pub(crate) fn gmtrr_type_equal(&self, gphys: u64, size: u64) -> bool {
        let first = self.get_gmtrr_type(gphys);
        let mut addr = gphys;
        while addr < gphys + size {
            if self.get_gmtrr_type(addr) != first {
                return false;
            }
            addr += 0x1000;
        }
        true
    }
}

/// MTRRs only ever encode UC/WC/WT/WP/WB; unlike PAT there is no reserved
/// encoding that falls back to uncacheable, a write carrying one is invalid.
fn is_valid_mtrr_type(v: u8) -> bool {
    matches!(v & 0b111, 0 | 1 | 4 | 5 | 6) && v & !0b111 == 0
}

/// True when `msr_num` is one of the MTRR-family MSRs this module shadows,
/// independent of whether any particular value written to it is valid.
/// `dispatch_msr` uses this to decide whether a `set_gmtrr` failure means
/// "inject #GP" (recognized, bad value) or "not ours" (fall through to a
/// real `wrmsr`).
pub(crate) fn is_mtrr_msr(msr_num: u32) -> bool {
    matches!(
        msr_num,
        0x0FE | 0x2FF | 0x200..=0x20F | 0x250 | 0x258 | 0x259 | 0x268..=0x26F
    )
}

/// True for the AMD-only SYSCFG/TOP_MEM2 pair, the `set_gmsr_amd` analogue
/// of [`is_mtrr_msr`].
pub(crate) fn is_amd_cache_msr(msr_num: u32) -> bool {
    matches!(msr_num, 0xC001_0010 | 0xC001_001D)
}

fn fixed_mtrr_index(msr_num: u32) -> usize {
    match msr_num {
        0x250 => 0,
        0x258 => 1,
        0x259 => 2,
        0x268..=0x26F => 3 + (msr_num - 0x268) as usize,
        _ => unreachable!(),
    }
}

fn combine(a: MemoryType, b: MemoryType) -> MemoryType {
    fn rank(t: MemoryType) -> u8 {
        match t {
            MemoryType::Uncacheable => 0,
            MemoryType::WriteCombining => 1,
            MemoryType::WriteThrough => 2,
            MemoryType::WriteProtect => 3,
            MemoryType::WriteBack => 4,
        }
    }
    if rank(a) <= rank(b) {
        a
    } else {
        b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_variable_mtrr_falls_back_to_default_type() {
        let mut c = CacheData::default();
        c.guest.mtrr_def_type = MemoryType::WriteBack.to_raw() as u64;
        assert_eq!(c.get_gmtrr_type(0x1000), MemoryType::WriteBack);
    }

    #[test]
    fn matching_variable_mtrr_overrides_default() {
        let mut c = CacheData::default();
        c.guest.mtrr_def_type = MemoryType::WriteBack.to_raw() as u64;
        c.guest.mtrr_physbase[0] = 0x10_0000 | MemoryType::Uncacheable.to_raw() as u64;
        c.guest.mtrr_physmask[0] = (!0xFFFFFu64 & 0xF_FFFF_FFFF) | 0x800;
        assert_eq!(c.get_gmtrr_type(0x10_0000), MemoryType::Uncacheable);
    }

    #[test]
    fn combine_picks_weaker_type() {
        assert_eq!(combine(MemoryType::WriteBack, MemoryType::Uncacheable), MemoryType::Uncacheable);
        assert_eq!(combine(MemoryType::WriteThrough, MemoryType::WriteBack), MemoryType::WriteThrough);
    }

    #[test]
    fn gpat_round_trips_through_raw_bytes() {
        let mut c = CacheData::default();
        assert!(c.set_gpat(0x0007_0406_0007_0406));
        assert_eq!(c.get_gpat(), 0x0007_0406_0007_0406);
    }
}
