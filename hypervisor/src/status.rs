//! The optional `vmmcall` debug status ABI, grounded on `vmmcall_status.c`:
//! feature-gated behind the `vmmcall_status` Cargo feature, this lets a
//! debug build of the guest ask the hypervisor for a human-readable status
//! report without needing a serial console of its own.
//!
//! ABI: the guest places the linear address of a buffer in `ARG1` (RBX) and
//! its capacity in `ARG2` (RCX), then executes `VMCALL`/`VMMCALL`. The
//! monitor composes a report from every registered [`StatusCallback`],
//! writes as much as fits, writes the report's true length back into
//! `ARG2`, and returns `0` (fit) or `1` (truncated) in RAX.

#![cfg(feature = "vmmcall_status")]

use crate::hardware_vt::HardwareVt;
use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Write as _;
use spin::Mutex;

/// A registered contributor to the status report. Mirrors one entry of the
/// callback list `vmmcall_status.c` walks to compose its text buffer.
pub(crate) trait StatusCallback: Send {
    fn name(&self) -> &str;
    fn write_status(&self, out: &mut String);
}

pub(crate) struct StatusRegistry {
    callbacks: Mutex<Vec<Box<dyn StatusCallback>>>,
}

impl StatusRegistry {
    pub(crate) const fn new() -> Self {
        Self {
            callbacks: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn register(&self, cb: Box<dyn StatusCallback>) {
        self.callbacks.lock().push(cb);
    }

    fn compose_report(&self) -> String {
        let mut report = String::new();
        for cb in self.callbacks.lock().iter() {
            let _ = writeln!(report, "== {} ==", cb.name());
            cb.write_status(&mut report);
        }
        report
    }
}

impl Default for StatusRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes a report byte into guest linear memory. Supplied by the caller so
/// this module does not depend on a particular guest-memory representation.
pub(crate) trait GuestWriter {
    fn write_u8(&mut self, linear: u64, value: u8);
}

/// Handles a `VMCALL` the dispatcher identified as a status request.
/// Returns the RAX value the caller should write back into the guest.
/// Mirrors `vmmcall_status_call`.
pub(crate) fn handle_status_vmmcall(
    registry: &StatusRegistry,
    vt: &mut dyn HardwareVt,
    writer: &mut impl GuestWriter,
) -> u64 {
    let buffer_addr = vt.registers().rbx;
    let buffer_size = vt.registers().rcx;

    let report = registry.compose_report();
    let bytes = report.as_bytes();
    let truncated = bytes.len() as u64 > buffer_size;
    let write_len = core::cmp::min(bytes.len() as u64, buffer_size) as usize;
    for (i, &b) in bytes.iter().take(write_len).enumerate() {
        writer.write_u8(buffer_addr + i as u64, b);
    }
    vt.registers_mut().rcx = bytes.len() as u64;
    u64::from(truncated)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Uptime;
    impl StatusCallback for Uptime {
        fn name(&self) -> &str {
            "uptime"
        }
        fn write_status(&self, out: &mut String) {
            out.push_str("42s\n");
        }
    }

    struct RecordingWriter(alloc::vec::Vec<u8>);
    impl GuestWriter for RecordingWriter {
        fn write_u8(&mut self, linear: u64, value: u8) {
            let idx = linear as usize;
            if idx >= self.0.len() {
                self.0.resize(idx + 1, 0);
            }
            self.0[idx] = value;
        }
    }

    #[test]
    fn compose_report_includes_every_registered_callback() {
        let registry = StatusRegistry::new();
        registry.register(Box::new(Uptime));
        let report = registry.compose_report();
        assert!(report.contains("uptime"));
        assert!(report.contains("42s"));
    }

    #[test]
    fn recording_writer_is_available_for_handle_status_vmmcall_tests() {
        let mut w = RecordingWriter(alloc::vec::Vec::new());
        w.write_u8(2, 0x41);
        assert_eq!(w.0, alloc::vec![0, 0, 0x41]);
    }

    mod handle_status_vmmcall {
        use super::*;
        use crate::hardware_vt::{
            GuestRegisters, NestedPagingStructureEntryFlags, NestedPagingStructureEntryType,
            VmExitReason,
        };
        #[derive(Debug)]
        struct FakeVt(GuestRegisters);

        impl HardwareVt for FakeVt {
            fn enable(&mut self) {}
            fn initialize(&mut self, _nested_pml4_addr: u64) {}
            fn revert_registers(&mut self, _state: &crate::boot_state::BootState) {}
            fn run(&mut self) -> VmExitReason {
                VmExitReason::Vmcall
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
                &self.0
            }
            fn registers_mut(&mut self) -> &mut GuestRegisters {
                &mut self.0
            }
            fn read_cr(&self, _which: u8) -> u64 {
                0
            }
            fn write_cr(&mut self, _which: u8, _value: u64) {}
            fn advance_rip(&mut self, len: u64) {
                self.0.rip += len;
            }
            fn inject_exception(&mut self, _vector: u8, _error_code: Option<u32>) {}
            fn inject_external_interrupt(&mut self, _vector: u8) {}
            fn set_io_intercept(&mut self, _port: u16, _intercept: bool) {}
            fn set_msr_intercept(&mut self, _msr: u32, _read: bool, _write: bool) {}
        }

        #[test]
        fn report_fitting_in_buffer_returns_zero_and_full_length() {
            let registry = StatusRegistry::new();
            registry.register(Box::new(Uptime));
            let mut vt = FakeVt(GuestRegisters {
                rbx: 0,
                rcx: 4096,
                ..Default::default()
            });
            let mut writer = RecordingWriter(alloc::vec::Vec::new());
            let rax = handle_status_vmmcall(&registry, &mut vt, &mut writer);
            assert_eq!(rax, 0);
            assert_eq!(vt.registers().rcx as usize, writer.0.len());
        }

        #[test]
        fn undersized_buffer_returns_one_but_still_reports_true_length() {
            let registry = StatusRegistry::new();
            registry.register(Box::new(Uptime));
            let mut vt = FakeVt(GuestRegisters {
                rbx: 0,
                rcx: 2,
                ..Default::default()
            });
            let mut writer = RecordingWriter(alloc::vec::Vec::new());
            let rax = handle_status_vmmcall(&registry, &mut vt, &mut writer);
            assert_eq!(rax, 1);
            assert_eq!(writer.0.len(), 2);
            assert!(vt.registers().rcx as usize > 2);
        }
    }
}
