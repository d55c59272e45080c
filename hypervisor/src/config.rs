//! The module containing various constants that may be modified by developers.
//!
//! Most of the actual strategy selection (SPT layout, the debug status ABI)
//! lives in Cargo features (see `Cargo.toml`) rather than here; this module
//! holds the constants that stay fixed regardless of which features are on.

/// The logging level.
pub(crate) const LOGGING_LEVEL: log::LevelFilter = log::LevelFilter::Trace;

/// The cooperative scheduler's time-slice for one vCPU, in TSC ticks, before
/// a `TimerExpiration` VM exit preempts it and `schedule()` picks the next
/// runnable thread. Mirrors the VMX-preemption-timer/SVM-equivalent value
/// `svm_paging_start`'s callers arm on every VM entry.
pub(crate) const GUEST_EXEC_TIMEOUT_IN_TSC: u64 = 200_000_000;

/// Number of preallocated nested paging structures (PDPT/PD/PT pages) each
/// vCPU's [`crate::npt::NestedPaging`] may allocate on demand. Sized for a
/// single guest identity-mapped up to a few GiB; raise if the guest's
/// physical address space is larger.
pub(crate) const NESTED_TABLE_CAPACITY: usize = 512;
