//! The crate-wide error type used at module boundaries.
//!
//! Failures that are fatal and host-unrecoverable are not represented here;
//! those go through [`panic!`] directly (see `panic.rs`). This type covers
//! the "recoverable" and "boot-time failure" tiers only.

use core::fmt;

/// An error produced by a subsystem that a caller is expected to handle,
/// as opposed to a condition that warrants a panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VmmError {
    /// A shadow page table pool (rwmap, shadow1 or shadow2) had no free
    /// entry available to satisfy the request.
    SptPoolExhausted,

    /// The guest physical address does not have a loaded translation and no
    /// fault could be synthesized for it.
    TranslationNotFound,

    /// A single-step/bounded instruction emulation failed to decode or
    /// execute the instruction at the current guest `rip`.
    EmulationFailure,

    /// A requested MSR is outside of any of the ranges this hypervisor
    /// routes, and the guest default behavior applies instead.
    MsrNotRouted,

    /// Boot-time initialization of a subsystem could not complete, eg
    /// because the host does not provide a required CPU feature.
    InitializationFailed(&'static str),
}

impl fmt::Display for VmmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SptPoolExhausted => write!(f, "shadow page table pool exhausted"),
            Self::TranslationNotFound => write!(f, "guest physical address translation not found"),
            Self::EmulationFailure => write!(f, "instruction emulation failed"),
            Self::MsrNotRouted => write!(f, "msr not routed by this hypervisor"),
            Self::InitializationFailed(reason) => write!(f, "initialization failed: {reason}"),
        }
    }
}
