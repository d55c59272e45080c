//! External-interrupt passthrough callback chain. Ported from
//! `exint_pass.c`: on a hardware external-interrupt VM exit, every
//! registered callback gets a turn to look at (and potentially replace or
//! drop) the vector before it reaches the generic dispatcher, which is how
//! a passthrough device routes a real IRQ to its emulated counterpart
//! without the dispatcher needing to know devices exist.

use alloc::boxed::Box;
use alloc::vec::Vec;
use spin::Mutex;

/// A registered filter. Returns the (possibly rewritten) vector to keep
/// passing down the chain, or `None` to drop it, mirroring a callback
/// returning a negative vector number in the original.
pub(crate) trait ExintFilter: Send {
    fn filter(&self, vector: u8) -> Option<u8>;
}

/// The process-wide passthrough filter chain. Mirrors `intr_list`.
pub(crate) struct ExintPass {
    filters: Mutex<Vec<Box<dyn ExintFilter>>>,
}

impl ExintPass {
    pub(crate) const fn new() -> Self {
        Self {
            filters: Mutex::new(Vec::new()),
        }
    }

    /// Appends a filter to the chain. Mirrors
    /// `exint_pass_intr_register_callback`.
    pub(crate) fn register_callback(&self, filter: Box<dyn ExintFilter>) {
        self.filters.lock().push(filter);
    }

    /// Runs every registered filter over `vector` in registration order,
    /// short-circuiting the moment one drops it. Mirrors
    /// `exint_pass_intr_run_callback_list`.
    pub(crate) fn run_callback_list(&self, vector: u8) -> Option<u8> {
        let filters = self.filters.lock();
        let mut v = vector;
        for f in filters.iter() {
            v = f.filter(v)?;
        }
        Some(v)
    }
}

impl Default for ExintPass {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Passthrough;
    impl ExintFilter for Passthrough {
        fn filter(&self, vector: u8) -> Option<u8> {
            Some(vector)
        }
    }

    struct DropVector(u8);
    impl ExintFilter for DropVector {
        fn filter(&self, vector: u8) -> Option<u8> {
            if vector == self.0 {
                None
            } else {
                Some(vector)
            }
        }
    }

    struct Remap(u8, u8);
    impl ExintFilter for Remap {
        fn filter(&self, vector: u8) -> Option<u8> {
            Some(if vector == self.0 { self.1 } else { vector })
        }
    }

    #[test]
    fn empty_chain_passes_vector_through_unchanged() {
        let chain = ExintPass::new();
        assert_eq!(chain.run_callback_list(0x30), Some(0x30));
    }

    #[test]
    fn a_filter_can_drop_a_vector() {
        let chain = ExintPass::new();
        chain.register_callback(Box::new(DropVector(0x30)));
        assert_eq!(chain.run_callback_list(0x30), None);
        assert_eq!(chain.run_callback_list(0x31), Some(0x31));
    }

    #[test]
    fn filters_run_in_registration_order() {
        let chain = ExintPass::new();
        chain.register_callback(Box::new(Remap(0x30, 0x40)));
        chain.register_callback(Box::new(Passthrough));
        assert_eq!(chain.run_callback_list(0x30), Some(0x40));
    }
}
