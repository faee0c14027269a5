//! Permission layer: logical page state to enforced protection
//!
//! The contract: the logical state and the protection that makes the next
//! access succeed or fault again change together, inside the same critical
//! section under the entry lock. A failed backend call leaves both untouched
//! and surfaces as a fatal `Permission` error.
//!
//! The backend is pluggable. The default enforces protection in software —
//! the bounds-checked accessors consult the entry's protection word — which
//! is the portable rendition of a fault-trap + page-protection scheme; a
//! guard-page or structured-exception backend plugs in behind the same
//! trait.

use std::fmt::Debug;

use crate::dsm::memory::page_table::PageSlot;
use crate::dsm::types::{DsmError, DsmResult, PageState, Protection};

/// Protection level enforcing a logical state.
pub fn protection_for(state: PageState) -> Protection {
    match state {
        PageState::Invalid => Protection::None,
        PageState::ReadOnly => Protection::Read,
        PageState::ReadWrite => Protection::ReadWrite,
    }
}

/// Applies protection changes to the platform.
pub trait ProtectionBackend: Send + Sync + Debug {
    /// Enforce `prot` for the page at `addr`. Must either take effect fully
    /// or fail without side effects.
    fn apply(&self, addr: u64, prot: Protection) -> DsmResult<()>;
}

/// Software enforcement: the accessors are the only path to shared bytes and
/// they honor the protection word in the entry, so there is nothing extra to
/// install here.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftProtection;

impl ProtectionBackend for SoftProtection {
    fn apply(&self, _addr: u64, _prot: Protection) -> DsmResult<()> {
        Ok(())
    }
}

/// Transition a page to `state`, updating the enforced protection in the
/// same critical section. The caller holds the entry lock (it owns the
/// `&mut PageSlot`).
pub fn apply_state(
    slot: &mut PageSlot,
    addr: u64,
    state: PageState,
    backend: &dyn ProtectionBackend,
) -> DsmResult<()> {
    let prot = protection_for(state);
    backend
        .apply(addr, prot)
        .map_err(|e| DsmError::permission(format!("protection change failed: {}", e)))?;
    slot.prot = prot;
    slot.state = state;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsm::memory::page_table::PageTable;
    use crate::dsm::types::PAGE_SIZE;

    #[derive(Debug)]
    struct RefusingBackend;

    impl ProtectionBackend for RefusingBackend {
        fn apply(&self, _addr: u64, _prot: Protection) -> DsmResult<()> {
            Err(DsmError::permission("backend refused"))
        }
    }

    #[test]
    fn state_and_protection_move_together() {
        let table = PageTable::create(PAGE_SIZE, 0, 0).unwrap();
        let entry = table.lookup_by_id(table.start_page_id()).unwrap();
        let backend = SoftProtection;

        let mut slot = entry.lock();
        apply_state(&mut slot, entry.addr(), PageState::ReadOnly, &backend).unwrap();
        assert_eq!(slot.state, PageState::ReadOnly);
        assert_eq!(slot.prot, Protection::Read);

        apply_state(&mut slot, entry.addr(), PageState::ReadWrite, &backend).unwrap();
        assert_eq!(slot.prot, Protection::ReadWrite);

        apply_state(&mut slot, entry.addr(), PageState::Invalid, &backend).unwrap();
        assert_eq!(slot.state, PageState::Invalid);
        assert_eq!(slot.prot, Protection::None);
    }

    #[test]
    fn failed_backend_leaves_no_drift() {
        let table = PageTable::create(PAGE_SIZE, 0, 0).unwrap();
        let entry = table.lookup_by_id(table.start_page_id()).unwrap();

        let mut slot = entry.lock();
        let err = apply_state(&mut slot, entry.addr(), PageState::ReadWrite, &RefusingBackend)
            .unwrap_err();
        assert!(matches!(err, DsmError::Permission(_)));
        // Neither half of the pair moved.
        assert_eq!(slot.state, PageState::Invalid);
        assert_eq!(slot.prot, Protection::None);
    }

    #[test]
    fn mapping_table() {
        assert_eq!(protection_for(PageState::Invalid), Protection::None);
        assert_eq!(protection_for(PageState::ReadOnly), Protection::Read);
        assert_eq!(protection_for(PageState::ReadWrite), Protection::ReadWrite);
    }
}
