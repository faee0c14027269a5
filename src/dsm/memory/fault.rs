//! Access-violation trap
//!
//! Turns an illegal access into a protocol event: resolve the faulting
//! address to a page entry, decode the access kind, and run the migration
//! protocol to obtain the missing right. Runs synchronously on the faulting
//! thread; only that thread suspends.
//!
//! An address outside every registered allocation is a genuine out-of-bounds
//! access. It propagates as `NotFound` — the caller gets the platform's
//! fatal behavior instead of a silent fix-up that would hide real bugs.

use log::debug;

use crate::dsm::coherence::migration;
use crate::dsm::context::DsmContext;
use crate::dsm::types::{AccessKind, DsmError, DsmResult, PageState};

/// Handle one access violation at `addr`.
///
/// State machine: INVALID -> READ_ONLY on a read fault, INVALID or
/// READ_ONLY -> READ_WRITE on a write fault. A fault on a page that already
/// has the needed right (a benign race with a concurrent fetch) is a no-op.
pub fn handle_fault(ctx: &DsmContext, addr: u64, kind: AccessKind) -> DsmResult<()> {
    ctx.counters().record_fault(kind == AccessKind::Write);

    let table = ctx.table_by_addr(addr).ok_or(DsmError::NotFound)?;
    let entry = table.lookup_by_addr(addr).ok_or(DsmError::NotFound)?;
    let page_id = entry.id();

    let state = entry.lock().state;
    debug!(
        "node {}: {:?} fault at {:#x} (page {}, state {:?})",
        ctx.node_id(),
        kind,
        addr,
        page_id,
        state
    );

    match kind {
        AccessKind::Read => {
            if state == PageState::Invalid {
                migration::fetch_for_read(ctx, page_id)
            } else {
                Ok(())
            }
        }
        AccessKind::Write => {
            if state.can_write() {
                Ok(())
            } else {
                migration::fetch_for_write(ctx, page_id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::dsm::coherence::authority::{DirPending, LocalAuthority};
    use crate::dsm::coherence::directory::Directory;
    use crate::dsm::config::{NodeConfig, ProtocolConfig};
    use crate::dsm::memory::page_table::PageTable;
    use crate::dsm::memory::permission::SoftProtection;
    use crate::dsm::net::transport::LoopbackHub;
    use crate::dsm::types::{PageState, Protection, PAGE_SIZE};
    use crate::telemetry::DsmCounters;

    fn solo_context() -> DsmContext {
        let counters = Arc::new(DsmCounters::new());
        let hub = LoopbackHub::new();
        let (transport, _rx) = hub.attach(0, Arc::clone(&counters));
        let directory = Arc::new(Directory::new());
        DsmContext::new(
            NodeConfig::manager(0, 1),
            ProtocolConfig::default(),
            counters,
            transport,
            Arc::new(LocalAuthority::new(Arc::clone(&directory))),
            Some(directory),
            Arc::new(DirPending::new()),
            Arc::new(SoftProtection),
        )
    }

    #[test]
    fn out_of_bounds_fault_propagates() {
        let ctx = solo_context();
        assert_eq!(
            handle_fault(&ctx, 0xDEAD, AccessKind::Read),
            Err(DsmError::NotFound)
        );
        assert_eq!(ctx.counters().snapshot().page_faults, 1);
    }

    #[test]
    fn read_fault_on_owned_page_widens_to_read_only() {
        let ctx = solo_context();
        let table = PageTable::create(PAGE_SIZE, 0, 0).unwrap();
        let base = table.base_addr();
        ctx.register_table(Arc::clone(&table));

        handle_fault(&ctx, base + 16, AccessKind::Read).unwrap();

        let entry = table.lookup_by_addr(base).unwrap();
        let slot = entry.lock();
        assert_eq!(slot.state, PageState::ReadOnly);
        assert_eq!(slot.prot, Protection::Read);

        let snap = ctx.counters().snapshot();
        assert_eq!(snap.read_faults, 1);
        assert_eq!(snap.write_faults, 0);
    }

    #[test]
    fn write_fault_on_owned_page_takes_read_write() {
        let ctx = solo_context();
        let table = PageTable::create(PAGE_SIZE, 0, 0).unwrap();
        let base = table.base_addr();
        ctx.register_table(Arc::clone(&table));

        // INVALID -> READ_WRITE directly on a first-touch write.
        handle_fault(&ctx, base, AccessKind::Write).unwrap();
        {
            let entry = table.lookup_by_addr(base).unwrap();
            assert_eq!(entry.lock().state, PageState::ReadWrite);
        }

        // A second write fault (benign race) is a no-op.
        handle_fault(&ctx, base, AccessKind::Write).unwrap();
        assert_eq!(ctx.counters().snapshot().write_faults, 2);
    }

    #[test]
    fn read_then_write_upgrades() {
        let ctx = solo_context();
        let table = PageTable::create(PAGE_SIZE, 0, 0).unwrap();
        let base = table.base_addr();
        ctx.register_table(Arc::clone(&table));

        handle_fault(&ctx, base, AccessKind::Read).unwrap();
        handle_fault(&ctx, base, AccessKind::Write).unwrap();

        let entry = table.lookup_by_addr(base).unwrap();
        let slot = entry.lock();
        assert_eq!(slot.state, PageState::ReadWrite);
        assert_eq!(slot.prot, Protection::ReadWrite);
    }
}
