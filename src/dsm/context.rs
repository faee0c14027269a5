//! Per-node DSM context
//!
//! The explicit handle threaded through every operation: table registry,
//! transport, coherence authority, synchronization services and counters.
//! Nothing here is process-global, so several independent nodes can live in
//! one process (the integration tests run whole clusters that way).

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use log::warn;

use crate::dsm::coherence::authority::{CoherenceAuthority, DirPending};
use crate::dsm::coherence::directory::Directory;
use crate::dsm::config::{NodeConfig, ProtocolConfig};
use crate::dsm::memory::allocator::AllocTracker;
use crate::dsm::memory::page_table::PageTable;
use crate::dsm::memory::permission::ProtectionBackend;
use crate::dsm::net::transport::Transport;
use crate::dsm::sync::barrier::BarrierRegistry;
use crate::dsm::sync::lock::LockRegistry;
use crate::dsm::types::{DsmError, DsmResult, NodeId, PageId, MAX_ALLOCATIONS};
use crate::telemetry::DsmCounters;

/// Runtime state of one DSM node.
#[derive(Debug)]
pub struct DsmContext {
    config: NodeConfig,
    protocol: ProtocolConfig,
    counters: Arc<DsmCounters>,
    transport: Arc<dyn Transport>,
    authority: Arc<dyn CoherenceAuthority>,
    /// Resident directory; populated only on the manager.
    directory: Option<Arc<Directory>>,
    /// Reply router for remote directory requests.
    dir_pending: Arc<DirPending>,
    backend: Arc<dyn ProtectionBackend>,
    /// Live page tables keyed by base address.
    tables: DashMap<u64, Arc<PageTable>>,
    /// Bitmask of local allocation slots in use.
    local_slots: Mutex<u32>,
    allocs: AllocTracker,
    locks: LockRegistry,
    barriers: BarrierRegistry,
}

impl DsmContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: NodeConfig,
        protocol: ProtocolConfig,
        counters: Arc<DsmCounters>,
        transport: Arc<dyn Transport>,
        authority: Arc<dyn CoherenceAuthority>,
        directory: Option<Arc<Directory>>,
        dir_pending: Arc<DirPending>,
        backend: Arc<dyn ProtectionBackend>,
    ) -> Self {
        Self {
            config,
            protocol,
            counters,
            transport,
            authority,
            directory,
            dir_pending,
            backend,
            tables: DashMap::new(),
            local_slots: Mutex::new(0),
            allocs: AllocTracker::new(),
            locks: LockRegistry::new(),
            barriers: BarrierRegistry::new(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    pub fn is_manager(&self) -> bool {
        self.config.is_manager()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn protocol(&self) -> &ProtocolConfig {
        &self.protocol
    }

    pub fn counters(&self) -> &DsmCounters {
        &self.counters
    }

    pub fn counters_arc(&self) -> Arc<DsmCounters> {
        Arc::clone(&self.counters)
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn authority(&self) -> &Arc<dyn CoherenceAuthority> {
        &self.authority
    }

    /// The resident directory, present only on the manager node.
    pub fn directory(&self) -> Option<&Arc<Directory>> {
        self.directory.as_ref()
    }

    pub fn dir_pending(&self) -> &Arc<DirPending> {
        &self.dir_pending
    }

    pub fn backend(&self) -> &dyn ProtectionBackend {
        self.backend.as_ref()
    }

    pub fn allocs(&self) -> &AllocTracker {
        &self.allocs
    }

    pub fn locks(&self) -> &LockRegistry {
        &self.locks
    }

    pub fn barriers(&self) -> &BarrierRegistry {
        &self.barriers
    }

    /* ------------------------- table registry ------------------------- */

    pub fn register_table(&self, table: Arc<PageTable>) {
        self.tables.insert(table.base_addr(), table);
    }

    /// Detach a table by base address; handlers still holding the `Arc`
    /// finish against it, then it is freed.
    pub fn unregister_table(&self, base_addr: u64) -> Option<Arc<PageTable>> {
        self.tables.remove(&base_addr).map(|(_, table)| table)
    }

    /// Table containing a shared address.
    pub fn table_by_addr(&self, addr: u64) -> Option<Arc<PageTable>> {
        self.tables.iter().find_map(|entry| {
            let table = entry.value();
            table.contains_addr(addr).then(|| Arc::clone(table))
        })
    }

    /// Table containing a page id.
    pub fn table_by_id(&self, page_id: PageId) -> Option<Arc<PageTable>> {
        self.tables.iter().find_map(|entry| {
            let table = entry.value();
            table.contains_id(page_id).then(|| Arc::clone(table))
        })
    }

    pub fn num_tables(&self) -> usize {
        self.tables.len()
    }

    /* ----------------------- allocation slots ------------------------ */

    /// Claim the lowest free local allocation slot.
    pub fn take_slot(&self) -> DsmResult<u64> {
        let mut slots = self
            .local_slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for slot in 0..MAX_ALLOCATIONS {
            let bit = 1u32 << slot;
            if *slots & bit == 0 {
                *slots |= bit;
                return Ok(slot);
            }
        }
        Err(DsmError::OutOfMemory)
    }

    /// Return a slot to the free pool.
    pub fn release_slot(&self, slot: u64) {
        if slot < MAX_ALLOCATIONS {
            let mut slots = self
                .local_slots
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *slots &= !(1u32 << slot);
        }
    }

    /* ------------------------- failure paths ------------------------- */

    /// React to a send that exhausted its retries: mark the peer failed and
    /// tell the authority so directory state stops pointing at it.
    pub fn report_send_failure(&self, node: NodeId, err: &DsmError) {
        if !matches!(err, DsmError::Network(_)) {
            return;
        }
        self.transport.mark_failed(node);
        if let Err(e) = self.authority.node_failed(node) {
            warn!(
                "node {}: failed to report node {} failure to authority: {}",
                self.node_id(),
                node,
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsm::coherence::authority::LocalAuthority;
    use crate::dsm::memory::permission::SoftProtection;
    use crate::dsm::net::transport::LoopbackHub;
    use crate::dsm::types::PAGE_SIZE;

    fn test_context() -> DsmContext {
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
    fn slot_allocation_is_exhaustible_and_reusable() {
        let ctx = test_context();
        for expected in 0..MAX_ALLOCATIONS {
            assert_eq!(ctx.take_slot().unwrap(), expected);
        }
        assert_eq!(ctx.take_slot(), Err(DsmError::OutOfMemory));

        ctx.release_slot(5);
        assert_eq!(ctx.take_slot().unwrap(), 5);
    }

    #[test]
    fn table_registry_lookups() {
        let ctx = test_context();
        let table = PageTable::create(2 * PAGE_SIZE, 0, 0).unwrap();
        let base = table.base_addr();
        let id = table.start_page_id();
        ctx.register_table(Arc::clone(&table));

        assert!(ctx.table_by_addr(base + 10).is_some());
        assert!(ctx.table_by_id(id + 1).is_some());
        assert!(ctx.table_by_id(id + 2).is_none());

        let removed = ctx.unregister_table(base).unwrap();
        assert_eq!(removed.base_addr(), base);
        assert!(ctx.table_by_addr(base).is_none());
    }
}
