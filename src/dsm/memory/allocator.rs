//! Shared-memory allocator
//!
//! `allocate` carves a page-aligned range out of the node's id space,
//! builds the page table, registers ownership with the authority and
//! broadcasts the allocation so every peer maps the identical address range
//! (single virtual address space). Peers acknowledge; the allocation is
//! aborted if acknowledgements don't arrive in time.
//!
//! Only the creating node may `free` an allocation. Remote nodes referencing
//! pages of a freed allocation is an explicit limitation of the design, not
//! silently repaired.

use std::collections::{HashMap, HashSet};
use std::sync::{Condvar, Mutex};

use log::{debug, info, warn};

use crate::dsm::context::DsmContext;
use crate::dsm::memory::page_table::PageTable;
use crate::dsm::net::protocol::Message;
use crate::dsm::types::{
    first_page_id, DsmError, DsmResult, NodeId, PageId, PAGES_PER_SLOT,
};

/// Outstanding allocation broadcast, keyed by start page id.
#[derive(Debug)]
struct AckWait {
    expected: usize,
    received: HashSet<NodeId>,
}

/// Tracks allocation-broadcast acknowledgements.
#[derive(Debug, Default)]
pub struct AllocTracker {
    waits: Mutex<HashMap<PageId, AckWait>>,
    complete: Condvar,
}

impl AllocTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the tracker before broadcasting so no ack can race registration.
    pub fn begin(&self, start_page_id: PageId, expected: usize) {
        self.waits
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(
                start_page_id,
                AckWait {
                    expected,
                    received: HashSet::new(),
                },
            );
    }

    /// Record one acknowledgement (or one peer known to never answer).
    pub fn note_ack(&self, start_page_id: PageId, acker: NodeId) {
        let mut waits = self
            .waits
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(wait) = waits.get_mut(&start_page_id) {
            wait.received.insert(acker);
            if wait.received.len() >= wait.expected {
                self.complete.notify_all();
            }
        } else {
            debug!("alloc ack for unknown allocation {}", start_page_id);
        }
    }

    /// Block until every expected acknowledgement arrived or the deadline
    /// passed. The wait record is dropped either way.
    pub fn wait(&self, start_page_id: PageId, timeout: std::time::Duration) -> DsmResult<()> {
        let waits = self
            .waits
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let (mut waits, _result) = self
            .complete
            .wait_timeout_while(waits, timeout, |waits| {
                waits
                    .get(&start_page_id)
                    .map(|w| w.received.len() < w.expected)
                    .unwrap_or(false)
            })
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let done = waits
            .remove(&start_page_id)
            .map(|w| w.received.len() >= w.expected)
            .unwrap_or(true);
        if done {
            Ok(())
        } else {
            Err(DsmError::Timeout)
        }
    }
}

/// Allocate `size` bytes of shared memory, returning the page-aligned base
/// address. Every page starts INVALID; touching the range drives the
/// coherence protocol.
pub fn allocate(ctx: &DsmContext, size: usize) -> DsmResult<u64> {
    if size == 0 {
        return Err(DsmError::invalid("allocation size is zero"));
    }

    let slot = ctx.take_slot()?;
    let table = match PageTable::create(size, ctx.node_id(), slot) {
        Ok(table) => table,
        Err(e) => {
            ctx.release_slot(slot);
            return Err(e);
        }
    };
    let base = table.base_addr();
    let start = table.start_page_id();
    let num_pages = table.num_pages() as u64;
    ctx.register_table(table.clone());

    if let Err(e) = ctx.authority().assign_range(start, num_pages, ctx.node_id()) {
        ctx.unregister_table(base);
        ctx.release_slot(slot);
        return Err(e);
    }

    info!(
        "node {}: allocated {} pages at {:#x} (ids {}..={})",
        ctx.node_id(),
        num_pages,
        base,
        start,
        table.end_page_id()
    );

    // Broadcast so peers map the same range at the same address, and hold
    // the allocation until they all confirm.
    let peers = ctx.transport().peers();
    if !peers.is_empty() {
        ctx.allocs().begin(start, peers.len());
        let notify = Message::AllocNotify {
            start_page_id: start,
            end_page_id: table.end_page_id(),
            owner: ctx.node_id(),
            base_addr: base,
            total_size: table.total_size() as u64,
        };
        for &peer in &peers {
            if let Err(e) = ctx.transport().send(peer, &notify) {
                warn!(
                    "node {}: alloc notify to node {} failed: {}",
                    ctx.node_id(),
                    peer,
                    e
                );
                // Count the unreachable peer as answered so the wait only
                // covers nodes that can still reply.
                ctx.allocs().note_ack(start, peer);
                ctx.report_send_failure(peer, &e);
            }
        }

        if ctx
            .allocs()
            .wait(start, ctx.protocol().alloc_ack_timeout)
            .is_err()
        {
            warn!(
                "node {}: allocation {:#x} missing acks, aborting",
                ctx.node_id(),
                base
            );
            let _ = free(ctx, base);
            return Err(DsmError::Timeout);
        }
    }

    Ok(base)
}

/// Free an allocation previously returned by [`allocate`] on this node.
pub fn free(ctx: &DsmContext, base_addr: u64) -> DsmResult<()> {
    let table = ctx
        .unregister_table(base_addr)
        .ok_or_else(|| DsmError::invalid(format!("{:#x} is not a DSM allocation", base_addr)))?;

    let start = table.start_page_id();
    let num_pages = table.num_pages() as u64;

    if let Err(e) = ctx.authority().release_range(start, num_pages) {
        warn!(
            "node {}: directory release for {:#x} failed: {}",
            ctx.node_id(),
            base_addr,
            e
        );
    }

    if table.home() == ctx.node_id() {
        let slot = (start - first_page_id(ctx.node_id(), 0)) / PAGES_PER_SLOT;
        ctx.release_slot(slot);
    }

    info!(
        "node {}: freed {} pages at {:#x}",
        ctx.node_id(),
        num_pages,
        base_addr
    );
    // Remaining Arc handles (in-flight handlers) keep the table alive until
    // they finish; the backing frames go with the last one.
    drop(table);
    Ok(())
}

/// Map a peer's announced allocation locally at the same address and
/// acknowledge.
pub fn handle_alloc_notify(
    ctx: &DsmContext,
    start_page_id: PageId,
    end_page_id: PageId,
    owner: NodeId,
    base_addr: u64,
    total_size: u64,
) -> DsmResult<()> {
    if end_page_id < start_page_id {
        return Err(DsmError::invalid("empty allocation range"));
    }

    let table = PageTable::create_remote(base_addr, total_size as usize, owner, start_page_id)?;
    if table.end_page_id() != end_page_id {
        return Err(DsmError::invalid(format!(
            "allocation range mismatch: {} pages vs ids {}..={}",
            table.num_pages(),
            start_page_id,
            end_page_id
        )));
    }
    ctx.register_table(table);

    info!(
        "node {}: mapped remote allocation {:#x} (ids {}..={}, owner {})",
        ctx.node_id(),
        base_addr,
        start_page_id,
        end_page_id,
        owner
    );

    ctx.transport().send(
        owner,
        &Message::AllocAck {
            start_page_id,
            acker: ctx.node_id(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::dsm::coherence::authority::{DirPending, LocalAuthority};
    use crate::dsm::coherence::directory::Directory;
    use crate::dsm::config::{NodeConfig, ProtocolConfig};
    use crate::dsm::memory::permission::SoftProtection;
    use crate::dsm::net::transport::LoopbackHub;
    use crate::dsm::types::PAGE_SIZE;
    use crate::telemetry::DsmCounters;

    fn solo_manager() -> (DsmContext, Arc<Directory>) {
        let counters = Arc::new(DsmCounters::new());
        let hub = LoopbackHub::new();
        let (transport, _rx) = hub.attach(0, Arc::clone(&counters));
        let directory = Arc::new(Directory::new());
        let ctx = DsmContext::new(
            NodeConfig::manager(0, 1),
            ProtocolConfig::default(),
            counters,
            transport,
            Arc::new(LocalAuthority::new(Arc::clone(&directory))),
            Some(Arc::clone(&directory)),
            Arc::new(DirPending::new()),
            Arc::new(SoftProtection),
        );
        (ctx, directory)
    }

    #[test]
    fn allocate_registers_table_and_ownership() {
        let (ctx, directory) = solo_manager();
        let base = allocate(&ctx, 3 * PAGE_SIZE).unwrap();

        let table = ctx.table_by_addr(base).unwrap();
        assert_eq!(table.num_pages(), 3);
        assert_eq!(directory.lookup(table.start_page_id()), Some(0));
        assert_eq!(directory.lookup(table.end_page_id()), Some(0));
    }

    #[test]
    fn allocate_zero_is_invalid() {
        let (ctx, _) = solo_manager();
        assert!(matches!(allocate(&ctx, 0), Err(DsmError::Invalid(_))));
    }

    #[test]
    fn free_releases_slot_and_directory_entries() {
        let (ctx, directory) = solo_manager();
        let base = allocate(&ctx, PAGE_SIZE).unwrap();
        let first_id = ctx.table_by_addr(base).unwrap().start_page_id();

        free(&ctx, base).unwrap();
        assert!(ctx.table_by_addr(base).is_none());
        assert_eq!(directory.lookup(first_id), None);

        // The slot is reusable: the next allocation lands at the same base.
        let again = allocate(&ctx, PAGE_SIZE).unwrap();
        assert_eq!(again, base);
    }

    #[test]
    fn double_free_is_invalid() {
        let (ctx, _) = solo_manager();
        let base = allocate(&ctx, PAGE_SIZE).unwrap();
        free(&ctx, base).unwrap();
        assert!(matches!(free(&ctx, base), Err(DsmError::Invalid(_))));
    }

    #[test]
    fn tracker_completes_on_last_ack() {
        let tracker = AllocTracker::new();
        tracker.begin(100, 2);
        tracker.note_ack(100, 1);
        tracker.note_ack(100, 2);
        assert!(tracker.wait(100, Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn tracker_times_out_when_acks_missing() {
        let tracker = AllocTracker::new();
        tracker.begin(200, 2);
        tracker.note_ack(200, 1);
        assert_eq!(
            tracker.wait(200, Duration::from_millis(50)),
            Err(DsmError::Timeout)
        );
    }
}
