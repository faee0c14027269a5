//! Per-allocation page table
//!
//! Maps one contiguous shared address range to per-page metadata: local
//! state, enforced protection, owner hint, version, the in-flight request
//! bookkeeping that coalesces concurrent faults, and the page's backing
//! frame. Tables are shared via `Arc`; an allocation is destroyed when the
//! last handle drops.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use log::debug;

use arrayvec::ArrayVec;

use crate::dsm::types::{
    first_page_id, page_addr, AccessKind, DsmError, DsmResult, NodeId, PageId, PageState,
    Protection, MAX_ALLOCATIONS, MAX_SHARERS, PAGES_PER_SLOT, PAGE_SIZE,
};

/// Outstanding invalidation ackers: every sharer plus the previous owner.
pub type AckSet = ArrayVec<NodeId, { MAX_SHARERS + 1 }>;

/// Mutable per-page state, guarded by the entry lock.
///
/// Transitions on one page are serialized by this lock; the logical state
/// and the enforced protection only ever change together inside it.
#[derive(Debug)]
pub struct PageSlot {
    /// Local coherence state.
    pub state: PageState,
    /// Enforced protection, kept in lockstep with `state`.
    pub prot: Protection,
    /// Last known owner. A hint: the directory is authoritative.
    pub owner_hint: NodeId,
    /// Version counter, bumped on every accepted remote copy.
    pub version: u64,
    /// True while a fetch for this page is outstanding on the network.
    pub pending: bool,
    /// Access the outstanding fetch was issued for; decides the state the
    /// arriving reply installs.
    pub pending_kind: AccessKind,
    /// Set when an invalidation lands while a fetch is outstanding. The
    /// reply that eventually arrives is stale with respect to the new owner
    /// and must not be installed; the access re-faults instead.
    pub fetch_invalidated: bool,
    /// Threads blocked on the ready condition, waiting for that fetch.
    pub waiters: u32,
    /// Nodes whose invalidation acknowledgement is still outstanding.
    pub pending_acks: AckSet,
    /// The page's local frame.
    pub data: Box<[u8; PAGE_SIZE]>,
}

impl PageSlot {
    fn new(owner_hint: NodeId) -> Self {
        Self {
            state: PageState::Invalid,
            prot: Protection::None,
            owner_hint,
            version: 0,
            pending: false,
            pending_kind: AccessKind::Read,
            fetch_invalidated: false,
            waiters: 0,
            pending_acks: AckSet::new(),
            data: Box::new([0u8; PAGE_SIZE]),
        }
    }
}

/// One page's entry: identity plus the lock/condvar pair every protocol
/// transition funnels through.
#[derive(Debug)]
pub struct PageEntry {
    id: PageId,
    addr: u64,
    slot: Mutex<PageSlot>,
    /// Signaled when an outstanding fetch completes (or aborts).
    pub ready: Condvar,
    /// Signaled when the pending invalidation-ack set drains.
    pub acks_drained: Condvar,
}

impl PageEntry {
    fn new(id: PageId, addr: u64, owner_hint: NodeId) -> Self {
        Self {
            id,
            addr,
            slot: Mutex::new(PageSlot::new(owner_hint)),
            ready: Condvar::new(),
            acks_drained: Condvar::new(),
        }
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    /// Base shared address of this page.
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// Take the entry lock.
    pub fn lock(&self) -> MutexGuard<'_, PageSlot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Page table covering one allocation.
#[derive(Debug)]
pub struct PageTable {
    base_addr: u64,
    total_size: usize,
    start_page_id: PageId,
    /// Node that created (and initially owns) the allocation.
    home: NodeId,
    entries: Vec<PageEntry>,
}

impl PageTable {
    /// Create the table for a locally allocated range.
    ///
    /// Assigns the page-id range unique to `(node, allocation_slot)`; fails
    /// with `Invalid` for a bad slot index or a size over the per-slot
    /// page-id budget.
    pub fn create(
        size: usize,
        node: NodeId,
        allocation_slot: u64,
    ) -> DsmResult<Arc<PageTable>> {
        if size == 0 {
            return Err(DsmError::invalid("allocation size is zero"));
        }
        if allocation_slot >= MAX_ALLOCATIONS {
            return Err(DsmError::invalid(format!(
                "allocation slot {} out of range (max {})",
                allocation_slot, MAX_ALLOCATIONS
            )));
        }
        let num_pages = size.div_ceil(PAGE_SIZE) as u64;
        if num_pages > PAGES_PER_SLOT {
            return Err(DsmError::invalid(format!(
                "allocation of {} pages exceeds per-slot budget of {}",
                num_pages, PAGES_PER_SLOT
            )));
        }

        let start_page_id = first_page_id(node, allocation_slot);
        Ok(Self::build(start_page_id, num_pages as usize, node))
    }

    /// Map another node's already-allocated range locally, with identical
    /// page ids and addresses so pointer values agree cluster-wide.
    pub fn create_remote(
        base_addr: u64,
        size: usize,
        owner: NodeId,
        start_page_id: PageId,
    ) -> DsmResult<Arc<PageTable>> {
        if size == 0 {
            return Err(DsmError::invalid("allocation size is zero"));
        }
        if base_addr != page_addr(start_page_id) {
            return Err(DsmError::invalid(format!(
                "base address {:#x} does not match page id {}",
                base_addr, start_page_id
            )));
        }
        let num_pages = size.div_ceil(PAGE_SIZE);
        Ok(Self::build(start_page_id, num_pages, owner))
    }

    fn build(start_page_id: PageId, num_pages: usize, owner_hint: NodeId) -> Arc<PageTable> {
        let base_addr = page_addr(start_page_id);
        let entries = (0..num_pages)
            .map(|i| {
                let id = start_page_id + i as u64;
                PageEntry::new(id, base_addr + (i * PAGE_SIZE) as u64, owner_hint)
            })
            .collect();

        debug!(
            "page table created: base={:#x}, pages={}, start_id={}",
            base_addr, num_pages, start_page_id
        );
        Arc::new(PageTable {
            base_addr,
            total_size: num_pages * PAGE_SIZE,
            start_page_id,
            home: owner_hint,
            entries,
        })
    }

    pub fn base_addr(&self) -> u64 {
        self.base_addr
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn num_pages(&self) -> usize {
        self.entries.len()
    }

    pub fn start_page_id(&self) -> PageId {
        self.start_page_id
    }

    /// Last page id in the table, inclusive.
    pub fn end_page_id(&self) -> PageId {
        self.start_page_id + self.entries.len() as u64 - 1
    }

    /// Creating node of the allocation.
    pub fn home(&self) -> NodeId {
        self.home
    }

    /// True when `addr` falls inside this allocation.
    pub fn contains_addr(&self, addr: u64) -> bool {
        addr >= self.base_addr && addr < self.base_addr + self.total_size as u64
    }

    /// True when `page_id` belongs to this allocation.
    pub fn contains_id(&self, page_id: PageId) -> bool {
        page_id >= self.start_page_id && page_id <= self.end_page_id()
    }

    /// Entry for any address within the page, or `None` out of range.
    pub fn lookup_by_addr(&self, addr: u64) -> Option<&PageEntry> {
        if !self.contains_addr(addr) {
            return None;
        }
        let index = ((addr - self.base_addr) as usize) / PAGE_SIZE;
        self.entries.get(index)
    }

    /// Entry by page id, or `None` out of range.
    pub fn lookup_by_id(&self, page_id: PageId) -> Option<&PageEntry> {
        if !self.contains_id(page_id) {
            return None;
        }
        self.entries.get((page_id - self.start_page_id) as usize)
    }

    /// Record a new owner hint for a page.
    pub fn set_owner(&self, page_id: PageId, owner: NodeId) -> DsmResult<()> {
        let entry = self.lookup_by_id(page_id).ok_or(DsmError::NotFound)?;
        entry.lock().owner_hint = owner;
        debug!("page {} owner hint set to {}", page_id, owner);
        Ok(())
    }

    /// Record a new local state for a page. The protection is left alone;
    /// callers changing both must go through the permission layer so the
    /// pair moves in one critical section.
    pub fn set_state(&self, page_id: PageId, state: PageState) -> DsmResult<()> {
        let entry = self.lookup_by_id(page_id).ok_or(DsmError::NotFound)?;
        entry.lock().state = state;
        debug!("page {} state set to {:?}", page_id, state);
        Ok(())
    }

    /// Page id for an address inside the table.
    pub fn addr_to_id(&self, addr: u64) -> Option<PageId> {
        self.lookup_by_addr(addr).map(PageEntry::id)
    }

    /// Base address for a page id inside the table.
    pub fn id_to_addr(&self, page_id: PageId) -> Option<u64> {
        self.lookup_by_id(page_id).map(PageEntry::addr)
    }

    /// Iterate all entries (teardown, diagnostics).
    pub fn entries(&self) -> impl Iterator<Item = &PageEntry> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsm::types::ADDR_BASE;

    #[test]
    fn create_assigns_slot_unique_id_range() {
        let table = PageTable::create(3 * PAGE_SIZE, 2, 1).unwrap();
        assert_eq!(table.num_pages(), 3);
        assert_eq!(table.start_page_id(), first_page_id(2, 1));
        assert_eq!(table.base_addr(), page_addr(table.start_page_id()));
        assert_eq!(table.home(), 2);
    }

    #[test]
    fn create_rounds_size_up_to_pages() {
        let table = PageTable::create(PAGE_SIZE + 1, 0, 0).unwrap();
        assert_eq!(table.num_pages(), 2);
        assert_eq!(table.total_size(), 2 * PAGE_SIZE);
    }

    #[test]
    fn create_rejects_bad_arguments() {
        assert!(PageTable::create(0, 0, 0).is_err());
        assert!(PageTable::create(PAGE_SIZE, 0, MAX_ALLOCATIONS).is_err());
        let oversized = (PAGES_PER_SLOT as usize + 1) * PAGE_SIZE;
        assert!(PageTable::create(oversized, 0, 0).is_err());
    }

    #[test]
    fn remote_table_maps_identical_addresses() {
        let local = PageTable::create(2 * PAGE_SIZE, 1, 0).unwrap();
        let remote = PageTable::create_remote(
            local.base_addr(),
            local.total_size(),
            1,
            local.start_page_id(),
        )
        .unwrap();

        assert_eq!(remote.base_addr(), local.base_addr());
        assert_eq!(remote.start_page_id(), local.start_page_id());
        assert_eq!(
            remote.id_to_addr(local.start_page_id() + 1),
            local.id_to_addr(local.start_page_id() + 1)
        );
    }

    #[test]
    fn remote_table_rejects_mismatched_base() {
        let id = first_page_id(1, 0);
        assert!(PageTable::create_remote(ADDR_BASE, PAGE_SIZE, 1, id).is_err());
    }

    #[test]
    fn lookups_respect_bounds() {
        let table = PageTable::create(2 * PAGE_SIZE, 0, 3).unwrap();
        let base = table.base_addr();

        assert!(table.lookup_by_addr(base).is_some());
        assert!(table.lookup_by_addr(base + PAGE_SIZE as u64 + 7).is_some());
        assert!(table.lookup_by_addr(base + 2 * PAGE_SIZE as u64).is_none());
        assert!(table.lookup_by_addr(base.wrapping_sub(1)).is_none());

        assert!(table.lookup_by_id(table.start_page_id()).is_some());
        assert!(table.lookup_by_id(table.end_page_id() + 1).is_none());
    }

    #[test]
    fn set_owner_and_state_report_not_found() {
        let table = PageTable::create(PAGE_SIZE, 0, 0).unwrap();
        let outside = table.end_page_id() + 1;
        assert_eq!(table.set_owner(outside, 1), Err(DsmError::NotFound));
        assert_eq!(
            table.set_state(outside, PageState::ReadOnly),
            Err(DsmError::NotFound)
        );

        table.set_owner(table.start_page_id(), 4).unwrap();
        let entry = table.lookup_by_id(table.start_page_id()).unwrap();
        assert_eq!(entry.lock().owner_hint, 4);
    }

    #[test]
    fn entries_start_invalid_with_no_access() {
        let table = PageTable::create(PAGE_SIZE, 0, 0).unwrap();
        let entry = table.lookup_by_id(table.start_page_id()).unwrap();
        let slot = entry.lock();
        assert_eq!(slot.state, PageState::Invalid);
        assert_eq!(slot.prot, Protection::None);
        assert!(!slot.pending);
        assert_eq!(slot.version, 0);
    }
}
