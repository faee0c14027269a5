//! Page directory: the cluster's authority on ownership and sharers
//!
//! Keyed concurrent map from page id to `{owner, sharer set}` with one lock
//! per entry; the lock-free map itself absorbs structural insert/erase.
//! Entries are created lazily on first reference with no owner.
//!
//! The ordering contract that keeps the protocol honest: `set_writer`
//! reassigns ownership immediately but leaves the sharer set in place, and
//! only an explicit `clear_sharers` — issued after every invalidation has
//! been acknowledged — empties it. A late read request therefore can never
//! be granted sharer status against copies that are not yet invalidated.

use std::sync::Mutex;

use arrayvec::ArrayVec;
use crossbeam_skiplist::SkipMap;
use log::{debug, warn};

use crate::dsm::types::{DsmError, DsmResult, NodeId, PageId, MAX_SHARERS};

/// Bounded, unordered, duplicate-free set of read-only sharers.
pub type SharerSet = ArrayVec<NodeId, MAX_SHARERS>;

/// Mutable state of one directory entry, guarded by the entry lock.
#[derive(Debug, Default)]
struct DirEntryState {
    /// Current owner, `None` until a writer or allocation registers one.
    owner: Option<NodeId>,
    /// Nodes holding read-only copies.
    sharers: SharerSet,
    /// Cleared on teardown so stale handles fail loudly.
    valid: bool,
}

/// One page's directory record.
#[derive(Debug)]
pub struct DirectoryEntry {
    state: Mutex<DirEntryState>,
}

impl DirectoryEntry {
    fn new() -> Self {
        Self {
            state: Mutex::new(DirEntryState {
                owner: None,
                sharers: SharerSet::new(),
                valid: true,
            }),
        }
    }
}

/// Replicated mutation event; the single write path a directory replica
/// consumes. The base protocol applies these locally, an availability
/// extension would ship them to a standby.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryEvent {
    RangeAssigned {
        start_page_id: PageId,
        count: u64,
        owner: NodeId,
    },
    ReaderAdded { page_id: PageId, reader: NodeId },
    WriterSet { page_id: PageId, writer: NodeId },
    SharersCleared { page_id: PageId },
    SharerRemoved { page_id: PageId, node: NodeId },
    EntryRemoved { page_id: PageId },
    NodeFailed { node: NodeId },
    OwnershipReclaimed { page_id: PageId, new_owner: NodeId },
}

/// Centralized page directory.
#[derive(Debug, Default)]
pub struct Directory {
    entries: SkipMap<PageId, DirectoryEntry>,
}

impl Directory {
    pub fn new() -> Self {
        Self {
            entries: SkipMap::new(),
        }
    }

    /// Run `f` under the entry lock, creating the entry lazily.
    fn with_entry<T>(&self, page_id: PageId, f: impl FnOnce(&mut DirEntryState) -> T) -> T {
        let entry = self
            .entries
            .get_or_insert_with(page_id, DirectoryEntry::new);
        let mut state = entry
            .value()
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !state.valid {
            // A handle raced the entry's teardown; start it fresh.
            state.owner = None;
            state.sharers.clear();
            state.valid = true;
        }
        f(&mut state)
    }

    /// Current owner of `page_id`, lazily creating the entry with no owner.
    pub fn lookup(&self, page_id: PageId) -> Option<NodeId> {
        self.with_entry(page_id, |state| state.owner)
    }

    /// Register `reader` as a sharer. Idempotent; returns `Busy` when the
    /// bounded sharer set is full.
    pub fn add_reader(&self, page_id: PageId, reader: NodeId) -> DsmResult<()> {
        self.with_entry(page_id, |state| {
            if state.sharers.contains(&reader) {
                return Ok(());
            }
            if state.sharers.try_push(reader).is_err() {
                warn!("sharer set full for page {}", page_id);
                return Err(DsmError::Busy);
            }
            debug!("page {}: added sharer {}", page_id, reader);
            Ok(())
        })
    }

    /// Transfer ownership to `writer`, returning the nodes whose copies must
    /// be invalidated: `(sharers ∪ {old owner}) \ {writer}`.
    ///
    /// Ownership is reassigned here; the sharer set is left intact until
    /// `clear_sharers` confirms the invalidations landed.
    pub fn set_writer(&self, page_id: PageId, writer: NodeId) -> DsmResult<Vec<NodeId>> {
        self.with_entry(page_id, |state| {
            let mut invalidate: Vec<NodeId> = state
                .sharers
                .iter()
                .copied()
                .filter(|&n| n != writer)
                .collect();
            if let Some(owner) = state.owner {
                if owner != writer && !invalidate.contains(&owner) {
                    invalidate.push(owner);
                }
            }

            state.owner = Some(writer);
            debug!(
                "page {}: writer set to {} ({} nodes to invalidate)",
                page_id,
                writer,
                invalidate.len()
            );
            Ok(invalidate)
        })
    }

    /// Empty the sharer set. Called by the writer once every invalidation
    /// from the preceding `set_writer` has been acknowledged.
    pub fn clear_sharers(&self, page_id: PageId) -> DsmResult<()> {
        self.with_entry(page_id, |state| {
            state.sharers.clear();
            Ok(())
        })
    }

    /// Remove one node from the sharer set. No-op when absent.
    pub fn remove_sharer(&self, page_id: PageId, node: NodeId) -> DsmResult<()> {
        self.with_entry(page_id, |state| {
            if let Some(pos) = state.sharers.iter().position(|&n| n == node) {
                state.sharers.swap_remove(pos);
                debug!("page {}: removed sharer {}", page_id, node);
            }
            Ok(())
        })
    }

    /// Snapshot of the current sharer set.
    pub fn get_sharers(&self, page_id: PageId) -> Vec<NodeId> {
        self.with_entry(page_id, |state| state.sharers.to_vec())
    }

    /// Register `owner` for `count` consecutive pages starting at
    /// `start_page_id` (allocation time).
    pub fn assign_range(&self, start_page_id: PageId, count: u64, owner: NodeId) {
        for page_id in start_page_id..start_page_id + count {
            self.with_entry(page_id, |state| {
                state.owner = Some(owner);
            });
        }
        debug!(
            "assigned pages {}..{} to node {}",
            start_page_id,
            start_page_id + count,
            owner
        );
    }

    /// Strip every trace of a failed node: clear ownership where it owned,
    /// drop it from every sharer set. Safe (and a successful no-op) when the
    /// node held nothing.
    pub fn handle_node_failure(&self, node: NodeId) -> DsmResult<()> {
        let mut owned = 0usize;
        let mut shared = 0usize;
        for entry in self.entries.iter() {
            let mut state = entry
                .value()
                .state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if state.owner == Some(node) {
                state.owner = None;
                owned += 1;
            }
            if let Some(pos) = state.sharers.iter().position(|&n| n == node) {
                state.sharers.swap_remove(pos);
                shared += 1;
            }
        }
        debug!(
            "node {} failure: cleared {} ownerships, {} sharer slots",
            node, owned, shared
        );
        Ok(())
    }

    /// Force ownership to `new_owner` after the true owner became
    /// unreachable. The resulting state is unverified, so the sharer set is
    /// cleared and the page treated as exclusive to the claimant.
    pub fn reclaim_ownership(&self, page_id: PageId, new_owner: NodeId) -> DsmResult<()> {
        self.with_entry(page_id, |state| {
            warn!(
                "page {}: ownership reclaimed by {} (was {:?})",
                page_id, new_owner, state.owner
            );
            state.owner = Some(new_owner);
            state.sharers.clear();
            Ok(())
        })
    }

    /// Drop the entry for a page belonging to a freed allocation.
    pub fn remove_entry(&self, page_id: PageId) {
        if let Some(entry) = self.entries.get(&page_id) {
            let mut state = entry
                .value()
                .state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state.valid = false;
        }
        self.entries.remove(&page_id);
    }

    /// Number of live entries (lazily created so this tracks referenced
    /// pages, not the id space).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply one replicated mutation. This is the entire write surface a
    /// standby replica needs to mirror the primary.
    pub fn apply(&self, event: &DirectoryEvent) -> DsmResult<()> {
        match event {
            DirectoryEvent::RangeAssigned {
                start_page_id,
                count,
                owner,
            } => {
                self.assign_range(*start_page_id, *count, *owner);
                Ok(())
            }
            DirectoryEvent::ReaderAdded { page_id, reader } => self.add_reader(*page_id, *reader),
            DirectoryEvent::WriterSet { page_id, writer } => {
                self.set_writer(*page_id, *writer).map(|_| ())
            }
            DirectoryEvent::SharersCleared { page_id } => self.clear_sharers(*page_id),
            DirectoryEvent::SharerRemoved { page_id, node } => {
                self.remove_sharer(*page_id, *node)
            }
            DirectoryEvent::EntryRemoved { page_id } => {
                self.remove_entry(*page_id);
                Ok(())
            }
            DirectoryEvent::NodeFailed { node } => self.handle_node_failure(*node),
            DirectoryEvent::OwnershipReclaimed { page_id, new_owner } => {
                self.reclaim_ownership(*page_id, *new_owner)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_lazily_creates_with_no_owner() {
        let dir = Directory::new();
        assert_eq!(dir.lookup(42), None);
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn add_reader_is_idempotent() {
        let dir = Directory::new();
        dir.add_reader(7, 2).unwrap();
        dir.add_reader(7, 2).unwrap();
        assert_eq!(dir.get_sharers(7), vec![2]);
    }

    #[test]
    fn add_reader_reports_busy_when_full() {
        let dir = Directory::new();
        for node in 0..MAX_SHARERS as NodeId {
            dir.add_reader(1, node).unwrap();
        }
        assert_eq!(dir.add_reader(1, 99), Err(DsmError::Busy));
        // Existing sharers still succeed idempotently.
        dir.add_reader(1, 0).unwrap();
    }

    #[test]
    fn set_writer_builds_invalidate_list_excluding_writer() {
        let dir = Directory::new();
        dir.assign_range(10, 1, 1);
        dir.add_reader(10, 2).unwrap();
        dir.add_reader(10, 3).unwrap();

        let mut list = dir.set_writer(10, 2).unwrap();
        list.sort_unstable();
        // Sharer 3 and old owner 1, never the new writer 2.
        assert_eq!(list, vec![1, 3]);
        assert_eq!(dir.lookup(10), Some(2));
    }

    #[test]
    fn set_writer_does_not_clear_sharers_until_told() {
        let dir = Directory::new();
        dir.assign_range(20, 1, 1);
        dir.add_reader(20, 2).unwrap();
        dir.add_reader(20, 3).unwrap();

        dir.set_writer(20, 3).unwrap();
        let mut sharers = dir.get_sharers(20);
        sharers.sort_unstable();
        // Pre-transfer sharer set survives the ownership change.
        assert_eq!(sharers, vec![2, 3]);

        dir.clear_sharers(20).unwrap();
        assert!(dir.get_sharers(20).is_empty());
        assert_eq!(dir.lookup(20), Some(3));
    }

    #[test]
    fn owner_not_duplicated_in_invalidate_list() {
        let dir = Directory::new();
        dir.assign_range(30, 1, 1);
        // Owner also appears as a sharer (it downgraded to read-only).
        dir.add_reader(30, 1).unwrap();
        dir.add_reader(30, 2).unwrap();

        let mut list = dir.set_writer(30, 2).unwrap();
        list.sort_unstable();
        assert_eq!(list, vec![1]);
    }

    #[test]
    fn node_failure_sweeps_ownership_and_sharers() {
        let dir = Directory::new();
        dir.assign_range(0, 3, 5);
        dir.add_reader(0, 5).unwrap();
        dir.add_reader(0, 2).unwrap();
        dir.add_reader(1, 5).unwrap();

        dir.handle_node_failure(5).unwrap();
        assert_eq!(dir.lookup(0), None);
        assert_eq!(dir.lookup(1), None);
        assert_eq!(dir.lookup(2), None);
        assert_eq!(dir.get_sharers(0), vec![2]);
        assert!(dir.get_sharers(1).is_empty());
    }

    #[test]
    fn node_failure_is_noop_success_for_unknown_node() {
        let dir = Directory::new();
        dir.assign_range(0, 2, 1);
        assert!(dir.handle_node_failure(14).is_ok());
        assert_eq!(dir.lookup(0), Some(1));
    }

    #[test]
    fn reclaim_clears_sharers_and_forces_owner() {
        let dir = Directory::new();
        dir.assign_range(50, 1, 1);
        dir.add_reader(50, 2).unwrap();
        dir.add_reader(50, 3).unwrap();

        dir.reclaim_ownership(50, 4).unwrap();
        assert_eq!(dir.lookup(50), Some(4));
        assert!(dir.get_sharers(50).is_empty());
    }

    #[test]
    fn apply_mirrors_direct_mutations() {
        let primary = Directory::new();
        let replica = Directory::new();

        let events = vec![
            DirectoryEvent::RangeAssigned {
                start_page_id: 0,
                count: 2,
                owner: 1,
            },
            DirectoryEvent::ReaderAdded { page_id: 0, reader: 2 },
            DirectoryEvent::WriterSet { page_id: 0, writer: 2 },
            DirectoryEvent::SharersCleared { page_id: 0 },
        ];
        for event in &events {
            primary.apply(event).unwrap();
            replica.apply(event).unwrap();
        }

        assert_eq!(primary.lookup(0), replica.lookup(0));
        assert_eq!(primary.get_sharers(0), replica.get_sharers(0));
        assert_eq!(replica.lookup(0), Some(2));
    }

    #[test]
    fn remove_entry_then_lookup_recreates_fresh() {
        let dir = Directory::new();
        dir.assign_range(9, 1, 3);
        dir.remove_entry(9);
        assert_eq!(dir.lookup(9), None);
    }
}
