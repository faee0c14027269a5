//! Coherence authority access
//!
//! The directory lives on one node. The migration protocol talks to it
//! through `CoherenceAuthority`, so the same fetch code runs everywhere:
//! `LocalAuthority` calls straight into the resident directory,
//! `RemoteAuthority` turns each operation into a directory query/update
//! message and blocks on the correlated reply.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::warn;

use crate::dsm::coherence::directory::Directory;
use crate::dsm::net::protocol::{DirStatus, Message};
use crate::dsm::net::transport::Transport;
use crate::dsm::types::{DsmError, DsmResult, NodeId, PageId};

/// Decoded body of a `DirReply`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirReplyData {
    pub status: DirStatus,
    pub owner: Option<NodeId>,
    pub nodes: Vec<NodeId>,
}

impl DirReplyData {
    /// Map a remote status back into the local error taxonomy.
    fn into_result(self) -> DsmResult<DirReplyData> {
        match self.status {
            DirStatus::Ok => Ok(self),
            DirStatus::NotFound => Err(DsmError::NotFound),
            DirStatus::Busy => Err(DsmError::Busy),
            DirStatus::Invalid => Err(DsmError::invalid("directory rejected request")),
        }
    }
}

/// One outstanding directory request awaiting its reply.
#[derive(Debug, Default)]
pub struct ReplySlot {
    state: Mutex<Option<DirReplyData>>,
    arrived: Condvar,
}

impl ReplySlot {
    /// Block until the reply lands or the deadline passes.
    fn wait(&self, timeout: Duration) -> Option<DirReplyData> {
        let guard = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let (mut guard, result) = self
            .arrived
            .wait_timeout_while(guard, timeout, |state| state.is_none())
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if result.timed_out() && guard.is_none() {
            return None;
        }
        guard.take()
    }

    fn complete(&self, data: DirReplyData) {
        let mut guard = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Some(data);
        self.arrived.notify_all();
    }
}

/// Router from reply sequence numbers to waiting request threads.
#[derive(Debug, Default)]
pub struct DirPending {
    slots: Mutex<HashMap<u64, Arc<ReplySlot>>>,
}

impl DirPending {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in the reply to request `seq`. Must happen before
    /// the request is sent so the reply can never race the registration.
    pub fn register(&self, seq: u64) -> Arc<ReplySlot> {
        let slot = Arc::new(ReplySlot::default());
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(seq, Arc::clone(&slot));
        slot
    }

    /// Deliver a reply to whoever is waiting on `seq`.
    pub fn complete(&self, seq: u64, data: DirReplyData) {
        let slot = self
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&seq);
        match slot {
            Some(slot) => slot.complete(data),
            None => warn!("directory reply for unknown request seq {}", seq),
        }
    }

    /// Forget a request that failed to send or timed out.
    pub fn cancel(&self, seq: u64) {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&seq);
    }
}

/// The directory operations the migration protocol needs, location-blind.
pub trait CoherenceAuthority: Send + Sync + Debug {
    /// Current owner of a page, if any is registered.
    fn lookup(&self, page_id: PageId) -> DsmResult<Option<NodeId>>;
    /// Register a read-only sharer (idempotent, bounded).
    fn add_reader(&self, page_id: PageId, reader: NodeId) -> DsmResult<()>;
    /// Transfer ownership, returning the nodes to invalidate.
    fn set_writer(&self, page_id: PageId, writer: NodeId) -> DsmResult<Vec<NodeId>>;
    /// Clear the sharer set after invalidations are confirmed.
    fn clear_sharers(&self, page_id: PageId) -> DsmResult<()>;
    /// Remove one sharer.
    fn remove_sharer(&self, page_id: PageId, node: NodeId) -> DsmResult<()>;
    /// Register ownership of a freshly allocated range.
    fn assign_range(&self, start_page_id: PageId, count: u64, owner: NodeId) -> DsmResult<()>;
    /// Drop the entries of a freed range.
    fn release_range(&self, start_page_id: PageId, count: u64) -> DsmResult<()>;
    /// Strip a failed node from every entry.
    fn node_failed(&self, node: NodeId) -> DsmResult<()>;
    /// Force-transfer ownership away from an unreachable owner.
    fn reclaim_ownership(&self, page_id: PageId, new_owner: NodeId) -> DsmResult<()>;
}

/// Authority access on the node hosting the directory.
#[derive(Debug)]
pub struct LocalAuthority {
    directory: Arc<Directory>,
}

impl LocalAuthority {
    pub fn new(directory: Arc<Directory>) -> Self {
        Self { directory }
    }
}

impl CoherenceAuthority for LocalAuthority {
    fn lookup(&self, page_id: PageId) -> DsmResult<Option<NodeId>> {
        Ok(self.directory.lookup(page_id))
    }

    fn add_reader(&self, page_id: PageId, reader: NodeId) -> DsmResult<()> {
        self.directory.add_reader(page_id, reader)
    }

    fn set_writer(&self, page_id: PageId, writer: NodeId) -> DsmResult<Vec<NodeId>> {
        self.directory.set_writer(page_id, writer)
    }

    fn clear_sharers(&self, page_id: PageId) -> DsmResult<()> {
        self.directory.clear_sharers(page_id)
    }

    fn remove_sharer(&self, page_id: PageId, node: NodeId) -> DsmResult<()> {
        self.directory.remove_sharer(page_id, node)
    }

    fn assign_range(&self, start_page_id: PageId, count: u64, owner: NodeId) -> DsmResult<()> {
        self.directory.assign_range(start_page_id, count, owner);
        Ok(())
    }

    fn release_range(&self, start_page_id: PageId, count: u64) -> DsmResult<()> {
        for page_id in start_page_id..start_page_id + count {
            self.directory.remove_entry(page_id);
        }
        Ok(())
    }

    fn node_failed(&self, node: NodeId) -> DsmResult<()> {
        self.directory.handle_node_failure(node)
    }

    fn reclaim_ownership(&self, page_id: PageId, new_owner: NodeId) -> DsmResult<()> {
        self.directory.reclaim_ownership(page_id, new_owner)
    }
}

/// Authority access from a node that does not host the directory: each call
/// is a request/reply round trip to the manager.
#[derive(Debug)]
pub struct RemoteAuthority {
    transport: Arc<dyn Transport>,
    manager: NodeId,
    pending: Arc<DirPending>,
    timeout: Duration,
}

impl RemoteAuthority {
    pub fn new(
        transport: Arc<dyn Transport>,
        manager: NodeId,
        pending: Arc<DirPending>,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            manager,
            pending,
            timeout,
        }
    }

    fn request(&self, msg: Message) -> DsmResult<DirReplyData> {
        let seq = self.transport.allocate_seq();
        let slot = self.pending.register(seq);
        if let Err(e) = self.transport.send_seq(self.manager, &msg, seq) {
            self.pending.cancel(seq);
            return Err(e);
        }
        match slot.wait(self.timeout) {
            Some(data) => data.into_result(),
            None => {
                self.pending.cancel(seq);
                Err(DsmError::Timeout)
            }
        }
    }
}

impl CoherenceAuthority for RemoteAuthority {
    fn lookup(&self, page_id: PageId) -> DsmResult<Option<NodeId>> {
        let reply = self.request(Message::DirLookup { page_id })?;
        Ok(reply.owner)
    }

    fn add_reader(&self, page_id: PageId, reader: NodeId) -> DsmResult<()> {
        self.request(Message::DirAddReader { page_id, reader })
            .map(|_| ())
    }

    fn set_writer(&self, page_id: PageId, writer: NodeId) -> DsmResult<Vec<NodeId>> {
        let reply = self.request(Message::DirSetWriter { page_id, writer })?;
        Ok(reply.nodes)
    }

    fn clear_sharers(&self, page_id: PageId) -> DsmResult<()> {
        self.request(Message::DirClearSharers { page_id }).map(|_| ())
    }

    fn remove_sharer(&self, page_id: PageId, node: NodeId) -> DsmResult<()> {
        self.request(Message::DirRemoveSharer { page_id, node })
            .map(|_| ())
    }

    fn assign_range(&self, start_page_id: PageId, count: u64, owner: NodeId) -> DsmResult<()> {
        self.request(Message::DirAssignRange {
            start_page_id,
            count,
            owner,
        })
        .map(|_| ())
    }

    fn release_range(&self, start_page_id: PageId, count: u64) -> DsmResult<()> {
        self.request(Message::DirReleaseRange {
            start_page_id,
            count,
        })
        .map(|_| ())
    }

    fn node_failed(&self, node: NodeId) -> DsmResult<()> {
        // Fire-and-forget notification; the authority sweeps on receipt.
        self.transport.send(self.manager, &Message::NodeFailure { node })
    }

    fn reclaim_ownership(&self, page_id: PageId, new_owner: NodeId) -> DsmResult<()> {
        self.request(Message::DirReclaim { page_id, new_owner })
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn reply_slot_delivers_before_deadline() {
        let pending = Arc::new(DirPending::new());
        let slot = pending.register(7);

        let pending_clone = Arc::clone(&pending);
        let handle = thread::spawn(move || {
            pending_clone.complete(
                7,
                DirReplyData {
                    status: DirStatus::Ok,
                    owner: Some(3),
                    nodes: vec![],
                },
            );
        });

        let reply = slot.wait(Duration::from_secs(2)).unwrap();
        assert_eq!(reply.owner, Some(3));
        handle.join().unwrap();
    }

    #[test]
    fn reply_slot_times_out_when_nothing_arrives() {
        let pending = DirPending::new();
        let slot = pending.register(9);
        assert!(slot.wait(Duration::from_millis(50)).is_none());
        pending.cancel(9);
    }

    #[test]
    fn local_authority_mirrors_directory() {
        let directory = Arc::new(Directory::new());
        let authority = LocalAuthority::new(Arc::clone(&directory));

        authority.assign_range(100, 4, 1).unwrap();
        assert_eq!(authority.lookup(101).unwrap(), Some(1));

        authority.add_reader(101, 2).unwrap();
        let list = authority.set_writer(101, 2).unwrap();
        assert_eq!(list, vec![1]);
        // Deferred clear: directory still remembers the sharer set.
        assert_eq!(directory.get_sharers(101), vec![2]);
        authority.clear_sharers(101).unwrap();
        assert!(directory.get_sharers(101).is_empty());

        authority.release_range(100, 4).unwrap();
        assert_eq!(directory.lookup(100), None);
    }

    #[test]
    fn remote_status_mapping() {
        let data = DirReplyData {
            status: DirStatus::Busy,
            owner: None,
            nodes: vec![],
        };
        assert_eq!(data.into_result(), Err(DsmError::Busy));
    }
}
