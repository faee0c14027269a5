//! Page migration protocol
//!
//! The read-fetch and write-fetch algorithms plus the handler-side halves:
//! serving a page request, completing a fetch from an arriving reply,
//! applying an invalidation, and counting invalidation acknowledgements.
//!
//! Every wait is bounded. A fetch that times out clears the entry's pending
//! flag before returning so a later attempt starts clean. Concurrent local
//! threads faulting on the same page coalesce onto the single outstanding
//! request by blocking on the entry's ready condition instead of sending a
//! duplicate.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, warn};

use crate::dsm::context::DsmContext;
use crate::dsm::memory::page_table::{PageEntry, PageTable};
use crate::dsm::memory::permission::apply_state;
use crate::dsm::net::protocol::Message;
use crate::dsm::types::{
    page_creator, AccessKind, DsmError, DsmResult, NodeId, PageId, PageState, PAGE_SIZE,
};

fn entry_of(table: &Arc<PageTable>, page_id: PageId) -> DsmResult<&PageEntry> {
    table.lookup_by_id(page_id).ok_or(DsmError::NotFound)
}

/// Resolve the page's owner, falling back to the creating node when the
/// directory has no registration yet.
fn resolve_owner(ctx: &DsmContext, page_id: PageId) -> DsmResult<NodeId> {
    Ok(ctx
        .authority()
        .lookup(page_id)?
        .unwrap_or_else(|| page_creator(page_id)))
}

/// Obtain read access to `page_id`, fetching the bytes from the current
/// owner if the local copy is invalid.
pub fn fetch_for_read(ctx: &DsmContext, page_id: PageId) -> DsmResult<()> {
    let start = Instant::now();
    let table = ctx.table_by_id(page_id).ok_or(DsmError::NotFound)?;
    let entry = entry_of(&table, page_id)?;

    // Fresh local copy: nothing to do, and no network traffic.
    {
        let slot = entry.lock();
        if slot.state.can_read() {
            return Ok(());
        }
    }

    let owner = resolve_owner(ctx, page_id)?;
    if owner == ctx.node_id() {
        // Own copy is the freshest there is; widen permission only.
        let mut slot = entry.lock();
        if !slot.state.can_read() {
            apply_state(&mut slot, entry.addr(), PageState::ReadOnly, ctx.backend())?;
        }
        slot.owner_hint = owner;
        debug!("page {}: already owned, widened to read", page_id);
        return Ok(());
    }

    // One outstanding request per page: either this thread owns the fetch
    // or it queues behind the one in flight.
    {
        let mut slot = entry.lock();
        if slot.pending {
            slot.waiters += 1;
            let (mut slot, _result) = entry
                .ready
                .wait_timeout_while(slot, ctx.protocol().read_fetch_timeout, |s| s.pending)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            slot.waiters -= 1;
            if slot.pending {
                ctx.counters().timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(DsmError::Timeout);
            }
            // The fetch completed — or was superseded by an invalidation,
            // in which case the caller re-faults against the new owner.
            return Ok(());
        }
        slot.pending = true;
        slot.pending_kind = AccessKind::Read;
        slot.fetch_invalidated = false;
    }

    debug!(
        "node {}: fetching page {} for read from node {}",
        ctx.node_id(),
        page_id,
        owner
    );
    if let Err(e) = ctx.transport().send(
        owner,
        &Message::PageRequest {
            page_id,
            access: AccessKind::Read,
            requester: ctx.node_id(),
        },
    ) {
        abort_pending(entry);
        ctx.report_send_failure(owner, &e);
        return Err(e);
    }

    // Await the reply; the dispatcher completes the fetch and signals.
    let installed = {
        let slot = entry.lock();
        let (mut slot, _result) = entry
            .ready
            .wait_timeout_while(slot, ctx.protocol().read_fetch_timeout, |s| s.pending)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.pending {
            slot.pending = false;
            entry.ready.notify_all();
            ctx.counters().timeouts.fetch_add(1, Ordering::Relaxed);
            warn!("node {}: timed out fetching page {}", ctx.node_id(), page_id);
            return Err(DsmError::Timeout);
        }
        if slot.state.can_read() {
            slot.owner_hint = owner;
            true
        } else {
            // Invalidated in flight; the caller re-faults and retries.
            false
        }
    };

    if installed {
        // Register as a reader so the next writer knows to invalidate us.
        ctx.authority().add_reader(page_id, ctx.node_id())?;
        ctx.counters().record_fetch(start.elapsed().as_nanos() as u64);
        debug!("node {}: fetched page {} for read", ctx.node_id(), page_id);
    }
    Ok(())
}

/// Obtain exclusive write access to `page_id`: take ownership at the
/// directory, invalidate every other copy, and fetch the bytes if a remote
/// node held them.
pub fn fetch_for_write(ctx: &DsmContext, page_id: PageId) -> DsmResult<()> {
    let start = Instant::now();
    let table = ctx.table_by_id(page_id).ok_or(DsmError::NotFound)?;
    let entry = entry_of(&table, page_id)?;
    let self_id = ctx.node_id();

    {
        let slot = entry.lock();
        if slot.state.can_write() {
            return Ok(());
        }
    }

    // Coalesce behind an in-flight fetch. If that fetch only obtained read
    // access the caller re-faults and comes back here.
    {
        let mut slot = entry.lock();
        if slot.pending {
            slot.waiters += 1;
            let (mut slot, _result) = entry
                .ready
                .wait_timeout_while(slot, ctx.protocol().write_fetch_timeout, |s| s.pending)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            slot.waiters -= 1;
            if slot.pending {
                ctx.counters().timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(DsmError::Timeout);
            }
            return Ok(());
        }
        slot.pending = true;
        slot.pending_kind = AccessKind::Write;
        slot.fetch_invalidated = false;
    }

    let owner = match resolve_owner(ctx, page_id) {
        Ok(owner) => owner,
        Err(e) => {
            abort_pending(entry);
            return Err(e);
        }
    };

    // The directory records us as owner atomically with handing back the
    // invalidation list; sharers stay registered until we confirm below.
    let invalidate = match ctx.authority().set_writer(page_id, self_id) {
        Ok(list) => list,
        Err(e) => {
            abort_pending(entry);
            return Err(e);
        }
    };

    if !invalidate.is_empty() {
        {
            let mut slot = entry.lock();
            slot.pending_acks.clear();
            for &node in &invalidate {
                if !slot.pending_acks.contains(&node) {
                    let _ = slot.pending_acks.try_push(node);
                }
            }
        }

        for &node in &invalidate {
            debug!(
                "node {}: invalidating page {} at node {}",
                self_id, page_id, node
            );
            match ctx.transport().send(
                node,
                &Message::Invalidate {
                    page_id,
                    new_owner: self_id,
                },
            ) {
                Ok(()) => {
                    ctx.counters()
                        .invalidations_sent
                        .fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    // Unreachable sharer: don't wait for its ack.
                    warn!(
                        "node {}: invalidate of page {} to node {} failed: {}",
                        self_id, page_id, node, e
                    );
                    let mut slot = entry.lock();
                    if let Some(pos) = slot.pending_acks.iter().position(|&n| n == node) {
                        slot.pending_acks.swap_remove(pos);
                    }
                    if slot.pending_acks.is_empty() {
                        entry.acks_drained.notify_all();
                    }
                    drop(slot);
                    ctx.report_send_failure(node, &e);
                }
            }
        }

        // Counted acknowledgement collection: proceed once every listed
        // node confirmed, or after the deadline for stragglers.
        let slot = entry.lock();
        let (mut slot, result) = entry
            .acks_drained
            .wait_timeout_while(slot, ctx.protocol().invalidate_ack_timeout, |s| {
                !s.pending_acks.is_empty()
            })
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if result.timed_out() && !slot.pending_acks.is_empty() {
            warn!(
                "node {}: page {} missing {} invalidation acks, proceeding",
                self_id,
                page_id,
                slot.pending_acks.len()
            );
            ctx.counters().timeouts.fetch_add(1, Ordering::Relaxed);
            slot.pending_acks.clear();
        }
    }

    if owner != self_id {
        debug!(
            "node {}: fetching page {} for write from node {}",
            self_id, page_id, owner
        );
        if let Err(e) = ctx.transport().send(
            owner,
            &Message::PageRequest {
                page_id,
                access: AccessKind::Write,
                requester: self_id,
            },
        ) {
            abort_pending(entry);
            ctx.report_send_failure(owner, &e);
            return Err(e);
        }

        let installed = {
            let slot = entry.lock();
            let (mut slot, _result) = entry
                .ready
                .wait_timeout_while(slot, ctx.protocol().write_fetch_timeout, |s| s.pending)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if slot.pending {
                slot.pending = false;
                entry.ready.notify_all();
                ctx.counters().timeouts.fetch_add(1, Ordering::Relaxed);
                warn!("node {}: timed out fetching page {}", self_id, page_id);
                return Err(DsmError::Timeout);
            }
            if slot.state.can_write() {
                slot.owner_hint = self_id;
                true
            } else {
                // A later writer invalidated us mid-fetch; the caller
                // re-faults against it.
                false
            }
        };

        if installed {
            ctx.counters().record_fetch(start.elapsed().as_nanos() as u64);
            // Invalidations confirmed and the copy is here: now the stale
            // sharer registrations may go.
            ctx.authority().clear_sharers(page_id)?;
        }
    } else {
        // Already held the bytes; widen permission in place.
        let superseded = {
            let mut slot = entry.lock();
            if slot.fetch_invalidated {
                // A competing writer took the page while we collected
                // acks; give up this round and let the access re-fault.
                slot.fetch_invalidated = false;
                slot.pending = false;
                entry.ready.notify_all();
                true
            } else {
                if let Err(e) =
                    apply_state(&mut slot, entry.addr(), PageState::ReadWrite, ctx.backend())
                {
                    slot.pending = false;
                    entry.ready.notify_all();
                    return Err(e);
                }
                slot.owner_hint = self_id;
                slot.version += 1;
                slot.pending = false;
                entry.ready.notify_all();
                false
            }
        };
        if !superseded && !invalidate.is_empty() {
            ctx.authority().clear_sharers(page_id)?;
        }
    }

    debug!("node {}: page {} now writable", self_id, page_id);
    Ok(())
}

/// Clear a failed fetch's pending flag and wake coalesced waiters.
fn abort_pending(entry: &PageEntry) {
    let mut slot = entry.lock();
    slot.pending = false;
    entry.ready.notify_all();
}

/// Serve an incoming page request: always reply with the current bytes,
/// then downgrade — to INVALID when ownership moved (WRITE), to READ_ONLY
/// when a second reader now exists (READ).
pub fn serve_page_request(
    ctx: &DsmContext,
    page_id: PageId,
    access: AccessKind,
    requester: NodeId,
) -> DsmResult<()> {
    let table = ctx.table_by_id(page_id).ok_or(DsmError::NotFound)?;
    let entry = entry_of(&table, page_id)?;

    let (data, version) = {
        let slot = entry.lock();
        (slot.data.clone(), slot.version)
    };

    ctx.transport().send(
        requester,
        &Message::PageReply {
            page_id,
            version,
            data,
        },
    )?;
    ctx.counters().pages_served.fetch_add(1, Ordering::Relaxed);

    // Downgrade strictly after the reply is on the wire.
    let mut slot = entry.lock();
    match access {
        AccessKind::Write => {
            apply_state(&mut slot, entry.addr(), PageState::Invalid, ctx.backend())?;
            slot.owner_hint = requester;
            debug!(
                "node {}: page {} transferred to node {}",
                ctx.node_id(),
                page_id,
                requester
            );
        }
        AccessKind::Read => {
            if slot.state == PageState::ReadWrite {
                apply_state(&mut slot, entry.addr(), PageState::ReadOnly, ctx.backend())?;
            }
            debug!(
                "node {}: page {} shared with node {}",
                ctx.node_id(),
                page_id,
                requester
            );
        }
    }
    Ok(())
}

/// Install an arriving page reply: copy the payload, record the version,
/// apply the state the fetch was issued for, and wake every waiter.
pub fn complete_fetch(
    ctx: &DsmContext,
    page_id: PageId,
    version: u64,
    data: &[u8; PAGE_SIZE],
) -> DsmResult<()> {
    let table = ctx.table_by_id(page_id).ok_or(DsmError::NotFound)?;
    let entry = entry_of(&table, page_id)?;

    let mut slot = entry.lock();
    if !slot.pending {
        // Nobody is waiting: a reply that outlived its fetch's timeout.
        // Installing it would create a copy the directory knows nothing
        // about, so drop it.
        debug!(
            "node {}: dropped unsolicited reply for page {}",
            ctx.node_id(),
            page_id
        );
        return Ok(());
    }
    if slot.fetch_invalidated {
        // Ownership moved while the reply was in flight: these bytes are
        // stale relative to the new owner. Install nothing; waiters wake,
        // re-fault and fetch from the new owner.
        slot.fetch_invalidated = false;
        slot.pending = false;
        entry.ready.notify_all();
        debug!(
            "node {}: dropped superseded reply for page {}",
            ctx.node_id(),
            page_id
        );
        return Ok(());
    }
    slot.data.copy_from_slice(data);
    let target = match slot.pending_kind {
        AccessKind::Read => PageState::ReadOnly,
        // Taking write ownership starts a new version of the page.
        AccessKind::Write => PageState::ReadWrite,
    };
    slot.version = match target {
        PageState::ReadWrite => version + 1,
        _ => version,
    };
    apply_state(&mut slot, entry.addr(), target, ctx.backend())?;
    let waiters = slot.waiters;
    slot.pending = false;
    entry.ready.notify_all();
    drop(slot);

    if waiters > 0 {
        debug!(
            "node {}: page {} arrival woke {} coalesced waiters",
            ctx.node_id(),
            page_id,
            waiters
        );
    }
    Ok(())
}

/// Drop the local copy on an invalidation directive, then acknowledge to
/// the new owner. Unknown pages are acknowledged anyway so the writer never
/// waits on a node that holds nothing.
pub fn apply_invalidate(
    ctx: &DsmContext,
    page_id: PageId,
    new_owner: NodeId,
    sender: NodeId,
) -> DsmResult<()> {
    if let Some(table) = ctx.table_by_id(page_id) {
        if let Some(entry) = table.lookup_by_id(page_id) {
            let mut slot = entry.lock();
            apply_state(&mut slot, entry.addr(), PageState::Invalid, ctx.backend())?;
            slot.owner_hint = new_owner;
            if slot.pending {
                // The copy this node is waiting on predates the transfer.
                slot.fetch_invalidated = true;
            }
            drop(slot);
            ctx.counters()
                .invalidations_received
                .fetch_add(1, Ordering::Relaxed);
            debug!(
                "node {}: invalidated page {} (new owner {})",
                ctx.node_id(),
                page_id,
                new_owner
            );
        }
    } else {
        debug!(
            "node {}: invalidate for unknown page {}, acking anyway",
            ctx.node_id(),
            page_id
        );
    }

    ctx.transport().send(
        sender,
        &Message::InvalidateAck {
            page_id,
            acker: ctx.node_id(),
        },
    )
}

/// Count one invalidation acknowledgement toward the expected set; wakes
/// the writer once the set drains.
pub fn note_invalidate_ack(ctx: &DsmContext, page_id: PageId, acker: NodeId) {
    let Some(table) = ctx.table_by_id(page_id) else {
        warn!("ack for unknown page {} from node {}", page_id, acker);
        return;
    };
    let Some(entry) = table.lookup_by_id(page_id) else {
        return;
    };

    let mut slot = entry.lock();
    if let Some(pos) = slot.pending_acks.iter().position(|&n| n == acker) {
        slot.pending_acks.swap_remove(pos);
        debug!(
            "page {}: ack from node {} ({} outstanding)",
            page_id,
            acker,
            slot.pending_acks.len()
        );
        if slot.pending_acks.is_empty() {
            entry.acks_drained.notify_all();
        }
    }
}
