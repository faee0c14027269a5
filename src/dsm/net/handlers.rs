//! Protocol message handlers
//!
//! Executed inline on the dispatcher thread. Handlers are short and never
//! block on a protocol wait; anything that must sleep lives on the
//! requesting thread instead.

use log::{debug, info, warn};

use crate::dsm::coherence::authority::DirReplyData;
use crate::dsm::coherence::migration;
use crate::dsm::context::DsmContext;
use crate::dsm::memory::allocator;
use crate::dsm::net::protocol::{DirStatus, Message, WireHeader};
use crate::dsm::sync::{barrier, lock};
use crate::dsm::types::{DsmError, DsmResult, NodeId};

/// Route one inbound message to its handler.
pub fn dispatch(ctx: &DsmContext, header: &WireHeader, msg: Message) -> DsmResult<()> {
    match msg {
        Message::PageRequest {
            page_id,
            access,
            requester,
        } => migration::serve_page_request(ctx, page_id, access, requester),
        Message::PageReply {
            page_id,
            version,
            data,
        } => migration::complete_fetch(ctx, page_id, version, &data),
        Message::Invalidate { page_id, new_owner } => {
            migration::apply_invalidate(ctx, page_id, new_owner, header.sender)
        }
        Message::InvalidateAck { page_id, acker } => {
            migration::note_invalidate_ack(ctx, page_id, acker);
            Ok(())
        }

        msg @ (Message::DirLookup { .. }
        | Message::DirAddReader { .. }
        | Message::DirSetWriter { .. }
        | Message::DirClearSharers { .. }
        | Message::DirRemoveSharer { .. }
        | Message::DirAssignRange { .. }
        | Message::DirReleaseRange { .. }
        | Message::DirReclaim { .. }) => handle_dir_request(ctx, header, msg),

        Message::DirReply {
            request_seq,
            status,
            owner,
            nodes,
        } => {
            ctx.dir_pending().complete(
                request_seq,
                DirReplyData {
                    status,
                    owner,
                    nodes,
                },
            );
            Ok(())
        }

        Message::NodeFailure { node } => handle_node_failure(ctx, node),

        Message::AllocNotify {
            start_page_id,
            end_page_id,
            owner,
            base_addr,
            total_size,
        } => allocator::handle_alloc_notify(
            ctx,
            start_page_id,
            end_page_id,
            owner,
            base_addr,
            total_size,
        ),
        Message::AllocAck {
            start_page_id,
            acker,
        } => {
            ctx.allocs().note_ack(start_page_id, acker);
            Ok(())
        }

        Message::NodeJoin { node_id, port } => {
            info!(
                "node {}: node {} joined (port {})",
                ctx.node_id(),
                node_id,
                port
            );
            Ok(())
        }
        Message::NodeLeave { node_id } => {
            info!("node {}: node {} left", ctx.node_id(), node_id);
            ctx.transport().mark_failed(node_id);
            if ctx.is_manager() {
                ctx.authority().node_failed(node_id)?;
            }
            Ok(())
        }

        Message::LockRequest { lock_id, requester } => {
            lock::manager_request(ctx, lock_id, requester)
        }
        Message::LockGrant { lock_id, .. } => {
            ctx.locks().signal_granted(lock_id);
            Ok(())
        }
        Message::LockRelease { lock_id, releaser } => {
            lock::manager_release(ctx, lock_id, releaser)
        }

        Message::BarrierArrive {
            barrier_id,
            arriver,
            num_participants,
        } => barrier::manager_arrive(ctx, barrier_id, arriver, num_participants as usize),
        Message::BarrierRelease { barrier_id } => {
            ctx.barriers().signal_released(barrier_id);
            Ok(())
        }
    }
}

fn status_of(result: &DsmResult<()>) -> DirStatus {
    match result {
        Ok(()) => DirStatus::Ok,
        Err(DsmError::NotFound) => DirStatus::NotFound,
        Err(DsmError::Busy) => DirStatus::Busy,
        Err(_) => DirStatus::Invalid,
    }
}

/// Execute a directory request on behalf of a remote node and send back the
/// correlated reply.
fn handle_dir_request(ctx: &DsmContext, header: &WireHeader, msg: Message) -> DsmResult<()> {
    let Some(directory) = ctx.directory() else {
        warn!(
            "node {}: directory request from node {} but this node is not the authority",
            ctx.node_id(),
            header.sender
        );
        return Err(DsmError::invalid("not the coherence authority"));
    };

    let mut owner: Option<NodeId> = None;
    let mut nodes: Vec<NodeId> = Vec::new();
    let status = match msg {
        Message::DirLookup { page_id } => {
            owner = directory.lookup(page_id);
            DirStatus::Ok
        }
        Message::DirAddReader { page_id, reader } => {
            status_of(&directory.add_reader(page_id, reader))
        }
        Message::DirSetWriter { page_id, writer } => match directory.set_writer(page_id, writer)
        {
            Ok(list) => {
                nodes = list;
                DirStatus::Ok
            }
            Err(e) => status_of(&Err(e)),
        },
        Message::DirClearSharers { page_id } => status_of(&directory.clear_sharers(page_id)),
        Message::DirRemoveSharer { page_id, node } => {
            status_of(&directory.remove_sharer(page_id, node))
        }
        Message::DirAssignRange {
            start_page_id,
            count,
            owner,
        } => {
            directory.assign_range(start_page_id, count, owner);
            DirStatus::Ok
        }
        Message::DirReleaseRange {
            start_page_id,
            count,
        } => {
            for page_id in start_page_id..start_page_id + count {
                directory.remove_entry(page_id);
            }
            DirStatus::Ok
        }
        Message::DirReclaim { page_id, new_owner } => {
            status_of(&directory.reclaim_ownership(page_id, new_owner))
        }
        other => {
            debug!("unexpected message in directory path: {:?}", other.kind_code());
            DirStatus::Invalid
        }
    };

    ctx.transport().send(
        header.sender,
        &Message::DirReply {
            request_seq: header.seq,
            status,
            owner,
            nodes,
        },
    )
}

fn handle_node_failure(ctx: &DsmContext, node: NodeId) -> DsmResult<()> {
    warn!("node {}: node {} reported failed", ctx.node_id(), node);
    ctx.transport().mark_failed(node);
    if ctx.is_manager() {
        ctx.authority().node_failed(node)?;
    }
    Ok(())
}
