//! Wire protocol message definitions and codec
//!
//! Every message travels as a 4-byte big-endian length prefix followed by a
//! bincode-encoded header and payload. The header carries a magic value for
//! framing validation, the message kind, the payload length, the sender id
//! and a per-sender monotonically increasing sequence number.

use bincode::{Decode, Encode};

use crate::dsm::types::{AccessKind, BarrierId, DsmError, DsmResult, LockId, NodeId, PageId, PAGE_SIZE};

/// Magic value validating every frame ("QULT").
pub const MSG_MAGIC: u32 = 0x5155_4C54;

/// Upper bound on one frame body: largest payload (a full page reply) plus
/// generous header room. Anything larger is rejected as corrupt framing.
pub const MAX_FRAME_LEN: usize = PAGE_SIZE + 512;

/// Common header prepended to every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct WireHeader {
    /// Framing validation value, always [`MSG_MAGIC`].
    pub magic: u32,
    /// Message kind code, must match the payload variant.
    pub kind: u8,
    /// Encoded payload length in bytes.
    pub length: u32,
    /// Sender node id.
    pub sender: NodeId,
    /// Per-sender monotonically increasing sequence number.
    pub seq: u64,
}

/// Outcome of a directory operation executed on behalf of a remote node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum DirStatus {
    Ok,
    NotFound,
    Busy,
    Invalid,
}

/// Protocol messages exchanged between nodes.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum Message {
    /// Request a page's bytes from its current owner.
    PageRequest {
        page_id: PageId,
        access: AccessKind,
        requester: NodeId,
    },
    /// Reply carrying the page's current bytes.
    PageReply {
        page_id: PageId,
        version: u64,
        data: Box<[u8; PAGE_SIZE]>,
    },
    /// Directive to drop a local copy; ownership has moved to `new_owner`.
    Invalidate { page_id: PageId, new_owner: NodeId },
    /// Acknowledgement that `acker` dropped its copy of `page_id`.
    InvalidateAck { page_id: PageId, acker: NodeId },

    /// Directory query: current owner of a page.
    DirLookup { page_id: PageId },
    /// Directory update: register a read-only sharer.
    DirAddReader { page_id: PageId, reader: NodeId },
    /// Directory update: transfer ownership, returning the invalidate list.
    DirSetWriter { page_id: PageId, writer: NodeId },
    /// Directory update: clear the sharer set once invalidations confirmed.
    DirClearSharers { page_id: PageId },
    /// Directory update: remove one sharer.
    DirRemoveSharer { page_id: PageId, node: NodeId },
    /// Directory update: register `owner` for a contiguous id range.
    DirAssignRange {
        start_page_id: PageId,
        count: u64,
        owner: NodeId,
    },
    /// Directory update: drop the entries of a freed allocation.
    DirReleaseRange { start_page_id: PageId, count: u64 },
    /// Directory update: force-transfer ownership of a page whose owner is
    /// unreachable.
    DirReclaim { page_id: PageId, new_owner: NodeId },
    /// Reply to any directory request, correlated by the request's sequence
    /// number. `owner` answers lookups, `nodes` carries sharer/invalidate
    /// lists.
    DirReply {
        request_seq: u64,
        status: DirStatus,
        owner: Option<NodeId>,
        nodes: Vec<NodeId>,
    },
    /// Notification that `node` is unreachable; the authority clears its
    /// ownership and sharer registrations.
    NodeFailure { node: NodeId },

    /// Broadcast announcing a new allocation so peers can map the same
    /// address range (single virtual address space).
    AllocNotify {
        start_page_id: PageId,
        end_page_id: PageId,
        owner: NodeId,
        base_addr: u64,
        total_size: u64,
    },
    /// Acknowledgement that the sender mapped the announced allocation.
    AllocAck { start_page_id: PageId, acker: NodeId },

    /// Worker identifying itself after connecting.
    NodeJoin { node_id: NodeId, port: u16 },
    /// Orderly departure.
    NodeLeave { node_id: NodeId },

    /// Centralized lock primitives.
    LockRequest { lock_id: LockId, requester: NodeId },
    LockGrant { lock_id: LockId, grantee: NodeId },
    LockRelease { lock_id: LockId, releaser: NodeId },

    /// Centralized barrier primitives.
    BarrierArrive {
        barrier_id: BarrierId,
        arriver: NodeId,
        num_participants: u32,
    },
    BarrierRelease { barrier_id: BarrierId },
}

impl Message {
    /// Stable kind code recorded in the wire header.
    pub fn kind_code(&self) -> u8 {
        match self {
            Message::PageRequest { .. } => 1,
            Message::PageReply { .. } => 2,
            Message::Invalidate { .. } => 3,
            Message::InvalidateAck { .. } => 4,
            Message::LockRequest { .. } => 5,
            Message::LockGrant { .. } => 6,
            Message::LockRelease { .. } => 7,
            Message::BarrierArrive { .. } => 8,
            Message::BarrierRelease { .. } => 9,
            Message::AllocNotify { .. } => 10,
            Message::NodeJoin { .. } => 11,
            Message::NodeLeave { .. } => 12,
            Message::AllocAck { .. } => 13,
            Message::DirLookup { .. } => 14,
            Message::DirAddReader { .. } => 15,
            Message::DirSetWriter { .. } => 16,
            Message::DirClearSharers { .. } => 17,
            Message::DirRemoveSharer { .. } => 18,
            Message::DirAssignRange { .. } => 19,
            Message::DirReply { .. } => 20,
            Message::NodeFailure { .. } => 21,
            Message::DirReleaseRange { .. } => 22,
            Message::DirReclaim { .. } => 23,
        }
    }

    /// True for directory requests that expect a [`Message::DirReply`].
    pub fn expects_dir_reply(&self) -> bool {
        matches!(
            self,
            Message::DirLookup { .. }
                | Message::DirAddReader { .. }
                | Message::DirSetWriter { .. }
                | Message::DirClearSharers { .. }
                | Message::DirRemoveSharer { .. }
                | Message::DirAssignRange { .. }
                | Message::DirReleaseRange { .. }
                | Message::DirReclaim { .. }
        )
    }
}

fn codec_config() -> bincode::config::Configuration {
    bincode::config::standard()
}

/// Encode a message into a complete frame: 4-byte big-endian body length,
/// then the header, then the payload.
pub fn encode_frame(msg: &Message, sender: NodeId, seq: u64) -> DsmResult<Vec<u8>> {
    let cfg = codec_config();
    let payload = bincode::encode_to_vec(msg, cfg)
        .map_err(|e| DsmError::invalid(format!("encode payload: {}", e)))?;

    let header = WireHeader {
        magic: MSG_MAGIC,
        kind: msg.kind_code(),
        length: payload.len() as u32,
        sender,
        seq,
    };
    let mut body = bincode::encode_to_vec(header, cfg)
        .map_err(|e| DsmError::invalid(format!("encode header: {}", e)))?;
    body.extend_from_slice(&payload);

    if body.len() > MAX_FRAME_LEN {
        return Err(DsmError::invalid(format!(
            "frame body {} exceeds limit {}",
            body.len(),
            MAX_FRAME_LEN
        )));
    }

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode one frame body (everything after the length prefix), validating
/// the magic value, declared payload length and kind code.
pub fn decode_body(body: &[u8]) -> DsmResult<(WireHeader, Message)> {
    let cfg = codec_config();
    let (header, consumed): (WireHeader, usize) = bincode::decode_from_slice(body, cfg)
        .map_err(|e| DsmError::invalid(format!("decode header: {}", e)))?;

    if header.magic != MSG_MAGIC {
        return Err(DsmError::invalid(format!(
            "bad magic: expected {:#x}, got {:#x}",
            MSG_MAGIC, header.magic
        )));
    }
    let payload = &body[consumed..];
    if payload.len() != header.length as usize {
        return Err(DsmError::invalid(format!(
            "payload length mismatch: header says {}, frame has {}",
            header.length,
            payload.len()
        )));
    }

    let (msg, used): (Message, usize) = bincode::decode_from_slice(payload, cfg)
        .map_err(|e| DsmError::invalid(format!("decode payload: {}", e)))?;
    if used != payload.len() {
        return Err(DsmError::invalid("trailing bytes after payload"));
    }
    if msg.kind_code() != header.kind {
        return Err(DsmError::invalid(format!(
            "kind mismatch: header {} vs payload {}",
            header.kind,
            msg.kind_code()
        )));
    }

    Ok((header, msg))
}
