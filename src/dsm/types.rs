//! Core identifier, state and error types for the DSM engine
//!
//! This module defines the fundamental vocabulary shared by every subsystem:
//! page/node identifiers and their cluster-wide layout, the local page state
//! machine, access kinds, protection levels, and the crate-wide error
//! taxonomy.

use std::fmt;

/// Page size in bytes (4 KiB granule, the unit of sharing).
pub const PAGE_SIZE: usize = 4096;

/// Maximum number of nodes in a cluster.
pub const MAX_NODES: usize = 16;

/// Maximum number of simultaneous read-only sharers tracked per page.
pub const MAX_SHARERS: usize = 16;

/// Maximum live allocations per node (allocation slots).
pub const MAX_ALLOCATIONS: u64 = 32;

/// Per-slot page-id budget: an allocation may not span more pages than this.
pub const PAGES_PER_SLOT: u64 = 32_768;

/// Base of the logical shared address range. Shared addresses are derived
/// from page ids, so every node resolves the same address to the same page.
pub const ADDR_BASE: u64 = 0x4000_0000_0000;

/// Node identifier, unique within the cluster.
pub type NodeId = u32;

/// Cluster-wide unique page identifier.
///
/// Layout: `node * (MAX_ALLOCATIONS * PAGES_PER_SLOT) + slot * PAGES_PER_SLOT
/// + index`, so the creating node and allocation slot are recoverable from
/// the id alone.
pub type PageId = u64;

/// Distributed lock identifier.
pub type LockId = u64;

/// Distributed barrier identifier.
pub type BarrierId = u64;

/// First page id of the given (node, slot) pair.
pub fn first_page_id(node: NodeId, slot: u64) -> PageId {
    node as u64 * (MAX_ALLOCATIONS * PAGES_PER_SLOT) + slot * PAGES_PER_SLOT
}

/// Node that created the allocation containing `page`.
pub fn page_creator(page: PageId) -> NodeId {
    (page / (MAX_ALLOCATIONS * PAGES_PER_SLOT)) as NodeId
}

/// Logical shared address of the first byte of `page`.
pub fn page_addr(page: PageId) -> u64 {
    ADDR_BASE + page * PAGE_SIZE as u64
}

/// Align a shared address down to its page base.
pub fn addr_page_base(addr: u64) -> u64 {
    addr & !(PAGE_SIZE as u64 - 1)
}

/// Local page state.
///
/// State machine:
///   INVALID -> READ_ONLY   (read fault)
///   INVALID -> READ_WRITE  (write fault)
///   READ_ONLY -> READ_WRITE (write fault)
///   READ_ONLY | READ_WRITE -> INVALID (invalidation)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageState {
    /// Page not present locally.
    Invalid = 0,
    /// Page present, read-only copy; other nodes may also hold copies.
    ReadOnly = 1,
    /// Page present with exclusive write access.
    ReadWrite = 2,
}

impl PageState {
    /// Convert a raw byte back into a state, defaulting to Invalid.
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => PageState::ReadOnly,
            2 => PageState::ReadWrite,
            _ => PageState::Invalid,
        }
    }

    /// Check if the state allows reading.
    pub fn can_read(&self) -> bool {
        matches!(self, PageState::ReadOnly | PageState::ReadWrite)
    }

    /// Check if the state allows writing.
    pub fn can_write(&self) -> bool {
        matches!(self, PageState::ReadWrite)
    }
}

/// Kind of memory access that triggered a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, bincode::Encode, bincode::Decode)]
#[repr(u8)]
pub enum AccessKind {
    Read = 0,
    Write = 1,
}

impl AccessKind {
    pub fn from_u8(value: u8) -> Self {
        if value == 1 { AccessKind::Write } else { AccessKind::Read }
    }
}

/// Enforced protection level for a page frame.
///
/// The logical [`PageState`] and the enforced protection are updated in the
/// same critical section; see `dsm::memory::permission`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Protection {
    /// No access; any touch faults.
    None = 0,
    /// Read-only; writes fault.
    Read = 1,
    /// Full access.
    ReadWrite = 2,
}

impl Protection {
    /// Check whether this protection level permits the given access.
    pub fn permits(&self, kind: AccessKind) -> bool {
        match kind {
            AccessKind::Read => !matches!(self, Protection::None),
            AccessKind::Write => matches!(self, Protection::ReadWrite),
        }
    }
}

/// DSM operation errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DsmError {
    /// Bad argument or malformed input.
    Invalid(String),
    /// Allocation or capacity exhaustion.
    OutOfMemory,
    /// Socket or connection failure (after retry exhaustion).
    Network(String),
    /// A bounded wait expired.
    Timeout,
    /// Unknown page, allocation or resource.
    NotFound,
    /// Capacity exceeded, e.g. the sharer set is full.
    Busy,
    /// Resource not owned by the caller, or protection change failed.
    Permission(String),
}

impl fmt::Display for DsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DsmError::Invalid(msg) => write!(f, "invalid argument: {}", msg),
            DsmError::OutOfMemory => write!(f, "out of memory"),
            DsmError::Network(msg) => write!(f, "network error: {}", msg),
            DsmError::Timeout => write!(f, "operation timed out"),
            DsmError::NotFound => write!(f, "not found"),
            DsmError::Busy => write!(f, "resource busy"),
            DsmError::Permission(msg) => write!(f, "permission error: {}", msg),
        }
    }
}

impl std::error::Error for DsmError {}

impl DsmError {
    /// Create an invalid-argument error.
    #[inline(always)]
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    /// Create a network error.
    #[inline(always)]
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    /// Create a permission error.
    #[inline(always)]
    pub fn permission(msg: impl Into<String>) -> Self {
        Self::Permission(msg.into())
    }

    /// True for errors that a sender may retry transparently.
    pub fn is_transient(&self) -> bool {
        matches!(self, DsmError::Busy | DsmError::Timeout)
    }
}

/// Convenience alias used throughout the crate.
pub type DsmResult<T> = Result<T, DsmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_id_layout_round_trips() {
        let id = first_page_id(3, 7);
        assert_eq!(page_creator(id), 3);
        assert_eq!(page_creator(id + PAGES_PER_SLOT - 1), 3);
        assert_eq!(first_page_id(0, 0), 0);
        // Slots of the same node never overlap.
        assert_eq!(first_page_id(3, 8) - id, PAGES_PER_SLOT);
    }

    #[test]
    fn addresses_are_page_aligned_and_stable() {
        let id = first_page_id(2, 5) + 17;
        let addr = page_addr(id);
        assert_eq!(addr % PAGE_SIZE as u64, 0);
        assert_eq!(addr_page_base(addr + 123), addr);
    }

    #[test]
    fn protection_permits_matrix() {
        assert!(!Protection::None.permits(AccessKind::Read));
        assert!(Protection::Read.permits(AccessKind::Read));
        assert!(!Protection::Read.permits(AccessKind::Write));
        assert!(Protection::ReadWrite.permits(AccessKind::Write));
    }

    #[test]
    fn state_predicates() {
        assert!(!PageState::Invalid.can_read());
        assert!(PageState::ReadOnly.can_read());
        assert!(!PageState::ReadOnly.can_write());
        assert!(PageState::ReadWrite.can_write());
        assert_eq!(PageState::from_u8(9), PageState::Invalid);
    }
}
