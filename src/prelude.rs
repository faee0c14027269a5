//! Commonly used types, importable in one line

pub use crate::dsm::config::{NodeConfig, ProtocolConfig};
pub use crate::dsm::net::transport::LoopbackHub;
pub use crate::dsm::types::{
    AccessKind, BarrierId, DsmError, DsmResult, LockId, NodeId, PageId, PageState, Protection,
    PAGE_SIZE,
};
pub use crate::quilt::{Quilt, QuiltBuilder};
pub use crate::telemetry::CountersSnapshot;
