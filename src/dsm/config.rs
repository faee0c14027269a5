//! Node and protocol configuration
//!
//! Plain-data configuration split in two: `NodeConfig` describes this node's
//! identity and cluster topology, `ProtocolConfig` carries the tunable
//! timeouts and retry budgets of the coherence protocol.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dsm::types::NodeId;

/// Identity and topology of one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's id. Node 0 is the coherence authority (manager).
    pub node_id: NodeId,
    /// Port this node's transport listens on.
    pub port: u16,
    /// Manager hostname, used by workers to connect.
    pub manager_host: String,
    /// Manager port.
    pub manager_port: u16,
    /// Total nodes expected in the cluster.
    pub num_nodes: usize,
}

impl NodeConfig {
    /// Configuration for the manager node.
    pub fn manager(port: u16, num_nodes: usize) -> Self {
        Self {
            node_id: 0,
            port,
            manager_host: "localhost".to_string(),
            manager_port: port,
            num_nodes,
        }
    }

    /// Configuration for a worker node connecting to `manager_host:manager_port`.
    pub fn worker(
        node_id: NodeId,
        port: u16,
        manager_host: impl Into<String>,
        manager_port: u16,
        num_nodes: usize,
    ) -> Self {
        Self {
            node_id,
            port,
            manager_host: manager_host.into(),
            manager_port,
            num_nodes,
        }
    }

    /// True when this node hosts the coherence authority.
    pub fn is_manager(&self) -> bool {
        self.node_id == 0
    }
}

/// Protocol timing and retry parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Deadline for a read page fetch.
    pub read_fetch_timeout: Duration,
    /// Deadline for a write page fetch (longer: it may chain invalidations).
    pub write_fetch_timeout: Duration,
    /// Deadline for collecting invalidation acknowledgements.
    pub invalidate_ack_timeout: Duration,
    /// Deadline for a remote directory query.
    pub directory_timeout: Duration,
    /// Deadline for distributed lock acquisition.
    pub lock_timeout: Duration,
    /// Deadline for barrier completion.
    pub barrier_timeout: Duration,
    /// Deadline for allocation-broadcast acknowledgements.
    pub alloc_ack_timeout: Duration,
    /// Outbound send attempts before a peer is declared unreachable.
    pub send_retries: u32,
    /// Base delay between send retries; doubles per attempt.
    pub retry_backoff: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            read_fetch_timeout: Duration::from_secs(5),
            write_fetch_timeout: Duration::from_secs(10),
            invalidate_ack_timeout: Duration::from_secs(1),
            directory_timeout: Duration::from_secs(5),
            lock_timeout: Duration::from_secs(5),
            barrier_timeout: Duration::from_secs(30),
            alloc_ack_timeout: Duration::from_secs(2),
            send_retries: 3,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

impl ProtocolConfig {
    /// Aggressive deadlines for low-latency LAN clusters.
    pub fn lan_tuned() -> Self {
        Self {
            read_fetch_timeout: Duration::from_secs(1),
            write_fetch_timeout: Duration::from_secs(2),
            invalidate_ack_timeout: Duration::from_millis(250),
            directory_timeout: Duration::from_secs(1),
            lock_timeout: Duration::from_secs(2),
            barrier_timeout: Duration::from_secs(10),
            alloc_ack_timeout: Duration::from_millis(500),
            send_retries: 3,
            retry_backoff: Duration::from_millis(25),
        }
    }

    /// Patient deadlines for congested or lossy links.
    pub fn wan_tolerant() -> Self {
        Self {
            read_fetch_timeout: Duration::from_secs(15),
            write_fetch_timeout: Duration::from_secs(30),
            invalidate_ack_timeout: Duration::from_secs(5),
            directory_timeout: Duration::from_secs(15),
            lock_timeout: Duration::from_secs(15),
            barrier_timeout: Duration::from_secs(120),
            alloc_ack_timeout: Duration::from_secs(10),
            send_retries: 5,
            retry_backoff: Duration::from_millis(250),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manager_detection() {
        assert!(NodeConfig::manager(7000, 4).is_manager());
        assert!(!NodeConfig::worker(2, 7002, "mgr", 7000, 4).is_manager());
    }

    #[test]
    fn default_deadlines_match_protocol_contract() {
        let cfg = ProtocolConfig::default();
        assert_eq!(cfg.read_fetch_timeout, Duration::from_secs(5));
        assert_eq!(cfg.send_retries, 3);
    }
}
