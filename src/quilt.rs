//! Public node handle and builder
//!
//! `Quilt` is one node's view of the shared address space: allocate and free
//! shared ranges, touch them through the bounds-checked accessors (which
//! drive the fault trap and the whole coherence protocol underneath), and
//! synchronize with distributed locks and barriers.

use std::sync::{Arc, Mutex};

use crossbeam_channel::Receiver;
use log::info;

use crate::dsm::coherence::authority::{
    CoherenceAuthority, DirPending, LocalAuthority, RemoteAuthority,
};
use crate::dsm::coherence::directory::Directory;
use crate::dsm::config::{NodeConfig, ProtocolConfig};
use crate::dsm::context::DsmContext;
use crate::dsm::memory::allocator;
use crate::dsm::memory::fault;
use crate::dsm::memory::page_table::PageSlot;
use crate::dsm::memory::permission::SoftProtection;
use crate::dsm::net::dispatch::Dispatcher;
use crate::dsm::net::transport::{Inbound, LoopbackHub, TcpTransport, Transport};
use crate::dsm::sync::{barrier, lock};
use crate::dsm::types::{
    addr_page_base, AccessKind, BarrierId, DsmError, DsmResult, LockId, NodeId, PAGE_SIZE,
};
use crate::telemetry::{CountersSnapshot, DsmCounters};

/// Bound on permission-check/fault retries for one page access. Repeated
/// invalidation between the fetch and the access re-faults; past this many
/// rounds the access reports `Timeout` instead of livelocking.
const FAULT_RETRY_LIMIT: usize = 16;

/// How the node's transport attaches to the cluster.
enum Attachment {
    /// Real TCP sockets per the node config.
    Tcp,
    /// In-process hub; for tests and single-process clusters.
    Loopback(Arc<LoopbackHub>),
}

/// Builder for a [`Quilt`] node.
pub struct QuiltBuilder {
    config: NodeConfig,
    protocol: ProtocolConfig,
    attachment: Attachment,
}

impl QuiltBuilder {
    /// Start from a node configuration; defaults to TCP transport and
    /// default protocol timings.
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            protocol: ProtocolConfig::default(),
            attachment: Attachment::Tcp,
        }
    }

    /// Override the protocol timing parameters.
    pub fn protocol(mut self, protocol: ProtocolConfig) -> Self {
        self.protocol = protocol;
        self
    }

    /// Attach to an in-process loopback hub instead of TCP.
    pub fn loopback(mut self, hub: Arc<LoopbackHub>) -> Self {
        self.attachment = Attachment::Loopback(hub);
        self
    }

    /// Build the node: bring up the transport, the coherence authority role
    /// and the dispatcher thread.
    pub fn build(self) -> DsmResult<Quilt> {
        let counters = Arc::new(DsmCounters::new());

        let (transport, inbound): (Arc<dyn Transport>, Receiver<Inbound>) = match self.attachment
        {
            Attachment::Loopback(hub) => {
                let (transport, rx) = hub.attach(self.config.node_id, Arc::clone(&counters));
                (transport, rx)
            }
            Attachment::Tcp => {
                if self.config.is_manager() {
                    let (transport, rx) = TcpTransport::listen(
                        self.config.node_id,
                        self.config.port,
                        &self.protocol,
                        Arc::clone(&counters),
                    )?;
                    (transport, rx)
                } else {
                    let (transport, rx) = TcpTransport::connect(
                        self.config.node_id,
                        self.config.port,
                        &self.config.manager_host,
                        self.config.manager_port,
                        &self.protocol,
                        Arc::clone(&counters),
                    )?;
                    (transport, rx)
                }
            }
        };

        let dir_pending = Arc::new(DirPending::new());
        let (directory, authority): (Option<Arc<Directory>>, Arc<dyn CoherenceAuthority>) =
            if self.config.is_manager() {
                let directory = Arc::new(Directory::new());
                (
                    Some(Arc::clone(&directory)),
                    Arc::new(LocalAuthority::new(directory)),
                )
            } else {
                (
                    None,
                    Arc::new(RemoteAuthority::new(
                        Arc::clone(&transport),
                        0,
                        Arc::clone(&dir_pending),
                        self.protocol.directory_timeout,
                    )),
                )
            };

        let node_id = self.config.node_id;
        let ctx = Arc::new(DsmContext::new(
            self.config,
            self.protocol,
            counters,
            transport,
            authority,
            directory,
            dir_pending,
            Arc::new(SoftProtection),
        ));
        let dispatcher = Dispatcher::spawn(Arc::clone(&ctx), inbound)?;

        info!("node {}: initialized", node_id);
        Ok(Quilt {
            ctx,
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }
}

/// One node of the shared address space.
pub struct Quilt {
    ctx: Arc<DsmContext>,
    dispatcher: Mutex<Option<Dispatcher>>,
}

impl Quilt {
    /// Builder entry point.
    pub fn builder(config: NodeConfig) -> QuiltBuilder {
        QuiltBuilder::new(config)
    }

    pub fn node_id(&self) -> NodeId {
        self.ctx.node_id()
    }

    pub fn is_manager(&self) -> bool {
        self.ctx.is_manager()
    }

    /// The underlying context, for protocol-level access.
    pub fn context(&self) -> &Arc<DsmContext> {
        &self.ctx
    }

    /* --------------------------- allocation --------------------------- */

    /// Allocate `size` bytes of shared memory. The returned address is
    /// page-aligned and identical on every node; touching it drives the
    /// coherence protocol.
    pub fn allocate(&self, size: usize) -> DsmResult<u64> {
        allocator::allocate(&self.ctx, size)
    }

    /// Free an allocation created by this node.
    pub fn free(&self, base_addr: u64) -> DsmResult<()> {
        allocator::free(&self.ctx, base_addr)
    }

    /* --------------------------- accessors ---------------------------- */

    /// Read `buf.len()` bytes starting at shared address `addr`.
    pub fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> DsmResult<()> {
        let mut offset = 0usize;
        while offset < buf.len() {
            let cur = addr + offset as u64;
            let page_base = addr_page_base(cur);
            let page_off = (cur - page_base) as usize;
            let chunk = (PAGE_SIZE - page_off).min(buf.len() - offset);

            let dest = &mut buf[offset..offset + chunk];
            self.with_page(cur, AccessKind::Read, &mut |slot: &mut PageSlot| {
                dest.copy_from_slice(&slot.data[page_off..page_off + chunk]);
            })?;
            offset += chunk;
        }
        Ok(())
    }

    /// Write `buf` starting at shared address `addr`.
    pub fn write_bytes(&self, addr: u64, buf: &[u8]) -> DsmResult<()> {
        let mut offset = 0usize;
        while offset < buf.len() {
            let cur = addr + offset as u64;
            let page_base = addr_page_base(cur);
            let page_off = (cur - page_base) as usize;
            let chunk = (PAGE_SIZE - page_off).min(buf.len() - offset);

            let src = &buf[offset..offset + chunk];
            self.with_page(cur, AccessKind::Write, &mut |slot: &mut PageSlot| {
                slot.data[page_off..page_off + chunk].copy_from_slice(src);
            })?;
            offset += chunk;
        }
        Ok(())
    }

    /// Read a little-endian u64 at `addr`.
    pub fn read_u64(&self, addr: u64) -> DsmResult<u64> {
        let mut buf = [0u8; 8];
        self.read_bytes(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Write a little-endian u64 at `addr`.
    pub fn write_u64(&self, addr: u64, value: u64) -> DsmResult<()> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    /// Run `op` against the page containing `addr` once the required access
    /// right is held. Insufficient protection faults into the migration
    /// protocol and retries; an unmapped address propagates as `NotFound`.
    fn with_page(
        &self,
        addr: u64,
        kind: AccessKind,
        op: &mut dyn FnMut(&mut PageSlot),
    ) -> DsmResult<()> {
        for _ in 0..FAULT_RETRY_LIMIT {
            let table = self.ctx.table_by_addr(addr).ok_or(DsmError::NotFound)?;
            let entry = table.lookup_by_addr(addr).ok_or(DsmError::NotFound)?;
            {
                let mut slot = entry.lock();
                if slot.prot.permits(kind) {
                    op(&mut slot);
                    return Ok(());
                }
            }
            fault::handle_fault(&self.ctx, addr, kind)?;
        }
        Err(DsmError::Timeout)
    }

    /* ------------------------ synchronization ------------------------- */

    /// Acquire a distributed lock (FIFO, cluster-wide).
    pub fn lock_acquire(&self, lock_id: LockId) -> DsmResult<()> {
        lock::acquire(&self.ctx, lock_id)
    }

    /// Release a distributed lock held by this node.
    pub fn lock_release(&self, lock_id: LockId) -> DsmResult<()> {
        lock::release(&self.ctx, lock_id)
    }

    /// Block until all `num_participants` nodes reach the barrier.
    pub fn barrier(&self, barrier_id: BarrierId, num_participants: usize) -> DsmResult<()> {
        barrier::wait(&self.ctx, barrier_id, num_participants)
    }

    /* --------------------------- telemetry ---------------------------- */

    /// Point-in-time copy of the node's runtime counters.
    pub fn stats(&self) -> CountersSnapshot {
        self.ctx.counters().snapshot()
    }

    /// Zero the runtime counters.
    pub fn reset_stats(&self) {
        self.ctx.counters().reset();
    }

    /// Stop the dispatcher and tear down the transport. Idempotent; also
    /// runs on drop.
    pub fn shutdown(&self) {
        let mut dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.ctx.transport().shutdown();
        if let Some(mut dispatcher) = dispatcher.take() {
            dispatcher.shutdown();
        }
    }
}

impl Drop for Quilt {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solo_node() -> Quilt {
        let hub = LoopbackHub::new();
        Quilt::builder(NodeConfig::manager(0, 1))
            .loopback(hub)
            .build()
            .unwrap()
    }

    #[test]
    fn allocate_write_read_round_trip() {
        let node = solo_node();
        let base = node.allocate(2 * PAGE_SIZE).unwrap();

        node.write_bytes(base, b"hello quilt").unwrap();
        let mut buf = [0u8; 11];
        node.read_bytes(base, &mut buf).unwrap();
        assert_eq!(&buf, b"hello quilt");

        node.write_u64(base + 64, 0xDECAF_C0FFEE).unwrap();
        assert_eq!(node.read_u64(base + 64).unwrap(), 0xDECAF_C0FFEE);
    }

    #[test]
    fn writes_span_page_boundaries() {
        let node = solo_node();
        let base = node.allocate(2 * PAGE_SIZE).unwrap();
        let straddle = base + PAGE_SIZE as u64 - 4;

        node.write_bytes(straddle, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let mut buf = [0u8; 8];
        node.read_bytes(straddle, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn out_of_bounds_access_is_not_masked() {
        let node = solo_node();
        let base = node.allocate(PAGE_SIZE).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(
            node.read_bytes(base + 2 * PAGE_SIZE as u64, &mut buf),
            Err(DsmError::NotFound)
        );
    }

    #[test]
    fn faults_are_counted() {
        let node = solo_node();
        let base = node.allocate(PAGE_SIZE).unwrap();

        node.write_u64(base, 1).unwrap(); // write fault
        node.read_u64(base).unwrap(); // no fault, already writable

        let stats = node.stats();
        assert_eq!(stats.write_faults, 1);
        assert_eq!(stats.read_faults, 0);
    }

    #[test]
    fn free_then_access_reports_not_found() {
        let node = solo_node();
        let base = node.allocate(PAGE_SIZE).unwrap();
        node.free(base).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(node.read_bytes(base, &mut buf), Err(DsmError::NotFound));
    }
}
