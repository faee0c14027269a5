//! Node-to-node transport
//!
//! Outbound sends are serialized per destination and retried on transient
//! failures with exponential backoff; fatal socket errors mark the peer
//! disconnected and propagate, retry exhaustion counts as a network failure
//! and propagates. Inbound frames are decoded off each connection and handed
//! to the node's single dispatcher thread over a channel.
//!
//! Two implementations: `TcpTransport` for real clusters and
//! `LoopbackTransport` for wiring several nodes inside one process (tests,
//! demos). Both run every frame through the same wire codec.

use std::collections::HashSet;
use std::fmt::Debug;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use log::{debug, error, info, warn};

use crate::dsm::config::ProtocolConfig;
use crate::dsm::net::protocol::{decode_body, encode_frame, Message, WireHeader, MAX_FRAME_LEN};
use crate::dsm::types::{DsmError, DsmResult, NodeId};
use crate::telemetry::DsmCounters;

/// One decoded inbound message, as delivered to the dispatcher.
#[derive(Debug)]
pub struct Inbound {
    pub header: WireHeader,
    pub msg: Message,
    /// Full frame length on the wire, length prefix included.
    pub frame_len: usize,
}

/// Node-to-node message transport.
pub trait Transport: Send + Sync + Debug {
    /// This node's id.
    fn local_node(&self) -> NodeId;

    /// Reserve the next per-sender sequence number.
    fn allocate_seq(&self) -> u64;

    /// Send `msg` to `dest` under a caller-reserved sequence number.
    fn send_seq(&self, dest: NodeId, msg: &Message, seq: u64) -> DsmResult<()>;

    /// Send `msg` to `dest` with a freshly allocated sequence number.
    fn send(&self, dest: NodeId, msg: &Message) -> DsmResult<()> {
        self.send_seq(dest, msg, self.allocate_seq())
    }

    /// Currently connected peers, excluding self and failed nodes.
    fn peers(&self) -> Vec<NodeId>;

    /// True when `node` is connected and not marked failed.
    fn is_connected(&self, node: NodeId) -> bool;

    /// Mark a peer unreachable; subsequent sends fail fast.
    fn mark_failed(&self, node: NodeId);

    /// Tear down connections and stop background threads.
    fn shutdown(&self);
}

/* ============================= loopback ============================= */

/// In-process message hub connecting several [`LoopbackTransport`] nodes.
#[derive(Debug, Default)]
pub struct LoopbackHub {
    inboxes: DashMap<NodeId, Sender<Inbound>>,
    delivered: AtomicU64,
}

impl LoopbackHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a node, returning its transport and the inbound channel its
    /// dispatcher drains.
    pub fn attach(
        self: &Arc<Self>,
        node: NodeId,
        counters: Arc<DsmCounters>,
    ) -> (Arc<LoopbackTransport>, Receiver<Inbound>) {
        let (tx, rx) = unbounded();
        self.inboxes.insert(node, tx);
        let transport = Arc::new(LoopbackTransport {
            hub: Arc::clone(self),
            node,
            seq: AtomicU64::new(1),
            failed: Mutex::new(HashSet::new()),
            counters,
        });
        (transport, rx)
    }

    /// Total messages delivered through the hub since creation. Lets tests
    /// assert that an operation produced no network traffic.
    pub fn message_count(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    fn detach(&self, node: NodeId) {
        self.inboxes.remove(&node);
    }
}

/// Transport endpoint for one node on a [`LoopbackHub`].
#[derive(Debug)]
pub struct LoopbackTransport {
    hub: Arc<LoopbackHub>,
    node: NodeId,
    seq: AtomicU64,
    failed: Mutex<HashSet<NodeId>>,
    counters: Arc<DsmCounters>,
}

impl Transport for LoopbackTransport {
    fn local_node(&self) -> NodeId {
        self.node
    }

    fn allocate_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn send_seq(&self, dest: NodeId, msg: &Message, seq: u64) -> DsmResult<()> {
        if self
            .failed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(&dest)
        {
            return Err(DsmError::network(format!("node {} marked failed", dest)));
        }

        // Run the real codec so loopback traffic exercises the same framing
        // as TCP traffic.
        let frame = encode_frame(msg, self.node, seq)?;
        let (header, decoded) = decode_body(&frame[4..])?;

        let inbox = self
            .hub
            .inboxes
            .get(&dest)
            .ok_or_else(|| DsmError::network(format!("node {} not connected", dest)))?;
        inbox
            .value()
            .send(Inbound {
                header,
                msg: decoded,
                frame_len: frame.len(),
            })
            .map_err(|_| DsmError::network(format!("node {} inbox closed", dest)))?;

        self.counters
            .bytes_sent
            .fetch_add(frame.len() as u64, Ordering::Relaxed);
        self.hub.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn peers(&self) -> Vec<NodeId> {
        let failed = self
            .failed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.hub
            .inboxes
            .iter()
            .map(|e| *e.key())
            .filter(|&n| n != self.node && !failed.contains(&n))
            .collect()
    }

    fn is_connected(&self, node: NodeId) -> bool {
        self.hub.inboxes.contains_key(&node)
            && !self
                .failed
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .contains(&node)
    }

    fn mark_failed(&self, node: NodeId) {
        self.failed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(node);
    }

    fn shutdown(&self) {
        self.hub.detach(self.node);
    }
}

/* ================================ tcp ================================ */

#[derive(Debug)]
struct PeerHandle {
    stream: Mutex<TcpStream>,
    failed: AtomicBool,
}

/// TCP transport: length-prefix framed streams, one reader thread per
/// connection, writes serialized per destination.
#[derive(Debug)]
pub struct TcpTransport {
    node: NodeId,
    seq: AtomicU64,
    peers: DashMap<NodeId, Arc<PeerHandle>>,
    inbound_tx: Sender<Inbound>,
    running: Arc<AtomicBool>,
    counters: Arc<DsmCounters>,
    send_retries: u32,
    retry_backoff: Duration,
}

impl TcpTransport {
    /// Start the manager-side transport: listen on `port` and accept worker
    /// connections, which identify themselves with a `NodeJoin` frame.
    pub fn listen(
        node: NodeId,
        port: u16,
        protocol: &ProtocolConfig,
        counters: Arc<DsmCounters>,
    ) -> DsmResult<(Arc<Self>, Receiver<Inbound>)> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .map_err(|e| DsmError::network(format!("bind port {}: {}", port, e)))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| DsmError::network(format!("set_nonblocking: {}", e)))?;

        let (transport, rx) = Self::build(node, protocol, counters);
        let accept_transport = Arc::clone(&transport);
        thread::Builder::new()
            .name(format!("quilt-accept-{}", node))
            .spawn(move || accept_transport.accept_loop(listener))
            .map_err(|e| DsmError::network(format!("spawn accept thread: {}", e)))?;

        info!("node {}: transport listening on port {}", node, port);
        Ok((transport, rx))
    }

    /// Start a worker-side transport: connect to the manager and identify
    /// with `NodeJoin`.
    pub fn connect(
        node: NodeId,
        local_port: u16,
        manager_host: &str,
        manager_port: u16,
        protocol: &ProtocolConfig,
        counters: Arc<DsmCounters>,
    ) -> DsmResult<(Arc<Self>, Receiver<Inbound>)> {
        let stream = TcpStream::connect((manager_host, manager_port)).map_err(|e| {
            DsmError::network(format!(
                "connect {}:{}: {}",
                manager_host, manager_port, e
            ))
        })?;
        stream
            .set_nodelay(true)
            .map_err(|e| DsmError::network(format!("set_nodelay: {}", e)))?;

        let (transport, rx) = Self::build(node, protocol, counters);
        transport.adopt_peer(0, stream)?;
        transport.send(
            0,
            &Message::NodeJoin {
                node_id: node,
                port: local_port,
            },
        )?;

        info!(
            "node {}: connected to manager at {}:{}",
            node, manager_host, manager_port
        );
        Ok((transport, rx))
    }

    fn build(
        node: NodeId,
        protocol: &ProtocolConfig,
        counters: Arc<DsmCounters>,
    ) -> (Arc<Self>, Receiver<Inbound>) {
        let (tx, rx) = unbounded();
        let transport = Arc::new(Self {
            node,
            seq: AtomicU64::new(1),
            peers: DashMap::new(),
            inbound_tx: tx,
            running: Arc::new(AtomicBool::new(true)),
            counters,
            send_retries: protocol.send_retries,
            retry_backoff: protocol.retry_backoff,
        });
        (transport, rx)
    }

    /// Register a connected stream for `node` and spawn its reader.
    fn adopt_peer(self: &Arc<Self>, node: NodeId, stream: TcpStream) -> DsmResult<()> {
        let reader = stream
            .try_clone()
            .map_err(|e| DsmError::network(format!("clone stream: {}", e)))?;
        self.peers.insert(
            node,
            Arc::new(PeerHandle {
                stream: Mutex::new(stream),
                failed: AtomicBool::new(false),
            }),
        );
        self.spawn_reader(Some(node), reader);
        Ok(())
    }

    fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        while self.running.load(Ordering::Acquire) {
            match listener.accept() {
                Ok((stream, addr)) => {
                    debug!("node {}: accepted connection from {}", self.node, addr);
                    if stream.set_nodelay(true).is_err() {
                        warn!("node {}: set_nodelay failed for {}", self.node, addr);
                    }
                    // The peer's identity arrives in its NodeJoin frame; the
                    // reader registers the write half at that point.
                    self.spawn_reader(None, stream);
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(100));
                }
                Err(e) => {
                    if self.running.load(Ordering::Acquire) {
                        error!("node {}: accept failed: {}", self.node, e);
                    }
                    break;
                }
            }
        }
    }

    fn spawn_reader(self: &Arc<Self>, peer: Option<NodeId>, stream: TcpStream) {
        let transport = Arc::clone(self);
        let name = format!("quilt-reader-{}", self.node);
        if thread::Builder::new()
            .name(name)
            .spawn(move || transport.reader_loop(peer, stream))
            .is_err()
        {
            error!("node {}: failed to spawn reader thread", self.node);
        }
    }

    fn reader_loop(self: Arc<Self>, mut peer: Option<NodeId>, mut stream: TcpStream) {
        while self.running.load(Ordering::Acquire) {
            let inbound = match read_frame(&mut stream) {
                Ok(inbound) => inbound,
                Err(e) => {
                    if self.running.load(Ordering::Acquire) {
                        debug!("node {}: connection closed: {}", self.node, e);
                        if let Some(node) = peer {
                            self.mark_failed(node);
                        }
                    }
                    return;
                }
            };

            self.counters
                .bytes_received
                .fetch_add(inbound.frame_len as u64, Ordering::Relaxed);

            // First frame on an accepted connection identifies the peer and
            // registers the write half under its node id.
            if let Message::NodeJoin { node_id, .. } = inbound.msg {
                if peer.is_none() {
                    peer = Some(node_id);
                    match stream.try_clone() {
                        Ok(write_half) => {
                            self.peers.insert(
                                node_id,
                                Arc::new(PeerHandle {
                                    stream: Mutex::new(write_half),
                                    failed: AtomicBool::new(false),
                                }),
                            );
                            info!("node {}: peer {} joined", self.node, node_id);
                        }
                        Err(e) => {
                            error!("node {}: clone stream for {}: {}", self.node, node_id, e);
                            return;
                        }
                    }
                }
            }

            if self.inbound_tx.send(inbound).is_err() {
                // Dispatcher gone; the node is shutting down.
                return;
            }
        }
    }
}

/// Read one length-prefixed frame off a stream and decode it.
fn read_frame(stream: &mut TcpStream) -> DsmResult<Inbound> {
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .map_err(|e| DsmError::network(format!("read length: {}", e)))?;
    let body_len = u32::from_be_bytes(len_buf) as usize;
    if body_len == 0 || body_len > MAX_FRAME_LEN {
        return Err(DsmError::invalid(format!("bad frame length {}", body_len)));
    }

    let mut body = vec![0u8; body_len];
    stream
        .read_exact(&mut body)
        .map_err(|e| DsmError::network(format!("read body: {}", e)))?;

    let (header, msg) = decode_body(&body)?;
    Ok(Inbound {
        header,
        msg,
        frame_len: 4 + body_len,
    })
}

impl Transport for TcpTransport {
    fn local_node(&self) -> NodeId {
        self.node
    }

    fn allocate_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn send_seq(&self, dest: NodeId, msg: &Message, seq: u64) -> DsmResult<()> {
        let peer = self
            .peers
            .get(&dest)
            .map(|p| Arc::clone(p.value()))
            .ok_or_else(|| DsmError::network(format!("node {} not connected", dest)))?;
        if peer.failed.load(Ordering::Acquire) {
            return Err(DsmError::network(format!("node {} marked failed", dest)));
        }

        let frame = encode_frame(msg, self.node, seq)?;

        let mut attempt = 0u32;
        loop {
            let result = {
                let mut stream = peer
                    .stream
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                stream.write_all(&frame).and_then(|_| stream.flush())
            };

            match result {
                Ok(()) => {
                    self.counters
                        .bytes_sent
                        .fetch_add(frame.len() as u64, Ordering::Relaxed);
                    return Ok(());
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {
                    // Retry immediately, not counted against the budget.
                    continue;
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::BrokenPipe
                            | ErrorKind::ConnectionReset
                            | ErrorKind::ConnectionAborted
                            | ErrorKind::NotConnected
                    ) =>
                {
                    error!("node {}: connection to {} broken: {}", self.node, dest, e);
                    peer.failed.store(true, Ordering::Release);
                    self.counters.network_failures.fetch_add(1, Ordering::Relaxed);
                    return Err(DsmError::network(format!(
                        "connection to node {} broken: {}",
                        dest, e
                    )));
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.send_retries {
                        error!(
                            "node {}: send to {} failed after {} attempts: {}",
                            self.node, dest, attempt, e
                        );
                        peer.failed.store(true, Ordering::Release);
                        self.counters.network_failures.fetch_add(1, Ordering::Relaxed);
                        return Err(DsmError::network(format!(
                            "send to node {} exhausted {} retries: {}",
                            dest, attempt, e
                        )));
                    }
                    warn!(
                        "node {}: send to {} failed (attempt {}/{}): {}",
                        self.node, dest, attempt, self.send_retries, e
                    );
                    self.counters.network_retries.fetch_add(1, Ordering::Relaxed);
                    thread::sleep(self.retry_backoff * 2u32.pow(attempt - 1));
                }
            }
        }
    }

    fn peers(&self) -> Vec<NodeId> {
        self.peers
            .iter()
            .filter(|e| !e.value().failed.load(Ordering::Acquire))
            .map(|e| *e.key())
            .filter(|&n| n != self.node)
            .collect()
    }

    fn is_connected(&self, node: NodeId) -> bool {
        self.peers
            .get(&node)
            .map(|p| !p.value().failed.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    fn mark_failed(&self, node: NodeId) {
        if let Some(peer) = self.peers.get(&node) {
            peer.value().failed.store(true, Ordering::Release);
        }
    }

    fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        for entry in self.peers.iter() {
            let stream = entry
                .value()
                .stream
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        self.peers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsm::types::PageId;

    fn hub_pair() -> (
        Arc<LoopbackHub>,
        Arc<LoopbackTransport>,
        Receiver<Inbound>,
        Arc<LoopbackTransport>,
        Receiver<Inbound>,
    ) {
        let hub = LoopbackHub::new();
        let (a, a_rx) = hub.attach(0, Arc::new(DsmCounters::new()));
        let (b, b_rx) = hub.attach(1, Arc::new(DsmCounters::new()));
        (hub, a, a_rx, b, b_rx)
    }

    #[test]
    fn loopback_delivers_through_the_codec() {
        let (hub, a, _a_rx, _b, b_rx) = hub_pair();

        let msg = Message::DirLookup { page_id: 3 as PageId };
        a.send(1, &msg).unwrap();

        let inbound = b_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(inbound.msg, msg);
        assert_eq!(inbound.header.sender, 0);
        assert_eq!(hub.message_count(), 1);
    }

    #[test]
    fn loopback_sequence_numbers_increase() {
        let (_hub, a, _a_rx, _b, b_rx) = hub_pair();

        a.send(1, &Message::DirLookup { page_id: 1 }).unwrap();
        a.send(1, &Message::DirLookup { page_id: 2 }).unwrap();

        let first = b_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        let second = b_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(second.header.seq > first.header.seq);
    }

    #[test]
    fn loopback_send_to_unknown_peer_fails() {
        let hub = LoopbackHub::new();
        let (a, _rx) = hub.attach(0, Arc::new(DsmCounters::new()));
        assert!(matches!(
            a.send(5, &Message::DirLookup { page_id: 1 }),
            Err(DsmError::Network(_))
        ));
    }

    #[test]
    fn loopback_marked_failed_peer_fails_fast() {
        let (_hub, a, _a_rx, _b, _b_rx) = hub_pair();
        a.mark_failed(1);
        assert!(!a.is_connected(1));
        assert!(a.send(1, &Message::DirLookup { page_id: 1 }).is_err());
    }

    #[test]
    fn tcp_round_trip_with_node_join() {
        let protocol = ProtocolConfig::default();
        let port = 39451;
        let (mgr, mgr_rx) =
            TcpTransport::listen(0, port, &protocol, Arc::new(DsmCounters::new())).unwrap();
        let (wrk, _wrk_rx) = TcpTransport::connect(
            2,
            39452,
            "127.0.0.1",
            port,
            &protocol,
            Arc::new(DsmCounters::new()),
        )
        .unwrap();

        // Manager sees the join frame first.
        let join = mgr_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(join.msg, Message::NodeJoin { node_id: 2, port: 39452 });

        // After the join the manager can address the worker by id.
        wrk.send(0, &Message::DirLookup { page_id: 9 }).unwrap();
        let inbound = mgr_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(inbound.msg, Message::DirLookup { page_id: 9 });
        assert!(mgr.is_connected(2));

        wrk.shutdown();
        mgr.shutdown();
    }
}
