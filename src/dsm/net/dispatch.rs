//! Message dispatch loop
//!
//! One dispatcher thread per node drains the transport's inbound channel
//! and executes protocol handlers inline. The dispatcher itself never
//! blocks on a protocol wait; it is the thread that signals those waits.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, select, Receiver, Sender};
use log::{debug, warn};

use crate::dsm::context::DsmContext;
use crate::dsm::net::handlers;
use crate::dsm::net::transport::Inbound;
use crate::dsm::types::{DsmError, DsmResult};

/// Handle to a running dispatcher thread.
#[derive(Debug)]
pub struct Dispatcher {
    handle: Option<JoinHandle<()>>,
    shutdown_tx: Sender<()>,
}

impl Dispatcher {
    /// Spawn the dispatcher for `ctx`, draining `inbound`.
    pub fn spawn(ctx: Arc<DsmContext>, inbound: Receiver<Inbound>) -> DsmResult<Self> {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let name = format!("quilt-dispatch-{}", ctx.node_id());
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || run(ctx, inbound, shutdown_rx))
            .map_err(|e| DsmError::invalid(format!("spawn dispatcher: {}", e)))?;
        Ok(Self {
            handle: Some(handle),
            shutdown_tx,
        })
    }

    /// Stop the loop and join the thread.
    pub fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(ctx: Arc<DsmContext>, inbound: Receiver<Inbound>, shutdown: Receiver<()>) {
    debug!("node {}: dispatcher running", ctx.node_id());
    loop {
        select! {
            recv(inbound) -> received => {
                let Ok(inbound) = received else {
                    // Transport gone; nothing more will arrive.
                    break;
                };
                let kind = inbound.msg.kind_code();
                if let Err(e) = handlers::dispatch(&ctx, &inbound.header, inbound.msg) {
                    warn!(
                        "node {}: handler for message kind {} from node {} failed: {}",
                        ctx.node_id(),
                        kind,
                        inbound.header.sender,
                        e
                    );
                }
            }
            recv(shutdown) -> _ => break,
        }
    }
    debug!("node {}: dispatcher stopped", ctx.node_id());
}
