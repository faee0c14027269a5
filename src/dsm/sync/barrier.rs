//! Centralized barriers
//!
//! Every participant sends `BarrierArrive` to the manager; when the expected
//! count is in, the manager broadcasts `BarrierRelease` and the barrier
//! resets for reuse. The manager's own arrival is recorded directly and its
//! release delivered by local signal.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::{Condvar, Mutex};

use log::{debug, warn};

use crate::dsm::context::DsmContext;
use crate::dsm::net::protocol::Message;
use crate::dsm::types::{BarrierId, DsmError, DsmResult, NodeId};

/// Manager-side record of one barrier cycle.
#[derive(Debug)]
struct ManagedBarrier {
    expected: usize,
    arrived: HashSet<NodeId>,
}

/// Barrier state for one node.
#[derive(Debug, Default)]
pub struct BarrierRegistry {
    managed: Mutex<HashMap<BarrierId, ManagedBarrier>>,
    waits: Mutex<HashMap<BarrierId, bool>>,
    released: Condvar,
}

impl BarrierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn begin_wait(&self, barrier_id: BarrierId) {
        self.waits
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(barrier_id, false);
    }

    /// Mark a release for `barrier_id` and wake local waiters.
    pub fn signal_released(&self, barrier_id: BarrierId) {
        let mut waits = self
            .waits
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(flag) = waits.get_mut(&barrier_id) {
            *flag = true;
            self.released.notify_all();
        } else {
            warn!("barrier {} released with no local waiter", barrier_id);
        }
    }

    fn wait_released(&self, barrier_id: BarrierId, timeout: std::time::Duration) -> DsmResult<()> {
        let waits = self
            .waits
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let (mut waits, _result) = self
            .released
            .wait_timeout_while(waits, timeout, |waits| {
                !waits.get(&barrier_id).copied().unwrap_or(false)
            })
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if waits.remove(&barrier_id).unwrap_or(false) {
            Ok(())
        } else {
            Err(DsmError::Timeout)
        }
    }

    fn cancel_wait(&self, barrier_id: BarrierId) {
        self.waits
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&barrier_id);
    }
}

/// Block until all `num_participants` nodes reach the barrier.
pub fn wait(ctx: &DsmContext, barrier_id: BarrierId, num_participants: usize) -> DsmResult<()> {
    if num_participants == 0 {
        return Err(DsmError::invalid("barrier needs at least one participant"));
    }

    let registry = ctx.barriers();
    registry.begin_wait(barrier_id);

    let result = if ctx.is_manager() {
        manager_arrive(ctx, barrier_id, ctx.node_id(), num_participants)
    } else {
        ctx.transport().send(
            0,
            &Message::BarrierArrive {
                barrier_id,
                arriver: ctx.node_id(),
                num_participants: num_participants as u32,
            },
        )
    };
    if let Err(e) = result {
        registry.cancel_wait(barrier_id);
        return Err(e);
    }

    match registry.wait_released(barrier_id, ctx.protocol().barrier_timeout) {
        Ok(()) => {
            ctx.counters().barrier_waits.fetch_add(1, Ordering::Relaxed);
            debug!("node {}: passed barrier {}", ctx.node_id(), barrier_id);
            Ok(())
        }
        Err(e) => {
            registry.cancel_wait(barrier_id);
            ctx.counters().timeouts.fetch_add(1, Ordering::Relaxed);
            Err(e)
        }
    }
}

/// Manager: record an arrival; broadcast the release once everyone is in.
pub fn manager_arrive(
    ctx: &DsmContext,
    barrier_id: BarrierId,
    arriver: NodeId,
    num_participants: usize,
) -> DsmResult<()> {
    let release_to = {
        let mut managed = ctx
            .barriers()
            .managed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let barrier = managed.entry(barrier_id).or_insert_with(|| ManagedBarrier {
            expected: num_participants,
            arrived: HashSet::new(),
        });
        if barrier.expected != num_participants {
            warn!(
                "barrier {}: arriver {} expects {} participants, barrier has {}",
                barrier_id, arriver, num_participants, barrier.expected
            );
            return Err(DsmError::invalid("mismatched barrier participant count"));
        }

        barrier.arrived.insert(arriver);
        debug!(
            "barrier {}: {}/{} arrived",
            barrier_id,
            barrier.arrived.len(),
            barrier.expected
        );
        if barrier.arrived.len() == barrier.expected {
            let nodes: Vec<NodeId> = barrier.arrived.iter().copied().collect();
            managed.remove(&barrier_id);
            Some(nodes)
        } else {
            None
        }
    };

    if let Some(nodes) = release_to {
        for node in nodes {
            if node == ctx.node_id() {
                ctx.barriers().signal_released(barrier_id);
            } else if let Err(e) = ctx
                .transport()
                .send(node, &Message::BarrierRelease { barrier_id })
            {
                warn!("barrier {}: failed to release node {}: {}", barrier_id, node, e);
            }
        }
    }
    Ok(())
}
