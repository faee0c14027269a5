//! Centralized distributed locks
//!
//! Lock state lives on the manager node, which grants in FIFO order. A
//! client sends `LockRequest` and blocks on its local wait state until the
//! `LockGrant` comes back; the manager's own acquisitions go through the
//! same wait state, signaled directly instead of over the wire.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::{Condvar, Mutex};

use log::{debug, warn};

use crate::dsm::context::DsmContext;
use crate::dsm::net::protocol::Message;
use crate::dsm::types::{DsmError, DsmResult, LockId, NodeId};

/// Manager-side record of one lock.
#[derive(Debug, Default)]
struct ManagedLock {
    holder: Option<NodeId>,
    queue: VecDeque<NodeId>,
}

/// Lock state for one node: the managed locks (populated only on the
/// manager) and the local grant-wait flags.
#[derive(Debug, Default)]
pub struct LockRegistry {
    managed: Mutex<HashMap<LockId, ManagedLock>>,
    waits: Mutex<HashMap<LockId, bool>>,
    granted: Condvar,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn begin_wait(&self, lock_id: LockId) {
        self.waits
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(lock_id, false);
    }

    /// Mark a grant for `lock_id` and wake local waiters.
    pub fn signal_granted(&self, lock_id: LockId) {
        let mut waits = self
            .waits
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(flag) = waits.get_mut(&lock_id) {
            *flag = true;
            self.granted.notify_all();
        } else {
            warn!("lock {} granted with no local waiter", lock_id);
        }
    }

    fn wait_granted(&self, lock_id: LockId, timeout: std::time::Duration) -> DsmResult<()> {
        let waits = self
            .waits
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let (mut waits, _result) = self
            .granted
            .wait_timeout_while(waits, timeout, |waits| {
                !waits.get(&lock_id).copied().unwrap_or(false)
            })
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if waits.remove(&lock_id).unwrap_or(false) {
            Ok(())
        } else {
            Err(DsmError::Timeout)
        }
    }

    fn cancel_wait(&self, lock_id: LockId) {
        self.waits
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&lock_id);
    }
}

/// Acquire a distributed lock, blocking up to the configured deadline.
pub fn acquire(ctx: &DsmContext, lock_id: LockId) -> DsmResult<()> {
    let registry = ctx.locks();
    registry.begin_wait(lock_id);

    let result = if ctx.is_manager() {
        manager_request(ctx, lock_id, ctx.node_id())
    } else {
        ctx.transport().send(
            0,
            &Message::LockRequest {
                lock_id,
                requester: ctx.node_id(),
            },
        )
    };
    if let Err(e) = result {
        registry.cancel_wait(lock_id);
        return Err(e);
    }

    match registry.wait_granted(lock_id, ctx.protocol().lock_timeout) {
        Ok(()) => {
            ctx.counters().lock_acquires.fetch_add(1, Ordering::Relaxed);
            debug!("node {}: acquired lock {}", ctx.node_id(), lock_id);
            Ok(())
        }
        Err(e) => {
            registry.cancel_wait(lock_id);
            ctx.counters().timeouts.fetch_add(1, Ordering::Relaxed);
            Err(e)
        }
    }
}

/// Release a distributed lock previously acquired by this node.
pub fn release(ctx: &DsmContext, lock_id: LockId) -> DsmResult<()> {
    if ctx.is_manager() {
        manager_release(ctx, lock_id, ctx.node_id())
    } else {
        ctx.transport().send(
            0,
            &Message::LockRelease {
                lock_id,
                releaser: ctx.node_id(),
            },
        )
    }
}

/// Manager: handle an acquisition request, granting immediately when free
/// or queuing FIFO behind the current holder.
pub fn manager_request(ctx: &DsmContext, lock_id: LockId, requester: NodeId) -> DsmResult<()> {
    let grant_now = {
        let mut managed = ctx
            .locks()
            .managed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let lock = managed.entry(lock_id).or_default();
        if lock.holder.is_none() {
            lock.holder = Some(requester);
            true
        } else {
            lock.queue.push_back(requester);
            debug!(
                "lock {}: queued node {} behind {:?}",
                lock_id, requester, lock.holder
            );
            false
        }
    };

    if grant_now {
        grant(ctx, lock_id, requester)?;
    }
    Ok(())
}

/// Manager: handle a release, passing the lock to the queue head.
pub fn manager_release(ctx: &DsmContext, lock_id: LockId, releaser: NodeId) -> DsmResult<()> {
    let next = {
        let mut managed = ctx
            .locks()
            .managed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let lock = managed.entry(lock_id).or_default();
        if lock.holder != Some(releaser) {
            warn!(
                "lock {}: release by {} but holder is {:?}",
                lock_id, releaser, lock.holder
            );
            return Err(DsmError::permission(format!(
                "lock {} not held by node {}",
                lock_id, releaser
            )));
        }
        lock.holder = lock.queue.pop_front();
        lock.holder
    };

    if let Some(grantee) = next {
        grant(ctx, lock_id, grantee)?;
    }
    Ok(())
}

fn grant(ctx: &DsmContext, lock_id: LockId, grantee: NodeId) -> DsmResult<()> {
    if grantee == ctx.node_id() {
        ctx.locks().signal_granted(lock_id);
        Ok(())
    } else {
        ctx.transport()
            .send(grantee, &Message::LockGrant { lock_id, grantee })
    }
}
