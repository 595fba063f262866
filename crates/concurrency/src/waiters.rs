//! The wait-for registry.
//!
//! Every transaction blocked on a lock registers a [`Waiter`] carrying the
//! awaited resource and a cooperative interrupt cause. The deadlock and
//! timeout detectors set the cause under the waiter's own mutex and wake the
//! lock's conditions; the blocked thread re-checks the cause on every wake
//! and on timeout expiry, so a cause set racing the waiter's own timeout
//! path is never lost.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use txfs_core::TransactionId;

use crate::lock::ResourceLock;
use crate::tree::NodeId;

/// Why a blocked transaction was told to stop waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptCause {
    /// Victimized by the deadlock detector.
    Deadlock,
    /// The transaction exceeded its lifetime.
    Timeout,
}

/// One blocked transaction.
#[derive(Debug)]
pub struct Waiter {
    /// The blocked transaction.
    pub xid: TransactionId,
    /// The lock-tree node awaited.
    pub node: NodeId,
    /// Whether the request is for exclusive ownership.
    pub exclusive: bool,
    /// When the wait began.
    pub since: Instant,
    lock: Arc<ResourceLock>,
    interrupt: Mutex<Option<InterruptCause>>,
}

impl Waiter {
    /// Set the interrupt cause (first writer wins) and wake the waiter.
    pub fn interrupt(&self, cause: InterruptCause) {
        {
            let mut slot = self.interrupt.lock();
            if slot.is_some() {
                return;
            }
            *slot = Some(cause);
        }
        // Serialize with a blocked thread that is between its pre-wait
        // interrupt check and the condvar wait; it holds the state mutex
        // across that window, so passing through here means the cause is
        // already visible to its next check.
        drop(self.lock.lock_state());
        self.lock.wake_all();
    }

    /// Consume a pending interrupt cause, if any.
    pub fn take_interrupt(&self) -> Option<InterruptCause> {
        self.interrupt.lock().take()
    }

    /// Peek at the pending interrupt cause.
    pub fn pending_interrupt(&self) -> Option<InterruptCause> {
        *self.interrupt.lock()
    }

    /// The awaited lock.
    pub fn lock(&self) -> &Arc<ResourceLock> {
        &self.lock
    }
}

/// All currently blocked transactions, keyed by transaction id.
///
/// At most one waiter exists per transaction: a session issues one lock
/// request at a time.
#[derive(Debug, Default)]
pub struct WaiterRegistry {
    waiters: DashMap<TransactionId, Arc<Waiter>>,
}

impl WaiterRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        WaiterRegistry::default()
    }

    /// Register `xid` as blocked on `node`'s lock.
    pub fn register(
        &self,
        xid: &TransactionId,
        node: NodeId,
        exclusive: bool,
        lock: Arc<ResourceLock>,
    ) -> Arc<Waiter> {
        let waiter = Arc::new(Waiter {
            xid: xid.clone(),
            node,
            exclusive,
            since: Instant::now(),
            lock,
            interrupt: Mutex::new(None),
        });
        self.waiters.insert(xid.clone(), Arc::clone(&waiter));
        waiter
    }

    /// Current waiter for `xid`, if it is blocked.
    pub fn get(&self, xid: &TransactionId) -> Option<Arc<Waiter>> {
        self.waiters.get(xid).map(|e| Arc::clone(e.value()))
    }

    /// Remove the waiter for `xid` once its wait has resolved.
    pub fn deregister(&self, xid: &TransactionId) {
        self.waiters.remove(xid);
    }

    /// Interrupt `xid` if it is currently blocked. Returns whether a waiter
    /// was found.
    pub fn interrupt_if_waiting(&self, xid: &TransactionId, cause: InterruptCause) -> bool {
        if let Some(waiter) = self.waiters.get(xid) {
            waiter.interrupt(cause);
            true
        } else {
            false
        }
    }

    /// Snapshot of all current waiters, for the deadlock detector.
    pub fn snapshot(&self) -> Vec<Arc<Waiter>> {
        self.waiters.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Number of blocked transactions.
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Whether no transaction is blocked.
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}
