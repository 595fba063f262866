//! Per-resource lock state.
//!
//! Each path in the lock tree owns one [`ResourceLock`]. A lock is shared
//! (any number of reader transactions) or exclusive (one transaction, with
//! in-place upgrade when the requester is the sole shared holder). Waiters
//! block on one of two conditions: shared requesters on "may become
//! readable", exclusive requesters on "may become writable".

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::HashSet;
use txfs_core::TransactionId;

/// Mutable state guarded by the lock's mutex.
#[derive(Debug, Default)]
pub struct LockState {
    exclusive: bool,
    upgraded: bool,
    holders: HashSet<TransactionId>,
}

impl LockState {
    /// True while a shared acquisition may proceed.
    pub fn readable(&self) -> bool {
        !self.exclusive
    }

    /// True while `xid` may take or upgrade to exclusive ownership.
    pub fn writable_by(&self, xid: &TransactionId) -> bool {
        self.holders.is_empty() || (self.holders.len() == 1 && self.holders.contains(xid))
    }

    /// Whether the lock is currently exclusive.
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// Whether the exclusive ownership came from a shared upgrade.
    pub fn is_upgraded(&self) -> bool {
        self.upgraded
    }

    /// Current holder set.
    pub fn holders(&self) -> &HashSet<TransactionId> {
        &self.holders
    }

    /// Number of holders.
    pub fn holder_count(&self) -> usize {
        self.holders.len()
    }

    pub(crate) fn add_holder(&mut self, xid: &TransactionId) {
        self.holders.insert(xid.clone());
    }

    pub(crate) fn remove_holder(&mut self, xid: &TransactionId) -> bool {
        self.holders.remove(xid)
    }

    pub(crate) fn mark_exclusive(&mut self, upgraded: bool) {
        self.exclusive = true;
        self.upgraded = upgraded;
    }

    pub(crate) fn reset_exclusivity(&mut self) {
        self.exclusive = false;
        self.upgraded = false;
    }

    pub(crate) fn reset(&mut self) {
        self.exclusive = false;
        self.upgraded = false;
        self.holders.clear();
    }
}

/// A lock over one filesystem path.
#[derive(Debug, Default)]
pub struct ResourceLock {
    state: Mutex<LockState>,
    readable: Condvar,
    writable: Condvar,
}

impl ResourceLock {
    /// Fresh, unheld lock.
    pub fn new() -> Self {
        ResourceLock::default()
    }

    /// Take the state mutex.
    pub fn lock_state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock()
    }

    /// Block the shared-acquisition condition.
    pub fn readable_condvar(&self) -> &Condvar {
        &self.readable
    }

    /// Block the exclusive-acquisition condition.
    pub fn writable_condvar(&self) -> &Condvar {
        &self.writable
    }

    /// Wake every waiter on both conditions.
    pub fn wake_all(&self) {
        self.readable.notify_all();
        self.writable.notify_all();
    }

    /// Wake exclusive waiters only.
    pub fn wake_writers(&self) {
        self.writable.notify_all();
    }

    /// Drop exclusivity while keeping `xid`'s shared hold.
    ///
    /// Used when a failed operation undoes an in-place upgrade: the shared
    /// hold predates the operation and must survive it.
    pub fn downgrade(&self, xid: &TransactionId) {
        let mut state = self.state.lock();
        if state.is_exclusive() && state.holders().contains(xid) {
            state.reset_exclusivity();
            drop(state);
            self.wake_all();
        }
    }

    /// Release `xid`'s hold.
    ///
    /// An exclusive release resets the lock to empty and wakes both wait
    /// conditions; a shared release wakes exclusive waiters only.
    pub fn release(&self, xid: &TransactionId) {
        let mut state = self.state.lock();
        if state.is_exclusive() && state.holders().contains(xid) {
            state.reset();
            drop(state);
            self.wake_all();
        } else if state.remove_holder(xid) {
            drop(state);
            self.wake_writers();
        }
    }
}
