//! Lock acquisition, release and rename pinning.
//!
//! Acquisition is strict two-phase: the session stores every [`HeldLock`]
//! and releases them only at transaction end (or, on a failed call, only the
//! locks that call newly acquired).

use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, trace};
use txfs_core::{Result, RollbackCause, TransactionId, TxError};

use crate::lock::ResourceLock;
use crate::tree::{LockTree, NodeId};
use crate::waiters::{InterruptCause, WaiterRegistry};

/// A lock held by a transaction, to be released at transaction end.
#[derive(Debug)]
pub struct HeldLock {
    /// Path the lock covers.
    pub path: PathBuf,
    /// Lock-tree node.
    pub node: NodeId,
    /// Whether the hold is exclusive.
    pub exclusive: bool,
    /// True when this acquisition upgraded an existing shared hold in place;
    /// the caller must replace its prior entry for the same path instead of
    /// adding a second one.
    pub upgraded: bool,
}

/// The engine-wide concurrency controller.
///
/// Owns the lock tree and the wait-for registry; the deadlock and timeout
/// detectors interrupt blocked transactions through it.
pub struct ConcurrencyControl {
    tree: LockTree,
    waiters: WaiterRegistry,
    exclusive_counts: DashMap<TransactionId, usize>,
    pins: DashMap<TransactionId, Vec<NodeId>>,
}

impl Default for ConcurrencyControl {
    fn default() -> Self {
        ConcurrencyControl::new()
    }
}

impl ConcurrencyControl {
    /// Fresh controller with an empty lock tree.
    pub fn new() -> Self {
        ConcurrencyControl {
            tree: LockTree::new(),
            waiters: WaiterRegistry::new(),
            exclusive_counts: DashMap::new(),
            pins: DashMap::new(),
        }
    }

    /// The underlying lock tree.
    pub fn tree(&self) -> &LockTree {
        &self.tree
    }

    /// The wait-for registry.
    pub fn waiters(&self) -> &WaiterRegistry {
        &self.waiters
    }

    /// Acquire a lock on `path` for `xid`, blocking up to `timeout`.
    ///
    /// Shared requests succeed while no exclusive holder exists; exclusive
    /// requests succeed while the holder set is empty or exactly `{xid}`
    /// (in-place upgrade). Otherwise the call blocks on the lock's condition
    /// until granted, timed out, or interrupted by a detector.
    pub fn acquire(
        &self,
        xid: &TransactionId,
        path: &Path,
        exclusive: bool,
        timeout: Duration,
    ) -> Result<HeldLock> {
        let node = self.tree.node_for(path);
        if self.tree.ancestor_pinned_by_other(node, xid) {
            return Err(TxError::AncestorPinned {
                path: path.to_path_buf(),
            });
        }
        let lock = self.tree.lock_of(node);
        let deadline = Instant::now() + timeout;
        let mut waited = false;

        loop {
            let grantable = {
                let state = lock.lock_state();
                if exclusive {
                    state.writable_by(xid)
                } else {
                    state.readable()
                }
            };

            if grantable {
                // Tentatively take the hold, then re-validate pins outside
                // the state mutex; an ancestor may have been pinned while we
                // were blocked.
                let upgraded = {
                    let mut state = lock.lock_state();
                    let ok = if exclusive {
                        state.writable_by(xid)
                    } else {
                        state.readable()
                    };
                    if !ok {
                        continue;
                    }
                    let upgraded = exclusive && state.holders().contains(xid);
                    state.add_holder(xid);
                    if exclusive {
                        state.mark_exclusive(upgraded);
                    }
                    upgraded
                };
                if waited {
                    self.waiters.deregister(xid);
                }
                if self.tree.ancestor_pinned_by_other(node, xid) {
                    self.undo_grant(&lock, xid, exclusive, upgraded);
                    return Err(TxError::AncestorPinned {
                        path: path.to_path_buf(),
                    });
                }
                if exclusive {
                    *self.exclusive_counts.entry(xid.clone()).or_insert(0) += 1;
                }
                trace!(%xid, path = %path.display(), exclusive, "lock acquired");
                return Ok(HeldLock {
                    path: path.to_path_buf(),
                    node,
                    exclusive,
                    upgraded,
                });
            }

            // Contended: publish the wait-for edge and block.
            let waiter = match self.waiters.get(xid) {
                Some(w) => w,
                None => {
                    if !waited {
                        waited = true;
                        debug!(%xid, path = %path.display(), exclusive, "lock contended, waiting");
                    }
                    self.waiters.register(xid, node, exclusive, lock.clone())
                }
            };

            let mut state = lock.lock_state();
            // Re-check under the mutex; the holder may have released between
            // our probe and here.
            let ok_now = if exclusive {
                state.writable_by(xid)
            } else {
                state.readable()
            };
            if !ok_now {
                // An interrupt delivered between registration and this point
                // produced no wakeup we could have seen; check under the
                // state mutex so the interrupter cannot slip in before the
                // wait below.
                if let Some(cause) = waiter.take_interrupt() {
                    drop(state);
                    self.waiters.deregister(xid);
                    return Err(Self::interrupted(xid, path, cause));
                }
                let condvar = if exclusive {
                    lock.writable_condvar()
                } else {
                    lock.readable_condvar()
                };
                let timed_out = condvar.wait_until(&mut state, deadline).timed_out();
                drop(state);

                if let Some(cause) = waiter.take_interrupt() {
                    self.waiters.deregister(xid);
                    return Err(Self::interrupted(xid, path, cause));
                }
                if timed_out {
                    self.waiters.deregister(xid);
                    return Err(TxError::LockingTimedOut {
                        path: path.to_path_buf(),
                    });
                }
            }
        }
    }

    fn interrupted(xid: &TransactionId, path: &Path, cause: InterruptCause) -> TxError {
        let cause = match cause {
            InterruptCause::Deadlock => RollbackCause::DeadlockVictimized,
            InterruptCause::Timeout => RollbackCause::TransactionTimeout,
        };
        debug!(%xid, path = %path.display(), %cause, "lock wait interrupted");
        TxError::TransactionRolledBack { cause }
    }

    fn undo_grant(&self, lock: &ResourceLock, xid: &TransactionId, exclusive: bool, upgraded: bool) {
        let mut state = lock.lock_state();
        if exclusive && !upgraded {
            state.reset();
            drop(state);
            lock.wake_all();
        } else if exclusive && upgraded {
            // Fall back to the pre-existing shared hold.
            state.reset_exclusivity();
            drop(state);
            lock.wake_all();
        } else {
            state.remove_holder(xid);
            drop(state);
            lock.wake_writers();
        }
    }

    /// Release one held lock.
    pub fn release(&self, xid: &TransactionId, held: &HeldLock) {
        let lock = self.tree.lock_of(held.node);
        lock.release(xid);
        if held.exclusive {
            if let Some(mut count) = self.exclusive_counts.get_mut(xid) {
                *count = count.saturating_sub(1);
            }
        }
        trace!(%xid, path = %held.path.display(), "lock released");
    }

    /// Take back a lock acquired by an operation that failed.
    ///
    /// An in-place upgrade is downgraded back to the pre-existing shared
    /// hold rather than released: that hold belongs to an earlier operation
    /// and stays until transaction end. Everything else releases fully.
    pub fn undo_acquisition(&self, xid: &TransactionId, held: &HeldLock) {
        if !held.upgraded {
            self.release(xid, held);
            return;
        }
        let lock = self.tree.lock_of(held.node);
        lock.downgrade(xid);
        if let Some(mut count) = self.exclusive_counts.get_mut(xid) {
            *count = count.saturating_sub(1);
        }
        trace!(%xid, path = %held.path.display(), "upgrade undone, shared hold kept");
    }

    /// Pin the directory subtree at `path` for a rename by `xid`.
    pub fn pin_directory_for_rename(&self, xid: &TransactionId, path: &Path) -> Result<()> {
        match self.tree.pin_subtree(path, xid) {
            Some(pinned) => {
                debug!(%xid, path = %path.display(), nodes = pinned.len(), "subtree pinned for rename");
                self.pins.entry(xid.clone()).or_default().extend(pinned);
                Ok(())
            }
            None => Err(TxError::AncestorPinned {
                path: path.to_path_buf(),
            }),
        }
    }

    /// Release every pin held by `xid`; called at transaction end regardless
    /// of outcome.
    pub fn release_pins(&self, xid: &TransactionId) {
        if let Some((_, pinned)) = self.pins.remove(xid) {
            self.tree.release_pins(&pinned, xid);
        }
    }

    /// Forget per-transaction bookkeeping once the transaction has ended.
    pub fn forget_transaction(&self, xid: &TransactionId) {
        self.release_pins(xid);
        self.exclusive_counts.remove(xid);
        self.waiters.deregister(xid);
    }

    /// Number of exclusive locks currently owned by `xid`.
    pub fn exclusive_locks_held(&self, xid: &TransactionId) -> usize {
        self.exclusive_counts.get(xid).map(|c| *c).unwrap_or(0)
    }

    /// Interrupt `xid`'s lock wait, if any, with the given cause.
    pub fn interrupt_if_waiting(&self, xid: &TransactionId, cause: InterruptCause) -> bool {
        self.waiters.interrupt_if_waiting(xid, cause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn xid(n: u64) -> TransactionId {
        TransactionId::for_local_transaction(n)
    }

    #[test]
    fn shared_locks_coexist() {
        let cc = ConcurrencyControl::new();
        let (a, b) = (xid(1), xid(2));
        let p = Path::new("/f");
        let ha = cc.acquire(&a, p, false, Duration::from_millis(100)).unwrap();
        let hb = cc.acquire(&b, p, false, Duration::from_millis(100)).unwrap();
        cc.release(&a, &ha);
        cc.release(&b, &hb);
    }

    #[test]
    fn exclusive_excludes_and_times_out() {
        let cc = ConcurrencyControl::new();
        let (a, b) = (xid(1), xid(2));
        let p = Path::new("/f");
        let _ha = cc.acquire(&a, p, true, Duration::from_millis(100)).unwrap();
        let err = cc.acquire(&b, p, true, Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, TxError::LockingTimedOut { .. }));
    }

    #[test]
    fn sole_shared_holder_upgrades_in_place() {
        let cc = ConcurrencyControl::new();
        let a = xid(1);
        let p = Path::new("/f");
        let _shared = cc.acquire(&a, p, false, Duration::from_millis(100)).unwrap();
        let upgraded = cc.acquire(&a, p, true, Duration::from_millis(100)).unwrap();
        assert!(upgraded.upgraded);
        assert_eq!(cc.exclusive_locks_held(&a), 1);
    }

    #[test]
    fn undone_upgrade_keeps_the_shared_hold() {
        let cc = ConcurrencyControl::new();
        let (a, b) = (xid(1), xid(2));
        let p = Path::new("/f");
        let shared = cc.acquire(&a, p, false, Duration::from_millis(100)).unwrap();
        let upgraded = cc.acquire(&a, p, true, Duration::from_millis(100)).unwrap();
        assert!(upgraded.upgraded);

        cc.undo_acquisition(&a, &upgraded);
        assert_eq!(cc.exclusive_locks_held(&a), 0);

        // Still shared: readers pass, writers do not.
        let hb = cc.acquire(&b, p, false, Duration::from_millis(50)).unwrap();
        cc.release(&b, &hb);
        let err = cc.acquire(&b, p, true, Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, TxError::LockingTimedOut { .. }));

        cc.release(&a, &shared);
        assert!(cc.acquire(&b, p, true, Duration::from_millis(50)).is_ok());
    }

    #[test]
    fn waiter_proceeds_after_release() {
        let cc = Arc::new(ConcurrencyControl::new());
        let (a, b) = (xid(1), xid(2));
        let p = PathBuf::from("/f");
        let ha = cc.acquire(&a, &p, true, Duration::from_millis(100)).unwrap();

        let cc2 = Arc::clone(&cc);
        let b2 = b.clone();
        let p2 = p.clone();
        let waiter = thread::spawn(move || cc2.acquire(&b2, &p2, true, Duration::from_secs(5)));

        thread::sleep(Duration::from_millis(50));
        cc.release(&a, &ha);
        let hb = waiter.join().unwrap().unwrap();
        assert!(hb.exclusive);
    }

    #[test]
    fn acquisition_under_pinned_subtree_fails() {
        let cc = ConcurrencyControl::new();
        let (a, b) = (xid(1), xid(2));
        cc.pin_directory_for_rename(&a, Path::new("/dir")).unwrap();
        let err = cc
            .acquire(&b, Path::new("/dir/file"), false, Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, TxError::AncestorPinned { .. }));

        cc.release_pins(&a);
        assert!(cc
            .acquire(&b, Path::new("/dir/file"), false, Duration::from_millis(50))
            .is_ok());
    }
}
