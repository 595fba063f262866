//! Log-file lifetime tracking.
//!
//! A log file may be deleted only once no transaction's record chain still
//! references it and it is not the live file. Each transaction registers
//! every log index it writes into; the per-log open-transaction refcount
//! drops as transactions complete.

use std::collections::HashMap;
use txfs_core::TransactionId;

/// Refcounts of open transactions per log file.
#[derive(Debug, Default)]
pub struct LogUsageTracker {
    logs_occupied: HashMap<TransactionId, Vec<u64>>,
    open_transactions: HashMap<u64, usize>,
}

impl LogUsageTracker {
    /// Empty tracker.
    pub fn new() -> Self {
        LogUsageTracker::default()
    }

    /// Note that `xid` wrote a record into log `log_index`.
    pub fn track(&mut self, xid: &TransactionId, log_index: u64) {
        let occupied = self.logs_occupied.entry(xid.clone()).or_default();
        if !occupied.contains(&log_index) {
            occupied.push(log_index);
            *self.open_transactions.entry(log_index).or_insert(0) += 1;
        }
    }

    /// Release `xid`'s claims; returns the log indices now safe to delete,
    /// excluding `current_log_index`.
    pub fn release_transaction(
        &mut self,
        xid: &TransactionId,
        current_log_index: u64,
    ) -> Vec<u64> {
        let mut deletable = Vec::new();
        let Some(occupied) = self.logs_occupied.remove(xid) else {
            return deletable;
        };
        for log_index in occupied {
            let Some(count) = self.open_transactions.get_mut(&log_index) else {
                continue;
            };
            *count -= 1;
            if *count == 0 && log_index != current_log_index {
                self.open_transactions.remove(&log_index);
                deletable.push(log_index);
            }
        }
        deletable
    }

    /// Whether a rotated-away log with no remaining references may go.
    pub fn is_deletable(&self, log_index: u64, current_log_index: u64) -> bool {
        log_index != current_log_index
            && self.open_transactions.get(&log_index).copied().unwrap_or(0) == 0
    }

    /// Log indices referenced by `xid`, oldest first.
    pub fn logs_of(&self, xid: &TransactionId) -> &[u64] {
        self.logs_occupied.get(xid).map(|v| v.as_slice()).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xid(n: u64) -> TransactionId {
        TransactionId::for_local_transaction(n)
    }

    #[test]
    fn logs_freed_only_when_last_transaction_leaves() {
        let mut tracker = LogUsageTracker::new();
        let (a, b) = (xid(1), xid(2));
        tracker.track(&a, 0);
        tracker.track(&a, 0); // duplicate is a no-op
        tracker.track(&b, 0);
        tracker.track(&a, 1);

        assert!(tracker.release_transaction(&a, 2).contains(&1));
        assert!(!tracker.is_deletable(0, 2));
        assert_eq!(tracker.release_transaction(&b, 2), vec![0]);
    }

    #[test]
    fn current_log_is_never_deletable() {
        let mut tracker = LogUsageTracker::new();
        let a = xid(1);
        tracker.track(&a, 3);
        assert!(tracker.release_transaction(&a, 3).is_empty());
        assert!(!tracker.is_deletable(3, 3));
        // Once the engine rotates past it, it may go.
        assert!(tracker.is_deletable(3, 4));
    }
}
