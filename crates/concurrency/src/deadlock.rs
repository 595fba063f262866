//! Deadlock detection over the wait-for graph.
//!
//! A periodic pass snapshots the current waiters, builds transaction →
//! transaction wait-for edges (each blocked transaction waits for every
//! holder of its awaited lock), and runs a depth-first search for cycles.
//! One participant per cycle is interrupted with [`InterruptCause::Deadlock`].
//!
//! Victim policy: the cycle participant holding the fewest exclusive locks;
//! ties broken by the most recent wait start. The cheapest transaction to
//! redo loses, and the tie-break makes the choice deterministic.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, trace};
use txfs_core::TransactionId;

use crate::control::ConcurrencyControl;
use crate::waiters::{InterruptCause, Waiter};

/// One detection pass over the wait-for graph.
pub struct DeadlockDetector {
    control: Arc<ConcurrencyControl>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

impl DeadlockDetector {
    /// Detector over the given controller.
    pub fn new(control: Arc<ConcurrencyControl>) -> Self {
        DeadlockDetector { control }
    }

    /// Run one detection pass; returns the victimized transactions, one per
    /// cycle found.
    pub fn run_once(&self) -> Vec<TransactionId> {
        let waiters = self.control.waiters().snapshot();
        if waiters.is_empty() {
            return Vec::new();
        }

        let mut edges: HashMap<TransactionId, Vec<TransactionId>> = HashMap::new();
        let mut wait_start: HashMap<TransactionId, Instant> = HashMap::new();
        for waiter in &waiters {
            let holders: Vec<TransactionId> = {
                let state = waiter.lock().lock_state();
                state
                    .holders()
                    .iter()
                    .filter(|h| **h != waiter.xid)
                    .cloned()
                    .collect()
            };
            wait_start.insert(waiter.xid.clone(), waiter.since);
            edges.entry(waiter.xid.clone()).or_default().extend(holders);
        }
        trace!(waiters = waiters.len(), "deadlock detection pass");

        let mut marks: HashMap<TransactionId, Mark> = HashMap::new();
        let mut victims = Vec::new();
        let nodes: Vec<TransactionId> = edges.keys().cloned().collect();
        for start in nodes {
            if *marks.get(&start).unwrap_or(&Mark::Unvisited) != Mark::Unvisited {
                continue;
            }
            let mut stack: Vec<TransactionId> = Vec::new();
            if let Some(cycle) = Self::dfs(&start, &edges, &mut marks, &mut stack) {
                if let Some(victim) = self.pick_victim(&cycle, &waiters, &wait_start) {
                    info!(%victim, cycle = cycle.len(), "deadlock cycle found, victimizing");
                    self.control
                        .interrupt_if_waiting(&victim, InterruptCause::Deadlock);
                    victims.push(victim);
                }
            }
        }
        victims
    }

    fn dfs(
        node: &TransactionId,
        edges: &HashMap<TransactionId, Vec<TransactionId>>,
        marks: &mut HashMap<TransactionId, Mark>,
        stack: &mut Vec<TransactionId>,
    ) -> Option<Vec<TransactionId>> {
        marks.insert(node.clone(), Mark::InProgress);
        stack.push(node.clone());
        if let Some(next) = edges.get(node) {
            for n in next {
                match marks.get(n).copied().unwrap_or(Mark::Unvisited) {
                    Mark::InProgress => {
                        // Cycle: everything on the stack from n onward.
                        let pos = stack.iter().position(|s| s == n).unwrap_or(0);
                        return Some(stack[pos..].to_vec());
                    }
                    Mark::Unvisited => {
                        if let Some(cycle) = Self::dfs(n, edges, marks, stack) {
                            return Some(cycle);
                        }
                    }
                    Mark::Done => {}
                }
            }
        }
        stack.pop();
        marks.insert(node.clone(), Mark::Done);
        None
    }

    fn pick_victim(
        &self,
        cycle: &[TransactionId],
        waiters: &[Arc<Waiter>],
        wait_start: &HashMap<TransactionId, Instant>,
    ) -> Option<TransactionId> {
        // Only a blocked participant can be interrupted.
        let blocked: HashSet<&TransactionId> = waiters.iter().map(|w| &w.xid).collect();
        cycle
            .iter()
            .filter(|xid| blocked.contains(xid))
            .min_by(|a, b| {
                let locks_a = self.control.exclusive_locks_held(a);
                let locks_b = self.control.exclusive_locks_held(b);
                locks_a.cmp(&locks_b).then_with(|| {
                    // Most recent wait start loses.
                    let sa = wait_start.get(*a);
                    let sb = wait_start.get(*b);
                    sb.cmp(&sa)
                })
            })
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::thread;
    use std::time::Duration;
    use txfs_core::{RollbackCause, TxError};

    fn xid(n: u64) -> TransactionId {
        TransactionId::for_local_transaction(n)
    }

    #[test]
    fn no_waiters_no_victims() {
        let cc = Arc::new(ConcurrencyControl::new());
        let detector = DeadlockDetector::new(cc);
        assert!(detector.run_once().is_empty());
    }

    #[test]
    fn two_transaction_cycle_victimizes_exactly_one() {
        let cc = Arc::new(ConcurrencyControl::new());
        let (a, b) = (xid(1), xid(2));
        let ha = cc.acquire(&a, Path::new("/x"), true, Duration::from_millis(100)).unwrap();
        let hb = cc.acquire(&b, Path::new("/y"), true, Duration::from_millis(100)).unwrap();

        let cc_a = Arc::clone(&cc);
        let a2 = a.clone();
        let ta = thread::spawn(move || cc_a.acquire(&a2, Path::new("/y"), true, Duration::from_secs(10)));
        let cc_b = Arc::clone(&cc);
        let b2 = b.clone();
        let tb = thread::spawn(move || cc_b.acquire(&b2, Path::new("/x"), true, Duration::from_secs(10)));

        // Let both threads block, then detect.
        let detector = DeadlockDetector::new(Arc::clone(&cc));
        let mut victims = Vec::new();
        for _ in 0..100 {
            victims = detector.run_once();
            if !victims.is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(victims.len(), 1);
        let victim = victims[0].clone();

        // Release the victim's initial hold (a forced rollback would do
        // this) so the survivor can proceed, then collect both results.
        let (vh, _sh) = if victim == a { (&ha, &hb) } else { (&hb, &ha) };
        cc.release(&victim, vh);
        cc.forget_transaction(&victim);

        let (ra, rb) = (ta.join().unwrap(), tb.join().unwrap());
        let (victim_result, survivor_result) = if victim == a { (ra, rb) } else { (rb, ra) };
        match victim_result {
            Err(TxError::TransactionRolledBack { cause }) => {
                assert_eq!(cause, RollbackCause::DeadlockVictimized)
            }
            other => panic!("victim got {other:?}"),
        }
        assert!(survivor_result.is_ok());
    }
}
