//! Cross-thread locking behavior: conflicts, upgrades, pins, interrupts.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use txfs_concurrency::{ConcurrencyControl, DeadlockDetector, InterruptCause};
use txfs_core::{RollbackCause, TransactionId, TxError};

fn xid(n: u64) -> TransactionId {
    TransactionId::for_local_transaction(n)
}

#[test]
fn conflicting_exclusive_locks_never_coexist() {
    let cc = Arc::new(ConcurrencyControl::new());
    let in_critical = Arc::new(AtomicBool::new(false));
    let mut handles = Vec::new();
    for n in 0..4u64 {
        let cc = Arc::clone(&cc);
        let in_critical = Arc::clone(&in_critical);
        handles.push(thread::spawn(move || {
            let me = xid(n);
            let held = cc
                .acquire(&me, Path::new("/shared/target"), true, Duration::from_secs(5))
                .unwrap();
            assert!(!in_critical.swap(true, Ordering::SeqCst), "two exclusive holders");
            thread::sleep(Duration::from_millis(20));
            in_critical.store(false, Ordering::SeqCst);
            cc.release(&me, &held);
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
}

#[test]
fn reader_blocks_writer_until_release() {
    let cc = Arc::new(ConcurrencyControl::new());
    let (reader, writer) = (xid(1), xid(2));
    let held = cc
        .acquire(&reader, Path::new("/f"), false, Duration::from_millis(100))
        .unwrap();

    // Writer cannot get in while the reader holds.
    let err = cc
        .acquire(&writer, Path::new("/f"), true, Duration::from_millis(50))
        .unwrap_err();
    assert!(matches!(err, TxError::LockingTimedOut { .. }));

    cc.release(&reader, &held);
    assert!(cc
        .acquire(&writer, Path::new("/f"), true, Duration::from_millis(50))
        .is_ok());
}

#[test]
fn upgrade_blocks_readers_until_undone() {
    let cc = ConcurrencyControl::new();
    let (upgrader, reader) = (xid(1), xid(2));
    let p = Path::new("/f");

    let shared = cc.acquire(&upgrader, p, false, Duration::from_millis(100)).unwrap();
    let upgrade = cc.acquire(&upgrader, p, true, Duration::from_millis(100)).unwrap();
    assert!(upgrade.upgraded);
    let err = cc.acquire(&reader, p, false, Duration::from_millis(30)).unwrap_err();
    assert!(matches!(err, TxError::LockingTimedOut { .. }));

    // Undoing a failed operation's upgrade re-admits readers but keeps the
    // upgrader's original shared hold against writers.
    cc.undo_acquisition(&upgrader, &upgrade);
    let hr = cc.acquire(&reader, p, false, Duration::from_millis(30)).unwrap();
    cc.release(&reader, &hr);
    let err = cc.acquire(&reader, p, true, Duration::from_millis(30)).unwrap_err();
    assert!(matches!(err, TxError::LockingTimedOut { .. }));

    cc.release(&upgrader, &shared);
    assert!(cc.acquire(&reader, p, true, Duration::from_millis(30)).is_ok());
}

#[test]
fn crossed_writers_deadlock_and_one_is_victimized() {
    let cc = Arc::new(ConcurrencyControl::new());
    let (a, b) = (xid(1), xid(2));
    let ha = cc.acquire(&a, Path::new("/x"), true, Duration::from_millis(100)).unwrap();
    let hb = cc.acquire(&b, Path::new("/y"), true, Duration::from_millis(100)).unwrap();

    let spawn_cross = |me: TransactionId, want: &'static str| {
        let cc = Arc::clone(&cc);
        thread::spawn(move || cc.acquire(&me, Path::new(want), true, Duration::from_secs(10)))
    };
    let ta = spawn_cross(a.clone(), "/y");
    let tb = spawn_cross(b.clone(), "/x");

    let detector = DeadlockDetector::new(Arc::clone(&cc));
    let mut victims = Vec::new();
    for _ in 0..200 {
        victims = detector.run_once();
        if !victims.is_empty() {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(victims.len(), 1, "exactly one victim per cycle");

    // Releasing the victim's hold (as its forced rollback would) unblocks
    // the survivor; the victim's own acquire surfaces the victimization.
    let victim = victims[0].clone();
    let victim_hold = if victim == a { &ha } else { &hb };
    cc.release(&victim, victim_hold);
    cc.forget_transaction(&victim);

    let (ra, rb) = (ta.join().unwrap(), tb.join().unwrap());
    let (lost, won) = if victim == a { (ra, rb) } else { (rb, ra) };
    assert!(matches!(
        lost,
        Err(TxError::TransactionRolledBack {
            cause: RollbackCause::DeadlockVictimized
        })
    ));
    assert!(won.is_ok());
}

#[test]
fn interrupt_pending_before_the_wait_is_seen_at_once() {
    let cc = ConcurrencyControl::new();
    let (holder, blocked) = (xid(1), xid(2));
    let p = Path::new("/f");
    let _held = cc.acquire(&holder, p, true, Duration::from_millis(100)).unwrap();

    // The cause lands before the blocked transaction ever reaches its
    // condvar; the acquire must not sit out its full deadline.
    let node = cc.tree().node_for(p);
    cc.waiters().register(&blocked, node, true, cc.tree().lock_of(node));
    assert!(cc.interrupt_if_waiting(&blocked, InterruptCause::Timeout));

    let start = Instant::now();
    let err = cc.acquire(&blocked, p, true, Duration::from_secs(10)).unwrap_err();
    assert!(matches!(
        err,
        TxError::TransactionRolledBack {
            cause: RollbackCause::TransactionTimeout
        }
    ));
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[test]
fn timeout_interrupt_surfaces_as_forced_rollback() {
    let cc = Arc::new(ConcurrencyControl::new());
    let (holder, blocked) = (xid(1), xid(2));
    let _held = cc
        .acquire(&holder, Path::new("/f"), true, Duration::from_millis(100))
        .unwrap();

    let cc2 = Arc::clone(&cc);
    let blocked2 = blocked.clone();
    let t = thread::spawn(move || cc2.acquire(&blocked2, Path::new("/f"), true, Duration::from_secs(10)));

    // Wait until the wait-for edge is published, then interrupt as the
    // timeout detector would.
    for _ in 0..100 {
        if cc.interrupt_if_waiting(&blocked, InterruptCause::Timeout) {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    match t.join().unwrap() {
        Err(TxError::TransactionRolledBack { cause }) => {
            assert_eq!(cause, RollbackCause::TransactionTimeout)
        }
        other => panic!("expected forced rollback, got {other:?}"),
    }
}

#[test]
fn pinned_subtree_rejects_locks_until_transaction_end() {
    let cc = ConcurrencyControl::new();
    let (renamer, other) = (xid(1), xid(2));
    cc.pin_directory_for_rename(&renamer, Path::new("/d")).unwrap();

    for path in ["/d", "/d/f", "/d/sub/deep"] {
        let err = cc
            .acquire(&other, Path::new(path), false, Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, TxError::AncestorPinned { .. }), "{path}");
    }

    // The pinning transaction itself is not blocked.
    assert!(cc
        .acquire(&renamer, Path::new("/d/f"), true, Duration::from_millis(20))
        .is_ok());

    cc.forget_transaction(&renamer);
    assert!(cc
        .acquire(&other, Path::new("/d/f"), false, Duration::from_millis(20))
        .is_ok());
}
