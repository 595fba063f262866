//! Background detectors.
//!
//! Two threads run for the life of the engine: the deadlock detector walks
//! the wait-for graph and victimizes one transaction per cycle; the timeout
//! detector force-rolls-back transactions that outlive their configured
//! lifetime. Both act through cooperative interrupts: a blocked transaction
//! observes the interrupt inside its lock wait, an idle one is rolled back
//! directly through its session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info};
use txfs_concurrency::{DeadlockDetector, InterruptCause};
use txfs_core::RollbackCause;

use crate::filesystem::EngineShared;
use crate::session::Session;

pub(crate) struct Workers {
    shutdown: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

pub(crate) fn spawn(shared: &Arc<EngineShared>) -> std::io::Result<Workers> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let mut handles = Vec::new();

    {
        let shutdown = Arc::clone(&shutdown);
        let detector = DeadlockDetector::new(Arc::clone(&shared.concurrency));
        let interval = shared.config.deadlock_detector_interval;
        handles.push(
            thread::Builder::new()
                .name("txfs-deadlock-detector".to_string())
                .spawn(move || deadlock_loop(detector, interval, shutdown))?,
        );
    }
    {
        let shutdown = Arc::clone(&shutdown);
        let shared = Arc::clone(shared);
        let interval = shared.config.timeout_detector_interval;
        handles.push(
            thread::Builder::new()
                .name("txfs-timeout-detector".to_string())
                .spawn(move || timeout_loop(shared, interval, shutdown))?,
        );
    }
    Ok(Workers { shutdown, handles })
}

fn deadlock_loop(detector: DeadlockDetector, interval: Duration, shutdown: Arc<AtomicBool>) {
    while !shutdown.load(Ordering::Relaxed) {
        thread::sleep(interval);
        let victims = detector.run_once();
        for victim in victims {
            info!(xid = %victim, "deadlock victim interrupted");
        }
    }
}

fn timeout_loop(shared: Arc<EngineShared>, interval: Duration, shutdown: Arc<AtomicBool>) {
    while !shutdown.load(Ordering::Relaxed) {
        thread::sleep(interval);
        // Snapshot first; a forced rollback removes the session from the
        // registry mid-iteration otherwise.
        let sessions: Vec<Arc<Session>> = shared
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for session in sessions {
            let Some(timeout) = session.transaction_timeout() else {
                continue;
            };
            if session.created_at().elapsed() <= timeout {
                continue;
            }
            let xid = session.xid().clone();
            if shared
                .concurrency
                .interrupt_if_waiting(&xid, InterruptCause::Timeout)
            {
                // The blocked operation surfaces the rollback itself.
                debug!(xid = %xid, "timed-out transaction interrupted in lock wait");
            } else if session.try_force_rollback(RollbackCause::TransactionTimeout) {
                info!(xid = %xid, "idle transaction timed out and was rolled back");
            }
        }
    }
}

impl Workers {
    /// Signal both detectors and join them.
    pub(crate) fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
