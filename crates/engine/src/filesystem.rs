//! Engine bootstrap, session registry and failure handling.
//!
//! [`FileSystem::boot`] opens the log writer, runs crash recovery over the
//! retained logs, then starts the background detectors. Sessions are
//! admitted only once recovery has fully completed; prepared transactions
//! found in doubt keep bootup incomplete until their coordinator resolves
//! them through [`FileSystem::commit_recovered`] or
//! [`FileSystem::rollback_recovered`].
//!
//! The first durability-affecting failure poisons the whole engine: the
//! failure reason is latched and every subsequent call returns
//! `SystemFailure` until the process restarts and recovery re-establishes a
//! consistent state.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{error, info};
use txfs_concurrency::ConcurrencyControl;
use txfs_core::{EngineConfig, Result, TransactionId, TxError};
use txfs_durability::{ChangeEvent, DurableDirSession, GatheringLogWriter, LogRecord};

use crate::recovery::{self, apply_redo_chain, apply_undo_chain, shadow_sources, InDoubtTransaction};
use crate::session::Session;
use crate::workers::{self, Workers};

/// State shared by the facade, every session and the detectors.
pub(crate) struct EngineShared {
    pub(crate) config: EngineConfig,
    pub(crate) concurrency: Arc<ConcurrencyControl>,
    pub(crate) writer: GatheringLogWriter,
    pub(crate) sessions: DashMap<TransactionId, Arc<Session>>,
    pub(crate) in_doubt: Mutex<HashMap<TransactionId, InDoubtTransaction>>,
    pub(crate) recovered_events: Mutex<Vec<ChangeEvent>>,
    pub(crate) stale_logs: Mutex<Vec<u64>>,
    recovery_complete: AtomicBool,
    failure: Mutex<Option<String>>,
    local_serial: AtomicU64,
    shadow_serial: AtomicU64,
}

impl EngineShared {
    /// Fail unless the engine is healthy and fully booted.
    pub(crate) fn check_operational(&self) -> Result<()> {
        self.check_not_failed()?;
        if !self.recovery_complete.load(Ordering::Acquire) {
            return Err(TxError::RecoveryInProgress);
        }
        Ok(())
    }

    fn check_not_failed(&self) -> Result<()> {
        if let Some(reason) = self.failure.lock().as_ref() {
            return Err(TxError::SystemFailure {
                reason: reason.clone(),
            });
        }
        Ok(())
    }

    /// Latch the first durability failure; everything after it is rejected.
    pub(crate) fn notify_failure(&self, reason: &str) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            error!(reason, "engine poisoned by durability failure");
            *failure = Some(reason.to_string());
        }
    }

    /// Path of the log file with the given index.
    pub(crate) fn log_path(&self, index: u64) -> PathBuf {
        self.config.log_file_path(index)
    }

    /// A fresh shadow location in the backup tree.
    pub(crate) fn next_shadow_path(&self) -> Result<PathBuf> {
        let n = self.shadow_serial.fetch_add(1, Ordering::Relaxed);
        Ok(self.config.backup_dir().join(format!("shadow_{n}")))
    }
}

/// The transactional filesystem engine.
pub struct FileSystem {
    shared: Arc<EngineShared>,
    workers: Mutex<Option<Workers>>,
}

impl FileSystem {
    /// Boot the engine over `config`'s home directory: open the log writer,
    /// recover from any previous crash, start the detectors.
    pub fn boot(config: EngineConfig) -> Result<FileSystem> {
        fs::create_dir_all(&config.home)?;
        fs::create_dir_all(config.backup_dir())?;
        let writer = GatheringLogWriter::open(&config)?;

        // Local transaction ids must not repeat across restarts.
        let epoch_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let shared = Arc::new(EngineShared {
            config,
            concurrency: Arc::new(ConcurrencyControl::new()),
            writer,
            sessions: DashMap::new(),
            in_doubt: Mutex::new(HashMap::new()),
            recovered_events: Mutex::new(Vec::new()),
            stale_logs: Mutex::new(Vec::new()),
            recovery_complete: AtomicBool::new(false),
            failure: Mutex::new(None),
            local_serial: AtomicU64::new(epoch_secs << 20),
            shadow_serial: AtomicU64::new(0),
        });

        let report = recovery::recover(&shared)?;
        if report.in_doubt.is_empty() {
            recovery::reclaim_stale_logs(&shared);
            shared.recovery_complete.store(true, Ordering::Release);
        } else {
            info!(
                count = report.in_doubt.len(),
                "bootup held open by in-doubt transactions"
            );
        }

        let workers = workers::spawn(&shared)?;
        info!(home = %shared.config.home.display(), "engine booted");
        Ok(FileSystem {
            shared,
            workers: Mutex::new(Some(workers)),
        })
    }

    /// Begin a new locally coordinated transaction.
    pub fn create_session_for_local_transaction(&self) -> Result<Arc<Session>> {
        self.shared.check_operational()?;
        let serial = self.shared.local_serial.fetch_add(1, Ordering::Relaxed);
        let xid = TransactionId::for_local_transaction(serial);
        let session = Arc::new(Session::new(Arc::clone(&self.shared), xid.clone()));
        self.shared.sessions.insert(xid, Arc::clone(&session));
        Ok(session)
    }

    /// Begin a session for an externally coordinated transaction branch.
    pub fn create_session_for_transaction(&self, xid: TransactionId) -> Result<Arc<Session>> {
        self.shared.check_operational()?;
        if self.shared.sessions.contains_key(&xid) {
            return Err(TxError::TransactionAlreadyAssociated {
                xid: xid.to_string(),
            });
        }
        let session = Arc::new(Session::new(Arc::clone(&self.shared), xid.clone()));
        self.shared.sessions.insert(xid, Arc::clone(&session));
        Ok(session)
    }

    /// Look up the live session for a transaction, if any.
    pub fn session_for_transaction(&self, xid: &TransactionId) -> Option<Arc<Session>> {
        self.shared.sessions.get(xid).map(|s| Arc::clone(s.value()))
    }

    /// Block until bootup completes (recovery finished and no transaction
    /// remains in doubt), or the timeout elapses.
    pub fn wait_for_bootup(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            self.shared.check_not_failed()?;
            if self.shared.recovery_complete.load(Ordering::Acquire) {
                return Ok(());
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(TxError::RecoveryInProgress);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Prepared transactions recovery found without an outcome; each must be
    /// resolved by its coordinator before bootup completes.
    pub fn in_doubt_transactions(&self) -> Vec<TransactionId> {
        self.shared.in_doubt.lock().keys().cloned().collect()
    }

    /// Commit an in-doubt transaction on the coordinator's verdict.
    pub fn commit_recovered(&self, xid: &TransactionId) -> Result<()> {
        self.shared.check_not_failed()?;
        let txn = self
            .shared
            .in_doubt
            .lock()
            .remove(xid)
            .ok_or(TxError::NoTransactionAssociated)?;
        let outcome = (|| -> Result<()> {
            self.shared
                .writer
                .force_write(&LogRecord::CommitBegins { xid: xid.clone() }, &[])?;
            let mut disk = DurableDirSession::new(self.shared.config.sync_directory_changes);
            let start_at = txn.checkpoint.unwrap_or(0) as usize;
            apply_redo_chain(
                &self.shared,
                &mut disk,
                xid,
                &txn.entries,
                &txn.files_on_disk,
                start_at,
            )?;
            disk.force_to_disk()?;
            self.shared
                .writer
                .force_write(&LogRecord::CommitDone { xid: xid.clone() }, &[])?;
            Ok(())
        })();
        match outcome {
            Ok(()) => {
                self.shared.recovered_events.lock().extend(txn.events);
                self.finish_recovered(xid);
                info!(xid = %xid, "in-doubt transaction committed");
                Ok(())
            }
            Err(e) => {
                let failure = e.into_system_failure();
                self.shared.notify_failure(&failure.to_string());
                Err(failure)
            }
        }
    }

    /// Roll back an in-doubt transaction on the coordinator's verdict.
    pub fn rollback_recovered(&self, xid: &TransactionId) -> Result<()> {
        self.shared.check_not_failed()?;
        let txn = self
            .shared
            .in_doubt
            .lock()
            .remove(xid)
            .ok_or(TxError::NoTransactionAssociated)?;
        let outcome = (|| -> Result<()> {
            apply_undo_chain(&txn.undo_entries)?;
            for shadow in shadow_sources(&txn.entries, &self.shared.config.backup_dir()) {
                if shadow.exists() {
                    fs::remove_file(&shadow)?;
                }
            }
            self.shared
                .writer
                .force_write(&LogRecord::RollbackDone { xid: xid.clone() }, &[])?;
            Ok(())
        })();
        match outcome {
            Ok(()) => {
                self.finish_recovered(xid);
                info!(xid = %xid, "in-doubt transaction rolled back");
                Ok(())
            }
            Err(e) => {
                let failure = e.into_system_failure();
                self.shared.notify_failure(&failure.to_string());
                Err(failure)
            }
        }
    }

    fn finish_recovered(&self, xid: &TransactionId) {
        if let Err(e) = self.shared.writer.release_transaction(xid) {
            self.shared.notify_failure(&e.to_string());
            return;
        }
        if self.shared.in_doubt.lock().is_empty() {
            recovery::reclaim_stale_logs(&self.shared);
            self.shared.recovery_complete.store(true, Ordering::Release);
            info!("bootup complete");
        }
    }

    /// Change events of transactions that committed across the crash without
    /// their events being delivered; drained once.
    pub fn recovered_events(&self) -> Vec<ChangeEvent> {
        std::mem::take(&mut *self.shared.recovered_events.lock())
    }

    /// Report a durability-affecting failure observed outside the engine's
    /// own calls; poisons the engine.
    pub fn notify_system_failure(&self, reason: &str) {
        self.shared.notify_failure(reason);
    }

    /// Stop the background detectors. Live sessions stay usable; called
    /// automatically on drop.
    pub fn shutdown(&self) {
        if let Some(mut workers) = self.workers.lock().take() {
            workers.shutdown();
        }
    }
}

impl Drop for FileSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}
