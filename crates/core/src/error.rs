//! Error taxonomy for the transactional filesystem engine.
//!
//! Per-call outcomes (`FileNotExists`, `FileAlreadyExists`, ...) leave the
//! transaction usable. `TransactionRolledBack` means the transaction was
//! force-failed asynchronously and must be abandoned. `SystemFailure` poisons
//! the whole engine: once a durability-affecting I/O operation fails, a
//! write-ahead record's integrity cannot be proven safe to retry, so the
//! engine rejects all further work.

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used across all txfs crates.
pub type Result<T> = std::result::Result<T, TxError>;

/// Why a transaction was rolled back from under its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackCause {
    /// Chosen as the victim of a deadlock cycle.
    DeadlockVictimized,
    /// Exceeded its configured transaction timeout.
    TransactionTimeout,
}

impl std::fmt::Display for RollbackCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RollbackCause::DeadlockVictimized => write!(f, "deadlock victimized"),
            RollbackCause::TransactionTimeout => write!(f, "transaction timeout"),
        }
    }
}

/// Errors surfaced by the transactional filesystem engine.
#[derive(Debug, Error)]
pub enum TxError {
    /// A lock could not be acquired within the caller's wait timeout.
    #[error("lock acquisition timed out for {path}")]
    LockingTimedOut {
        /// Path whose lock was awaited.
        path: PathBuf,
    },

    /// The transaction was rolled back asynchronously.
    #[error("transaction was rolled back: {cause}")]
    TransactionRolledBack {
        /// What triggered the forced rollback.
        cause: RollbackCause,
    },

    /// The target file or directory does not exist in this transaction's view.
    #[error("file does not exist: {path}")]
    FileNotExists {
        /// Missing path.
        path: PathBuf,
    },

    /// The target already exists in this transaction's view.
    #[error("file already exists: {path}")]
    FileAlreadyExists {
        /// Conflicting path.
        path: PathBuf,
    },

    /// The file is held open by a stream of this transaction.
    #[error("file is in use: {path}")]
    FileUnderUse {
        /// Busy path.
        path: PathBuf,
    },

    /// A directory slated for deletion or move still has children.
    #[error("directory not empty: {path}")]
    DirectoryNotEmpty {
        /// Non-empty directory.
        path: PathBuf,
    },

    /// The filesystem permissions forbid the requested operation.
    #[error("insufficient permission ({needed}) on {path}")]
    InsufficientPermission {
        /// Affected path.
        path: PathBuf,
        /// Which permission was missing.
        needed: &'static str,
    },

    /// An ancestor directory is pinned for rename by another transaction.
    #[error("an ancestor of {path} is pinned for rename by another transaction")]
    AncestorPinned {
        /// Path whose lock was requested.
        path: PathBuf,
    },

    /// A durability-affecting failure; the engine is now unusable.
    #[error("system failure: {reason}")]
    SystemFailure {
        /// Description of the original failure.
        reason: String,
    },

    /// Boot-time recovery has not finished yet.
    #[error("crash recovery is still in progress")]
    RecoveryInProgress,

    /// The session has no live transaction associated.
    #[error("no transaction is associated with this session")]
    NoTransactionAssociated,

    /// A session already exists for the given transaction id.
    #[error("transaction {xid} is already associated with a session")]
    TransactionAlreadyAssociated {
        /// The duplicated transaction id, in display form.
        xid: String,
    },

    /// Underlying I/O error from a non-durability path (reads, listings).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A log record could not be decoded.
    #[error("corrupt log record at offset {offset} in log {log_index}: {detail}")]
    CorruptLogRecord {
        /// Log file index.
        log_index: u64,
        /// Byte offset of the record.
        offset: u64,
        /// What failed to parse.
        detail: String,
    },
}

impl TxError {
    /// Escalate any error into the engine-poisoning form.
    pub fn into_system_failure(self) -> TxError {
        match self {
            TxError::SystemFailure { .. } => self,
            other => TxError::SystemFailure {
                reason: other.to_string(),
            },
        }
    }

    /// True for the per-call outcomes that leave the transaction usable.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TxError::LockingTimedOut { .. }
                | TxError::FileNotExists { .. }
                | TxError::FileAlreadyExists { .. }
                | TxError::FileUnderUse { .. }
                | TxError::DirectoryNotEmpty { .. }
                | TxError::InsufficientPermission { .. }
                | TxError::AncestorPinned { .. }
                | TxError::TransactionAlreadyAssociated { .. }
        )
    }
}
