//! Transactional access to an ordinary filesystem.
//!
//! Multiple concurrent transactions may create, delete, move, copy, truncate,
//! read and append files and directories. Isolation is enforced by
//! hierarchical two-phase locking, durability by a write-ahead log, and crash
//! recovery restores exactly the set of committed effects after an unclean
//! shutdown.
//!
//! Entry point is [`FileSystem`]: boot it over a home directory, open a
//! [`Session`], perform operations, then `commit` or `rollback`.

pub use txfs_core::{Buffer, EngineConfig, Result, RollbackCause, TransactionId, TxError};
pub use txfs_engine::{FileSystem, Session, TxInputStream, TxOutputStream};
