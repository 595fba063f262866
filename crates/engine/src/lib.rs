//! The transactional filesystem engine.
//!
//! This crate orchestrates the lower layers:
//! - [`FileSystem`]: boot, crash recovery, session registry, failure
//!   poisoning
//! - [`Session`]: per-transaction operations, prepare/commit/rollback
//! - per-transaction copy-on-write views of directories and file content
//! - background deadlock and timeout detectors
//!
//! The engine is the only component that knows about cross-layer
//! coordination: locking + view + log per operation, commit replay against
//! the physical filesystem, and recovery-time completion of unfinished
//! transactions.

#![warn(clippy::all)]

pub mod filesystem;
pub mod recovery;
pub mod session;
pub mod streams;
pub mod view;
pub mod workers;

pub use filesystem::FileSystem;
pub use session::Session;
pub use streams::{TxInputStream, TxOutputStream};
