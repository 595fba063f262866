//! Core types shared by every layer of the txfs engine.
//!
//! - [`TransactionId`]: content-equatable global transaction identifier
//! - [`TxError`] / [`Result`]: the engine-wide error taxonomy
//! - [`EngineConfig`]: tunables for locking, logging and recovery
//! - [`Buffer`]: a log-record payload that may live in memory or on disk

#![warn(clippy::all)]

pub mod buffer;
pub mod config;
pub mod error;
pub mod xid;

pub use buffer::{Buffer, OnDiskInfo};
pub use config::EngineConfig;
pub use error::{Result, RollbackCause, TxError};
pub use xid::TransactionId;
