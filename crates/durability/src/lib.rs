//! Durability layer: the binary write-ahead log and directory-metadata
//! synchronization.
//!
//! Records are appended to sequentially numbered log files
//! (`txlog_0`, `txlog_1`, ...). Ordinary operation records are batched per
//! transaction and flushed in one gathered write; control records
//! (commit-begin, commit-done, rollback-done, prepare-done) are force-written
//! immediately and are the ground truth for crash classification.

#![warn(clippy::all)]

pub mod disk;
pub mod reader;
pub mod record;
pub mod usage;
pub mod writer;

pub use disk::DurableDirSession;
pub use reader::{ParsedRecord, RecordReader};
pub use record::{ChangeEvent, EventKind, LogRecord};
pub use usage::LogUsageTracker;
pub use writer::{find_latest_log_index, GatheringLogWriter, LogPosition};
