//! Concurrency control for the transactional filesystem engine.
//!
//! Locks follow strict two-phase locking: a session acquires path locks as
//! operations need them and releases everything only at transaction end. The
//! lock tree mirrors the filesystem hierarchy; directory renames pin whole
//! subtrees; a background detector victimizes one transaction per deadlock
//! cycle.

#![warn(clippy::all)]

pub mod control;
pub mod deadlock;
pub mod lock;
pub mod tree;
pub mod waiters;

pub use control::{ConcurrencyControl, HeldLock};
pub use deadlock::DeadlockDetector;
pub use lock::ResourceLock;
pub use tree::{LockTree, NodeId};
pub use waiters::{InterruptCause, Waiter, WaiterRegistry};
