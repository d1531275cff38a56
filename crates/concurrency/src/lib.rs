//! Concurrency primitives for memport
//!
//! This crate provides the building blocks shared by the storage and
//! primitive crates:
//! - Lock / LockFactory: mutual exclusion carried by a context
//! - TxScope: nested, context-scoped transactions with cascading rollback
//! - WorkerPool: background workers for deferred jobs

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod lock;
pub mod txn;
pub mod worker;

pub use lock::{Lock, LockFactory};
pub use txn::{TxBuffer, TxNode, TxScope};
pub use worker::{SubmitError, WorkerPool, WorkerStats};
