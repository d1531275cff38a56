//! Storage layer for memport
//!
//! This crate implements the two in-memory backends:
//! - EventLog: ordered, namespaced events with nested transactions,
//!   compaction, stack traces and context metadata
//! - Memory: namespaced key/value maps with transactional overlays
//!
//! Both are cheap-to-clone handles over shared state guarded by
//! `parking_lot::RwLock`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod event_log;
pub mod memory;

pub use event_log::{Event, EventLog, Trace};
pub use memory::{Memory, StoredValue};
