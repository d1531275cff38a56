//! Primitives layer for memport
//!
//! Stateful building blocks over the storage layer:
//! - **EventLogRepository**: CRUD entities folded from an event log
//! - **Repository**: direct CRUD over the namespaced memory store
//! - **Queue**: leased at-least-once delivery with FIFO/LIFO/custom order
//! - **FanOutExchange**: atomic publish to every bound queue
//! - **ScheduleStateRepository**: last-run records paired with per-id locks
//!
//! ## Transactions
//!
//! Every primitive implements [`OnePhaseCommitProtocol`]. Transactions are
//! carried in the [`Context`]: begin returns a child context, and any write
//! through that context is buffered until the outermost commit.
//!
//! ```rust
//! use memport_core::{in_tx, Context, Publisher};
//! use memport_primitives::Queue;
//!
//! let queue = Queue::new();
//! in_tx(&queue, &Context::background(), |tx| queue.publish(tx, vec!["hello"]))?;
//! assert_eq!(queue.len(), 1);
//! # Ok::<(), memport_core::Error>(())
//! ```
//!
//! [`OnePhaseCommitProtocol`]: memport_core::OnePhaseCommitProtocol
//! [`Context`]: memport_core::Context

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod event_log_repository;
pub mod fanout;
pub mod queue;
pub mod repository;
pub mod schedule;

pub use event_log_repository::{EventLogRepository, EventName, RepositoryEvent, View};
pub use fanout::{DeliveryWait, ExchangeTarget, FanOutExchange};
pub use queue::{Message, Queue, QueueStats, SortLess, Subscription};
pub use repository::Repository;
pub use schedule::{ScheduleState, ScheduleStateRepository};
