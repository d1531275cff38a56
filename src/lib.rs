//! memport - in-process transactional repositories, queues, locks and caches
//!
//! memport gives tests and embedded programs the storage ports a service
//! usually talks to over the network, implemented in memory with the same
//! transactional and concurrency semantics:
//!
//! - [`EventLogRepository`]: CRUD repository whose state is a fold over an
//!   event log, with nested transactions and compaction
//! - [`Repository`]: the same contract over a plain namespaced map
//! - [`Queue`] and [`FanOutExchange`]: leased, at-least-once messaging
//! - [`Lock`] and [`LockFactory`]: advisory locks carried by a [`Context`]
//! - [`Cache`]: read-through, write-through cache with invalidation and
//!   refresh-behind
//!
//! # Quick Start
//!
//! ```
//! use memport::{in_tx, ByIdFinder, Context, Creator, EventLog, EventLogRepository, IdAccessor};
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct Order { id: String, total: u32 }
//!
//! let ids = IdAccessor::new(|o: &Order| o.id.clone(), |o: &mut Order, id| o.id = id);
//! let orders = EventLogRepository::new(EventLog::new(), ids);
//! let ctx = Context::background();
//!
//! let order = in_tx(&orders, &ctx, |tx| {
//!     let mut order = Order { id: String::new(), total: 12 };
//!     orders.create(tx, &mut order)?;
//!     Ok(order)
//! })?;
//! assert_eq!(orders.find_by_id(&ctx, &order.id)?, Some(order));
//! # Ok::<(), memport::Error>(())
//! ```
//!
//! # Architecture
//!
//! Every operation takes a [`Context`]. Transactions and held locks live in
//! the context, so passing the context a `begin_tx` or `acquire` returned is
//! what scopes later calls to that transaction or lock.
//!
//! The member crates are re-exported whole, and their main types at the top
//! level. The executable behaviour contracts live in [`memport_contracts`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub use memport_cache;
pub use memport_concurrency;
pub use memport_contracts;
pub use memport_core;
pub use memport_primitives;
pub use memport_storage;

pub use memport_core::{
    in_tx, merge_results, seq_first, seq_from_error, seq_from_vec, AllDeleter, AllFinder,
    ByIdDeleter, ByIdFinder, ByIdsFinder, CacheOptions, CancelHandle, Context, ContextKey,
    Creator, Crud, EntityId, Error, ErrorKind, EventLogOptions, HasId, IdAccessor, IdMinter,
    MemportConfig, MetaAccessor, OnePhaseCommitProtocol, Publisher, Purger, QueueOptions,
    RepositoryOptions, Result, Saver, Seq, Updater, Upserter,
};

pub use memport_concurrency::{Lock, LockFactory, WorkerPool};
pub use memport_storage::{Event, EventLog, Memory};

pub use memport_primitives::{
    EventLogRepository, FanOutExchange, Message, Queue, Repository, ScheduleState,
    ScheduleStateRepository, Subscription,
};

pub use memport_cache::{Cache, CacheBuilder, CachedQueryInvalidator, HitId, Query, Source};
