//! Core types and traits for memport
//!
//! This crate defines the foundational types used throughout the system:
//! - Context: cancellation, deadlines and scoped values (the carrier for
//!   transactions, locks and metadata)
//! - Error: error type hierarchy and kinds
//! - EntityId / IdAccessor / IdMinter: entity identity
//! - Ports: CRUD capability traits and the one-phase commit protocol
//! - Config: component options, loadable from `memport.toml`

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod context;
pub mod error;
pub mod id;
pub mod ports;

pub use config::{CacheOptions, EventLogOptions, MemportConfig, QueueOptions, RepositoryOptions};
pub use context::{CancelHandle, CancelRegistration, Context, ContextKey};
pub use error::{merge_results, Error, ErrorKind, Result};
pub use id::{DefaultMinter, EntityId, FnMinter, HasId, IdAccessor, IdMinter};
pub use ports::{
    in_tx, seq_first, seq_from_error, seq_from_vec, AllDeleter, AllFinder, ByIdDeleter,
    ByIdFinder, ByIdsFinder, Creator, Crud, MetaAccessor, OnePhaseCommitProtocol, Publisher,
    Purger, Saver, Seq, Updater, Upserter,
};
