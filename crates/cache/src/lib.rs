//! Cache layer for memport
//!
//! A [`Cache`] sits in front of a slow [`Source`] and keeps what it has read
//! in a [`CacheRepository`]:
//! - **Entities**: cached entity snapshots, keyed by entity id
//! - **Hits**: cached query results, keyed by [`HitId`], listing entity ids
//!
//! Reads go through the cache, writes go to the source and are mirrored.
//! [`CachedQueryInvalidator`]s let callers widen invalidation to hits the
//! cache cannot link to an entity on its own.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod builder;
pub mod cache;
pub mod hit;
pub mod invalidator;
pub mod repository;
pub mod source;

pub use builder::CacheBuilder;
pub use cache::{Cache, Producer};
pub use hit::{Hit, HitId, Query, FIND_ALL, FIND_BY_ID};
pub use invalidator::CachedQueryInvalidator;
pub use repository::{CacheRepository, EntityRepository, MemoryCacheRepository};
pub use source::Source;
