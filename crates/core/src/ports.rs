//! Storage port capabilities
//!
//! Each CRUD capability is its own trait so that composite subjects
//! advertise exactly what they implement and consumers (the cache, the
//! contract suites) can require only what they use.
//!
//! All traits are object safe except [`MetaAccessor`], which is generic
//! over the stored value.

use crate::context::Context;
use crate::error::{Error, Result};
use std::any::Any;

/// Lazy, fallible sequence of values
///
/// Produced by `find_all`, `find_by_ids`, cached queries and subscriptions.
/// An `Err` item may appear at any step; consumers usually stop there.
pub type Seq<T> = Box<dyn Iterator<Item = Result<T>> + Send>;

/// Sequence over already materialised values
pub fn seq_from_vec<T: Send + 'static>(values: Vec<T>) -> Seq<T> {
    Box::new(values.into_iter().map(Ok))
}

/// Sequence yielding a single error
pub fn seq_from_error<T: Send + 'static>(err: Error) -> Seq<T> {
    Box::new(std::iter::once(Err(err)))
}

/// First value of a sequence
pub fn seq_first<T>(mut seq: Seq<T>) -> Result<Option<T>> {
    seq.next().transpose()
}

/// Persists new entities
pub trait Creator<E>: Send + Sync {
    /// Store `entity`, assigning an id when it has none
    fn create(&self, ctx: &Context, entity: &mut E) -> Result<()>;
}

/// Looks entities up by id
pub trait ByIdFinder<E, I>: Send + Sync {
    /// The entity with `id`, if any
    fn find_by_id(&self, ctx: &Context, id: &I) -> Result<Option<E>>;
}

/// Lists every entity
pub trait AllFinder<E>: Send + Sync {
    /// All entities, in unspecified order
    fn find_all(&self, ctx: &Context) -> Seq<E>;
}

/// Looks several entities up by id
pub trait ByIdsFinder<E, I>: Send + Sync {
    /// The entities for `ids`, in order; a missing id yields `NotFound`
    fn find_by_ids(&self, ctx: &Context, ids: &[I]) -> Seq<E>;
}

/// Replaces stored entities
pub trait Updater<E>: Send + Sync {
    /// Replace the stored entity with the same id
    fn update(&self, ctx: &Context, entity: &E) -> Result<()>;
}

/// Deletes entities by id
pub trait ByIdDeleter<I>: Send + Sync {
    /// Delete the entity with `id`
    fn delete_by_id(&self, ctx: &Context, id: &I) -> Result<()>;
}

/// Deletes every entity
pub trait AllDeleter: Send + Sync {
    /// Delete every entity
    fn delete_all(&self, ctx: &Context) -> Result<()>;
}

/// Atomic create-or-update
pub trait Saver<E>: Send + Sync {
    /// Create `entity` if absent, update it otherwise
    fn save(&self, ctx: &Context, entity: &mut E) -> Result<()>;
}

/// Unconditional create-or-replace
pub trait Upserter<E>: Send + Sync {
    /// Store `entity` under its id, replacing any existing value
    fn upsert(&self, ctx: &Context, entity: &E) -> Result<()>;
}

/// Begin/commit/rollback over context values
pub trait OnePhaseCommitProtocol: Send + Sync {
    /// Begin a transaction nested in whatever `ctx` already carries
    fn begin_tx(&self, ctx: &Context) -> Result<Context>;

    /// Commit the transaction carried by `ctx`
    fn commit_tx(&self, ctx: &Context) -> Result<()>;

    /// Roll back the transaction carried by `ctx`
    fn rollback_tx(&self, ctx: &Context) -> Result<()>;
}

/// Run `f` inside a transaction of `protocol`
///
/// Commits on success. On failure the transaction is rolled back and any
/// rollback error is merged with the original one.
pub fn in_tx<P, T, F>(protocol: &P, ctx: &Context, f: F) -> Result<T>
where
    P: OnePhaseCommitProtocol + ?Sized,
    F: FnOnce(&Context) -> Result<T>,
{
    let tx = protocol.begin_tx(ctx)?;
    match f(&tx) {
        Ok(value) => {
            protocol.commit_tx(&tx)?;
            Ok(value)
        }
        Err(err) => match protocol.rollback_tx(&tx) {
            Ok(()) => Err(err),
            Err(rollback) => Err(err.join(rollback)),
        },
    }
}

/// Context-scoped metadata
pub trait MetaAccessor {
    /// Derive a context carrying `value` under `key`
    fn set_meta<T: Any + Send + Sync>(&self, ctx: &Context, key: &str, value: T) -> Result<Context>;

    /// A copy of the value stored under `key`
    fn lookup_meta<T: Any + Clone + Send + Sync>(&self, ctx: &Context, key: &str) -> Option<T>;
}

/// Publishes values to subscribers
pub trait Publisher<V>: Send + Sync {
    /// Publish a batch; an empty batch is a no-op
    fn publish(&self, ctx: &Context, values: Vec<V>) -> Result<()>;
}

/// Drops every queued value
pub trait Purger: Send + Sync {
    /// Empty the queue
    fn purge(&self, ctx: &Context) -> Result<()>;
}

/// The full CRUD capability set
pub trait Crud<E, I>:
    Creator<E>
    + ByIdFinder<E, I>
    + AllFinder<E>
    + ByIdsFinder<E, I>
    + Updater<E>
    + ByIdDeleter<I>
    + AllDeleter
    + Saver<E>
{
}

impl<E, I, T> Crud<E, I> for T where
    T: Creator<E>
        + ByIdFinder<E, I>
        + AllFinder<E>
        + ByIdsFinder<E, I>
        + Updater<E>
        + ByIdDeleter<I>
        + AllDeleter
        + Saver<E>
{
}
