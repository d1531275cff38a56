//! Storage for cached entities and hits
//!
//! A [`CacheRepository`] pairs an entity repository with a hit repository
//! under one transaction protocol, so an invalidation that touches both
//! commits or rolls back as a unit.

use crate::hit::{Hit, HitId};
use memport_core::{
    Context, Crud, EntityId, IdAccessor, OnePhaseCommitProtocol, RepositoryOptions, Result,
    Upserter,
};
use memport_primitives::Repository;
use memport_storage::Memory;
use std::any::type_name;
use std::fmt;

/// Full CRUD plus upsert
pub trait EntityRepository<E, I>: Crud<E, I> + Upserter<E> {}

impl<E, I, T> EntityRepository<E, I> for T where T: Crud<E, I> + Upserter<E> {}

/// Backing store of a cache
pub trait CacheRepository<E, I>: OnePhaseCommitProtocol {
    /// Cached entities
    fn entities(&self) -> &dyn EntityRepository<E, I>;

    /// Cached query results
    fn hits(&self) -> &dyn EntityRepository<Hit<I>, HitId>;
}

/// Cache repository over a [`Memory`] store
pub struct MemoryCacheRepository<E, I> {
    store: Memory,
    entities: Repository<E, I>,
    hits: Repository<Hit<I>, HitId>,
}

impl<E, I> MemoryCacheRepository<E, I>
where
    E: Clone + Send + Sync + 'static,
    I: EntityId,
{
    /// Repository in a private store
    pub fn new(ids: IdAccessor<E, I>) -> Self {
        Self::with_store(Memory::new(), ids)
    }

    /// Repository in `store`, namespaced by the entity type
    pub fn with_store(store: Memory, ids: IdAccessor<E, I>) -> Self {
        let prefix = format!("memport.cache.{}", type_name::<E>());
        let entities = Repository::with_options(
            store.clone(),
            ids,
            RepositoryOptions::default()
                .with_namespace(format!("{}.entities", prefix))
                .with_expect_id(true),
        );
        let hits = Repository::with_options(
            store.clone(),
            IdAccessor::of_entity(),
            RepositoryOptions::default()
                .with_namespace(format!("{}.hits", prefix))
                .with_expect_id(true),
        );
        Self {
            store,
            entities,
            hits,
        }
    }

    /// The shared store
    pub fn store(&self) -> &Memory {
        &self.store
    }
}

impl<E, I> CacheRepository<E, I> for MemoryCacheRepository<E, I>
where
    E: Clone + Send + Sync + 'static,
    I: EntityId,
{
    fn entities(&self) -> &dyn EntityRepository<E, I> {
        &self.entities
    }

    fn hits(&self) -> &dyn EntityRepository<Hit<I>, HitId> {
        &self.hits
    }
}

impl<E, I> OnePhaseCommitProtocol for MemoryCacheRepository<E, I>
where
    E: Clone + Send + Sync + 'static,
    I: EntityId,
{
    fn begin_tx(&self, ctx: &Context) -> Result<Context> {
        self.store.begin_tx(ctx)
    }

    fn commit_tx(&self, ctx: &Context) -> Result<()> {
        self.store.commit_tx(ctx)
    }

    fn rollback_tx(&self, ctx: &Context) -> Result<()> {
        self.store.rollback_tx(ctx)
    }
}

impl<E, I> fmt::Debug for MemoryCacheRepository<E, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCacheRepository")
            .field("entities", &self.entities)
            .field("hits", &self.hits)
            .finish()
    }
}
