//! Read-through, write-through cache
//!
//! ## Reads
//!
//! Every read is a cached query: a [`HitId`] plus a producer that asks the
//! source. The first call runs the producer, stores the entities and records
//! a [`Hit`] listing their ids. Later calls answer from the hit until it is
//! invalidated. An empty result is cached too.
//!
//! `find_by_id` first looks for the entity itself, so an entity cached by any
//! query is served without touching the source.
//!
//! ## Writes
//!
//! Writes go to the source first. Mirroring them into the cache is best
//! effort: a failed mirror is logged and repaired by invalidation, never
//! reported to the caller.
//!
//! ## Invalidation
//!
//! Invalidating an entity drops it, its canonical `FindByID` hit, and every
//! hit that references it or that a registered [`CachedQueryInvalidator`]
//! selects. Hits are only deleted there; the entities they reference stay.
//! Invalidating a query drops its hit first and then invalidates each entity
//! it referenced.
//!
//! ## Refresh-behind
//!
//! With `refresh_behind`, serving from cache also queues a background re-run
//! of the producer, keyed by hit id so a burst of reads refreshes once.

use crate::builder::CacheBuilder;
use crate::hit::{Hit, HitId, Query};
use crate::invalidator::CachedQueryInvalidator;
use crate::repository::CacheRepository;
use crate::source::Source;
use memport_concurrency::{SubmitError, WorkerPool, WorkerStats};
use memport_core::{
    in_tx, merge_results, seq_from_error, seq_from_vec, AllDeleter, AllFinder, ByIdDeleter,
    ByIdFinder, ByIdsFinder, Context, Creator, EntityId, Error, ErrorKind, IdAccessor, Result,
    Seq, Updater, Upserter,
};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Re-runnable producer of a cached query
pub type Producer<E> = Arc<dyn Fn(&Context) -> Seq<E> + Send + Sync>;

pub(crate) struct CacheCore<E, I> {
    pub(crate) source: Source<E, I>,
    pub(crate) repository: Arc<dyn CacheRepository<E, I>>,
    pub(crate) ids: IdAccessor<E, I>,
    pub(crate) invalidators: Vec<CachedQueryInvalidator<E, I>>,
}

/// Cache in front of a [`Source`]
///
/// Cloning yields another handle to the same cache. The background refresh
/// workers stop when the last handle is dropped or on [`Cache::close`].
pub struct Cache<E, I> {
    core: Arc<CacheCore<E, I>>,
    refresher: Option<Arc<WorkerPool>>,
}

impl<E, I> Clone for Cache<E, I> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            refresher: self.refresher.clone(),
        }
    }
}

fn ignore_not_found(result: Result<()>) -> Result<()> {
    match result {
        Err(err) if err.is(ErrorKind::NotFound) => Ok(()),
        other => other,
    }
}

fn single<E: Send + 'static>(found: Result<Option<E>>) -> Seq<E> {
    match found {
        Ok(Some(entity)) => seq_from_vec(vec![entity]),
        Ok(None) => seq_from_vec(Vec::new()),
        Err(err) => seq_from_error(err),
    }
}

impl<E, I> CacheCore<E, I>
where
    E: Clone + Send + Sync + 'static,
    I: EntityId,
{
    /// Entities of an existing hit, `None` when there is no usable hit
    fn lookup_hit(&self, ctx: &Context, hit_id: &HitId) -> Result<Option<Vec<E>>> {
        let Some(hit) = self.repository.hits().find_by_id(ctx, hit_id)? else {
            return Ok(None);
        };
        let entities = self
            .repository
            .entities()
            .find_by_ids(ctx, &hit.entity_ids)
            .collect::<Result<Vec<E>>>();
        match entities {
            Ok(entities) if entities.len() == hit.entity_ids.len() => Ok(Some(entities)),
            Ok(_) => {
                warn!(hit = %hit_id, "cached hit references missing entities; re-running query");
                Ok(None)
            }
            Err(err) if err.is_cancellation() => Err(err),
            Err(err) => {
                warn!(hit = %hit_id, error = %err, "cached hit lookup failed; re-running query");
                Ok(None)
            }
        }
    }

    /// Run the producer and store its result under `hit_id`
    fn populate(&self, ctx: &Context, hit_id: &HitId, producer: &Producer<E>) -> Result<Vec<E>> {
        let entities = producer(ctx).collect::<Result<Vec<E>>>()?;
        in_tx(self.repository.as_ref(), ctx, |tx| {
            let mut ids = Vec::with_capacity(entities.len());
            for entity in &entities {
                self.repository.entities().upsert(tx, entity)?;
                ids.push(self.ids.get(entity));
            }
            self.repository.hits().upsert(tx, &Hit::new(hit_id.clone(), ids))
        })?;
        debug!(hit = %hit_id, entities = entities.len(), "query result cached");
        Ok(entities)
    }

    fn refresh_by_id(&self, ctx: &Context, id: &I) -> Result<Option<E>> {
        let hit_id = Query::find_by_id(id).hit_id();
        let found = self.source.find_by_id(ctx, id)?;
        in_tx(self.repository.as_ref(), ctx, |tx| {
            match &found {
                Some(entity) => self.repository.entities().upsert(tx, entity)?,
                None => ignore_not_found(self.repository.entities().delete_by_id(tx, id))?,
            }
            let ids = found.as_ref().map(|e| self.ids.get(e)).into_iter().collect();
            self.repository.hits().upsert(tx, &Hit::new(hit_id.clone(), ids))
        })?;
        Ok(found)
    }

    fn invalidate_by_id(&self, ctx: &Context, id: &I) -> Result<()> {
        in_tx(self.repository.as_ref(), ctx, |tx| {
            let current = match self.repository.entities().find_by_id(tx, id)? {
                Some(entity) => Some(entity),
                None => self.source.find_by_id(tx, id)?,
            };
            ignore_not_found(self.repository.entities().delete_by_id(tx, id))?;

            let mut doomed: BTreeSet<HitId> = BTreeSet::new();
            if let Some(entity) = &current {
                for invalidator in &self.invalidators {
                    doomed.extend(invalidator.check_entity(entity));
                }
            }
            doomed.insert(Query::find_by_id(id).hit_id());
            for hit in self.repository.hits().find_all(tx) {
                let hit = hit?;
                if hit.references(id) || self.invalidators.iter().any(|inv| inv.check_hit(&hit)) {
                    doomed.insert(hit.id);
                }
            }

            for hit_id in &doomed {
                ignore_not_found(self.repository.hits().delete_by_id(tx, hit_id))?;
            }
            debug!(id = %id.id_key(), hits = doomed.len(), "entity invalidated");
            Ok(())
        })
    }

    fn invalidate_cached_query(&self, ctx: &Context, hit_id: &HitId) -> Result<()> {
        ctx.check()?;
        in_tx(self.repository.as_ref(), ctx, |tx| {
            let Some(hit) = self.repository.hits().find_by_id(tx, hit_id)? else {
                return Ok(());
            };
            self.repository.hits().delete_by_id(tx, hit_id)?;
            for id in &hit.entity_ids {
                self.invalidate_by_id(tx, id)?;
            }
            debug!(hit = %hit_id, entities = hit.entity_ids.len(), "cached query invalidated");
            Ok(())
        })
    }

    fn drop_cached_values(&self, ctx: &Context) -> Result<()> {
        let failures: Vec<Error> = [
            self.repository.entities().delete_all(ctx),
            self.repository.hits().delete_all(ctx),
        ]
        .into_iter()
        .filter_map(|r| r.err())
        .collect();
        merge_results(failures)
    }

    fn find_by_id_producer(&self, id: &I) -> Producer<E> {
        let source = self.source.clone();
        let id = id.clone();
        Arc::new(move |ctx: &Context| single(source.find_by_id(ctx, &id)))
    }

    fn find_all_producer(&self) -> Producer<E> {
        let source = self.source.clone();
        Arc::new(move |ctx: &Context| source.find_all(ctx))
    }
}

impl<E, I> Cache<E, I>
where
    E: Clone + Send + Sync + 'static,
    I: EntityId,
{
    /// Start configuring a cache
    pub fn builder(
        source: Source<E, I>,
        repository: Arc<dyn CacheRepository<E, I>>,
        ids: IdAccessor<E, I>,
    ) -> CacheBuilder<E, I> {
        CacheBuilder::new(source, repository, ids)
    }

    pub(crate) fn from_parts(core: CacheCore<E, I>, refresher: Option<WorkerPool>) -> Self {
        Self {
            core: Arc::new(core),
            refresher: refresher.map(Arc::new),
        }
    }

    /// The source behind the cache
    pub fn source(&self) -> &Source<E, I> {
        &self.core.source
    }

    /// The cache's own storage
    pub fn repository(&self) -> &dyn CacheRepository<E, I> {
        self.core.repository.as_ref()
    }

    // ========== Cached queries ==========

    /// Entities of the query `hit_id`, running `producer` on a miss
    pub fn cached_query_many(
        &self,
        ctx: &Context,
        hit_id: &HitId,
        producer: impl Fn(&Context) -> Seq<E> + Send + Sync + 'static,
    ) -> Seq<E> {
        self.query_many(ctx, hit_id, Arc::new(producer))
    }

    /// Entity of the query `hit_id`, running `producer` on a miss
    pub fn cached_query_one(
        &self,
        ctx: &Context,
        hit_id: &HitId,
        producer: impl Fn(&Context) -> Result<Option<E>> + Send + Sync + 'static,
    ) -> Result<Option<E>> {
        let producer: Producer<E> = Arc::new(move |ctx: &Context| single(producer(ctx)));
        let mut seq = self.query_many(ctx, hit_id, producer);
        seq.next().transpose()
    }

    fn query_many(&self, ctx: &Context, hit_id: &HitId, producer: Producer<E>) -> Seq<E> {
        if let Err(err) = ctx.check() {
            return seq_from_error(err);
        }
        match self.core.lookup_hit(ctx, hit_id) {
            Ok(Some(entities)) => {
                self.schedule_refresh(hit_id, &producer);
                return seq_from_vec(entities);
            }
            Ok(None) => {}
            Err(err) => return seq_from_error(err),
        }
        match self.core.populate(ctx, hit_id, &producer) {
            Ok(entities) => seq_from_vec(entities),
            Err(err) => seq_from_error(err),
        }
    }

    // ========== Refresh ==========

    /// Re-run the `FindAll` query against the source
    pub fn refresh(&self, ctx: &Context) -> Result<()> {
        let producer = self.core.find_all_producer();
        self.core
            .populate(ctx, &Query::find_all().hit_id(), &producer)
            .map(|_| ())
    }

    /// Re-read one entity from the source
    ///
    /// An entity gone from the source is dropped from the cache.
    pub fn refresh_by_id(&self, ctx: &Context, id: &I) -> Result<Option<E>> {
        self.core.refresh_by_id(ctx, id)
    }

    /// Re-run a query, bypassing its hit
    pub fn refresh_query_many(
        &self,
        ctx: &Context,
        hit_id: &HitId,
        producer: impl Fn(&Context) -> Seq<E> + Send + Sync + 'static,
    ) -> Seq<E> {
        let producer: Producer<E> = Arc::new(producer);
        match self.core.populate(ctx, hit_id, &producer) {
            Ok(entities) => seq_from_vec(entities),
            Err(err) => seq_from_error(err),
        }
    }

    /// Re-run a single-entity query, bypassing its hit
    pub fn refresh_query_one(
        &self,
        ctx: &Context,
        hit_id: &HitId,
        producer: impl Fn(&Context) -> Result<Option<E>> + Send + Sync + 'static,
    ) -> Result<Option<E>> {
        let producer: Producer<E> = Arc::new(move |ctx: &Context| single(producer(ctx)));
        Ok(self
            .core
            .populate(ctx, hit_id, &producer)?
            .into_iter()
            .next())
    }

    fn schedule_refresh(&self, hit_id: &HitId, producer: &Producer<E>) {
        let core = Arc::clone(&self.core);
        let hit = hit_id.clone();
        let producer = Arc::clone(producer);
        self.submit(hit_id, move |ctx| {
            if let Err(err) = core.populate(ctx, &hit, &producer) {
                if !err.is_cancellation() {
                    error!(hit = %hit, error = %err, "background refresh failed");
                }
            }
        });
    }

    fn schedule_refresh_by_id(&self, id: &I) {
        let core = Arc::clone(&self.core);
        let id = id.clone();
        let hit_id = Query::find_by_id(&id).hit_id();
        self.submit(&hit_id, move |ctx| {
            if let Err(err) = core.refresh_by_id(ctx, &id) {
                if !err.is_cancellation() {
                    error!(id = %id.id_key(), error = %err, "background refresh failed");
                }
            }
        });
    }

    fn submit(&self, hit_id: &HitId, job: impl FnOnce(&Context) + Send + 'static) {
        let Some(pool) = &self.refresher else {
            return;
        };
        match pool.submit_keyed(hit_id.as_str(), job) {
            Ok(true) => debug!(hit = %hit_id, "refresh queued"),
            Ok(false) => {}
            Err(SubmitError::Full) => warn!(hit = %hit_id, "refresh queue full; refresh skipped"),
            Err(SubmitError::Closed) => {}
        }
    }

    /// Whether no background refresh is queued or running
    pub fn idle(&self) -> bool {
        self.refresher.as_ref().map_or(true, |pool| pool.is_idle())
    }

    /// Block until background refreshes settle
    pub fn wait_idle(&self) {
        if let Some(pool) = &self.refresher {
            pool.drain();
        }
    }

    /// Refresh worker metrics, if refresh-behind is on
    pub fn refresh_stats(&self) -> Option<WorkerStats> {
        self.refresher.as_ref().map(|pool| pool.stats())
    }

    /// Stop the refresh workers, waiting for running refreshes
    ///
    /// Queued refreshes are dropped. The cache keeps serving reads and
    /// writes without refreshing. Idempotent.
    pub fn close(&self) {
        if let Some(pool) = &self.refresher {
            pool.close();
        }
    }

    // ========== Invalidation ==========

    /// Drop an entity and every hit that depends on it
    pub fn invalidate_by_id(&self, ctx: &Context, id: &I) -> Result<()> {
        self.core.invalidate_by_id(ctx, id)
    }

    /// Drop a query's hit and every entity it referenced
    pub fn invalidate_cached_query(&self, ctx: &Context, hit_id: &HitId) -> Result<()> {
        self.core.invalidate_cached_query(ctx, hit_id)
    }

    /// Empty the cache
    ///
    /// Both sub-repositories are cleared even if one fails; failures are
    /// merged.
    pub fn drop_cached_values(&self, ctx: &Context) -> Result<()> {
        self.core.drop_cached_values(ctx)
    }

    fn recover(&self, ctx: &Context, id: &I, cause: &Error) {
        warn!(id = %id.id_key(), error = %cause, "cache mirror write failed; invalidating");
        if let Err(err) = self.core.invalidate_by_id(ctx, id) {
            error!(id = %id.id_key(), error = %err, "cache invalidation after failed mirror write failed");
        }
    }
}

impl<E, I> Creator<E> for Cache<E, I>
where
    E: Clone + Send + Sync + 'static,
    I: EntityId,
{
    fn create(&self, ctx: &Context, entity: &mut E) -> Result<()> {
        self.core.source.create(ctx, entity)?;

        let id = self.core.ids.get(entity);
        let mirrored = in_tx(self.core.repository.as_ref(), ctx, |tx| {
            self.core.repository.entities().upsert(tx, entity)?;
            let hits = self.core.repository.hits();
            ignore_not_found(hits.delete_by_id(tx, &Query::find_by_id(&id).hit_id()))?;
            ignore_not_found(hits.delete_by_id(tx, &Query::find_all().hit_id()))
        });
        if let Err(err) = mirrored {
            self.recover(ctx, &id, &err);
        }
        Ok(())
    }
}

impl<E, I> ByIdFinder<E, I> for Cache<E, I>
where
    E: Clone + Send + Sync + 'static,
    I: EntityId,
{
    fn find_by_id(&self, ctx: &Context, id: &I) -> Result<Option<E>> {
        ctx.check()?;
        if let Some(entity) = self.core.repository.entities().find_by_id(ctx, id)? {
            self.schedule_refresh_by_id(id);
            return Ok(Some(entity));
        }
        let hit_id = Query::find_by_id(id).hit_id();
        let producer = self.core.find_by_id_producer(id);
        self.query_many(ctx, &hit_id, producer).next().transpose()
    }
}

impl<E, I> AllFinder<E> for Cache<E, I>
where
    E: Clone + Send + Sync + 'static,
    I: EntityId,
{
    fn find_all(&self, ctx: &Context) -> Seq<E> {
        if !self.core.source.can_find_all() {
            return seq_from_error(Error::NotImplementedBySource("AllFinder"));
        }
        let producer = self.core.find_all_producer();
        self.query_many(ctx, &Query::find_all().hit_id(), producer)
    }
}

impl<E, I> Updater<E> for Cache<E, I>
where
    E: Clone + Send + Sync + 'static,
    I: EntityId,
{
    fn update(&self, ctx: &Context, entity: &E) -> Result<()> {
        self.core.source.update(ctx, entity)?;
        if let Err(err) = self.core.repository.entities().upsert(ctx, entity) {
            self.recover(ctx, &self.core.ids.get(entity), &err);
        }
        Ok(())
    }
}

impl<E, I> ByIdDeleter<I> for Cache<E, I>
where
    E: Clone + Send + Sync + 'static,
    I: EntityId,
{
    fn delete_by_id(&self, ctx: &Context, id: &I) -> Result<()> {
        self.core.source.delete_by_id(ctx, id)?;
        if let Err(err) = self.core.invalidate_by_id(ctx, id) {
            warn!(id = %id.id_key(), error = %err, "cache invalidation after delete failed");
        }
        Ok(())
    }
}

impl<E, I> AllDeleter for Cache<E, I>
where
    E: Clone + Send + Sync + 'static,
    I: EntityId,
{
    fn delete_all(&self, ctx: &Context) -> Result<()> {
        self.core.source.delete_all(ctx)?;
        if let Err(err) = self.core.drop_cached_values(ctx) {
            warn!(error = %err, "dropping cached values after delete_all failed");
        }
        Ok(())
    }
}

impl<E, I> fmt::Debug for Cache<E, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("source", &self.core.source)
            .field("invalidators", &self.core.invalidators.len())
            .field("refresh_behind", &self.refresher.is_some())
            .finish()
    }
}
