//! Cache contract
//!
//! Each case builds a fresh source (a [`Repository`] over its own
//! [`Memory`]) and hands it to the factory together with the options the
//! case needs. The source is then mutated behind the cache's back to tell
//! cached answers from fresh ones.

use crate::fixture::{ok, Fixture};
use memport_cache::{Cache, HitId, Query, Source};
use memport_core::{
    AllFinder, ByIdDeleter, ByIdFinder, CacheOptions, Context, Creator, EntityId, Result, Seq,
    Updater,
};
use memport_primitives::Repository;
use memport_storage::Memory;
use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Everything a case needs
pub struct Subject<E, I> {
    /// Cache under test
    pub cache: Cache<E, I>,
    /// Backing store, bypassing the cache
    pub store: Arc<Repository<E, I>>,
    /// Entity fixture
    pub fixture: Fixture<E, I>,
}

/// Run every cache case
pub fn run<E, I, F>(factory: F, fixture: &Fixture<E, I>)
where
    E: Clone + Debug + PartialEq + Send + Sync + 'static,
    I: EntityId,
    F: Fn(Source<E, I>, CacheOptions) -> Cache<E, I>,
{
    let plain = CacheOptions::default();
    let behind = CacheOptions::default().with_refresh_behind(true);
    let cases: [(&str, &CacheOptions, fn(&Subject<E, I>)); 8] = [
        ("read_through", &plain, read_through),
        ("cached_queries_are_idempotent", &plain, cached_queries_are_idempotent),
        ("invalidate_cached_query", &plain, invalidate_cached_query),
        ("invalidate_by_id_drops_dependents", &plain, invalidate_by_id_drops_dependents),
        ("drop_cached_values", &plain, drop_cached_values),
        ("snapshot_until_refresh", &plain, snapshot_until_refresh),
        ("refresh_behind_converges", &behind, refresh_behind_converges),
        ("write_through", &plain, write_through),
    ];
    for (name, options, case) in cases {
        debug!(case = name, "cache contract");
        let subject = setup(&factory, fixture, options.clone());
        case(&subject);
        subject.cache.close();
    }
}

fn setup<E, I, F>(factory: &F, fixture: &Fixture<E, I>, options: CacheOptions) -> Subject<E, I>
where
    E: Clone + Debug + PartialEq + Send + Sync + 'static,
    I: EntityId,
    F: Fn(Source<E, I>, CacheOptions) -> Cache<E, I>,
{
    let store = Arc::new(Repository::new(Memory::new(), fixture.ids().clone()));
    let cache = factory(Source::from_crud(Arc::clone(&store)), options);
    Subject {
        cache,
        store,
        fixture: fixture.clone(),
    }
}

impl<E, I> Subject<E, I>
where
    E: Clone + Debug + PartialEq + Send + Sync + 'static,
    I: EntityId,
{
    fn seed(&self, n: u32) -> E {
        let mut entity = self.fixture.make(n);
        ok(self.store.create(&Context::background(), &mut entity), "seed");
        entity
    }

    fn id_of(&self, entity: &E) -> I {
        self.fixture.id_of(entity)
    }

    fn cached_entity(&self, id: &I) -> Option<E> {
        let entities = self.cache.repository().entities();
        ok(entities.find_by_id(&Context::background(), id), "cached entity")
    }

    fn has_hit(&self, hit_id: &HitId) -> bool {
        let hits = self.cache.repository().hits();
        ok(hits.find_by_id(&Context::background(), hit_id), "cached hit").is_some()
    }

    fn all(&self) -> Vec<E> {
        ok(self.cache.find_all(&Context::background()).collect(), "find_all")
    }

    /// A producer over the store that counts its runs
    fn counted_lookup(
        &self,
        id: &I,
    ) -> (
        Arc<AtomicUsize>,
        impl Fn(&Context) -> Result<Option<E>> + Send + Sync + 'static,
    ) {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let store = Arc::clone(&self.store);
        let id = id.clone();
        let producer = move |ctx: &Context| {
            counter.fetch_add(1, Ordering::SeqCst);
            store.find_by_id(ctx, &id)
        };
        (runs, producer)
    }
}

fn by_key<I: EntityId>(id: &I) -> HitId {
    Query::new("ByKey").with_arg("key", id.id_key()).hit_id()
}

/// `find_by_id` answers from the source once, then from the cache
pub fn read_through<E, I>(s: &Subject<E, I>)
where
    E: Clone + Debug + PartialEq + Send + Sync + 'static,
    I: EntityId,
{
    let ctx = Context::background();
    let entity = s.seed(1);
    let id = s.id_of(&entity);
    assert_eq!(ok(s.cache.find_by_id(&ctx, &id), "find_by_id"), Some(entity.clone()));
    assert_eq!(s.cached_entity(&id), Some(entity.clone()));

    ok(s.store.delete_by_id(&ctx, &id), "delete in store");
    assert_eq!(ok(s.cache.find_by_id(&ctx, &id), "cached find_by_id"), Some(entity));
}

/// Repeating a cached query does not re-run its producer
pub fn cached_queries_are_idempotent<E, I>(s: &Subject<E, I>)
where
    E: Clone + Debug + PartialEq + Send + Sync + 'static,
    I: EntityId,
{
    let ctx = Context::background();
    let entity = s.seed(1);
    let id = s.id_of(&entity);

    let (runs, producer) = s.counted_lookup(&id);
    let producer = Arc::new(producer);
    for _ in 0..3 {
        let producer = Arc::clone(&producer);
        let found = s.cache.cached_query_one(&ctx, &by_key(&id), move |ctx| producer(ctx));
        assert_eq!(ok(found, "cached_query_one"), Some(entity.clone()));
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let many_runs = Arc::new(AtomicUsize::new(0));
    let hit = Query::new("Everything").hit_id();
    for _ in 0..3 {
        let counter = Arc::clone(&many_runs);
        let store = Arc::clone(&s.store);
        let producer = move |ctx: &Context| -> Seq<E> {
            counter.fetch_add(1, Ordering::SeqCst);
            store.find_all(ctx)
        };
        let found: Vec<E> = ok(s.cache.cached_query_many(&ctx, &hit, producer).collect(), "cached_query_many");
        assert_eq!(found, vec![entity.clone()]);
    }
    assert_eq!(many_runs.load(Ordering::SeqCst), 1);
}

/// Invalidating a query drops its hit and its entities; the next call asks again
pub fn invalidate_cached_query<E, I>(s: &Subject<E, I>)
where
    E: Clone + Debug + PartialEq + Send + Sync + 'static,
    I: EntityId,
{
    let ctx = Context::background();
    let entity = s.seed(1);
    let id = s.id_of(&entity);
    let hit = by_key(&id);
    let (runs, producer) = s.counted_lookup(&id);
    let producer = Arc::new(producer);
    let query = |s: &Subject<E, I>| {
        let producer = Arc::clone(&producer);
        ok(s.cache.cached_query_one(&ctx, &hit, move |ctx| producer(ctx)), "cached_query_one")
    };

    assert_eq!(query(s), Some(entity.clone()));
    ok(s.store.delete_by_id(&ctx, &id), "delete in store");
    assert_eq!(query(s), Some(entity), "served from cache");

    ok(s.cache.invalidate_cached_query(&ctx, &hit), "invalidate_cached_query");
    assert!(!s.has_hit(&hit));
    assert_eq!(s.cached_entity(&id), None);

    assert_eq!(query(s), None);
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    ok(s.cache.invalidate_cached_query(&ctx, &Query::new("Unknown").hit_id()), "invalidate unknown");
}

/// Invalidating an entity drops every hit that listed it, and only those
pub fn invalidate_by_id_drops_dependents<E, I>(s: &Subject<E, I>)
where
    E: Clone + Debug + PartialEq + Send + Sync + 'static,
    I: EntityId,
{
    let ctx = Context::background();
    let a = s.seed(1);
    let b = s.seed(2);
    let (a_id, b_id) = (s.id_of(&a), s.id_of(&b));

    assert_eq!(s.all().len(), 2);
    ok(s.cache.find_by_id(&ctx, &b_id), "find_by_id");
    let (_, lookup_b) = s.counted_lookup(&b_id);
    ok(s.cache.cached_query_one(&ctx, &by_key(&b_id), lookup_b), "cached_query_one");

    ok(s.cache.invalidate_by_id(&ctx, &a_id), "invalidate_by_id");
    assert_eq!(s.cached_entity(&a_id), None);
    assert!(!s.has_hit(&Query::find_all().hit_id()), "FindAll hit referenced the entity");
    assert!(!s.has_hit(&Query::find_by_id(&a_id).hit_id()));
    assert!(s.has_hit(&by_key(&b_id)), "unrelated hit dropped");
    assert_eq!(s.cached_entity(&b_id), Some(b));
}

/// Dropping cached values empties both hits and entities
pub fn drop_cached_values<E, I>(s: &Subject<E, I>)
where
    E: Clone + Debug + PartialEq + Send + Sync + 'static,
    I: EntityId,
{
    let ctx = Context::background();
    let seeded: Vec<E> = (0..3).map(|n| s.seed(n)).collect();
    assert_eq!(s.all().len(), 3);
    ok(s.cache.find_by_id(&ctx, &s.id_of(&seeded[0])), "find_by_id");

    ok(s.cache.drop_cached_values(&ctx), "drop_cached_values");
    let repo = s.cache.repository();
    assert_eq!(repo.hits().find_all(&ctx).count(), 0);
    assert_eq!(repo.entities().find_all(&ctx).count(), 0);
    assert_eq!(s.all().len(), 3, "source untouched");
}

/// Without refresh-behind, `find_all` keeps its snapshot until refreshed
pub fn snapshot_until_refresh<E, I>(s: &Subject<E, I>)
where
    E: Clone + Debug + PartialEq + Send + Sync + 'static,
    I: EntityId,
{
    let ctx = Context::background();
    let entity = s.seed(1);
    assert_eq!(s.all(), vec![entity.clone()]);

    let changed = s.fixture.change(&entity);
    ok(s.store.update(&ctx, &changed), "update in store");
    assert_eq!(s.all(), vec![entity.clone()]);
    assert_eq!(s.all(), vec![entity]);
    assert!(s.cache.idle());

    ok(s.cache.refresh(&ctx), "refresh");
    assert_eq!(s.all(), vec![changed]);
}

/// With refresh-behind, `find_all` catches up with the source
pub fn refresh_behind_converges<E, I>(s: &Subject<E, I>)
where
    E: Clone + Debug + PartialEq + Send + Sync + 'static,
    I: EntityId,
{
    let ctx = Context::background();
    let entity = s.seed(1);
    assert_eq!(s.all(), vec![entity.clone()]);

    let changed = s.fixture.change(&entity);
    ok(s.store.update(&ctx, &changed), "update in store");
    s.all();
    s.cache.wait_idle();
    assert_eq!(s.all(), vec![changed]);
}

/// Writes through the cache reach the source and stay coherent
pub fn write_through<E, I>(s: &Subject<E, I>)
where
    E: Clone + Debug + PartialEq + Send + Sync + 'static,
    I: EntityId,
{
    let ctx = Context::background();
    let seeded = s.seed(1);
    assert_eq!(s.all().len(), 1);

    let mut created = s.fixture.make(2);
    ok(s.cache.create(&ctx, &mut created), "create");
    let id = s.id_of(&created);
    assert_eq!(ok(s.store.find_by_id(&ctx, &id), "store find"), Some(created.clone()));
    assert_eq!(s.all().len(), 2, "create must invalidate FindAll");

    let changed = s.fixture.change(&created);
    ok(s.cache.update(&ctx, &changed), "update");
    assert_eq!(ok(s.cache.find_by_id(&ctx, &id), "find_by_id"), Some(changed));

    ok(s.cache.delete_by_id(&ctx, &id), "delete_by_id");
    assert_eq!(ok(s.store.find_by_id(&ctx, &id), "store find"), None);
    assert_eq!(ok(s.cache.find_by_id(&ctx, &id), "find_by_id"), None);
    assert_eq!(s.all(), vec![seeded]);
}
