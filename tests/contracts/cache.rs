//! Cache contract

use crate::common::{account_fixture, init_tracing, note_fixture, Note};
use memport::memport_cache::{Hit, MemoryCacheRepository};
use memport::memport_contracts::{cache, Fixture};
use memport::{Cache, CacheOptions, CachedQueryInvalidator, EntityId, Memory, Query, Source};
use std::sync::Arc;

fn build<E, I>(fixture: &Fixture<E, I>, source: Source<E, I>, options: CacheOptions) -> Cache<E, I>
where
    E: Clone + Send + Sync + 'static,
    I: EntityId,
{
    let repository = Arc::new(MemoryCacheRepository::new(fixture.ids().clone()));
    Cache::builder(source, repository, fixture.ids().clone())
        .options(options)
        .build()
        .expect("cache builds")
}

#[test]
fn test_cache() {
    init_tracing();
    let fixture = note_fixture();
    cache::run(|source, options| build(&fixture, source, options), &fixture);
}

#[test]
fn test_cache_integer_ids() {
    let fixture = account_fixture();
    cache::run(
        |source, options| build(&fixture, source, options.with_refresh_workers(2)),
        &fixture,
    );
}

#[test]
fn test_cache_with_invalidators() {
    let fixture = note_fixture();
    cache::run(
        |source, options| {
            let by_body = CachedQueryInvalidator::<Note, String>::new()
                .with_check_entity(|n: &Note| {
                    vec![Query::new("ByBody").with_arg("body", &n.body).hit_id()]
                })
                .with_check_hit(|h: &Hit<String>| h.id.as_str().starts_with("0:Unrelated"));
            let repository = MemoryCacheRepository::with_store(Memory::new(), fixture.ids().clone());
            Cache::builder(source, Arc::new(repository), fixture.ids().clone())
                .options(options)
                .invalidator(by_body)
                .build()
                .expect("cache builds")
        },
        &fixture,
    );
}
