//! Cache invalidation by hit

use crate::common::{init_tracing, note, Note};
use memport::memport_cache::MemoryCacheRepository;
use memport::{
    ByIdDeleter, ByIdFinder, Cache, Context, Creator, IdAccessor, Memory, Query, Repository,
    Source,
};
use std::sync::Arc;

#[test]
fn test_invalidate_cached_query() {
    init_tracing();
    let ids = || IdAccessor::<Note, String>::of_entity();
    let store = Arc::new(Repository::new(Memory::new(), ids()));
    let cache = Cache::builder(
        Source::from_crud(Arc::clone(&store)),
        Arc::new(MemoryCacheRepository::new(ids())),
        ids(),
    )
    .build()
    .unwrap();
    let ctx = Context::background();
    store.create(&ctx, &mut note("e", "1")).unwrap();

    let k = Query::new("Latest").with_arg("id", "e").hit_id();
    let lookup = {
        let store = Arc::clone(&store);
        move |ctx: &Context| store.find_by_id(ctx, &"e".to_string())
    };
    let query = || cache.cached_query_one(&ctx, &k, lookup.clone()).unwrap();

    assert_eq!(query(), Some(note("e", "1")));
    store.delete_by_id(&ctx, &"e".to_string()).unwrap();
    assert_eq!(query(), Some(note("e", "1")));

    cache.invalidate_cached_query(&ctx, &k).unwrap();
    let repo = cache.repository();
    assert!(repo.hits().find_by_id(&ctx, &k).unwrap().is_none());
    assert_eq!(repo.entities().find_by_id(&ctx, &"e".to_string()).unwrap(), None);

    assert_eq!(query(), None);
}
