//! Fluent construction of a [`Cache`]

use crate::cache::{Cache, CacheCore};
use crate::invalidator::CachedQueryInvalidator;
use crate::repository::CacheRepository;
use crate::source::Source;
use memport_concurrency::WorkerPool;
use memport_core::{CacheOptions, EntityId, IdAccessor, Result};
use std::sync::Arc;
use tracing::debug;

// ============================================================================
// Cache Builder Pattern
// ============================================================================

/// Builder for [`Cache`]
///
/// ```
/// use memport_cache::{Cache, MemoryCacheRepository, Source};
/// use memport_core::{ByIdFinder, CacheOptions, Context, Creator, IdAccessor};
/// use memport_primitives::Repository;
/// use memport_storage::Memory;
/// use std::sync::Arc;
///
/// #[derive(Clone)]
/// struct User { id: i64, name: String }
///
/// let ids = || IdAccessor::read_only(|u: &User| u.id);
/// let db = Arc::new(Repository::new(Memory::new(), ids()));
/// db.create(&Context::background(), &mut User { id: 1, name: "ann".into() })?;
///
/// let cache = Cache::builder(
///     Source::from_crud(db),
///     Arc::new(MemoryCacheRepository::new(ids())),
///     ids(),
/// )
/// .options(CacheOptions::default())
/// .build()?;
///
/// let user = cache.find_by_id(&Context::background(), &1)?.unwrap();
/// assert_eq!(user.name, "ann");
/// # Ok::<(), memport_core::Error>(())
/// ```
pub struct CacheBuilder<E, I> {
    source: Source<E, I>,
    repository: Arc<dyn CacheRepository<E, I>>,
    ids: IdAccessor<E, I>,
    invalidators: Vec<CachedQueryInvalidator<E, I>>,
    options: CacheOptions,
}

impl<E, I> CacheBuilder<E, I>
where
    E: Clone + Send + Sync + 'static,
    I: EntityId,
{
    /// Builder with default options and no invalidators
    pub fn new(
        source: Source<E, I>,
        repository: Arc<dyn CacheRepository<E, I>>,
        ids: IdAccessor<E, I>,
    ) -> Self {
        Self {
            source,
            repository,
            ids,
            invalidators: Vec::new(),
            options: CacheOptions::default(),
        }
    }

    /// Replace all options
    pub fn options(mut self, options: CacheOptions) -> Self {
        self.options = options;
        self
    }

    /// Toggle refresh-behind
    pub fn refresh_behind(mut self, enabled: bool) -> Self {
        self.options.refresh_behind = enabled;
        self
    }

    /// Register an invalidator
    pub fn invalidator(mut self, invalidator: CachedQueryInvalidator<E, I>) -> Self {
        self.invalidators.push(invalidator);
        self
    }

    /// Build the cache, starting refresh workers if refresh-behind is on
    pub fn build(self) -> Result<Cache<E, I>> {
        let refresher = if self.options.refresh_behind {
            Some(WorkerPool::new(
                "memport-cache-refresh",
                self.options.refresh_workers.max(1),
                self.options.max_pending_refreshes,
            )?)
        } else {
            None
        };
        debug!(
            refresh_behind = self.options.refresh_behind,
            invalidators = self.invalidators.len(),
            "cache built"
        );
        Ok(Cache::from_parts(
            CacheCore {
                source: self.source,
                repository: self.repository,
                ids: self.ids,
                invalidators: self.invalidators,
            },
            refresher,
        ))
    }
}
