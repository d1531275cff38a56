//! Invalidation hooks that widen `invalidate_by_id`

use crate::hit::{Hit, HitId};
use std::fmt;
use std::sync::Arc;

type CheckEntity<E> = Arc<dyn Fn(&E) -> Vec<HitId> + Send + Sync>;
type CheckHit<I> = Arc<dyn Fn(&Hit<I>) -> bool + Send + Sync>;

/// Extra hits to drop when an entity is invalidated
///
/// Both checks must be pure. Either may be absent.
pub struct CachedQueryInvalidator<E, I> {
    check_entity: Option<CheckEntity<E>>,
    check_hit: Option<CheckHit<I>>,
}

impl<E, I> CachedQueryInvalidator<E, I> {
    /// Invalidator with no checks
    pub fn new() -> Self {
        Self {
            check_entity: None,
            check_hit: None,
        }
    }

    /// Map an invalidated entity to the hits that depend on it
    pub fn with_check_entity(mut self, check: impl Fn(&E) -> Vec<HitId> + Send + Sync + 'static) -> Self {
        self.check_entity = Some(Arc::new(check));
        self
    }

    /// Select hits to drop whenever any entity is invalidated
    pub fn with_check_hit(mut self, check: impl Fn(&Hit<I>) -> bool + Send + Sync + 'static) -> Self {
        self.check_hit = Some(Arc::new(check));
        self
    }

    /// Hits depending on `entity`
    pub fn check_entity(&self, entity: &E) -> Vec<HitId> {
        self.check_entity.as_ref().map_or_else(Vec::new, |check| check(entity))
    }

    /// Whether `hit` must be dropped
    pub fn check_hit(&self, hit: &Hit<I>) -> bool {
        self.check_hit.as_ref().map_or(false, |check| check(hit))
    }
}

impl<E, I> Default for CachedQueryInvalidator<E, I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E, I> Clone for CachedQueryInvalidator<E, I> {
    fn clone(&self) -> Self {
        Self {
            check_entity: self.check_entity.clone(),
            check_hit: self.check_hit.clone(),
        }
    }
}

impl<E, I> fmt::Debug for CachedQueryInvalidator<E, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedQueryInvalidator")
            .field("check_entity", &self.check_entity.is_some())
            .field("check_hit", &self.check_hit.is_some())
            .finish()
    }
}
