//! Entity fixtures and assertion helpers shared by the suites

use memport_core::{EntityId, ErrorKind, IdAccessor, Result};
use std::fmt::Debug;
use std::sync::Arc;

/// How a suite makes and changes entities
pub struct Fixture<E, I> {
    ids: IdAccessor<E, I>,
    make: Arc<dyn Fn(u32) -> E + Send + Sync>,
    change: Arc<dyn Fn(&E) -> E + Send + Sync>,
}

impl<E, I: EntityId> Fixture<E, I> {
    /// Fixture from an id accessor, a factory and a modifier
    ///
    /// `make(n)` must return an entity with a zero id whose content differs
    /// for every `n`. `change(e)` must keep the id and alter the content.
    pub fn new(
        ids: IdAccessor<E, I>,
        make: impl Fn(u32) -> E + Send + Sync + 'static,
        change: impl Fn(&E) -> E + Send + Sync + 'static,
    ) -> Self {
        Self {
            ids,
            make: Arc::new(make),
            change: Arc::new(change),
        }
    }

    /// The id accessor
    pub fn ids(&self) -> &IdAccessor<E, I> {
        &self.ids
    }

    /// A fresh entity without id
    pub fn make(&self, n: u32) -> E {
        (self.make)(n)
    }

    /// A modified copy keeping the id
    pub fn change(&self, entity: &E) -> E {
        (self.change)(entity)
    }

    /// The entity's id
    pub fn id_of(&self, entity: &E) -> I {
        self.ids.get(entity)
    }
}

impl<E, I> Clone for Fixture<E, I> {
    fn clone(&self) -> Self {
        Self {
            ids: self.ids.clone(),
            make: Arc::clone(&self.make),
            change: Arc::clone(&self.change),
        }
    }
}

/// Unwrap `result`, naming `what` on failure
#[track_caller]
pub fn ok<T>(result: Result<T>, what: &str) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("{}: unexpected error: {}", what, err),
    }
}

/// Assert that `result` failed with `kind`
#[track_caller]
pub fn expect_kind<T: Debug>(result: Result<T>, kind: ErrorKind, what: &str) {
    match result {
        Ok(value) => panic!("{}: expected {:?}, got Ok({:?})", what, kind, value),
        Err(err) => assert!(err.is(kind), "{}: expected {:?}, got {:?}", what, kind, err),
    }
}
