//! Capability descriptor of the store behind a cache
//!
//! A source must at least find entities by id. Every other capability is
//! optional; calling a missing one fails with `NotImplementedBySource`.

use memport_core::{
    seq_from_error, AllDeleter, AllFinder, ByIdDeleter, ByIdFinder, Context, Creator, Crud,
    Error, Result, Seq, Updater,
};
use std::fmt;
use std::sync::Arc;

/// The slow store a [`Cache`](crate::Cache) reads through and writes through
pub struct Source<E, I> {
    finder: Arc<dyn ByIdFinder<E, I>>,
    creator: Option<Arc<dyn Creator<E>>>,
    updater: Option<Arc<dyn Updater<E>>>,
    deleter: Option<Arc<dyn ByIdDeleter<I>>>,
    all_finder: Option<Arc<dyn AllFinder<E>>>,
    all_deleter: Option<Arc<dyn AllDeleter>>,
}

impl<E, I> Clone for Source<E, I> {
    fn clone(&self) -> Self {
        Self {
            finder: Arc::clone(&self.finder),
            creator: self.creator.clone(),
            updater: self.updater.clone(),
            deleter: self.deleter.clone(),
            all_finder: self.all_finder.clone(),
            all_deleter: self.all_deleter.clone(),
        }
    }
}

impl<E: 'static, I: 'static> Source<E, I> {
    /// Source that can only find by id
    pub fn new<S: ByIdFinder<E, I> + 'static>(finder: Arc<S>) -> Self {
        Self {
            finder,
            creator: None,
            updater: None,
            deleter: None,
            all_finder: None,
            all_deleter: None,
        }
    }

    /// Source exposing every CRUD capability of `store`
    pub fn from_crud<S: Crud<E, I> + 'static>(store: Arc<S>) -> Self {
        Self {
            finder: store.clone(),
            creator: Some(store.clone()),
            updater: Some(store.clone()),
            deleter: Some(store.clone()),
            all_finder: Some(store.clone()),
            all_deleter: Some(store),
        }
    }

    /// Add creation
    pub fn with_creator<S: Creator<E> + 'static>(mut self, creator: Arc<S>) -> Self {
        self.creator = Some(creator);
        self
    }

    /// Add updates
    pub fn with_updater<S: Updater<E> + 'static>(mut self, updater: Arc<S>) -> Self {
        self.updater = Some(updater);
        self
    }

    /// Add deletion by id
    pub fn with_deleter<S: ByIdDeleter<I> + 'static>(mut self, deleter: Arc<S>) -> Self {
        self.deleter = Some(deleter);
        self
    }

    /// Add listing
    pub fn with_all_finder<S: AllFinder<E> + 'static>(mut self, all_finder: Arc<S>) -> Self {
        self.all_finder = Some(all_finder);
        self
    }

    /// Add deletion of everything
    pub fn with_all_deleter<S: AllDeleter + 'static>(mut self, all_deleter: Arc<S>) -> Self {
        self.all_deleter = Some(all_deleter);
        self
    }
}

impl<E, I> Source<E, I> {
    /// Find one entity
    pub fn find_by_id(&self, ctx: &Context, id: &I) -> Result<Option<E>> {
        self.finder.find_by_id(ctx, id)
    }

    /// Create an entity
    pub fn create(&self, ctx: &Context, entity: &mut E) -> Result<()> {
        self.creator
            .as_ref()
            .ok_or(Error::NotImplementedBySource("Creator"))?
            .create(ctx, entity)
    }

    /// Replace an entity
    pub fn update(&self, ctx: &Context, entity: &E) -> Result<()> {
        self.updater
            .as_ref()
            .ok_or(Error::NotImplementedBySource("Updater"))?
            .update(ctx, entity)
    }

    /// Delete one entity
    pub fn delete_by_id(&self, ctx: &Context, id: &I) -> Result<()> {
        self.deleter
            .as_ref()
            .ok_or(Error::NotImplementedBySource("ByIdDeleter"))?
            .delete_by_id(ctx, id)
    }

    /// List every entity
    pub fn find_all(&self, ctx: &Context) -> Seq<E>
    where
        E: Send + 'static,
    {
        match &self.all_finder {
            Some(all_finder) => all_finder.find_all(ctx),
            None => seq_from_error(Error::NotImplementedBySource("AllFinder")),
        }
    }

    /// Delete every entity
    pub fn delete_all(&self, ctx: &Context) -> Result<()> {
        self.all_deleter
            .as_ref()
            .ok_or(Error::NotImplementedBySource("AllDeleter"))?
            .delete_all(ctx)
    }

    /// Whether the source can create
    pub fn can_create(&self) -> bool {
        self.creator.is_some()
    }

    /// Whether the source can list
    pub fn can_find_all(&self) -> bool {
        self.all_finder.is_some()
    }
}

impl<E, I> fmt::Debug for Source<E, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("creator", &self.creator.is_some())
            .field("updater", &self.updater.is_some())
            .field("deleter", &self.deleter.is_some())
            .field("all_finder", &self.all_finder.is_some())
            .field("all_deleter", &self.all_deleter.is_some())
            .finish()
    }
}
