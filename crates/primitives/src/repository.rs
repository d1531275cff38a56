//! Repository: direct CRUD over a shared [`Memory`] store
//!
//! Same contract as the event-log repository without the history: each write
//! replaces the stored value, inside the caller's transaction overlay if the
//! context carries one.
//!
//! Values are stored type-erased; a namespace must only ever hold one entity
//! type. Reading a foreign value fails with `Internal`.

use memport_core::{
    in_tx, AllDeleter, AllFinder, ByIdDeleter, ByIdFinder, ByIdsFinder, Context, Creator,
    DefaultMinter, EntityId, Error, IdAccessor, IdMinter, OnePhaseCommitProtocol,
    RepositoryOptions, Result, Saver, Seq, Updater, Upserter,
};
use memport_storage::{Memory, StoredValue};
use parking_lot::RwLock;
use std::any::type_name;
use std::fmt;
use std::sync::Arc;

struct RepositoryInner<E, I> {
    store: Memory,
    namespace: String,
    ids: IdAccessor<E, I>,
    minter: RwLock<Arc<dyn IdMinter<I>>>,
    expect_id: bool,
}

/// Direct repository for entities of type `E` keyed by `I`
///
/// Cloning yields another handle to the same repository.
pub struct Repository<E, I> {
    inner: Arc<RepositoryInner<E, I>>,
}

impl<E, I> Clone for Repository<E, I> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E, I> Repository<E, I>
where
    E: Clone + Send + Sync + 'static,
    I: EntityId,
{
    /// Repository over `store` with default options
    pub fn new(store: Memory, ids: IdAccessor<E, I>) -> Self {
        Self::with_options(store, ids, RepositoryOptions::default())
    }

    /// Repository over `store`
    ///
    /// The namespace defaults to the type name of `E`.
    pub fn with_options(store: Memory, ids: IdAccessor<E, I>, options: RepositoryOptions) -> Self {
        Self {
            inner: Arc::new(RepositoryInner {
                store,
                namespace: options
                    .namespace
                    .unwrap_or_else(|| type_name::<E>().to_string()),
                ids,
                minter: RwLock::new(Arc::new(DefaultMinter) as Arc<dyn IdMinter<I>>),
                expect_id: options.expect_id,
            }),
        }
    }

    /// Replace the id minter for every handle of this repository
    pub fn with_minter(self, minter: impl IdMinter<I> + 'static) -> Self {
        *self.inner.minter.write() = Arc::new(minter);
        self
    }

    fn new_id(&self, ctx: &Context) -> Result<I> {
        let minter = Arc::clone(&*self.inner.minter.read());
        minter.new_id(ctx)
    }

    /// Namespace in the store
    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    /// The underlying store
    pub fn store(&self) -> &Memory {
        &self.inner.store
    }

    /// First entity matching `predicate`
    pub fn query_one<P>(&self, ctx: &Context, predicate: P) -> Result<Option<E>>
    where
        P: Fn(&E) -> bool,
    {
        for entity in self.find_all(ctx) {
            let entity = entity?;
            if predicate(&entity) {
                return Ok(Some(entity));
            }
        }
        Ok(None)
    }

    /// Every entity matching `predicate`, lazily
    pub fn query_many<P>(&self, ctx: &Context, predicate: P) -> Seq<E>
    where
        P: Fn(&E) -> bool + Send + 'static,
    {
        Box::new(self.find_all(ctx).filter(move |item| match item {
            Ok(entity) => predicate(entity),
            Err(_) => true,
        }))
    }

    fn decode(&self, value: StoredValue) -> Result<E> {
        value.downcast_ref::<E>().cloned().ok_or_else(|| {
            Error::Internal(format!(
                "namespace '{}' holds a value that is not a {}",
                self.inner.namespace,
                type_name::<E>()
            ))
        })
    }

    fn get(&self, ctx: &Context, key: &str) -> Result<Option<E>> {
        self.inner
            .store
            .get(ctx, &self.inner.namespace, key)?
            .map(|v| self.decode(v))
            .transpose()
    }

    fn exists(&self, ctx: &Context, key: &str) -> Result<bool> {
        self.inner.store.contains(ctx, &self.inner.namespace, key)
    }

    fn put(&self, ctx: &Context, key: &str, entity: &E) -> Result<()> {
        self.inner
            .store
            .put(ctx, &self.inner.namespace, key, Arc::new(entity.clone()))
    }

    fn not_found(&self, key: &str) -> Error {
        Error::NotFound(format!("{} {}", type_name::<I>(), key))
    }

    /// One `find_all` step; the snapshot is taken on the first call
    fn next_value(
        &self,
        ctx: &Context,
        values: &mut Option<std::vec::IntoIter<StoredValue>>,
    ) -> Result<Option<E>> {
        ctx.check()?;
        self.inner.store.check_tx(ctx)?;
        if values.is_none() {
            let snapshot = self.inner.store.snapshot(ctx, &self.inner.namespace)?;
            *values = Some(snapshot.into_values().collect::<Vec<_>>().into_iter());
        }
        values
            .as_mut()
            .and_then(|v| v.next())
            .map(|v| self.decode(v))
            .transpose()
    }

    fn ensure_id(&self, ctx: &Context, entity: &mut E) -> Result<()> {
        if !self.inner.ids.get(entity).is_zero() {
            return Ok(());
        }
        if self.inner.expect_id {
            return Err(Error::MissingId(type_name::<E>().to_string()));
        }
        let id = self.new_id(ctx)?;
        self.inner.ids.set(entity, id)
    }
}

impl<E, I> Creator<E> for Repository<E, I>
where
    E: Clone + Send + Sync + 'static,
    I: EntityId,
{
    fn create(&self, ctx: &Context, entity: &mut E) -> Result<()> {
        self.ensure_id(ctx, entity)?;
        ctx.check()?;
        let key = self.inner.ids.get(entity).id_key();
        if self.exists(ctx, &key)? {
            return Err(Error::AlreadyExists(format!("{} {}", type_name::<I>(), key)));
        }
        self.put(ctx, &key, entity)
    }
}

impl<E, I> ByIdFinder<E, I> for Repository<E, I>
where
    E: Clone + Send + Sync + 'static,
    I: EntityId,
{
    fn find_by_id(&self, ctx: &Context, id: &I) -> Result<Option<E>> {
        self.get(ctx, &id.id_key())
    }
}

impl<E, I> AllFinder<E> for Repository<E, I>
where
    E: Clone + Send + Sync + 'static,
    I: EntityId,
{
    fn find_all(&self, ctx: &Context) -> Seq<E> {
        let repo = self.clone();
        let ctx = ctx.clone();
        let mut values: Option<std::vec::IntoIter<StoredValue>> = None;
        let mut finished = false;
        Box::new(std::iter::from_fn(move || {
            if finished {
                return None;
            }
            match repo.next_value(&ctx, &mut values) {
                Ok(Some(entity)) => Some(Ok(entity)),
                Ok(None) => {
                    finished = true;
                    None
                }
                Err(err) => {
                    finished = true;
                    Some(Err(err))
                }
            }
        }))
    }
}

impl<E, I> ByIdsFinder<E, I> for Repository<E, I>
where
    E: Clone + Send + Sync + 'static,
    I: EntityId,
{
    fn find_by_ids(&self, ctx: &Context, ids: &[I]) -> Seq<E> {
        let repo = self.clone();
        let ctx = ctx.clone();
        Box::new(ids.to_vec().into_iter().map(move |id| {
            let key = id.id_key();
            repo.get(&ctx, &key)?.ok_or_else(|| repo.not_found(&key))
        }))
    }
}

impl<E, I> Updater<E> for Repository<E, I>
where
    E: Clone + Send + Sync + 'static,
    I: EntityId,
{
    fn update(&self, ctx: &Context, entity: &E) -> Result<()> {
        ctx.check()?;
        let id = self.inner.ids.get(entity);
        let key = id.id_key();
        if id.is_zero() || !self.exists(ctx, &key)? {
            return Err(self.not_found(&key));
        }
        self.put(ctx, &key, entity)
    }
}

impl<E, I> Upserter<E> for Repository<E, I>
where
    E: Clone + Send + Sync + 'static,
    I: EntityId,
{
    fn upsert(&self, ctx: &Context, entity: &E) -> Result<()> {
        ctx.check()?;
        let id = self.inner.ids.get(entity);
        if id.is_zero() {
            return Err(Error::MissingId(type_name::<E>().to_string()));
        }
        self.put(ctx, &id.id_key(), entity)
    }
}

impl<E, I> ByIdDeleter<I> for Repository<E, I>
where
    E: Clone + Send + Sync + 'static,
    I: EntityId,
{
    fn delete_by_id(&self, ctx: &Context, id: &I) -> Result<()> {
        ctx.check()?;
        let key = id.id_key();
        if !self.exists(ctx, &key)? {
            return Err(self.not_found(&key));
        }
        self.inner.store.remove(ctx, &self.inner.namespace, &key)
    }
}

impl<E, I> AllDeleter for Repository<E, I>
where
    E: Clone + Send + Sync + 'static,
    I: EntityId,
{
    fn delete_all(&self, ctx: &Context) -> Result<()> {
        self.inner.store.clear(ctx, &self.inner.namespace)
    }
}

impl<E, I> Saver<E> for Repository<E, I>
where
    E: Clone + Send + Sync + 'static,
    I: EntityId,
{
    fn save(&self, ctx: &Context, entity: &mut E) -> Result<()> {
        in_tx(&self.inner.store, ctx, |tx| {
            let id = self.inner.ids.get(entity);
            if id.is_zero() || !self.exists(tx, &id.id_key())? {
                self.create(tx, entity)
            } else {
                self.update(tx, entity)
            }
        })
    }
}

impl<E, I> OnePhaseCommitProtocol for Repository<E, I>
where
    E: Send + Sync + 'static,
    I: Send + Sync + 'static,
{
    fn begin_tx(&self, ctx: &Context) -> Result<Context> {
        self.inner.store.begin_tx(ctx)
    }

    fn commit_tx(&self, ctx: &Context) -> Result<()> {
        self.inner.store.commit_tx(ctx)
    }

    fn rollback_tx(&self, ctx: &Context) -> Result<()> {
        self.inner.store.rollback_tx(ctx)
    }
}

impl<E, I> fmt::Debug for Repository<E, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("namespace", &self.inner.namespace)
            .field("expect_id", &self.inner.expect_id)
            .finish()
    }
}
