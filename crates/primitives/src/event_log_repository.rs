//! EventLogRepository: event-sourced CRUD over an [`EventLog`]
//!
//! ## Design
//!
//! The repository stores nothing itself. Every write appends a
//! [`RepositoryEvent`] to its namespace of the log, and every read folds the
//! events visible from the caller's context into a [`View`]. The fold is pure,
//! so two readers folding the same prefix always agree.
//!
//! ## Transactions
//!
//! The repository shares the log's transactions: `begin_tx` on the repository
//! and on the log are the same thing, and reads inside a transaction see its
//! pending events.
//!
//! ## Compression
//!
//! `compress` rewrites the namespace as one `Create` per live entity. With
//! `compress_event_log` set this runs after every successful append.

use memport_core::{
    in_tx, AllDeleter, AllFinder, ByIdDeleter, ByIdFinder, ByIdsFinder, Context, Creator,
    DefaultMinter, EntityId, Error, IdAccessor, IdMinter, MetaAccessor, OnePhaseCommitProtocol,
    RepositoryOptions, Result, Saver, Seq, Updater,
};
use memport_storage::{Event, EventLog};
use parking_lot::{Mutex, RwLock};
use std::any::{type_name, Any};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Projection of a namespace: id key to latest snapshot
pub type View<E> = BTreeMap<String, E>;

/// Kind of a repository event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    /// Entity created
    Create,
    /// Entity created or updated
    Save,
    /// Entity replaced
    Update,
    /// Entity removed
    DeleteById,
    /// Namespace emptied
    DeleteAll,
}

/// Payload appended by [`EventLogRepository`]
#[derive(Debug, Clone, PartialEq)]
pub enum RepositoryEvent<E, I> {
    /// Entity created
    Create(E),
    /// Entity created or updated
    Save(E),
    /// Entity replaced
    Update(E),
    /// Entity with this id removed
    DeleteById(I),
    /// Every entity removed
    DeleteAll,
}

impl<E, I> RepositoryEvent<E, I> {
    /// The event kind
    pub fn name(&self) -> EventName {
        match self {
            RepositoryEvent::Create(_) => EventName::Create,
            RepositoryEvent::Save(_) => EventName::Save,
            RepositoryEvent::Update(_) => EventName::Update,
            RepositoryEvent::DeleteById(_) => EventName::DeleteById,
            RepositoryEvent::DeleteAll => EventName::DeleteAll,
        }
    }
}

struct RepositoryInner<E, I> {
    log: EventLog,
    namespace: String,
    ids: IdAccessor<E, I>,
    minter: RwLock<Arc<dyn IdMinter<I>>>,
    compress_on_append: bool,
    compress_lock: Mutex<()>,
}

/// Event-sourced repository for entities of type `E` keyed by `I`
///
/// Cloning yields another handle to the same repository.
///
/// # Example
///
/// ```
/// use memport_core::{Context, Creator, ByIdFinder, IdAccessor};
/// use memport_primitives::EventLogRepository;
/// use memport_storage::EventLog;
///
/// #[derive(Clone, Default)]
/// struct Note { id: String, text: String }
///
/// let ids = IdAccessor::new(|n: &Note| n.id.clone(), |n: &mut Note, id| n.id = id);
/// let repo = EventLogRepository::new(EventLog::new(), ids);
/// let ctx = Context::background();
///
/// let mut note = Note { text: "hello".into(), ..Default::default() };
/// repo.create(&ctx, &mut note).unwrap();
/// assert!(!note.id.is_empty());
/// assert_eq!(repo.find_by_id(&ctx, &note.id).unwrap().unwrap().text, "hello");
/// ```
pub struct EventLogRepository<E, I> {
    inner: Arc<RepositoryInner<E, I>>,
}

impl<E, I> Clone for EventLogRepository<E, I> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E, I> EventLogRepository<E, I>
where
    E: Clone + Send + Sync + 'static,
    I: EntityId,
{
    /// Repository over `log` with default options
    pub fn new(log: EventLog, ids: IdAccessor<E, I>) -> Self {
        Self::with_options(log, ids, RepositoryOptions::default())
    }

    /// Repository over `log`
    ///
    /// The namespace defaults to the type name of `E`.
    pub fn with_options(log: EventLog, ids: IdAccessor<E, I>, options: RepositoryOptions) -> Self {
        Self {
            inner: Arc::new(RepositoryInner {
                log,
                namespace: options
                    .namespace
                    .unwrap_or_else(|| type_name::<E>().to_string()),
                ids,
                minter: RwLock::new(Arc::new(DefaultMinter) as Arc<dyn IdMinter<I>>),
                compress_on_append: options.compress_event_log,
                compress_lock: Mutex::new(()),
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

    /// Namespace of this repository's events
    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    /// The underlying log
    pub fn event_log(&self) -> &EventLog {
        &self.inner.log
    }

    /// Fold `events` into a view, ignoring other namespaces
    pub fn fold(&self, events: &[Event]) -> View<E> {
        let mut view = View::new();
        for event in events.iter().filter(|e| e.namespace() == self.inner.namespace) {
            let Some(payload) = event.payload::<RepositoryEvent<E, I>>() else {
                continue;
            };
            match payload {
                RepositoryEvent::Create(value)
                | RepositoryEvent::Save(value)
                | RepositoryEvent::Update(value) => {
                    view.insert(self.inner.ids.get(value).id_key(), value.clone());
                }
                RepositoryEvent::DeleteById(id) => {
                    view.remove(&id.id_key());
                }
                RepositoryEvent::DeleteAll => view.clear(),
            }
        }
        view
    }

    /// The view as seen from `ctx`, including its transaction's pending events
    pub fn view(&self, ctx: &Context) -> Result<View<E>> {
        Ok(self.fold(&self.inner.log.events_in_context(ctx)?))
    }

    /// Rewrite this namespace as one `Create` per live entity
    pub fn compress(&self) -> Result<()> {
        let _guard = self.inner.compress_lock.lock();
        self.inner.log.compact(&self.inner.namespace, |events| {
            Ok(self
                .fold(&events)
                .into_values()
                .map(|value| self.event(RepositoryEvent::Create(value)))
                .collect())
        })
    }

    fn event(&self, payload: RepositoryEvent<E, I>) -> Event {
        Event::traced(self.inner.namespace.clone(), payload)
    }

    fn append(&self, ctx: &Context, payload: RepositoryEvent<E, I>) -> Result<()> {
        let name = payload.name();
        self.inner.log.append(ctx, self.event(payload))?;
        debug!(namespace = %self.inner.namespace, event = ?name, "repository event appended");
        self.compress_if_committed(ctx)
    }

    /// Compress after a write that reached the committed log
    fn compress_if_committed(&self, ctx: &Context) -> Result<()> {
        if self.inner.compress_on_append && !self.inner.log.has_tx(ctx) {
            self.compress()?;
        }
        Ok(())
    }

    fn not_found(&self, key: &str) -> Error {
        Error::NotFound(format!("{} {}", type_name::<I>(), key))
    }
}

impl<E, I> Creator<E> for EventLogRepository<E, I>
where
    E: Clone + Send + Sync + 'static,
    I: EntityId,
{
    fn create(&self, ctx: &Context, entity: &mut E) -> Result<()> {
        if self.inner.ids.get(entity).is_zero() {
            let id = self.new_id(ctx)?;
            self.inner.ids.set(entity, id)?;
        }
        ctx.check()?;

        let key = self.inner.ids.get(entity).id_key();
        if self.view(ctx)?.contains_key(&key) {
            return Err(Error::AlreadyExists(format!("{} {}", type_name::<I>(), key)));
        }
        self.append(ctx, RepositoryEvent::Create(entity.clone()))
    }
}

impl<E, I> ByIdFinder<E, I> for EventLogRepository<E, I>
where
    E: Clone + Send + Sync + 'static,
    I: EntityId,
{
    fn find_by_id(&self, ctx: &Context, id: &I) -> Result<Option<E>> {
        Ok(self.view(ctx)?.remove(&id.id_key()))
    }
}

/// Lazily folds on the first step, then walks the view
///
/// Every step re-checks cancellation and transaction state.
struct ViewIter<E, I> {
    repo: EventLogRepository<E, I>,
    ctx: Context,
    values: Option<std::vec::IntoIter<E>>,
    finished: bool,
}

impl<E, I> Iterator for ViewIter<E, I>
where
    E: Clone + Send + Sync + 'static,
    I: EntityId,
{
    type Item = Result<E>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        if let Err(err) = self
            .ctx
            .check()
            .and_then(|_| self.repo.inner.log.check_tx(&self.ctx))
        {
            self.finished = true;
            return Some(Err(err));
        }
        if self.values.is_none() {
            match self.repo.view(&self.ctx) {
                Ok(view) => {
                    self.values = Some(view.into_values().collect::<Vec<_>>().into_iter())
                }
                Err(err) => {
                    self.finished = true;
                    return Some(Err(err));
                }
            }
        }
        let next = self.values.as_mut().and_then(|v| v.next());
        if next.is_none() {
            self.finished = true;
        }
        next.map(Ok)
    }
}

impl<E, I> AllFinder<E> for EventLogRepository<E, I>
where
    E: Clone + Send + Sync + 'static,
    I: EntityId,
{
    fn find_all(&self, ctx: &Context) -> Seq<E> {
        Box::new(ViewIter {
            repo: self.clone(),
            ctx: ctx.clone(),
            values: None,
            finished: false,
        })
    }
}

impl<E, I> ByIdsFinder<E, I> for EventLogRepository<E, I>
where
    E: Clone + Send + Sync + 'static,
    I: EntityId,
{
    fn find_by_ids(&self, ctx: &Context, ids: &[I]) -> Seq<E> {
        let repo = self.clone();
        let ctx = ctx.clone();
        let mut view: Option<View<E>> = None;
        Box::new(ids.to_vec().into_iter().map(move |id| {
            ctx.check()?;
            if view.is_none() {
                view = Some(repo.view(&ctx)?);
            }
            let key = id.id_key();
            view.as_ref()
                .and_then(|v| v.get(&key).cloned())
                .ok_or_else(|| repo.not_found(&key))
        }))
    }
}

impl<E, I> Updater<E> for EventLogRepository<E, I>
where
    E: Clone + Send + Sync + 'static,
    I: EntityId,
{
    fn update(&self, ctx: &Context, entity: &E) -> Result<()> {
        ctx.check()?;
        let id = self.inner.ids.get(entity);
        let key = id.id_key();
        if id.is_zero() || !self.view(ctx)?.contains_key(&key) {
            return Err(self.not_found(&key));
        }
        self.append(ctx, RepositoryEvent::Update(entity.clone()))
    }
}

impl<E, I> ByIdDeleter<I> for EventLogRepository<E, I>
where
    E: Clone + Send + Sync + 'static,
    I: EntityId,
{
    fn delete_by_id(&self, ctx: &Context, id: &I) -> Result<()> {
        ctx.check()?;
        let key = id.id_key();
        if !self.view(ctx)?.contains_key(&key) {
            return Err(self.not_found(&key));
        }
        self.append(ctx, RepositoryEvent::DeleteById(id.clone()))
    }
}

impl<E, I> AllDeleter for EventLogRepository<E, I>
where
    E: Clone + Send + Sync + 'static,
    I: EntityId,
{
    fn delete_all(&self, ctx: &Context) -> Result<()> {
        ctx.check()?;
        self.append(ctx, RepositoryEvent::DeleteAll)
    }
}

impl<E, I> Saver<E> for EventLogRepository<E, I>
where
    E: Clone + Send + Sync + 'static,
    I: EntityId,
{
    fn save(&self, ctx: &Context, entity: &mut E) -> Result<()> {
        in_tx(&self.inner.log, ctx, |tx| {
            let id = self.inner.ids.get(entity);
            if id.is_zero() || !self.view(tx)?.contains_key(&id.id_key()) {
                self.create(tx, entity)
            } else {
                self.update(tx, entity)
            }
        })?;
        self.compress_if_committed(ctx)
    }
}

impl<E, I> OnePhaseCommitProtocol for EventLogRepository<E, I>
where
    E: Clone + Send + Sync + 'static,
    I: EntityId,
{
    fn begin_tx(&self, ctx: &Context) -> Result<Context> {
        self.inner.log.begin_tx(ctx)
    }

    fn commit_tx(&self, ctx: &Context) -> Result<()> {
        let to_root = self.inner.log.commits_to_root(ctx);
        self.inner.log.commit_tx(ctx)?;
        if to_root && self.inner.compress_on_append {
            self.compress()?;
        }
        Ok(())
    }

    fn rollback_tx(&self, ctx: &Context) -> Result<()> {
        self.inner.log.rollback_tx(ctx)
    }
}

impl<E, I> MetaAccessor for EventLogRepository<E, I> {
    fn set_meta<T: Any + Send + Sync>(&self, ctx: &Context, key: &str, value: T) -> Result<Context> {
        self.inner.log.set_meta(ctx, key, value)
    }

    fn lookup_meta<T: Any + Clone + Send + Sync>(&self, ctx: &Context, key: &str) -> Option<T> {
        self.inner.log.lookup_meta(ctx, key)
    }
}

impl<E, I> fmt::Debug for EventLogRepository<E, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLogRepository")
            .field("namespace", &self.inner.namespace)
            .field("compress_on_append", &self.inner.compress_on_append)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memport_core::{ErrorKind, FnMinter, HasId};

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Item {
        id: String,
        v: String,
    }

    impl HasId for Item {
        type Id = String;
        fn id(&self) -> String {
            self.id.clone()
        }
        fn set_id(&mut self, id: String) {
            self.id = id;
        }
    }

    fn item(id: &str, v: &str) -> Item {
        Item {
            id: id.into(),
            v: v.into(),
        }
    }

    fn setup() -> (EventLogRepository<Item, String>, Context) {
        (
            EventLogRepository::new(EventLog::new(), IdAccessor::of_entity()),
            Context::background(),
        )
    }

    fn collect(seq: Seq<Item>) -> Vec<Item> {
        seq.collect::<Result<Vec<_>>>().unwrap()
    }

    #[test]
    fn test_create_mints_missing_id() {
        let (repo, ctx) = setup();
        let mut it = item("", "a");
        repo.create(&ctx, &mut it).unwrap();
        assert!(!it.id.is_empty());
        assert_eq!(repo.find_by_id(&ctx, &it.id).unwrap(), Some(it));
    }

    #[test]
    fn test_create_duplicate_fails() {
        let (repo, ctx) = setup();
        repo.create(&ctx, &mut item("x", "a")).unwrap();
        let err = repo.create(&ctx, &mut item("x", "b")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_create_update_delete_fold() {
        let (repo, ctx) = setup();
        repo.create(&ctx, &mut item("x", "a")).unwrap();
        repo.update(&ctx, &item("x", "b")).unwrap();
        assert_eq!(repo.find_by_id(&ctx, &"x".into()).unwrap().unwrap().v, "b");
        repo.delete_by_id(&ctx, &"x".into()).unwrap();

        assert_eq!(repo.find_by_id(&ctx, &"x".into()).unwrap(), None);
        assert!(collect(repo.find_all(&ctx)).is_empty());
        assert_eq!(repo.event_log().len(), 3);

        repo.compress().unwrap();
        assert_eq!(repo.event_log().len(), 0);
    }

    #[test]
    fn test_update_and_delete_missing() {
        let (repo, ctx) = setup();
        assert_eq!(repo.update(&ctx, &item("nope", "a")).unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(repo.update(&ctx, &item("", "a")).unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(
            repo.delete_by_id(&ctx, &"nope".into()).unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_delete_all() {
        let (repo, ctx) = setup();
        repo.create(&ctx, &mut item("a", "1")).unwrap();
        repo.create(&ctx, &mut item("b", "2")).unwrap();
        repo.delete_all(&ctx).unwrap();
        assert!(collect(repo.find_all(&ctx)).is_empty());
        repo.create(&ctx, &mut item("a", "3")).unwrap();
        assert_eq!(collect(repo.find_all(&ctx)), vec![item("a", "3")]);
    }

    #[test]
    fn test_save_upserts() {
        let (repo, ctx) = setup();
        let mut it = item("", "a");
        repo.save(&ctx, &mut it).unwrap();
        it.v = "b".into();
        repo.save(&ctx, &mut it).unwrap();
        assert_eq!(collect(repo.find_all(&ctx)), vec![it]);
    }

    #[test]
    fn test_find_by_ids_reports_missing() {
        let (repo, ctx) = setup();
        repo.create(&ctx, &mut item("a", "1")).unwrap();
        repo.create(&ctx, &mut item("b", "2")).unwrap();

        let results: Vec<_> = repo
            .find_by_ids(&ctx, &["b".into(), "zz".into(), "a".into()])
            .collect();
        assert_eq!(results[0].as_ref().unwrap().v, "2");
        let err = results[1].as_ref().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.to_string().contains("String"));
        assert_eq!(results[2].as_ref().unwrap().v, "1");
    }

    #[test]
    fn test_find_all_is_restartable_and_checks_context() {
        let (repo, ctx) = setup();
        repo.create(&ctx, &mut item("a", "1")).unwrap();
        assert_eq!(collect(repo.find_all(&ctx)).len(), 1);
        assert_eq!(collect(repo.find_all(&ctx)).len(), 1);

        let (cancel_ctx, cancel) = ctx.with_cancel();
        let mut seq = repo.find_all(&cancel_ctx);
        cancel.cancel();
        assert!(seq.next().unwrap().unwrap_err().is_cancellation());
        assert!(seq.next().is_none());
    }

    #[test]
    fn test_find_all_stops_when_tx_finishes() {
        let (repo, ctx) = setup();
        repo.create(&ctx, &mut item("a", "1")).unwrap();
        repo.create(&ctx, &mut item("b", "2")).unwrap();
        let outer = repo.begin_tx(&ctx).unwrap();
        let inner = repo.begin_tx(&outer).unwrap();

        let mut seq = repo.find_all(&inner);
        assert!(seq.next().unwrap().is_ok());
        repo.rollback_tx(&inner).unwrap();
        assert!(seq.next().unwrap().is_err());
    }

    #[test]
    fn test_transactional_reads_and_rollback() {
        let (repo, ctx) = setup();
        let tx = repo.begin_tx(&ctx).unwrap();
        repo.create(&tx, &mut item("t", "1")).unwrap();
        assert!(repo.find_by_id(&tx, &"t".into()).unwrap().is_some());
        assert!(repo.find_by_id(&ctx, &"t".into()).unwrap().is_none());
        repo.rollback_tx(&tx).unwrap();
        assert!(repo.find_by_id(&ctx, &"t".into()).unwrap().is_none());
    }

    #[test]
    fn test_compress_on_append_keeps_view() {
        let repo = EventLogRepository::with_options(
            EventLog::new(),
            IdAccessor::<Item, String>::of_entity(),
            RepositoryOptions::default().with_compress_event_log(true),
        );
        let ctx = Context::background();
        repo.create(&ctx, &mut item("a", "1")).unwrap();
        repo.update(&ctx, &item("a", "2")).unwrap();
        repo.update(&ctx, &item("a", "3")).unwrap();
        assert_eq!(repo.event_log().len(), 1);
        assert_eq!(repo.find_by_id(&ctx, &"a".into()).unwrap().unwrap().v, "3");
    }

    #[test]
    fn test_compress_on_append_after_save_and_tx_commit() {
        let repo = EventLogRepository::with_options(
            EventLog::new(),
            IdAccessor::<Item, String>::of_entity(),
            RepositoryOptions::default().with_compress_event_log(true),
        );
        let ctx = Context::background();
        repo.save(&ctx, &mut item("a", "1")).unwrap();
        repo.save(&ctx, &mut item("a", "2")).unwrap();
        assert_eq!(repo.event_log().len(), 1);

        let tx = repo.begin_tx(&ctx).unwrap();
        repo.update(&tx, &item("a", "3")).unwrap();
        repo.create(&tx, &mut item("b", "1")).unwrap();
        repo.delete_by_id(&tx, &"b".to_string()).unwrap();
        repo.commit_tx(&tx).unwrap();

        assert_eq!(repo.event_log().len(), 1);
        assert_eq!(repo.find_by_id(&ctx, &"a".into()).unwrap().unwrap().v, "3");
    }

    #[test]
    fn test_shared_log_namespaces() {
        let log = EventLog::new();
        let a = EventLogRepository::with_options(
            log.clone(),
            IdAccessor::<Item, String>::of_entity(),
            RepositoryOptions::default().with_namespace("a"),
        );
        let b = EventLogRepository::with_options(
            log.clone(),
            IdAccessor::<Item, String>::of_entity(),
            RepositoryOptions::default().with_namespace("b"),
        );
        let ctx = Context::background();
        a.create(&ctx, &mut item("x", "from-a")).unwrap();
        b.create(&ctx, &mut item("x", "from-b")).unwrap();
        b.delete_all(&ctx).unwrap();

        assert_eq!(a.find_by_id(&ctx, &"x".into()).unwrap().unwrap().v, "from-a");
        assert!(b.find_by_id(&ctx, &"x".into()).unwrap().is_none());
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn test_custom_minter() {
        let repo = EventLogRepository::new(EventLog::new(), IdAccessor::<Item, String>::of_entity())
            .with_minter(FnMinter(|_: &Context| Ok::<_, Error>("fixed".to_string())));
        let ctx = Context::background();
        let mut it = item("", "a");
        repo.create(&ctx, &mut it).unwrap();
        assert_eq!(it.id, "fixed");
    }

    #[test]
    fn test_minter_replaced_on_shared_handle() {
        let repo = EventLogRepository::new(EventLog::new(), IdAccessor::<Item, String>::of_entity());
        let shared = repo.clone();
        let _repo = repo.with_minter(FnMinter(|_: &Context| Ok::<_, Error>("minted".to_string())));

        let mut it = item("", "a");
        shared.create(&Context::background(), &mut it).unwrap();
        assert_eq!(it.id, "minted");
    }

    #[test]
    fn test_events_carry_traces() {
        let (repo, ctx) = setup();
        repo.create(&ctx, &mut item("a", "1")).unwrap();
        let events = repo.event_log().events();
        assert!(events[0].trace().is_some());
        let payload = events[0].payload::<RepositoryEvent<Item, String>>().unwrap();
        assert_eq!(payload.name(), EventName::Create);
    }

    #[test]
    fn test_metadata_delegates_to_log() {
        let (repo, ctx) = setup();
        let ctx = repo.set_meta(&ctx, "k", 5u8).unwrap();
        assert_eq!(repo.lookup_meta::<u8>(&ctx, "k"), Some(5));
        assert_eq!(repo.event_log().lookup_meta::<u8>(&ctx, "k"), Some(5));
    }
}
