//! EventLog: ordered, namespaced event stream with nested transactions
//!
//! ## Role
//!
//! The log is the single source of truth for event-sourced repositories. It
//! never looks inside an event; repositories fold the events of their own
//! namespace into a view.
//!
//! ## Design
//!
//! 1. **Total order**: events live in one `Vec` behind a `RwLock`. Appends,
//!    commits and compactions take the write lock, reads take the read lock.
//! 2. **Context-scoped transactions**: a transaction is a [`TxScope`] node
//!    carried by the context. Appends under a transaction go to its buffer and
//!    reach the log contiguously at the outermost commit.
//! 3. **Independent logs**: each log owns its own context keys, so several
//!    logs can coexist in one process without seeing each other's state.
//! 4. **Metadata**: values attached with `set_meta` live in the context only
//!    and are never persisted.

use memport_concurrency::TxScope;
use memport_core::{
    Context, ContextKey, Error, EventLogOptions, MetaAccessor, OnePhaseCommitProtocol, Result,
};
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use std::any::Any;
use std::backtrace::Backtrace;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

// ========== Trace ==========

/// Frame prefixes dropped from captured traces
const SKIPPED_FRAME_PREFIXES: &[&str] = &[
    "memport",
    "<memport",
    "std::",
    "core::",
    "alloc::",
    "test::",
    "<alloc::",
    "<core::",
    "<std::",
    "__rust",
    "__libc",
    "_start",
    "start_thread",
    "clone",
    "proptest::",
];

/// Stack snapshot taken when an event was appended
///
/// Frames are resolved on first access. Frames from memport itself, the
/// standard library and the test harness are filtered out.
#[derive(Clone)]
pub struct Trace {
    backtrace: Arc<Backtrace>,
    frames: Arc<OnceCell<Vec<String>>>,
}

impl Trace {
    fn capture() -> Self {
        Self {
            backtrace: Arc::new(Backtrace::force_capture()),
            frames: Arc::new(OnceCell::new()),
        }
    }

    /// Caller frames, innermost first
    pub fn frames(&self) -> &[String] {
        self.frames.get_or_init(|| {
            self.backtrace
                .to_string()
                .lines()
                .filter_map(parse_frame)
                .filter(|f| !SKIPPED_FRAME_PREFIXES.iter().any(|p| f.starts_with(p)))
                .collect()
        })
    }
}

/// Function name from a rendered backtrace line like `  12: crate::f`
fn parse_frame(line: &str) -> Option<String> {
    let (index, name) = line.trim_start().split_once(": ")?;
    if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(name.trim().to_string())
}

impl fmt::Debug for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.frames()).finish()
    }
}

// ========== Event ==========

/// An opaque, namespaced log entry
#[derive(Clone)]
pub struct Event {
    namespace: String,
    payload: Arc<dyn Any + Send + Sync>,
    wants_trace: bool,
    trace: Option<Trace>,
}

impl Event {
    /// Event without a trace
    pub fn new<T: Any + Send + Sync>(namespace: impl Into<String>, payload: T) -> Self {
        Self {
            namespace: namespace.into(),
            payload: Arc::new(payload),
            wants_trace: false,
            trace: None,
        }
    }

    /// Event that records a stack trace when appended
    pub fn traced<T: Any + Send + Sync>(namespace: impl Into<String>, payload: T) -> Self {
        Self {
            wants_trace: true,
            ..Self::new(namespace, payload)
        }
    }

    /// Namespace the event belongs to
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The payload, if it is a `T`
    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }

    /// Trace captured at append time
    pub fn trace(&self) -> Option<&Trace> {
        self.trace.as_ref()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("namespace", &self.namespace)
            .field("traced", &self.trace.is_some())
            .finish()
    }
}

// ========== EventLog ==========

type MetaMap = HashMap<String, Arc<dyn Any + Send + Sync>>;

struct LogInner {
    events: RwLock<Vec<Event>>,
    txs: TxScope<Vec<Event>>,
    meta_key: ContextKey,
    options: EventLogOptions,
}

/// In-memory event log
///
/// Cloning yields another handle to the same log.
#[derive(Clone)]
pub struct EventLog {
    inner: Arc<LogInner>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    /// Empty log with default options
    pub fn new() -> Self {
        Self::with_options(EventLogOptions::default())
    }

    /// Empty log
    pub fn with_options(options: EventLogOptions) -> Self {
        Self {
            inner: Arc::new(LogInner {
                events: RwLock::new(Vec::new()),
                txs: TxScope::new("event_log"),
                meta_key: ContextKey::new(),
                options,
            }),
        }
    }

    /// Append an event, into the context's transaction if it carries one
    pub fn append(&self, ctx: &Context, mut event: Event) -> Result<()> {
        ctx.check()?;
        if event.wants_trace && self.inner.options.capture_traces {
            event.trace = Some(Trace::capture());
        }

        match self.inner.txs.active(ctx)? {
            Some(tx) => tx.state().push(event),
            None => self.inner.events.write().push(event),
        }
        Ok(())
    }

    /// Begin an isolated transaction
    ///
    /// Its commit appends to the log even when nested, and an enclosing
    /// rollback does not undo it.
    pub fn begin_isolated_tx(&self, ctx: &Context) -> Result<Context> {
        self.inner.txs.begin_isolated(ctx)
    }

    /// `TxDone` if the context's transaction is already finished
    pub fn check_tx(&self, ctx: &Context) -> Result<()> {
        self.inner.txs.active(ctx).map(|_| ())
    }

    /// Whether `ctx` carries an unfinished transaction of this log
    pub fn has_tx(&self, ctx: &Context) -> bool {
        self.inner.txs.lookup(ctx).map_or(false, |tx| !tx.is_done())
    }

    /// Whether committing `ctx`'s transaction writes to the committed log
    ///
    /// True for an outermost or isolated transaction.
    pub fn commits_to_root(&self, ctx: &Context) -> bool {
        self.inner
            .txs
            .lookup(ctx)
            .map_or(false, |tx| tx.parent().is_none() || tx.is_isolated())
    }

    /// Snapshot of the committed events
    pub fn events(&self) -> Vec<Event> {
        self.inner.events.read().clone()
    }

    /// Committed events followed by the pending events of every
    /// transaction in `ctx`, outermost first
    pub fn events_in_context(&self, ctx: &Context) -> Result<Vec<Event>> {
        ctx.check()?;
        let tx = self.inner.txs.active(ctx)?;
        let mut events = self.events();
        if let Some(tx) = tx {
            for node in tx.lineage().iter().rev() {
                events.extend(node.state().iter().cloned());
            }
        }
        Ok(events)
    }

    /// Number of committed events
    pub fn len(&self) -> usize {
        self.inner.events.read().len()
    }

    /// Whether the log has no committed events
    pub fn is_empty(&self) -> bool {
        self.inner.events.read().is_empty()
    }

    /// Distinct namespaces among the committed events
    pub fn namespaces(&self) -> BTreeSet<String> {
        self.inner
            .events
            .read()
            .iter()
            .map(|e| e.namespace.clone())
            .collect()
    }

    /// Rewrite the committed events of `namespace` with `rewrite`
    ///
    /// Events of other namespaces keep their relative order. The rewritten
    /// events take the place of the namespace's first event, or go to the
    /// end if it had none. Appends are blocked while `rewrite` runs.
    pub fn compact<F>(&self, namespace: &str, rewrite: F) -> Result<()>
    where
        F: FnOnce(Vec<Event>) -> Result<Vec<Event>>,
    {
        let mut events = self.inner.events.write();
        let before = events.len();

        let own: Vec<Event> = events
            .iter()
            .filter(|e| e.namespace == namespace)
            .cloned()
            .collect();
        let rewritten = rewrite(own)?;
        if let Some(bad) = rewritten.iter().find(|e| e.namespace != namespace) {
            return Err(Error::Internal(format!(
                "compaction of '{}' produced an event in '{}'",
                namespace, bad.namespace
            )));
        }

        let mut rewritten = Some(rewritten);
        let mut compacted = Vec::with_capacity(events.len());
        for event in events.drain(..) {
            if event.namespace != namespace {
                compacted.push(event);
            } else if let Some(batch) = rewritten.take() {
                compacted.extend(batch);
            }
        }
        if let Some(batch) = rewritten {
            compacted.extend(batch);
        }
        *events = compacted;

        debug!(
            namespace,
            before,
            after = events.len(),
            "event log compacted"
        );
        Ok(())
    }

    fn meta_map(&self, ctx: &Context) -> Option<Arc<MetaMap>> {
        ctx.value::<MetaMap>(self.inner.meta_key)
    }
}

impl OnePhaseCommitProtocol for EventLog {
    fn begin_tx(&self, ctx: &Context) -> Result<Context> {
        self.inner.txs.begin(ctx)
    }

    fn commit_tx(&self, ctx: &Context) -> Result<()> {
        self.inner.txs.commit(ctx, |pending| {
            self.inner.events.write().extend(pending);
            Ok(())
        })
    }

    fn rollback_tx(&self, ctx: &Context) -> Result<()> {
        self.inner.txs.rollback(ctx)
    }
}

impl MetaAccessor for EventLog {
    fn set_meta<T: Any + Send + Sync>(&self, ctx: &Context, key: &str, value: T) -> Result<Context> {
        ctx.check()?;
        let mut map = self
            .meta_map(ctx)
            .map(|m| (*m).clone())
            .unwrap_or_default();
        map.insert(key.to_string(), Arc::new(value));
        Ok(ctx.with_value(self.inner.meta_key, map))
    }

    fn lookup_meta<T: Any + Clone + Send + Sync>(&self, ctx: &Context, key: &str) -> Option<T> {
        self.meta_map(ctx)?
            .get(key)?
            .downcast_ref::<T>()
            .cloned()
    }
}

impl fmt::Debug for EventLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLog")
            .field("len", &self.len())
            .finish()
    }
}
