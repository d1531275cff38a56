//! Context: cancellation, deadlines and scoped values
//!
//! ## Design
//!
//! A [`Context`] is the single carrier for every scope in memport. Transaction
//! handles, lock ownership and metadata are all context values, and every
//! blocking operation observes the context's cancellation.
//!
//! Contexts form a tree of cheap `Arc` nodes. A node introduces a value,
//! a cancellation scope, or detaches from its parent's cancellation.
//! Cancelling a scope cancels every scope derived from it. Values are looked
//! up by walking towards the root.
//!
//! ## Keys
//!
//! Values are keyed by [`ContextKey`], a process-unique token. Each event log,
//! queue, store and lock owns its own keys, so independent instances never
//! see each other's transactions.

use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::warn;

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);
static NEXT_SCOPE: AtomicU64 = AtomicU64::new(1);

/// Process-unique key for context values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextKey(u64);

impl ContextKey {
    /// Issue a fresh key
    pub fn new() -> Self {
        Self(NEXT_KEY.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ContextKey {
    fn default() -> Self {
        Self::new()
    }
}

type Callback = Box<dyn FnOnce() + Send>;

struct ScopeState {
    err: Option<Error>,
    callbacks: Vec<(u64, Callback)>,
    children: Vec<Arc<Scope>>,
    next_callback: u64,
}

/// A cancellation scope shared by every context derived below it
///
/// A parent keeps its live children alive until they are cancelled, so a
/// scope's callbacks still run on parent cancellation after every context
/// naming the scope was dropped.
struct Scope {
    id: u64,
    parent: Weak<Scope>,
    state: Mutex<ScopeState>,
    cond: Condvar,
    deadline: Option<Instant>,
}

impl Scope {
    fn new(parent: Option<&Arc<Scope>>, deadline: Option<Instant>) -> Arc<Scope> {
        // A child never outlives its parent's deadline.
        let deadline = match (parent.and_then(|p| p.deadline), deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let scope = Arc::new(Scope {
            id: NEXT_SCOPE.fetch_add(1, Ordering::Relaxed),
            parent: parent.map(Arc::downgrade).unwrap_or_default(),
            state: Mutex::new(ScopeState {
                err: None,
                callbacks: Vec::new(),
                children: Vec::new(),
                next_callback: 0,
            }),
            cond: Condvar::new(),
            deadline,
        });

        if let Some(parent) = parent {
            let inherited = {
                let mut state = parent.state.lock();
                match &state.err {
                    Some(err) => Some(err.clone()),
                    None => {
                        state.children.push(Arc::clone(&scope));
                        None
                    }
                }
            };
            if let Some(err) = inherited {
                scope.cancel(err);
            }
        }
        scope
    }

    fn err(&self) -> Option<Error> {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                self.cancel(Error::DeadlineExceeded);
            }
        }
        self.state.lock().err.clone()
    }

    fn cancel(&self, err: Error) {
        let (callbacks, children) = {
            let mut state = self.state.lock();
            if state.err.is_some() {
                return;
            }
            state.err = Some(err.clone());
            (
                std::mem::take(&mut state.callbacks),
                std::mem::take(&mut state.children),
            )
        };
        self.cond.notify_all();

        if let Some(parent) = self.parent.upgrade() {
            parent.state.lock().children.retain(|c| c.id != self.id);
        }
        for child in children {
            child.cancel(err.clone());
        }
        // Callbacks run outside the state lock so they may touch other scopes.
        for (_, callback) in callbacks {
            callback();
        }
    }

    fn wait_timeout(&self, timeout: Duration) -> bool {
        let timeout = match self.deadline {
            Some(deadline) => timeout.min(deadline.saturating_duration_since(Instant::now())),
            None => timeout,
        };
        {
            let mut state = self.state.lock();
            if state.err.is_none() {
                self.cond.wait_for(&mut state, timeout);
            }
        }
        self.err().is_some()
    }

    fn register(self: &Arc<Self>, callback: Callback) -> Option<u64> {
        let callback = {
            let mut state = self.state.lock();
            if state.err.is_none() {
                let id = state.next_callback;
                state.next_callback += 1;
                state.callbacks.push((id, callback));
                return Some(id);
            }
            callback
        };
        callback();
        None
    }

    fn deregister(&self, id: u64) -> bool {
        let mut state = self.state.lock();
        let before = state.callbacks.len();
        state.callbacks.retain(|(cid, _)| *cid != id);
        state.callbacks.len() != before
    }
}

fn spawn_deadline_timer(scope: &Arc<Scope>) {
    let Some(deadline) = scope.deadline else {
        return;
    };
    let weak = Arc::downgrade(scope);
    let spawned = std::thread::Builder::new()
        .name("memport-deadline".to_string())
        .spawn(move || loop {
            let Some(scope) = weak.upgrade() else {
                return;
            };
            let now = Instant::now();
            if now >= deadline {
                scope.cancel(Error::DeadlineExceeded);
                return;
            }
            if scope.wait_timeout(deadline - now) {
                return;
            }
        });
    if let Err(e) = spawned {
        // Deadlines are still enforced lazily on every err() check.
        warn!(error = %e, "failed to spawn deadline timer");
    }
}

struct Node {
    parent: Option<Context>,
    scope: Option<Arc<Scope>>,
    value: Option<(ContextKey, Arc<dyn Any + Send + Sync>)>,
}

/// Carrier for cancellation, deadlines and scoped values
///
/// Cloning a context is cheap and yields the same scope.
///
/// # Example
///
/// ```
/// use memport_core::{Context, ContextKey};
///
/// let key = ContextKey::new();
/// let (ctx, cancel) = Context::background().with_cancel();
/// let ctx = ctx.with_value(key, 42u32);
///
/// assert_eq!(*ctx.value::<u32>(key).unwrap(), 42);
/// cancel.cancel();
/// assert!(ctx.is_cancelled());
/// ```
#[derive(Clone)]
pub struct Context {
    node: Arc<Node>,
}

impl Context {
    /// A root context that is never cancelled
    pub fn background() -> Self {
        Self {
            node: Arc::new(Node {
                parent: None,
                scope: None,
                value: None,
            }),
        }
    }

    /// Derive a child with its own cancellation scope
    pub fn with_cancel(&self) -> (Context, CancelHandle) {
        let scope = Scope::new(self.node.scope.as_ref(), None);
        (self.child_with_scope(scope.clone()), CancelHandle { scope })
    }

    /// Derive a child that is cancelled at `deadline`
    pub fn with_deadline(&self, deadline: Instant) -> (Context, CancelHandle) {
        let scope = Scope::new(self.node.scope.as_ref(), Some(deadline));
        spawn_deadline_timer(&scope);
        (self.child_with_scope(scope.clone()), CancelHandle { scope })
    }

    /// Derive a child that is cancelled after `timeout`
    pub fn with_timeout(&self, timeout: Duration) -> (Context, CancelHandle) {
        self.with_deadline(Instant::now() + timeout)
    }

    fn child_with_scope(&self, scope: Arc<Scope>) -> Context {
        Context {
            node: Arc::new(Node {
                parent: Some(self.clone()),
                scope: Some(scope),
                value: None,
            }),
        }
    }

    /// Derive a child carrying `value` under `key`
    pub fn with_value<T: Any + Send + Sync>(&self, key: ContextKey, value: T) -> Context {
        self.with_shared_value(key, Arc::new(value))
    }

    /// Derive a child carrying an already shared value under `key`
    pub fn with_shared_value<T: Any + Send + Sync>(&self, key: ContextKey, value: Arc<T>) -> Context {
        Context {
            node: Arc::new(Node {
                parent: Some(self.clone()),
                scope: self.node.scope.clone(),
                value: Some((key, value)),
            }),
        }
    }

    /// Look up the nearest value stored under `key`
    ///
    /// Returns `None` when no value exists or it is not a `T`.
    pub fn value<T: Any + Send + Sync>(&self, key: ContextKey) -> Option<Arc<T>> {
        let mut current = Some(self);
        while let Some(ctx) = current {
            if let Some((k, v)) = &ctx.node.value {
                if *k == key {
                    return Arc::clone(v).downcast::<T>().ok();
                }
            }
            current = ctx.node.parent.as_ref();
        }
        None
    }

    /// Like [`Context::value`], failing with `NoCtx` when absent
    pub fn require_value<T: Any + Send + Sync>(&self, key: ContextKey, what: &str) -> Result<Arc<T>> {
        self.value(key).ok_or_else(|| Error::NoCtx(what.to_string()))
    }

    /// A child keeping this context's values but none of its cancellation
    pub fn detached(&self) -> Context {
        Context {
            node: Arc::new(Node {
                parent: Some(self.clone()),
                scope: None,
                value: None,
            }),
        }
    }

    /// The cancellation reason, if cancelled
    pub fn err(&self) -> Option<Error> {
        self.node.scope.as_ref().and_then(|s| s.err())
    }

    /// `Err` with the cancellation reason, if cancelled
    pub fn check(&self) -> Result<()> {
        match self.err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Whether this context has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.err().is_some()
    }

    /// The effective deadline, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.node.scope.as_ref().and_then(|s| s.deadline)
    }

    /// Block for up to `timeout` or until cancelled
    ///
    /// Returns `true` if the context is cancelled. This is the cooperative
    /// suspension point used by every polling loop in memport.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match &self.node.scope {
            Some(scope) => scope.wait_timeout(timeout),
            None => {
                std::thread::sleep(timeout);
                false
            }
        }
    }

    /// Run `callback` once when this context is cancelled
    ///
    /// Runs immediately if already cancelled. A context that can never be
    /// cancelled never runs the callback.
    pub fn after_cancel(&self, callback: impl FnOnce() + Send + 'static) -> CancelRegistration {
        match &self.node.scope {
            Some(scope) => {
                let id = scope.register(Box::new(callback));
                CancelRegistration {
                    scope: Arc::downgrade(scope),
                    id,
                }
            }
            None => CancelRegistration {
                scope: Weak::new(),
                id: None,
            },
        }
    }

    /// Whether two contexts share the same node
    pub fn ptr_eq(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("cancellable", &self.node.scope.is_some())
            .field("err", &self.err())
            .finish()
    }
}

/// Cancels the scope created by [`Context::with_cancel`]
#[derive(Clone)]
pub struct CancelHandle {
    scope: Arc<Scope>,
}

impl CancelHandle {
    /// Cancel the scope and every scope derived from it
    ///
    /// Idempotent; the first reason wins.
    pub fn cancel(&self) {
        self.scope.cancel(Error::Cancelled);
    }

    /// Whether the scope is cancelled
    pub fn is_cancelled(&self) -> bool {
        self.scope.err().is_some()
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Handle to a callback registered with [`Context::after_cancel`]
#[derive(Debug)]
pub struct CancelRegistration {
    scope: Weak<Scope>,
    id: Option<u64>,
}

impl CancelRegistration {
    /// Deregister the callback
    ///
    /// Returns `true` if the callback was removed before it ran.
    pub fn stop(&self) -> bool {
        match (self.scope.upgrade(), self.id) {
            (Some(scope), Some(id)) => scope.deregister(id),
            _ => false,
        }
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope").field("deadline", &self.deadline).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_background_never_cancelled() {
        let ctx = Context::background();
        assert!(ctx.check().is_ok());
        assert!(!ctx.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn test_cancel_propagates_to_children() {
        let (parent, cancel) = Context::background().with_cancel();
        let (child, _) = parent.with_cancel();
        let grandchild = child.with_value(ContextKey::new(), "v");

        cancel.cancel();

        assert!(parent.is_cancelled());
        assert!(child.is_cancelled());
        assert_eq!(grandchild.err().unwrap().kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_child_cancel_does_not_affect_parent() {
        let (parent, _keep) = Context::background().with_cancel();
        let (child, cancel) = parent.with_cancel();
        cancel.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn test_child_of_cancelled_is_cancelled() {
        let (parent, cancel) = Context::background().with_cancel();
        cancel.cancel();
        let (child, _) = parent.with_cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_values_shadow_and_lookup() {
        let key = ContextKey::new();
        let other = ContextKey::new();
        let ctx = Context::background().with_value(key, 1i32);
        let ctx = ctx.with_value(other, "x".to_string());
        let ctx = ctx.with_value(key, 2i32);

        assert_eq!(*ctx.value::<i32>(key).unwrap(), 2);
        assert_eq!(ctx.value::<String>(other).unwrap().as_str(), "x");
        assert!(ctx.value::<String>(key).is_none());
        assert!(ctx.value::<i32>(ContextKey::new()).is_none());
    }

    #[test]
    fn test_require_value_missing() {
        let err = Context::background()
            .require_value::<i32>(ContextKey::new(), "answer")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoCtx);
    }

    #[test]
    fn test_detached_keeps_values_drops_cancel() {
        let key = ContextKey::new();
        let (ctx, cancel) = Context::background().with_cancel();
        let ctx = ctx.with_value(key, 7u8);
        let detached = ctx.detached();

        cancel.cancel();

        assert!(ctx.is_cancelled());
        assert!(!detached.is_cancelled());
        assert_eq!(*detached.value::<u8>(key).unwrap(), 7);
    }

    #[test]
    fn test_timeout_cancels_with_deadline_exceeded() {
        let (ctx, _cancel) = Context::background().with_timeout(Duration::from_millis(20));
        assert!(ctx.wait_timeout(Duration::from_secs(5)));
        assert_eq!(ctx.err().unwrap().kind(), ErrorKind::DeadlineExceeded);
    }

    #[test]
    fn test_after_cancel_runs_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (ctx, cancel) = Context::background().with_cancel();
        let c = Arc::clone(&counter);
        ctx.after_cancel(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        cancel.cancel();
        cancel.cancel();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_after_cancel_on_cancelled_runs_immediately() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (ctx, cancel) = Context::background().with_cancel();
        cancel.cancel();
        let c = Arc::clone(&counter);
        let reg = ctx.after_cancel(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!reg.stop());
    }

    #[test]
    fn test_after_cancel_stop() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (ctx, cancel) = Context::background().with_cancel();
        let c = Arc::clone(&counter);
        let reg = ctx.after_cancel(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(reg.stop());
        cancel.cancel();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_dropped_child_still_runs_callbacks_on_parent_cancel() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (parent, cancel) = Context::background().with_cancel();
        {
            let (child, _) = parent.with_cancel();
            let c = Arc::clone(&counter);
            child.after_cancel(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }

        cancel.cancel();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancelled_child_leaves_parent() {
        let (parent, _keep) = Context::background().with_cancel();
        let (_child, cancel) = parent.with_cancel();
        let scope = parent.node.scope.clone().unwrap();
        assert_eq!(scope.state.lock().children.len(), 1);
        cancel.cancel();
        assert!(scope.state.lock().children.is_empty());
    }

    #[test]
    fn test_wait_wakes_on_cancel() {
        let (ctx, cancel) = Context::background().with_cancel();
        let waiter = {
            let ctx = ctx.clone();
            std::thread::spawn(move || {
                let start = Instant::now();
                let cancelled = ctx.wait_timeout(Duration::from_secs(10));
                (cancelled, start.elapsed())
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        cancel.cancel();
        let (cancelled, elapsed) = waiter.join().unwrap();
        assert!(cancelled);
        assert!(elapsed < Duration::from_secs(5));
    }
}
