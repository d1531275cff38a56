//! Context-scoped nested transactions
//!
//! A [`TxScope`] owns one context key. `begin` wraps whatever transaction the
//! context already carries as the parent and installs a fresh [`TxNode`] in a
//! child context; `commit` and `rollback` dispose of exactly that node.
//!
//! ## Semantics
//!
//! - Committing a nested node folds its buffer into the parent's buffer.
//!   Only the outermost commit hands the buffer to the owner's root apply.
//! - Rollback discards the node's buffer and, in the default cascading style,
//!   every ancestor's too. Effects folded up from committed children are lost.
//! - An isolated node (see [`TxScope::begin_isolated`]) commits straight to the
//!   root and its rollback does not cascade.
//! - A node is disposed exactly once; the second disposal fails with `TxDone`.
//! - Commit on a cancelled context rolls back and returns the cancellation
//!   reason.
//!
//! The node's buffer type `S` decides what "fold into parent" means via
//! [`TxBuffer`].

use memport_core::{CancelHandle, Context, ContextKey, Error, Result};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

static NEXT_TX_ID: AtomicU64 = AtomicU64::new(1);

/// Pending state buffered by a transaction node
pub trait TxBuffer: Default + Send + 'static {
    /// Merge a committed child's buffer into this (parent) buffer
    fn fold_child(&mut self, child: Self);
}

impl<T: Send + 'static> TxBuffer for Vec<T> {
    fn fold_child(&mut self, child: Self) {
        self.extend(child);
    }
}

/// One transaction in a parent chain
pub struct TxNode<S> {
    id: u64,
    parent: Option<Arc<TxNode<S>>>,
    isolated: bool,
    state: Mutex<S>,
    done: AtomicBool,
    cancel: CancelHandle,
}

impl<S> TxNode<S> {
    /// Process-unique transaction id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The enclosing transaction, if nested
    pub fn parent(&self) -> Option<&Arc<TxNode<S>>> {
        self.parent.as_ref()
    }

    /// Whether this node commits straight to the root
    pub fn is_isolated(&self) -> bool {
        self.isolated
    }

    /// Whether this node was committed or rolled back
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Nesting depth, 1 for an outermost transaction
    pub fn depth(&self) -> usize {
        1 + self.parent.as_ref().map_or(0, |p| p.depth())
    }

    /// Lock the pending buffer
    pub fn state(&self) -> MutexGuard<'_, S> {
        self.state.lock()
    }

    /// `TxDone` if this node is already disposed
    pub fn ensure_active(&self) -> Result<()> {
        if self.is_done() {
            Err(Error::TxDone)
        } else {
            Ok(())
        }
    }

    /// This node followed by its ancestors, innermost first
    pub fn lineage(self: &Arc<Self>) -> Vec<Arc<TxNode<S>>> {
        let mut chain = vec![Arc::clone(self)];
        let mut current = self.parent.clone();
        while let Some(node) = current {
            current = node.parent.clone();
            chain.push(node);
        }
        chain
    }

    fn mark_done(&self) -> Result<()> {
        if self.done.swap(true, Ordering::AcqRel) {
            Err(Error::TxDone)
        } else {
            Ok(())
        }
    }
}

impl<S: TxBuffer> TxNode<S> {
    fn discard(&self) {
        *self.state.lock() = S::default();
        self.cancel.cancel();
    }
}

/// Registry of transactions for one owner (event log, store, queue)
pub struct TxScope<S> {
    key: ContextKey,
    name: &'static str,
    _buffer: std::marker::PhantomData<fn() -> S>,
}

impl<S: TxBuffer> TxScope<S> {
    /// New scope; `name` labels log records
    pub fn new(name: &'static str) -> Self {
        Self {
            key: ContextKey::new(),
            name,
            _buffer: std::marker::PhantomData,
        }
    }

    /// The context key transactions of this scope are stored under
    pub fn key(&self) -> ContextKey {
        self.key
    }

    /// The innermost transaction carried by `ctx`, done or not
    pub fn lookup(&self, ctx: &Context) -> Option<Arc<TxNode<S>>> {
        ctx.value::<TxNode<S>>(self.key)
    }

    /// The innermost transaction carried by `ctx`, failing if it is done
    pub fn active(&self, ctx: &Context) -> Result<Option<Arc<TxNode<S>>>> {
        match self.lookup(ctx) {
            Some(node) => {
                node.ensure_active()?;
                Ok(Some(node))
            }
            None => Ok(None),
        }
    }

    /// Begin a cascading transaction nested in `ctx`'s current one
    pub fn begin(&self, ctx: &Context) -> Result<Context> {
        self.begin_with(ctx, false)
    }

    /// Begin an isolated transaction
    ///
    /// Its commit applies to the root even when nested, and rolling back an
    /// enclosing transaction does not undo it.
    pub fn begin_isolated(&self, ctx: &Context) -> Result<Context> {
        self.begin_with(ctx, true)
    }

    fn begin_with(&self, ctx: &Context, isolated: bool) -> Result<Context> {
        ctx.check()?;
        let parent = self.active(ctx)?;
        let (child, cancel) = ctx.with_cancel();
        let node = TxNode {
            id: NEXT_TX_ID.fetch_add(1, Ordering::Relaxed),
            parent,
            isolated,
            state: Mutex::new(S::default()),
            done: AtomicBool::new(false),
            cancel,
        };
        debug!(
            scope = self.name,
            tx = node.id,
            depth = node.depth(),
            isolated,
            "transaction begun"
        );
        Ok(child.with_value(self.key, node))
    }

    /// Commit the transaction carried by `ctx`
    ///
    /// A nested buffer is folded into its parent. An outermost (or isolated)
    /// buffer is passed to `apply_root`, whose error is returned.
    pub fn commit(&self, ctx: &Context, apply_root: impl FnOnce(S) -> Result<()>) -> Result<()> {
        let node = self.lookup(ctx).ok_or(Error::NoTx)?;
        node.ensure_active()?;

        if let Some(err) = ctx.err() {
            return match self.rollback(ctx) {
                Ok(()) => Err(err),
                Err(rollback) => Err(err.join(rollback)),
            };
        }

        node.mark_done()?;
        let pending = std::mem::take(&mut *node.state.lock());

        let result = match node.parent.as_ref().filter(|_| !node.isolated) {
            Some(parent) => {
                let mut parent_state = parent.state.lock();
                // Checked under the parent's lock so a racing rollback cannot
                // lose the fold silently.
                if parent.is_done() {
                    Err(Error::TxDone)
                } else {
                    parent_state.fold_child(pending);
                    Ok(())
                }
            }
            None => apply_root(pending),
        };

        node.cancel.cancel();
        debug!(
            scope = self.name,
            tx = node.id,
            ok = result.is_ok(),
            "transaction committed"
        );
        result
    }

    /// Roll back the transaction carried by `ctx`
    ///
    /// Never checks cancellation, so cleanup always runs.
    pub fn rollback(&self, ctx: &Context) -> Result<()> {
        let node = self.lookup(ctx).ok_or(Error::NoTx)?;
        node.mark_done()?;
        node.discard();
        debug!(scope = self.name, tx = node.id, "transaction rolled back");

        if !node.isolated {
            let mut current = node.parent.clone();
            while let Some(parent) = current {
                if parent.mark_done().is_err() {
                    break;
                }
                parent.discard();
                debug!(scope = self.name, tx = parent.id, "transaction rolled back by child");
                if parent.isolated {
                    break;
                }
                current = parent.parent.clone();
            }
        }
        Ok(())
    }
}

impl<S> std::fmt::Debug for TxScope<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxScope")
            .field("name", &self.name)
            .field("key", &self.key)
            .finish()
    }
}
