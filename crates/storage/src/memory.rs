//! Memory: namespaced key/value store with transactional overlays
//!
//! Backs the direct repository. Each namespace is an ordered map from id key
//! to a shared, type-erased value. A transaction buffers its writes in an
//! overlay per namespace instead of touching the maps.
//!
//! ## Reads under a transaction
//!
//! The innermost overlay is consulted first: an override wins, a tombstone
//! hides the key, a `cleared` overlay hides everything beneath it. Otherwise
//! the lookup falls through to the parent transaction and finally the store.

use memport_concurrency::{TxBuffer, TxNode, TxScope};
use memport_core::{Context, OnePhaseCommitProtocol, Result};
use parking_lot::RwLock;
use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// A stored value
pub type StoredValue = Arc<dyn Any + Send + Sync>;

/// Pending writes of one transaction in one namespace
#[derive(Default)]
struct Overlay {
    cleared: bool,
    overrides: HashMap<String, StoredValue>,
    tombstones: HashSet<String>,
}

impl Overlay {
    fn put(&mut self, key: String, value: StoredValue) {
        self.tombstones.remove(&key);
        self.overrides.insert(key, value);
    }

    fn remove(&mut self, key: &str) {
        self.overrides.remove(key);
        self.tombstones.insert(key.to_string());
    }

    fn clear(&mut self) {
        self.overrides.clear();
        self.tombstones.clear();
        self.cleared = true;
    }

    /// `Some(answer)` if this overlay decides the lookup
    fn resolve(&self, key: &str) -> Option<Option<StoredValue>> {
        if let Some(v) = self.overrides.get(key) {
            return Some(Some(Arc::clone(v)));
        }
        if self.cleared || self.tombstones.contains(key) {
            return Some(None);
        }
        None
    }

    fn apply_to(self, map: &mut BTreeMap<String, StoredValue>) {
        if self.cleared {
            map.clear();
        }
        for key in &self.tombstones {
            map.remove(key);
        }
        map.extend(self.overrides);
    }

    fn fold_into(self, parent: &mut Overlay) {
        if self.cleared {
            parent.clear();
        }
        for key in self.tombstones {
            parent.remove(&key);
        }
        for (key, value) in self.overrides {
            parent.put(key, value);
        }
    }
}

/// Transaction buffer: one overlay per touched namespace
#[derive(Default)]
struct MemoryTx {
    namespaces: HashMap<String, Overlay>,
}

impl TxBuffer for MemoryTx {
    fn fold_child(&mut self, child: Self) {
        for (ns, overlay) in child.namespaces {
            overlay.fold_into(self.namespaces.entry(ns).or_default());
        }
    }
}

type Namespaces = HashMap<String, BTreeMap<String, StoredValue>>;

struct MemoryInner {
    namespaces: RwLock<Namespaces>,
    txs: TxScope<MemoryTx>,
}

/// Shared in-memory store
///
/// Cloning yields another handle to the same store.
#[derive(Clone)]
pub struct Memory {
    inner: Arc<MemoryInner>,
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

impl Memory {
    /// Empty store
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                namespaces: RwLock::new(HashMap::new()),
                txs: TxScope::new("memory"),
            }),
        }
    }

    fn tx(&self, ctx: &Context) -> Result<Option<Arc<TxNode<MemoryTx>>>> {
        ctx.check()?;
        self.inner.txs.active(ctx)
    }

    /// Value under `key`, as seen from `ctx`
    pub fn get(&self, ctx: &Context, namespace: &str, key: &str) -> Result<Option<StoredValue>> {
        if let Some(tx) = self.tx(ctx)? {
            for node in tx.lineage() {
                let state = node.state();
                if let Some(answer) = state.namespaces.get(namespace).and_then(|o| o.resolve(key)) {
                    return Ok(answer);
                }
            }
        }
        Ok(self
            .inner
            .namespaces
            .read()
            .get(namespace)
            .and_then(|m| m.get(key))
            .cloned())
    }

    /// Whether `key` exists, as seen from `ctx`
    pub fn contains(&self, ctx: &Context, namespace: &str, key: &str) -> Result<bool> {
        Ok(self.get(ctx, namespace, key)?.is_some())
    }

    /// Store `value` under `key`
    pub fn put(&self, ctx: &Context, namespace: &str, key: &str, value: StoredValue) -> Result<()> {
        match self.tx(ctx)? {
            Some(tx) => tx
                .state()
                .namespaces
                .entry(namespace.to_string())
                .or_default()
                .put(key.to_string(), value),
            None => {
                self.inner
                    .namespaces
                    .write()
                    .entry(namespace.to_string())
                    .or_default()
                    .insert(key.to_string(), value);
            }
        }
        Ok(())
    }

    /// Remove `key`; absent keys are ignored
    pub fn remove(&self, ctx: &Context, namespace: &str, key: &str) -> Result<()> {
        match self.tx(ctx)? {
            Some(tx) => tx
                .state()
                .namespaces
                .entry(namespace.to_string())
                .or_default()
                .remove(key),
            None => {
                if let Some(map) = self.inner.namespaces.write().get_mut(namespace) {
                    map.remove(key);
                }
            }
        }
        Ok(())
    }

    /// Remove every key of `namespace`
    pub fn clear(&self, ctx: &Context, namespace: &str) -> Result<()> {
        match self.tx(ctx)? {
            Some(tx) => tx
                .state()
                .namespaces
                .entry(namespace.to_string())
                .or_default()
                .clear(),
            None => {
                self.inner.namespaces.write().remove(namespace);
            }
        }
        Ok(())
    }

    /// Every entry of `namespace` as seen from `ctx`, ordered by key
    pub fn snapshot(&self, ctx: &Context, namespace: &str) -> Result<BTreeMap<String, StoredValue>> {
        let tx = self.tx(ctx)?;
        let mut view = self
            .inner
            .namespaces
            .read()
            .get(namespace)
            .cloned()
            .unwrap_or_default();

        if let Some(tx) = tx {
            for node in tx.lineage().iter().rev() {
                let state = node.state();
                if let Some(overlay) = state.namespaces.get(namespace) {
                    if overlay.cleared {
                        view.clear();
                    }
                    for key in &overlay.tombstones {
                        view.remove(key);
                    }
                    for (key, value) in &overlay.overrides {
                        view.insert(key.clone(), Arc::clone(value));
                    }
                }
            }
        }
        Ok(view)
    }

    /// Number of committed entries in `namespace`
    pub fn len(&self, namespace: &str) -> usize {
        self.inner
            .namespaces
            .read()
            .get(namespace)
            .map_or(0, |m| m.len())
    }

    /// Begin an isolated transaction
    pub fn begin_isolated_tx(&self, ctx: &Context) -> Result<Context> {
        self.inner.txs.begin_isolated(ctx)
    }

    /// `TxDone` if the context's transaction is already finished
    pub fn check_tx(&self, ctx: &Context) -> Result<()> {
        self.inner.txs.active(ctx).map(|_| ())
    }
}

impl OnePhaseCommitProtocol for Memory {
    fn begin_tx(&self, ctx: &Context) -> Result<Context> {
        self.inner.txs.begin(ctx)
    }

    fn commit_tx(&self, ctx: &Context) -> Result<()> {
        self.inner.txs.commit(ctx, |pending| {
            let mut namespaces = self.inner.namespaces.write();
            for (ns, overlay) in pending.namespaces {
                let map = namespaces.entry(ns).or_default();
                overlay.apply_to(map);
            }
            namespaces.retain(|_, m| !m.is_empty());
            Ok(())
        })
    }

    fn rollback_tx(&self, ctx: &Context) -> Result<()> {
        self.inner.txs.rollback(ctx)
    }
}

impl fmt::Debug for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let namespaces = self.inner.namespaces.read();
        f.debug_map()
            .entries(namespaces.iter().map(|(ns, m)| (ns, m.len())))
            .finish()
    }
}
