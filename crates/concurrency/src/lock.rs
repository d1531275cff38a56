//! Context-carried mutual exclusion
//!
//! [`Lock::acquire`] returns a *lock context*: a child of the caller's context
//! that carries a handle to the held lock. Passing that context back to
//! `acquire` re-enters without blocking, and passing it to
//! [`Lock::release`] unlocks.
//!
//! ## Lifetime
//!
//! A lock context dies at `release` or when its parent is cancelled, and
//! either event unlocks exactly once, even if the lock context itself was
//! already dropped. Forgetting to release a lock taken on a context that is
//! never cancelled keeps it held.

use memport_core::{CancelHandle, Context, ContextKey, Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Upper bound on one blocking wait before cancellation is re-checked
const ACQUIRE_POLL: Duration = Duration::from_millis(5);

struct LockState {
    key: ContextKey,
    held: Mutex<bool>,
    unlocked: Condvar,
}

impl LockState {
    fn unlock(&self) {
        let mut held = self.held.lock();
        *held = false;
        self.unlocked.notify_one();
    }
}

/// Held-lock marker stored in the lock context
struct LockHandle {
    cancel: CancelHandle,
    released: Arc<AtomicBool>,
}

/// A mutual-exclusion lock whose ownership travels with a [`Context`]
#[derive(Clone)]
pub struct Lock {
    state: Arc<LockState>,
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

impl Lock {
    /// A new, unlocked lock
    pub fn new() -> Self {
        Self {
            state: Arc::new(LockState {
                key: ContextKey::new(),
                held: Mutex::new(false),
                unlocked: Condvar::new(),
            }),
        }
    }

    fn owned_by(&self, ctx: &Context) -> bool {
        ctx.value::<LockHandle>(self.state.key)
            .map(|h| !h.released.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Acquire the lock, blocking until it is free or `ctx` is cancelled
    ///
    /// If `ctx` already carries this lock, it is returned unchanged.
    pub fn acquire(&self, ctx: &Context) -> Result<Context> {
        if self.owned_by(ctx) {
            return Ok(ctx.clone());
        }
        ctx.check()?;

        {
            let mut held = self.state.held.lock();
            while *held {
                if let Some(err) = ctx.err() {
                    return Err(err);
                }
                self.state.unlocked.wait_for(&mut held, ACQUIRE_POLL);
            }
            *held = true;
        }

        let lock_ctx = self.attach(ctx);
        // A cancellation racing the acquisition has already unlocked us.
        lock_ctx.check()?;
        trace!(key = ?self.state.key, "lock acquired");
        Ok(lock_ctx)
    }

    /// Acquire the lock only if it is free right now
    pub fn try_acquire(&self, ctx: &Context) -> Result<Option<Context>> {
        if self.owned_by(ctx) {
            return Ok(Some(ctx.clone()));
        }
        ctx.check()?;

        {
            let mut held = self.state.held.lock();
            if *held {
                return Ok(None);
            }
            *held = true;
        }

        let lock_ctx = self.attach(ctx);
        lock_ctx.check()?;
        Ok(Some(lock_ctx))
    }

    /// Release the lock carried by `lock_ctx`
    ///
    /// Idempotent. Fails with `NoLock` if `lock_ctx` was not produced by
    /// [`Lock::acquire`] on this lock.
    pub fn release(&self, lock_ctx: &Context) -> Result<()> {
        let handle = lock_ctx
            .value::<LockHandle>(self.state.key)
            .ok_or(Error::NoLock)?;
        handle.cancel.cancel();
        trace!(key = ?self.state.key, "lock released");
        Ok(())
    }

    /// Whether some context currently holds the lock
    pub fn is_locked(&self) -> bool {
        *self.state.held.lock()
    }

    fn attach(&self, ctx: &Context) -> Context {
        let (child, cancel) = ctx.with_cancel();
        let released = Arc::new(AtomicBool::new(false));

        let state = Arc::clone(&self.state);
        let flag = Arc::clone(&released);
        child.after_cancel(move || {
            if !flag.swap(true, Ordering::AcqRel) {
                state.unlock();
            }
        });

        child.with_value(self.state.key, LockHandle { cancel, released })
    }
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lock")
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// Hands out one [`Lock`] per key
///
/// Locks are created on first use and live as long as the factory.
pub struct LockFactory<K> {
    locks: Mutex<HashMap<K, Lock>>,
}

impl<K: Eq + Hash + Clone> LockFactory<K> {
    /// Empty factory
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The lock for `key`
    pub fn lock_for(&self, key: &K) -> Lock {
        let mut locks = self.locks.lock();
        if let Some(lock) = locks.get(key) {
            return lock.clone();
        }
        let lock = Lock::new();
        locks.insert(key.clone(), lock.clone());
        lock
    }

    /// Number of keys with a lock
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    /// Whether no lock was created yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash + Clone> Default for LockFactory<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memport_core::ErrorKind;
    use std::sync::mpsc;
    use std::time::Instant;

    #[test]
    fn test_acquire_and_release() {
        let lock = Lock::new();
        let ctx = Context::background();
        let lock_ctx = lock.acquire(&ctx).unwrap();
        assert!(lock.is_locked());
        lock.release(&lock_ctx).unwrap();
        assert!(!lock.is_locked());
        assert!(lock_ctx.is_cancelled());
    }

    #[test]
    fn test_release_is_idempotent() {
        let lock = Lock::new();
        let lock_ctx = lock.acquire(&Context::background()).unwrap();
        lock.release(&lock_ctx).unwrap();
        lock.release(&lock_ctx).unwrap();
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_release_without_lock() {
        let lock = Lock::new();
        let err = lock.release(&Context::background()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoLock);

        let other = Lock::new();
        let lock_ctx = other.acquire(&Context::background()).unwrap();
        assert_eq!(lock.release(&lock_ctx).unwrap_err().kind(), ErrorKind::NoLock);
    }

    #[test]
    fn test_reentrant_acquire_returns_same_context() {
        let lock = Lock::new();
        let lock_ctx = lock.acquire(&Context::background()).unwrap();
        let again = lock.acquire(&lock_ctx).unwrap();
        assert!(again.ptr_eq(&lock_ctx));
        lock.release(&again).unwrap();
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_parent_cancellation_unlocks() {
        let lock = Lock::new();
        let (ctx, cancel) = Context::background().with_cancel();
        let _lock_ctx = lock.acquire(&ctx).unwrap();
        assert!(lock.is_locked());
        cancel.cancel();
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_dropped_lock_context_unlocks_on_parent_cancel() {
        let lock = Lock::new();
        let (ctx, cancel) = Context::background().with_cancel();
        drop(lock.acquire(&ctx).unwrap());
        assert!(lock.is_locked());

        cancel.cancel();
        assert!(!lock.is_locked());
        let again = lock.acquire(&Context::background()).unwrap();
        lock.release(&again).unwrap();
    }

    #[test]
    fn test_acquire_on_cancelled_context() {
        let lock = Lock::new();
        let (ctx, cancel) = Context::background().with_cancel();
        cancel.cancel();
        assert!(lock.acquire(&ctx).unwrap_err().is_cancellation());
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_waiter_gives_up_on_timeout() {
        let lock = Lock::new();
        let held = lock.acquire(&Context::background()).unwrap();
        let (ctx, _cancel) = Context::background().with_timeout(Duration::from_millis(30));
        let err = lock.acquire(&ctx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
        lock.release(&held).unwrap();
    }

    #[test]
    fn test_try_acquire() {
        let lock = Lock::new();
        let ctx = Context::background();
        let held = lock.try_acquire(&ctx).unwrap().unwrap();
        assert!(lock.try_acquire(&ctx).unwrap().is_none());
        assert!(lock.try_acquire(&held).unwrap().is_some());
        lock.release(&held).unwrap();
        assert!(lock.try_acquire(&ctx).unwrap().is_some());
    }

    #[test]
    fn test_contender_blocks_until_release() {
        let lock = Lock::new();
        let first = lock.acquire(&Context::background()).unwrap();

        let (tx, rx) = mpsc::channel();
        let contender = lock.clone();
        let handle = std::thread::spawn(move || {
            let start = Instant::now();
            let ctx = contender.acquire(&Context::background()).unwrap();
            tx.send(start.elapsed()).unwrap();
            contender.release(&ctx).unwrap();
        });

        std::thread::sleep(Duration::from_millis(60));
        assert!(rx.try_recv().is_err());
        lock.release(&first).unwrap();

        let waited = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(waited >= Duration::from_millis(50));
        handle.join().unwrap();
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_factory_returns_same_lock_per_key() {
        let factory = LockFactory::<String>::new();
        let a = factory.lock_for(&"a".to_string());
        let a2 = factory.lock_for(&"a".to_string());
        let b = factory.lock_for(&"b".to_string());

        let held = a.acquire(&Context::background()).unwrap();
        assert!(a2.is_locked());
        assert!(!b.is_locked());
        a.release(&held).unwrap();
        assert_eq!(factory.len(), 2);
    }
}
