//! Multi-threaded tests for memport-concurrency
//!
//! These exercise the primitives under real contention:
//!
//! 1. **Mutual exclusion** - at most one holder of a lock at any time
//! 2. **Cancellation wakeups** - waiters give up when their context dies
//! 3. **Concurrent nested commits** - sibling transactions fold safely
//! 4. **Worker pool** - many submitters, one drain
//! 5. **Nesting model** - random begin/commit/rollback sequences against a
//!    stack-of-buffers model
//!
//! ## Running These Tests
//!
//! ```bash
//! cargo test -p memport-concurrency --test concurrent_tests
//! ```

use memport_concurrency::{Lock, LockFactory, TxScope, WorkerPool};
use memport_core::{Context, ErrorKind};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

// ============================================================================
// Locks
// ============================================================================

#[test]
fn test_lock_mutual_exclusion_under_contention() {
    let lock = Lock::new();
    let inside = Arc::new(AtomicUsize::new(0));
    let max_inside = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let lock = lock.clone();
            let inside = Arc::clone(&inside);
            let max_inside = Arc::clone(&max_inside);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..25 {
                    let ctx = lock.acquire(&Context::background()).unwrap();
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    thread::yield_now();
                    inside.fetch_sub(1, Ordering::SeqCst);
                    lock.release(&ctx).unwrap();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    assert!(!lock.is_locked());
}

#[test]
fn test_cancelled_waiter_returns_error_and_holder_keeps_lock() {
    let lock = Lock::new();
    let held = lock.acquire(&Context::background()).unwrap();

    let (ctx, cancel) = Context::background().with_cancel();
    let contender = lock.clone();
    let waiter = thread::spawn(move || contender.acquire(&ctx));

    thread::sleep(Duration::from_millis(30));
    cancel.cancel();
    let err = waiter.join().unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert!(lock.is_locked());

    lock.release(&held).unwrap();
    assert!(!lock.is_locked());
}

#[test]
fn test_factory_keys_are_independent_across_threads() {
    let factory = Arc::new(LockFactory::<u32>::new());
    let held = factory.lock_for(&1).acquire(&Context::background()).unwrap();

    let f = Arc::clone(&factory);
    let other = thread::spawn(move || {
        let lock = f.lock_for(&2);
        let ctx = lock.acquire(&Context::background()).unwrap();
        lock.release(&ctx).unwrap();
    });
    other.join().unwrap();

    factory.lock_for(&1).release(&held).unwrap();
}

// ============================================================================
// Transactions
// ============================================================================

#[test]
fn test_sibling_commits_fold_into_shared_parent() {
    let scope = Arc::new(TxScope::<Vec<usize>>::new("concurrent"));
    let outer = scope.begin(&Context::background()).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let scope = Arc::clone(&scope);
            let outer = outer.clone();
            thread::spawn(move || {
                let inner = scope.begin(&outer).unwrap();
                scope.lookup(&inner).unwrap().state().push(i);
                scope.commit(&inner, |_| Ok(())).unwrap();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let applied = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&applied);
    scope
        .commit(&outer, move |buf| {
            *sink.lock() = buf;
            Ok(())
        })
        .unwrap();

    let mut applied = applied.lock().clone();
    applied.sort_unstable();
    assert_eq!(applied, (0..8).collect::<Vec<_>>());
}

#[test]
fn test_racing_disposals_finish_exactly_once() {
    let scope = Arc::new(TxScope::<Vec<u8>>::new("race"));
    let tx = scope.begin(&Context::background()).unwrap();
    let barrier = Arc::new(Barrier::new(4));

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let scope = Arc::clone(&scope);
            let tx = tx.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                if i % 2 == 0 {
                    scope.commit(&tx, |_| Ok(())).is_ok()
                } else {
                    scope.rollback(&tx).is_ok()
                }
            })
        })
        .collect();

    let successes = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|ok| *ok)
        .count();
    assert_eq!(successes, 1);
}

// ============================================================================
// Worker pool
// ============================================================================

#[test]
fn test_many_submitters_one_drain() {
    let pool = Arc::new(WorkerPool::new("stress-worker", 4, 10_000).unwrap());
    let counter = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let pool = Arc::clone(&pool);
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                for _ in 0..100 {
                    let c = Arc::clone(&counter);
                    pool.submit(move |_| {
                        c.fetch_add(1, Ordering::Relaxed);
                    })
                    .unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    pool.drain();
    assert_eq!(counter.load(Ordering::Relaxed), 400);
    pool.close();
}

// ============================================================================
// Nesting model
// ============================================================================

#[derive(Debug, Clone)]
enum TxOp {
    Begin,
    Push(u8),
    Commit,
    Rollback,
}

fn tx_op() -> impl Strategy<Value = TxOp> {
    prop_oneof![
        3 => Just(TxOp::Begin),
        4 => any::<u8>().prop_map(TxOp::Push),
        3 => Just(TxOp::Commit),
        1 => Just(TxOp::Rollback),
    ]
}

proptest! {
    /// Root applies match a stack of buffers where commit folds into the
    /// parent and rollback drops the whole chain
    #[test]
    fn prop_nested_commits_match_stack_model(ops in prop::collection::vec(tx_op(), 1..60)) {
        let scope = TxScope::<Vec<u8>>::new("model");
        let applied = Arc::new(Mutex::new(Vec::new()));
        let mut open: Vec<Context> = Vec::new();
        let mut model: Vec<Vec<u8>> = Vec::new();
        let mut expected: Vec<u8> = Vec::new();

        for op in ops {
            match op {
                TxOp::Begin => {
                    let parent = open.last().cloned().unwrap_or_else(Context::background);
                    open.push(scope.begin(&parent).unwrap());
                    model.push(Vec::new());
                }
                TxOp::Push(v) => {
                    if let Some(ctx) = open.last() {
                        scope.lookup(ctx).unwrap().state().push(v);
                        model.last_mut().unwrap().push(v);
                    }
                }
                TxOp::Commit => {
                    if let Some(ctx) = open.pop() {
                        let sink = Arc::clone(&applied);
                        scope.commit(&ctx, move |buf| {
                            sink.lock().extend(buf);
                            Ok(())
                        }).unwrap();
                        let buf = model.pop().unwrap();
                        match model.last_mut() {
                            Some(parent) => parent.extend(buf),
                            None => expected.extend(buf),
                        }
                    }
                }
                TxOp::Rollback => {
                    if let Some(ctx) = open.last() {
                        scope.rollback(ctx).unwrap();
                        for ctx in &open {
                            prop_assert_eq!(scope.lookup(ctx).unwrap().is_done(), true);
                        }
                        open.clear();
                        model.clear();
                    }
                }
            }
        }
        prop_assert_eq!(&*applied.lock(), &expected);
    }
}
