//! Lock contract
//!
//! Run against every way of obtaining a [`Lock`]: a fresh one, or one handed
//! out by a [`LockFactory`](memport_concurrency::LockFactory).

use crate::fixture::{expect_kind, ok};
use memport_concurrency::Lock;
use memport_core::{Context, ErrorKind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// How long a contender must stay blocked behind a holder
pub const HOLD: Duration = Duration::from_millis(50);

/// Run every lock case
pub fn run<F: Fn() -> Lock>(factory: F) {
    let cases: [(&str, fn(Lock)); 7] = [
        ("mutual_exclusion", mutual_exclusion),
        ("reentrant", reentrant),
        ("release_requires_lock", release_requires_lock),
        ("cancel_releases", cancel_releases),
        ("dropped_lock_context", dropped_lock_context),
        ("contender_waits", contender_waits),
        ("cancelled_waiter_gives_up", cancelled_waiter_gives_up),
    ];
    for (name, case) in cases {
        debug!(case = name, "lock contract");
        case(factory());
    }
}

/// At most one holder at any instant
pub fn mutual_exclusion(lock: Lock) {
    let holders = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let lock = lock.clone();
            let holders = Arc::clone(&holders);
            let max_seen = Arc::clone(&max_seen);
            thread::spawn(move || {
                for _ in 0..20 {
                    let held = ok(lock.acquire(&Context::background()), "acquire");
                    let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    thread::yield_now();
                    holders.fetch_sub(1, Ordering::SeqCst);
                    ok(lock.release(&held), "release");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("lock worker panicked");
    }
    assert_eq!(max_seen.load(Ordering::SeqCst), 1, "two holders at once");
    assert!(!lock.is_locked());
}

/// Acquiring with the lock context returns without blocking
pub fn reentrant(lock: Lock) {
    let held = ok(lock.acquire(&Context::background()), "acquire");
    let again = ok(lock.acquire(&held), "re-acquire");
    assert!(again.ptr_eq(&held), "re-entry must return the lock context");
    assert!(ok(lock.try_acquire(&held), "try_acquire").is_some());

    ok(lock.release(&held), "release");
    assert!(!lock.is_locked());
    ok(lock.release(&held), "second release");
}

/// Releasing a context that never held the lock fails with `NoLock`
pub fn release_requires_lock(lock: Lock) {
    expect_kind(lock.release(&Context::background()), ErrorKind::NoLock, "release");

    let other = Lock::new();
    let held = ok(other.acquire(&Context::background()), "acquire other");
    expect_kind(lock.release(&held), ErrorKind::NoLock, "release foreign lock");
    ok(other.release(&held), "release other");
}

/// Cancelling the acquiring context unlocks
pub fn cancel_releases(lock: Lock) {
    let (ctx, cancel) = Context::background().with_cancel();
    let held = ok(lock.acquire(&ctx), "acquire");
    assert!(lock.is_locked());
    cancel.cancel();
    assert!(held.is_cancelled());
    assert!(!lock.is_locked());

    let next = ok(lock.acquire(&Context::background()), "acquire after cancel");
    ok(lock.release(&next), "release");
}

/// Dropping the lock context without releasing still unlocks on cancellation
pub fn dropped_lock_context(lock: Lock) {
    let (ctx, cancel) = Context::background().with_cancel();
    drop(ok(lock.acquire(&ctx), "acquire"));
    assert!(lock.is_locked());
    cancel.cancel();
    assert!(!lock.is_locked(), "lock leaked by a dropped lock context");

    let next = ok(lock.acquire(&Context::background()), "acquire after cancel");
    ok(lock.release(&next), "release");
}

/// A contender blocks until the holder releases
pub fn contender_waits(lock: Lock) {
    let held = ok(lock.acquire(&Context::background()), "acquire");
    let started = Instant::now();

    let contender = {
        let lock = lock.clone();
        thread::spawn(move || {
            let held = ok(lock.acquire(&Context::background()), "contender acquire");
            let waited = started.elapsed();
            ok(lock.release(&held), "contender release");
            waited
        })
    };
    thread::sleep(HOLD);
    assert!(ok(lock.try_acquire(&Context::background()), "try_acquire").is_none());
    ok(lock.release(&held), "release");

    let waited = contender.join().expect("contender panicked");
    assert!(waited >= HOLD, "contender got the lock after {:?}", waited);
}

/// A waiter whose context ends stops waiting with that context's error
pub fn cancelled_waiter_gives_up(lock: Lock) {
    let held = ok(lock.acquire(&Context::background()), "acquire");

    let (ctx, _cancel) = Context::background().with_timeout(Duration::from_millis(20));
    expect_kind(lock.acquire(&ctx), ErrorKind::DeadlineExceeded, "acquire past deadline");

    let (ctx, cancel) = Context::background().with_cancel();
    let waiter = {
        let lock = lock.clone();
        thread::spawn(move || lock.acquire(&ctx).map(|_| ()))
    };
    thread::sleep(Duration::from_millis(10));
    cancel.cancel();
    expect_kind(waiter.join().expect("waiter panicked"), ErrorKind::Cancelled, "cancelled acquire");

    assert!(lock.is_locked());
    ok(lock.release(&held), "release");
}
