//! Background worker pool for deferred work
//!
//! A fixed set of named threads pulls jobs from a FIFO queue. The cache uses
//! it to re-run sourced queries after serving them from cache.
//!
//! ## Design
//!
//! - Every job receives the pool's root context, not its submitter's. The root
//!   is cancelled by [`WorkerPool::close`], so in-flight jobs can bail out.
//! - Jobs may carry a key. A keyed job is dropped while another job with the
//!   same key is still queued, so a hot query is refreshed once per burst.
//! - A panicking job is logged and does not take its worker down.

use memport_core::{CancelHandle, Context, Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error};

/// Why a job was not queued
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    /// The queue is at capacity
    #[error("worker queue is full")]
    Full,
    /// The pool has been closed
    #[error("worker pool is closed")]
    Closed,
}

/// Pool metrics snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    /// Jobs waiting in the queue
    pub queue_depth: usize,
    /// Jobs currently running
    pub active_jobs: usize,
    /// Jobs finished since the pool was created
    pub jobs_completed: u64,
    /// Keyed jobs dropped because an identical one was pending
    pub jobs_coalesced: u64,
    /// Worker threads
    pub worker_count: usize,
}

type Job = Box<dyn FnOnce(&Context) + Send>;

struct QueuedJob {
    key: Option<String>,
    work: Job,
}

#[derive(Default)]
struct Pending {
    jobs: VecDeque<QueuedJob>,
    keys: HashSet<String>,
}

struct PoolInner {
    pending: Mutex<Pending>,
    work_ready: Condvar,
    idle_cond: Condvar,
    closed: AtomicBool,
    active_jobs: AtomicUsize,
    max_queue_depth: usize,
    jobs_completed: AtomicU64,
    jobs_coalesced: AtomicU64,
    root: Context,
}

/// Fixed-size pool of background workers
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    num_threads: usize,
    root_cancel: CancelHandle,
}

impl WorkerPool {
    /// Start `num_threads` workers named `{name}-0`, `{name}-1`, ...
    pub fn new(name: &str, num_threads: usize, max_queue_depth: usize) -> Result<Self> {
        let (root, root_cancel) = Context::background().with_cancel();
        let inner = Arc::new(PoolInner {
            pending: Mutex::new(Pending::default()),
            work_ready: Condvar::new(),
            idle_cond: Condvar::new(),
            closed: AtomicBool::new(false),
            active_jobs: AtomicUsize::new(0),
            max_queue_depth: max_queue_depth.max(1),
            jobs_completed: AtomicU64::new(0),
            jobs_coalesced: AtomicU64::new(0),
            root,
        });

        let pool = Self {
            inner,
            workers: Mutex::new(Vec::with_capacity(num_threads)),
            num_threads: num_threads.max(1),
            root_cancel,
        };

        for i in 0..pool.num_threads {
            let inner = Arc::clone(&pool.inner);
            let handle = std::thread::Builder::new()
                .name(format!("{}-{}", name, i))
                .spawn(move || worker_loop(&inner))
                .map_err(|e| Error::Internal(format!("failed to spawn worker thread: {}", e)));
            match handle {
                Ok(handle) => pool.workers.lock().push(handle),
                Err(err) => {
                    pool.close();
                    return Err(err);
                }
            }
        }
        Ok(pool)
    }

    /// Queue a job
    pub fn submit(&self, work: impl FnOnce(&Context) + Send + 'static) -> std::result::Result<(), SubmitError> {
        self.enqueue(None, Box::new(work)).map(|_| ())
    }

    /// Queue a job unless one with the same key is already waiting
    ///
    /// Returns `Ok(false)` when the job was coalesced into the pending one.
    pub fn submit_keyed(
        &self,
        key: impl Into<String>,
        work: impl FnOnce(&Context) + Send + 'static,
    ) -> std::result::Result<bool, SubmitError> {
        self.enqueue(Some(key.into()), Box::new(work))
    }

    fn enqueue(&self, key: Option<String>, work: Job) -> std::result::Result<bool, SubmitError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(SubmitError::Closed);
        }

        {
            let mut pending = self.inner.pending.lock();
            if let Some(k) = &key {
                if pending.keys.contains(k) {
                    self.inner.jobs_coalesced.fetch_add(1, Ordering::Relaxed);
                    return Ok(false);
                }
            }
            if pending.jobs.len() >= self.inner.max_queue_depth {
                return Err(SubmitError::Full);
            }
            if let Some(k) = &key {
                pending.keys.insert(k.clone());
            }
            pending.jobs.push_back(QueuedJob { key, work });
        }

        self.inner.work_ready.notify_one();
        Ok(true)
    }

    /// Whether no job is queued or running
    pub fn is_idle(&self) -> bool {
        let pending = self.inner.pending.lock();
        pending.jobs.is_empty() && self.inner.active_jobs.load(Ordering::Acquire) == 0
    }

    /// Block until every queued and running job has finished
    ///
    /// Workers keep running afterwards.
    pub fn drain(&self) {
        let mut pending = self.inner.pending.lock();
        while !pending.jobs.is_empty() || self.inner.active_jobs.load(Ordering::Acquire) > 0 {
            self.inner.idle_cond.wait(&mut pending);
        }
    }

    /// Cancel the root context, drop queued jobs and join the workers
    ///
    /// Running jobs observe the cancelled context and are waited for.
    /// Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.root_cancel.cancel();

        let dropped = {
            let mut pending = self.inner.pending.lock();
            let dropped = pending.jobs.len();
            pending.jobs.clear();
            pending.keys.clear();
            self.inner.work_ready.notify_all();
            self.inner.idle_cond.notify_all();
            dropped
        };
        if dropped > 0 {
            debug!(dropped, "worker pool closed with queued jobs");
        }

        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }

    /// Whether [`WorkerPool::close`] was called
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Metrics snapshot
    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            queue_depth: self.inner.pending.lock().jobs.len(),
            active_jobs: self.inner.active_jobs.load(Ordering::Relaxed),
            jobs_completed: self.inner.jobs_completed.load(Ordering::Relaxed),
            jobs_coalesced: self.inner.jobs_coalesced.load(Ordering::Relaxed),
            worker_count: self.num_threads,
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("stats", &self.stats())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Decrements `active_jobs` and wakes idle waiters, even if the job panics
struct ActiveJobGuard<'a> {
    inner: &'a PoolInner,
}

impl Drop for ActiveJobGuard<'_> {
    fn drop(&mut self) {
        let prev_active = self.inner.active_jobs.fetch_sub(1, Ordering::Release);
        self.inner.jobs_completed.fetch_add(1, Ordering::Relaxed);

        if prev_active == 1 {
            let pending = self.inner.pending.lock();
            if pending.jobs.is_empty() {
                self.inner.idle_cond.notify_all();
            }
        }
    }
}

fn worker_loop(inner: &PoolInner) {
    loop {
        let job = {
            let mut pending = inner.pending.lock();
            loop {
                if inner.closed.load(Ordering::Acquire) {
                    return;
                }
                if let Some(job) = pending.jobs.pop_front() {
                    if let Some(k) = &job.key {
                        pending.keys.remove(k);
                    }
                    inner.active_jobs.fetch_add(1, Ordering::Release);
                    break job;
                }
                inner.work_ready.wait(&mut pending);
            }
        };

        let _guard = ActiveJobGuard { inner };
        let root = &inner.root;
        let work = job.work;
        if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || work(root))) {
            error!(
                key = job.key.as_deref().unwrap_or("-"),
                "background job panicked: {:?}",
                e.downcast_ref::<&str>().copied().unwrap_or("(non-string panic)")
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::time::Duration;

    #[test]
    fn test_submit_and_drain() {
        let pool = WorkerPool::new("test-worker", 2, 1024).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let c = Arc::clone(&counter);
            pool.submit(move |_| {
                c.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        }
        pool.drain();
        assert_eq!(counter.load(Ordering::Relaxed), 10);
        assert!(pool.is_idle());
        assert_eq!(pool.stats().jobs_completed, 10);
        pool.close();
    }

    #[test]
    fn test_keyed_jobs_coalesce_while_pending() {
        let pool = WorkerPool::new("test-worker", 1, 1024).unwrap();
        let barrier = Arc::new(Barrier::new(2));
        let b = Arc::clone(&barrier);
        pool.submit(move |_| {
            b.wait();
        })
        .unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let counter = Arc::new(AtomicUsize::new(0));
        let mut queued = 0;
        for _ in 0..5 {
            let c = Arc::clone(&counter);
            if pool
                .submit_keyed("q", move |_| {
                    c.fetch_add(1, Ordering::Relaxed);
                })
                .unwrap()
            {
                queued += 1;
            }
        }
        assert_eq!(queued, 1);
        assert_eq!(pool.stats().jobs_coalesced, 4);

        barrier.wait();
        pool.drain();
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_backpressure() {
        let pool = WorkerPool::new("test-worker", 1, 2).unwrap();
        let barrier = Arc::new(Barrier::new(2));
        let b = Arc::clone(&barrier);
        pool.submit(move |_| {
            b.wait();
        })
        .unwrap();
        std::thread::sleep(Duration::from_millis(50));

        pool.submit(|_| {}).unwrap();
        pool.submit(|_| {}).unwrap();
        assert_eq!(pool.submit(|_| {}), Err(SubmitError::Full));

        barrier.wait();
        pool.drain();
    }

    #[test]
    fn test_close_cancels_root_and_rejects_jobs() {
        let pool = WorkerPool::new("test-worker", 1, 16).unwrap();
        let observed = Arc::new(AtomicBool::new(false));
        let o = Arc::clone(&observed);
        pool.submit(move |ctx| {
            while !ctx.wait_timeout(Duration::from_millis(5)) {}
            o.store(true, Ordering::SeqCst);
        })
        .unwrap();
        std::thread::sleep(Duration::from_millis(20));

        pool.close();
        assert!(observed.load(Ordering::SeqCst));
        assert!(pool.is_closed());
        assert_eq!(pool.submit(|_| {}), Err(SubmitError::Closed));
        pool.close();
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        let pool = WorkerPool::new("test-worker", 1, 16).unwrap();
        pool.submit(|_| panic!("boom")).unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let r = Arc::clone(&ran);
        pool.submit(move |_| r.store(true, Ordering::SeqCst)).unwrap();
        pool.drain();
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(pool.stats().active_jobs, 0);
    }

    #[test]
    fn test_drain_on_empty_pool_returns() {
        let pool = WorkerPool::new("test-worker", 2, 16).unwrap();
        pool.drain();
        assert!(pool.is_idle());
        assert_eq!(pool.stats().worker_count, 2);
    }
}
