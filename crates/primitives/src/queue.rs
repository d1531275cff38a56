//! Queue: leased, at-least-once message delivery between threads
//!
//! ## Delivery model
//!
//! Published values become [`Message`]s in one shared list. A
//! [`Subscription`] pulls by leasing the first free message in delivery order
//! with a compare-and-swap on its `taken_by` slot. The holder then either
//! `ack`s (the message is removed) or `nack`s (the lease is dropped and the
//! message can be delivered again, to anyone).
//!
//! Pulling the next message while still holding the previous one nacks it, as
//! does closing or dropping the subscription.
//!
//! ## Ordering
//!
//! FIFO by publish sequence unless `lifo` is set. A custom `sort_less`
//! overrides both and is re-applied on every pull.
//!
//! ## Waiting
//!
//! Idle subscribers and blocking publishers sleep on a shared signal that is
//! bumped on every publish, ack, nack and purge. Each sleep is capped at the
//! configured poll interval so cancellation is observed promptly.

use chrono::{DateTime, Utc};
use memport_concurrency::TxScope;
use memport_core::{Context, Error, OnePhaseCommitProtocol, Publisher, Purger, QueueOptions, Result};
use parking_lot::{Condvar, Mutex, RwLock};
use std::cmp::Ordering as CmpOrdering;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};
use uuid::Uuid;

/// Custom delivery order: `less(a, b)` means `a` is delivered before `b`
pub type SortLess<V> = Arc<dyn Fn(&V, &V) -> bool + Send + Sync>;

const FREE: u64 = 0;
const ACKED: u64 = u64::MAX;

struct MessageRecord<V> {
    id: String,
    seq: u64,
    timestamp: DateTime<Utc>,
    value: V,
    taken_by: AtomicU64,
}

impl<V> MessageRecord<V> {
    fn release(&self, subscriber: u64) -> bool {
        self.taken_by
            .compare_exchange(subscriber, FREE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Wakes waiters on queue changes
struct Signal {
    generation: Mutex<u64>,
    changed: Condvar,
}

impl Signal {
    fn new() -> Self {
        Self {
            generation: Mutex::new(0),
            changed: Condvar::new(),
        }
    }

    fn current(&self) -> u64 {
        *self.generation.lock()
    }

    fn notify(&self) {
        *self.generation.lock() += 1;
        self.changed.notify_all();
    }

    /// Sleep until the generation moves past `seen` or `max` elapses
    fn wait(&self, seen: u64, max: Duration) {
        let mut generation = self.generation.lock();
        if *generation == seen {
            self.changed.wait_for(&mut generation, max);
        }
    }
}

struct QueueInner<V> {
    messages: RwLock<Vec<Arc<MessageRecord<V>>>>,
    subscribers: Mutex<HashSet<u64>>,
    signal: Signal,
    next_seq: AtomicU64,
    next_subscriber: AtomicU64,
    id_prefix: Uuid,
    options: QueueOptions,
    sort_less: Option<SortLess<V>>,
    txs: TxScope<Vec<V>>,
}

impl<V> QueueInner<V> {
    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.options.poll_interval_ms.max(1))
    }

    fn order(&self, a: &MessageRecord<V>, b: &MessageRecord<V>) -> CmpOrdering {
        if let Some(less) = &self.sort_less {
            if less(&a.value, &b.value) {
                return CmpOrdering::Less;
            }
            if less(&b.value, &a.value) {
                return CmpOrdering::Greater;
            }
            return a.seq.cmp(&b.seq);
        }
        if self.options.lifo {
            b.seq.cmp(&a.seq)
        } else {
            a.seq.cmp(&b.seq)
        }
    }

    /// Lease the first free message visible to `subscriber`
    fn take(&self, subscriber: u64, watermark: Option<u64>) -> Option<Arc<MessageRecord<V>>> {
        let mut candidates: Vec<Arc<MessageRecord<V>>> = self
            .messages
            .read()
            .iter()
            .filter(|m| watermark.map_or(true, |w| m.seq >= w))
            .filter(|m| m.taken_by.load(Ordering::Acquire) == FREE)
            .cloned()
            .collect();
        candidates.sort_by(|a, b| self.order(a, b));

        candidates.into_iter().find(|m| {
            m.taken_by
                .compare_exchange(FREE, subscriber, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        })
    }

    fn nack(&self, record: &MessageRecord<V>, subscriber: u64) -> bool {
        let released = record.release(subscriber);
        if released {
            trace!(message = %record.id, subscriber, "message nacked");
            self.signal.notify();
        }
        released
    }

    fn ack(&self, record: &Arc<MessageRecord<V>>, subscriber: u64) -> Result<()> {
        {
            let mut messages = self.messages.write();
            let position = messages.iter().position(|m| Arc::ptr_eq(m, record));
            let position = match position {
                Some(i) if record.taken_by.load(Ordering::Acquire) == subscriber => i,
                _ => {
                    return Err(Error::NotFound(format!(
                        "message {} is not leased by subscription {}",
                        record.id, subscriber
                    )))
                }
            };
            messages.remove(position);
            record.taken_by.store(ACKED, Ordering::Release);
        }
        trace!(message = %record.id, subscriber, "message acked");
        self.signal.notify();
        Ok(())
    }

    fn publish_now(&self, ctx: &Context, values: Vec<V>) -> Result<()> {
        let published = self.enqueue(values);
        if self.options.blocking {
            self.await_consumed(ctx, &published)?;
        }
        Ok(())
    }

    /// Append `values` and return their sequence numbers
    fn enqueue(&self, values: Vec<V>) -> HashSet<u64> {
        if values.is_empty() {
            return HashSet::new();
        }
        let published: HashSet<u64> = {
            let mut messages = self.messages.write();
            let now = Utc::now();
            values
                .into_iter()
                .map(|value| {
                    let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                    messages.push(Arc::new(MessageRecord {
                        id: format!("{}-{}", self.id_prefix, seq),
                        seq,
                        timestamp: now,
                        value,
                        taken_by: AtomicU64::new(FREE),
                    }));
                    seq
                })
                .collect()
        };
        debug!(count = published.len(), "messages published");
        self.signal.notify();
        published
    }

    fn await_consumed(&self, ctx: &Context, published: &HashSet<u64>) -> Result<()> {
        loop {
            let seen = self.signal.current();
            let pending = self
                .messages
                .read()
                .iter()
                .any(|m| published.contains(&m.seq));
            if !pending {
                return Ok(());
            }
            ctx.check()?;
            self.signal.wait(seen, self.poll_interval());
        }
    }
}

/// Thread-safe message queue
///
/// Cloning yields another handle to the same queue.
pub struct Queue<V> {
    inner: Arc<QueueInner<V>>,
}

impl<V> Clone for Queue<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Queue occupancy snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Messages in the queue, leased or not
    pub queued: usize,
    /// Messages currently leased
    pub leased: usize,
    /// Open subscriptions
    pub subscribers: usize,
}

impl<V: Send + Sync + 'static> Default for Queue<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Send + Sync + 'static> Queue<V> {
    /// FIFO queue with default options
    pub fn new() -> Self {
        Self::with_options(QueueOptions::default())
    }

    /// Queue with `options`
    pub fn with_options(options: QueueOptions) -> Self {
        Self::build(options, None)
    }

    /// Queue delivering in the order given by `less`
    pub fn with_sort_less(
        options: QueueOptions,
        less: impl Fn(&V, &V) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self::build(options, Some(Arc::new(less)))
    }

    fn build(options: QueueOptions, sort_less: Option<SortLess<V>>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                messages: RwLock::new(Vec::new()),
                subscribers: Mutex::new(HashSet::new()),
                signal: Signal::new(),
                next_seq: AtomicU64::new(1),
                next_subscriber: AtomicU64::new(1),
                id_prefix: Uuid::new_v4(),
                options,
                sort_less,
                txs: TxScope::new("queue"),
            }),
        }
    }

    /// The queue's options
    pub fn options(&self) -> &QueueOptions {
        &self.inner.options
    }

    /// Open a subscription bound to `ctx`
    ///
    /// Iterating blocks until a message can be leased. Cancelling `ctx`
    /// ends the iteration with the cancellation reason.
    pub fn subscribe(&self, ctx: &Context) -> Subscription<V> {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.lock().insert(id);
        let watermark = self
            .inner
            .options
            .volatile
            .then(|| self.inner.next_seq.load(Ordering::Acquire));
        debug!(subscriber = id, volatile = watermark.is_some(), "subscription opened");
        Subscription {
            queue: Arc::clone(&self.inner),
            id,
            ctx: ctx.clone(),
            watermark,
            current: None,
            closed: false,
        }
    }

    /// Messages in the queue, leased or not
    pub fn len(&self) -> usize {
        self.inner.messages.read().len()
    }

    /// Whether the queue holds no message
    pub fn is_empty(&self) -> bool {
        self.inner.messages.read().is_empty()
    }

    /// Occupancy snapshot
    pub fn stats(&self) -> QueueStats {
        let messages = self.inner.messages.read();
        QueueStats {
            queued: messages.len(),
            leased: messages
                .iter()
                .filter(|m| m.taken_by.load(Ordering::Acquire) != FREE)
                .count(),
            subscribers: self.inner.subscribers.lock().len(),
        }
    }
}

impl<V: Send + Sync + 'static> Queue<V> {
    /// Commit the transaction carried by `tx` without waiting for consumers
    ///
    /// Cancellation of `tx` is ignored. Returns the sequence numbers of the
    /// messages the commit published, for [`Queue::await_consumed`].
    pub(crate) fn commit_detached(&self, tx: &Context) -> Result<HashSet<u64>> {
        let mut published = HashSet::new();
        self.inner.txs.commit(&tx.detached(), |pending| {
            published = self.inner.enqueue(pending);
            Ok(())
        })?;
        Ok(published)
    }

    /// Block until none of `published` is queued, if this queue is blocking
    pub(crate) fn await_consumed(&self, ctx: &Context, published: &HashSet<u64>) -> Result<()> {
        if !self.inner.options.blocking || published.is_empty() {
            return Ok(());
        }
        self.inner.await_consumed(ctx, published)
    }
}

impl<V: Send + Sync + 'static> Publisher<V> for Queue<V> {
    fn publish(&self, ctx: &Context, values: Vec<V>) -> Result<()> {
        ctx.check()?;
        if values.is_empty() {
            return Ok(());
        }
        match self.inner.txs.active(ctx)? {
            Some(tx) => {
                tx.state().extend(values);
                Ok(())
            }
            None => self.inner.publish_now(ctx, values),
        }
    }
}

impl<V: Send + Sync + 'static> Purger for Queue<V> {
    fn purge(&self, ctx: &Context) -> Result<()> {
        ctx.check()?;
        let purged = {
            let mut messages = self.inner.messages.write();
            let n = messages.len();
            messages.clear();
            n
        };
        debug!(purged, "queue purged");
        self.inner.signal.notify();
        Ok(())
    }
}

impl<V: Send + Sync + 'static> OnePhaseCommitProtocol for Queue<V> {
    fn begin_tx(&self, ctx: &Context) -> Result<Context> {
        self.inner.txs.begin(ctx)
    }

    fn commit_tx(&self, ctx: &Context) -> Result<()> {
        self.inner
            .txs
            .commit(ctx, |pending| self.inner.publish_now(ctx, pending))
    }

    fn rollback_tx(&self, ctx: &Context) -> Result<()> {
        self.inner.txs.rollback(ctx)
    }
}

impl<V> fmt::Debug for Queue<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("len", &self.inner.messages.read().len())
            .field("options", &self.inner.options)
            .finish()
    }
}

/// A leased message
///
/// Must be acked or nacked before the subscription pulls again; otherwise
/// the pull nacks it.
pub struct Message<V> {
    record: Arc<MessageRecord<V>>,
    queue: Arc<QueueInner<V>>,
    subscriber: u64,
    ctx: Context,
}

impl<V> Message<V> {
    /// Queue-unique id
    pub fn id(&self) -> &str {
        &self.record.id
    }

    /// Publish time
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.record.timestamp
    }

    /// The published value
    pub fn data(&self) -> &V {
        &self.record.value
    }

    /// The subscription's context
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Remove the message from the queue
    ///
    /// Fails with `NotFound` if the lease was already given up.
    pub fn ack(&self) -> Result<()> {
        self.queue.ack(&self.record, self.subscriber)
    }

    /// Give up the lease so the message can be delivered again
    ///
    /// Idempotent.
    pub fn nack(&self) {
        self.queue.nack(&self.record, self.subscriber);
    }
}

impl<V: fmt::Debug> fmt::Debug for Message<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.record.id)
            .field("timestamp", &self.record.timestamp)
            .field("data", &self.record.value)
            .finish()
    }
}

/// Blocking iterator over leased messages
pub struct Subscription<V> {
    queue: Arc<QueueInner<V>>,
    id: u64,
    ctx: Context,
    watermark: Option<u64>,
    current: Option<Arc<MessageRecord<V>>>,
    closed: bool,
}

impl<V> Subscription<V> {
    /// Subscription id, unique per queue
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Nack any held message and unregister
    ///
    /// Idempotent; the iterator yields nothing afterwards.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.release_current();
        self.queue.subscribers.lock().remove(&self.id);
        debug!(subscriber = self.id, "subscription closed");
    }

    fn release_current(&mut self) {
        if let Some(record) = self.current.take() {
            self.queue.nack(&record, self.id);
        }
    }
}

impl<V> Iterator for Subscription<V> {
    type Item = Result<Message<V>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.closed {
            return None;
        }
        self.release_current();

        loop {
            if let Err(err) = self.ctx.check() {
                self.close();
                return Some(Err(err));
            }
            let seen = self.queue.signal.current();
            if let Some(record) = self.queue.take(self.id, self.watermark) {
                self.current = Some(Arc::clone(&record));
                return Some(Ok(Message {
                    record,
                    queue: Arc::clone(&self.queue),
                    subscriber: self.id,
                    ctx: self.ctx.clone(),
                }));
            }
            self.queue.signal.wait(seen, self.queue.poll_interval());
        }
    }
}

impl<V> Drop for Subscription<V> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<V> fmt::Debug for Subscription<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("volatile", &self.watermark.is_some())
            .field("closed", &self.closed)
            .finish()
    }
}
