//! Queue contract
//!
//! The factory receives the options each case needs, so the same suite
//! covers FIFO, LIFO, blocking and volatile behaviour.

use crate::fixture::{expect_kind, ok};
use memport_core::{Context, ErrorKind, OnePhaseCommitProtocol, Publisher, Purger, QueueOptions};
use memport_primitives::{Message, Queue, Subscription};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// Upper bound on any single wait inside a case
const PATIENCE: Duration = Duration::from_secs(2);

/// Run every queue case
pub fn run<F: Fn(QueueOptions) -> Queue<u64>>(factory: F) {
    let cases: [(&str, QueueOptions, fn(Queue<u64>)); 11] = [
        ("fifo_order", QueueOptions::default(), fifo_order),
        ("lifo_order", QueueOptions::default().with_lifo(true), lifo_order),
        ("nack_redelivers", QueueOptions::default(), nack_redelivers),
        ("pull_nacks_previous", QueueOptions::default(), pull_nacks_previous),
        ("exclusive_leases", QueueOptions::default(), exclusive_leases),
        ("ack_once", QueueOptions::default(), ack_once),
        ("publish_in_tx", QueueOptions::default(), publish_in_tx),
        ("purge", QueueOptions::default(), purge),
        ("blocking_publish", QueueOptions::default().with_blocking(true), blocking_publish),
        ("volatile_subscription", QueueOptions::default().with_volatile(true), volatile_subscription),
        ("cancelled_subscription", QueueOptions::default(), cancelled_subscription),
    ];
    for (name, options, case) in cases {
        debug!(case = name, "queue contract");
        case(factory(options));
    }
}

fn subscribe(queue: &Queue<u64>) -> Subscription<u64> {
    let (ctx, _) = Context::background().with_timeout(PATIENCE);
    queue.subscribe(&ctx)
}

#[track_caller]
fn pull(subscription: &mut Subscription<u64>) -> Message<u64> {
    match subscription.next() {
        Some(message) => ok(message, "pull"),
        None => panic!("subscription ended"),
    }
}

fn publish(queue: &Queue<u64>, values: Vec<u64>) {
    ok(queue.publish(&Context::background(), values), "publish");
}

fn drain(queue: &Queue<u64>, n: usize) -> Vec<u64> {
    let mut subscription = subscribe(queue);
    (0..n)
        .map(|_| {
            let message = pull(&mut subscription);
            ok(message.ack(), "ack");
            *message.data()
        })
        .collect()
}

/// Messages are delivered oldest first and acking removes them
pub fn fifo_order(queue: Queue<u64>) {
    publish(&queue, vec![1, 2, 3]);
    publish(&queue, vec![4, 5]);
    assert_eq!(drain(&queue, 5), vec![1, 2, 3, 4, 5]);
    assert!(queue.is_empty());
}

/// With `lifo` the newest message comes first
pub fn lifo_order(queue: Queue<u64>) {
    publish(&queue, vec![1, 2, 3]);
    assert_eq!(drain(&queue, 3), vec![3, 2, 1]);
}

/// A nacked message is delivered again
pub fn nack_redelivers(queue: Queue<u64>) {
    publish(&queue, vec![7, 8]);
    let mut subscription = subscribe(&queue);
    let first = pull(&mut subscription);
    let id = first.id().to_string();
    first.nack();
    first.nack();

    let again = pull(&mut subscription);
    assert_eq!(again.id(), id);
    assert_eq!(*again.data(), 7);
    ok(again.ack(), "ack");
    assert_eq!(queue.len(), 1);
}

/// Pulling while holding a message gives the held one up
pub fn pull_nacks_previous(queue: Queue<u64>) {
    publish(&queue, vec![1, 2]);
    let mut subscription = subscribe(&queue);
    let first = pull(&mut subscription);
    let second = pull(&mut subscription);
    assert_eq!((*first.data(), *second.data()), (1, 2));
    expect_kind(first.ack(), ErrorKind::NotFound, "ack after implicit nack");

    subscription.close();
    assert_eq!(queue.stats().leased, 0);
    assert_eq!(drain(&queue, 2), vec![1, 2]);
}

/// Concurrent subscribers never hold the same message
pub fn exclusive_leases(queue: Queue<u64>) {
    publish(&queue, vec![1, 2]);
    let mut a = subscribe(&queue);
    let mut b = subscribe(&queue);
    let from_a = pull(&mut a);
    let from_b = pull(&mut b);
    assert_ne!(from_a.id(), from_b.id());

    let stats = queue.stats();
    assert_eq!((stats.queued, stats.leased, stats.subscribers), (2, 2, 2));
    ok(from_a.ack(), "ack a");
    ok(from_b.ack(), "ack b");
    assert!(queue.is_empty());
}

/// A message is acked at most once
pub fn ack_once(queue: Queue<u64>) {
    publish(&queue, vec![1]);
    let mut subscription = subscribe(&queue);
    let message = pull(&mut subscription);
    ok(message.ack(), "ack");
    expect_kind(message.ack(), ErrorKind::NotFound, "second ack");
    message.nack();
    assert!(queue.is_empty());
}

/// Publishing inside a tx is deferred to the outermost commit
pub fn publish_in_tx(queue: Queue<u64>) {
    let ctx = Context::background();
    let tx = ok(queue.begin_tx(&ctx), "begin_tx");
    ok(queue.publish(&tx, vec![1, 2]), "publish in tx");
    let inner = ok(queue.begin_tx(&tx), "begin inner");
    ok(queue.publish(&inner, vec![3]), "publish in inner");
    ok(queue.commit_tx(&inner), "commit inner");
    assert!(queue.is_empty(), "tx publish leaked before commit");
    ok(queue.commit_tx(&tx), "commit_tx");
    assert_eq!(drain(&queue, 3), vec![1, 2, 3]);

    let tx = ok(queue.begin_tx(&ctx), "begin_tx");
    ok(queue.publish(&tx, vec![9]), "publish in tx");
    ok(queue.rollback_tx(&tx), "rollback_tx");
    assert!(queue.is_empty());
}

/// Purge drops every message, leased or not
pub fn purge(queue: Queue<u64>) {
    publish(&queue, vec![1, 2, 3]);
    let mut subscription = subscribe(&queue);
    let leased = pull(&mut subscription);
    ok(queue.purge(&Context::background()), "purge");
    assert!(queue.is_empty());
    expect_kind(leased.ack(), ErrorKind::NotFound, "ack after purge");
}

/// A blocking publish returns once its messages are consumed
pub fn blocking_publish(queue: Queue<u64>) {
    let started = Instant::now();
    let publisher = {
        let queue = queue.clone();
        thread::spawn(move || {
            let (ctx, _) = Context::background().with_timeout(PATIENCE);
            queue.publish(&ctx, vec![1]).map(|_| started.elapsed())
        })
    };

    let mut subscription = subscribe(&queue);
    let message = pull(&mut subscription);
    thread::sleep(Duration::from_millis(20));
    let acked_at = started.elapsed();
    ok(message.ack(), "ack");

    let returned_at = ok(publisher.join().expect("publisher panicked"), "blocking publish");
    assert!(returned_at >= acked_at, "publish returned before its message was acked");

    let (ctx, cancel) = Context::background().with_cancel();
    let waiting = {
        let queue = queue.clone();
        thread::spawn(move || queue.publish(&ctx, vec![2]))
    };
    thread::sleep(Duration::from_millis(10));
    cancel.cancel();
    expect_kind(waiting.join().expect("publisher panicked"), ErrorKind::Cancelled, "cancelled publish");
    assert_eq!(queue.len(), 1, "cancelled publish keeps its messages queued");
}

/// A volatile subscription ignores what was published before it
pub fn volatile_subscription(queue: Queue<u64>) {
    publish(&queue, vec![1]);
    let mut subscription = subscribe(&queue);
    publish(&queue, vec![2]);
    let message = pull(&mut subscription);
    assert_eq!(*message.data(), 2);
    ok(message.ack(), "ack");
    assert_eq!(queue.len(), 1);
}

/// Cancelling the subscription context ends iteration with the reason
pub fn cancelled_subscription(queue: Queue<u64>) {
    let (ctx, cancel) = Context::background().with_cancel();
    let mut subscription = queue.subscribe(&ctx);
    let waiter = thread::spawn(move || {
        let first = subscription.next().map(|m| m.map(|_| ()));
        let after = subscription.next().is_none();
        (first, after)
    });
    thread::sleep(Duration::from_millis(10));
    cancel.cancel();

    let (first, ended) = waiter.join().expect("subscriber panicked");
    match first {
        Some(result) => expect_kind(result, ErrorKind::Cancelled, "cancelled pull"),
        None => panic!("subscription ended without the cancellation error"),
    }
    assert!(ended);
    assert_eq!(queue.stats().subscribers, 0);
}
