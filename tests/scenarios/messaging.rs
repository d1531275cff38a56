//! Queue delivery and fan-out

use crate::common::init_tracing;
use memport::{Context, FanOutExchange, Publisher, Queue};
use std::thread;

// ============================================================================
// Queue
// ============================================================================

#[test]
fn test_fifo_delivery() {
    init_tracing();
    let queue: Queue<&'static str> = Queue::new();
    let ctx = Context::background();
    queue.publish(&ctx, vec!["a"]).unwrap();
    queue.publish(&ctx, vec!["b"]).unwrap();

    let mut subscription = queue.subscribe(&ctx);
    let first = subscription.next().unwrap().unwrap();
    assert_eq!(*first.data(), "a");
    first.ack().unwrap();
    let second = subscription.next().unwrap().unwrap();
    assert_eq!(*second.data(), "b");
    second.ack().unwrap();
    assert!(queue.is_empty());
}

#[test]
fn test_redelivery_after_nack() {
    let queue: Queue<&'static str> = Queue::new();
    let ctx = Context::background();
    queue.publish(&ctx, vec!["a"]).unwrap();

    let mut subscription = queue.subscribe(&ctx);
    let message = subscription.next().unwrap().unwrap();
    assert_eq!(*message.data(), "a");
    message.nack();

    let again = subscription.next().unwrap().unwrap();
    assert_eq!(*again.data(), "a");
    assert_eq!(again.id(), message.id());
    again.ack().unwrap();
    assert!(queue.is_empty());
}

#[test]
fn test_workers_share_a_queue() {
    let queue: Queue<u32> = Queue::new();
    let ctx = Context::background();
    queue.publish(&ctx, (0..200).collect()).unwrap();

    let (done, cancel) = ctx.with_cancel();
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let queue = queue.clone();
            let done = done.clone();
            thread::spawn(move || {
                let mut seen = Vec::new();
                for message in queue.subscribe(&done) {
                    let Ok(message) = message else { break };
                    seen.push(*message.data());
                    message.ack().unwrap();
                }
                seen
            })
        })
        .collect();

    while !queue.is_empty() {
        thread::yield_now();
    }
    cancel.cancel();

    let mut all: Vec<u32> = workers.into_iter().flat_map(|w| w.join().unwrap()).collect();
    all.sort_unstable();
    assert_eq!(all, (0..200).collect::<Vec<_>>());
}

// ============================================================================
// Fan-out
// ============================================================================

#[test]
fn test_fan_out_reaches_every_queue() {
    let exchange: FanOutExchange<String> = FanOutExchange::new();
    let audit = exchange.make_queue();
    let billing = exchange.make_queue();
    let ctx = Context::background();

    exchange.publish(&ctx, vec!["order-1".into(), "order-2".into()]).unwrap();

    for queue in [&audit, &billing] {
        let mut subscription = queue.subscribe(&ctx);
        for expected in ["order-1", "order-2"] {
            let message = subscription.next().unwrap().unwrap();
            assert_eq!(message.data(), expected);
            message.ack().unwrap();
        }
    }
}
