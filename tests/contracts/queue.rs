//! Queue contract

use crate::common::init_tracing;
use memport::memport_contracts::queue;
use memport::{FanOutExchange, Queue};

#[test]
fn test_queue() {
    init_tracing();
    queue::run(Queue::with_options);
}

#[test]
fn test_queue_made_by_exchange() {
    queue::run(|options| FanOutExchange::with_options(options).make_queue());
}

#[test]
fn test_queue_with_fast_polling() {
    queue::run(|options| Queue::with_options(options.with_poll_interval_ms(1)));
}
