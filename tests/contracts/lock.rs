//! Lock contract

use crate::common::init_tracing;
use memport::memport_contracts::lock;
use memport::{Lock, LockFactory, Memory, ScheduleStateRepository};

#[test]
fn test_lock() {
    init_tracing();
    lock::run(Lock::new);
}

#[test]
fn test_lock_from_factory() {
    let factory = LockFactory::<String>::new();
    let n = std::cell::Cell::new(0);
    lock::run(|| {
        let key = format!("job-{}", n.get());
        n.set(n.get() + 1);
        factory.lock_for(&key)
    });
    assert_eq!(factory.len(), n.get());
}

#[test]
fn test_schedule_state_locks() {
    let states = ScheduleStateRepository::new(Memory::new());
    lock::run(|| states.locks().lock_for(&"nightly".to_string()));
}
