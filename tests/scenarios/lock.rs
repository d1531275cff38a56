//! Advisory locking and schedule state

use crate::common::init_tracing;
use chrono::Utc;
use memport::{Context, Lock, Memory, ScheduleStateRepository};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn test_contended_lock() {
    init_tracing();
    let lock = Lock::new();
    let (acquired_tx, acquired_rx) = mpsc::channel();

    let held = lock.acquire(&Context::background()).unwrap();
    let started = Instant::now();

    let second = {
        let lock = lock.clone();
        thread::spawn(move || {
            let held = lock.acquire(&Context::background()).unwrap();
            acquired_tx.send(started.elapsed()).unwrap();
            lock.release(&held).unwrap();
            held
        })
    };

    thread::sleep(Duration::from_millis(60));
    assert!(acquired_rx.try_recv().is_err(), "second holder did not wait");
    lock.release(&held).unwrap();

    let waited = acquired_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert!(waited >= Duration::from_millis(50));
    let second_held = second.join().unwrap();

    assert!(held.is_cancelled());
    assert!(second_held.is_cancelled());
    assert!(!lock.is_locked());
}

#[test]
fn test_one_runner_per_schedule() {
    let schedules = ScheduleStateRepository::new(Memory::new());
    let runs = (0..4)
        .map(|_| {
            let schedules = schedules.clone();
            thread::spawn(move || {
                let ctx = Context::background();
                let lock = schedules.locks().lock_for(&"nightly".to_string());
                let held = lock.acquire(&ctx).unwrap();
                let ran = match schedules.last_run(&held, "nightly").unwrap() {
                    Some(_) => false,
                    None => {
                        schedules.record_run(&held, "nightly", Utc::now()).unwrap();
                        true
                    }
                };
                lock.release(&held).unwrap();
                ran
            })
        })
        .collect::<Vec<_>>();

    let ran = runs
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|ran| *ran)
        .count();
    assert_eq!(ran, 1);
    assert!(schedules.last_run(&Context::background(), "nightly").unwrap().is_some());
}
