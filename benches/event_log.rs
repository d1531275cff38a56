//! Event Log Benchmarks
//!
//! Hot paths of the event log and the repository folded over it:
//! - Appending outside and inside transactions
//! - Folding views of growing logs
//! - Compression
//!
//! ## Running
//!
//! ```bash
//! cargo bench --bench event_log
//! cargo bench --bench event_log -- "event_log/append"
//! cargo bench --bench event_log -- "repository/"
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use memport::{
    ByIdFinder, Context, Creator, Event, EventLog, EventLogRepository, HasId, IdAccessor,
    OnePhaseCommitProtocol, Updater,
};

// =============================================================================
// Fixtures
// =============================================================================

/// Log sizes for fold scaling.
const LOG_SIZES: &[usize] = &[100, 1_000, 10_000];

#[derive(Debug, Clone)]
struct Counter {
    id: i64,
    value: u64,
}

impl HasId for Counter {
    type Id = i64;

    fn id(&self) -> i64 {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = id;
    }
}

/// Repository with `entities` counters, each updated `updates` times.
fn populated(entities: usize, updates: usize) -> (EventLogRepository<Counter, i64>, Vec<i64>) {
    let repo = EventLogRepository::new(EventLog::new(), IdAccessor::of_entity());
    let ctx = Context::background();
    let ids = (0..entities)
        .map(|_| {
            let mut counter = Counter { id: 0, value: 0 };
            repo.create(&ctx, &mut counter).unwrap();
            for value in 1..=updates as u64 {
                repo.update(&ctx, &Counter { value, ..counter.clone() }).unwrap();
            }
            counter.id
        })
        .collect();
    (repo, ids)
}

// =============================================================================
// Event log
// =============================================================================

fn event_log_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_log/append");
    group.throughput(Throughput::Elements(1));
    let ctx = Context::background();

    {
        let log = EventLog::new();
        group.bench_function("no_tx", |b| {
            b.iter(|| log.append(&ctx, Event::new("bench", black_box(1u64))).unwrap());
        });
    }

    {
        let log = EventLog::new();
        group.bench_function("tx_of_10", |b| {
            b.iter(|| {
                let tx = log.begin_tx(&ctx).unwrap();
                for i in 0..10u64 {
                    log.append(&tx, Event::new("bench", black_box(i))).unwrap();
                }
                log.commit_tx(&tx).unwrap();
            });
        });
    }

    group.finish();
}

// =============================================================================
// Repository
// =============================================================================

fn repository_find_by_id(c: &mut Criterion) {
    let mut group = c.benchmark_group("repository/find_by_id");
    let ctx = Context::background();

    for &size in LOG_SIZES {
        let (repo, ids) = populated(size / 10, 9);
        let hot = ids[ids.len() / 2];
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &hot, |b, id| {
            b.iter(|| black_box(repo.find_by_id(&ctx, id).unwrap()));
        });
    }

    group.finish();
}

fn repository_compress(c: &mut Criterion) {
    let mut group = c.benchmark_group("repository/compress");
    group.sample_size(20);

    for &size in LOG_SIZES {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_with_setup(|| populated(size / 10, 9).0, |repo| repo.compress().unwrap());
        });
    }

    group.finish();
}

criterion_group! {
    name = event_log;
    config = Criterion::default();
    targets = event_log_append
}

criterion_group! {
    name = repository;
    config = Criterion::default();
    targets = repository_find_by_id, repository_compress
}

criterion_main!(event_log, repository);
