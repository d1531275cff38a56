//! Event log visibility and repository folding

use crate::common::{init_tracing, note, Note};
use memport::{
    AllFinder, ByIdDeleter, ByIdFinder, Context, Creator, Event, EventLog, EventLogRepository,
    IdAccessor, OnePhaseCommitProtocol, Updater,
};

fn labels(events: &[Event]) -> Vec<&'static str> {
    events
        .iter()
        .filter_map(|e| e.payload::<&'static str>().copied())
        .collect()
}

// ============================================================================
// Transaction visibility
// ============================================================================

#[test]
fn test_tx_events_visible_only_inside_until_commit() {
    init_tracing();
    let log = EventLog::new();
    let ctx = Context::background();

    let tx = log.begin_tx(&ctx).unwrap();
    log.append(&tx, Event::new("ns", "A")).unwrap();
    log.append(&ctx, Event::new("ns", "B")).unwrap();

    assert_eq!(labels(&log.events_in_context(&ctx).unwrap()), vec!["B"]);
    assert_eq!(labels(&log.events_in_context(&tx).unwrap()), vec!["B", "A"]);

    log.commit_tx(&tx).unwrap();
    assert_eq!(labels(&log.events_in_context(&ctx).unwrap()), vec!["B", "A"]);
}

#[test]
fn test_isolated_tx_survives_outer_rollback() {
    let log = EventLog::new();
    let ctx = Context::background();

    let outer = log.begin_tx(&ctx).unwrap();
    log.append(&outer, Event::new("ns", "outer")).unwrap();
    let isolated = log.begin_isolated_tx(&outer).unwrap();
    log.append(&isolated, Event::new("ns", "isolated")).unwrap();
    log.commit_tx(&isolated).unwrap();

    assert_eq!(labels(&log.events()), vec!["isolated"]);
    log.rollback_tx(&outer).unwrap();
    assert_eq!(labels(&log.events()), vec!["isolated"]);
}

// ============================================================================
// Repository fold and compression
// ============================================================================

#[test]
fn test_create_update_delete_fold() {
    init_tracing();
    let log = EventLog::new();
    let notes = EventLogRepository::new(log.clone(), IdAccessor::<Note, String>::of_entity());
    let ctx = Context::background();

    notes.create(&ctx, &mut note("x", "a")).unwrap();
    notes.update(&ctx, &note("x", "b")).unwrap();
    notes.delete_by_id(&ctx, &"x".to_string()).unwrap();

    assert_eq!(notes.find_by_id(&ctx, &"x".to_string()).unwrap(), None);
    assert_eq!(notes.find_all(&ctx).count(), 0);
    assert_eq!(log.len(), 3);

    notes.compress().unwrap();
    assert_eq!(log.len(), 0);
}

#[test]
fn test_compression_keeps_other_namespaces() {
    let log = EventLog::new();
    let notes = EventLogRepository::new(log.clone(), IdAccessor::<Note, String>::of_entity());
    let ctx = Context::background();

    log.append(&ctx, Event::new("audit", "first")).unwrap();
    notes.create(&ctx, &mut note("x", "a")).unwrap();
    notes.update(&ctx, &note("x", "b")).unwrap();
    log.append(&ctx, Event::new("audit", "second")).unwrap();

    notes.compress().unwrap();
    assert_eq!(log.len(), 3);
    assert_eq!(labels(&log.events()), vec!["first", "second"]);
    assert_eq!(
        notes.find_by_id(&ctx, &"x".to_string()).unwrap(),
        Some(note("x", "b"))
    );
}
