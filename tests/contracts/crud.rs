//! CRUD contract against both repository kinds

use crate::common::{account_fixture, init_tracing, note_fixture};
use memport::memport_contracts::crud;
use memport::{EventLog, EventLogRepository, Memory, Repository, RepositoryOptions};

// ============================================================================
// Event-log repository
// ============================================================================

#[test]
fn test_event_log_repository_string_ids() {
    init_tracing();
    let fixture = note_fixture();
    crud::run(|| EventLogRepository::new(EventLog::new(), fixture.ids().clone()), &fixture);
}

#[test]
fn test_event_log_repository_integer_ids() {
    init_tracing();
    let fixture = account_fixture();
    crud::run(|| EventLogRepository::new(EventLog::new(), fixture.ids().clone()), &fixture);
}

#[test]
fn test_event_log_repository_compressing_on_append() {
    let fixture = note_fixture();
    let options = RepositoryOptions::default().with_compress_event_log(true);
    crud::run(
        || EventLogRepository::with_options(EventLog::new(), fixture.ids().clone(), options.clone()),
        &fixture,
    );
}

#[test]
fn test_event_log_repository_sharing_a_log() {
    let fixture = note_fixture();
    let accounts = account_fixture();
    crud::run(
        || {
            let log = EventLog::new();
            let neighbour = EventLogRepository::new(log.clone(), accounts.ids().clone());
            crud::create_then_find(&neighbour, &accounts);
            EventLogRepository::new(log, fixture.ids().clone())
        },
        &fixture,
    );
}

// ============================================================================
// Direct repository
// ============================================================================

#[test]
fn test_repository_string_ids() {
    init_tracing();
    let fixture = note_fixture();
    crud::run(|| Repository::new(Memory::new(), fixture.ids().clone()), &fixture);
}

#[test]
fn test_repository_integer_ids() {
    let fixture = account_fixture();
    crud::run(|| Repository::new(Memory::new(), fixture.ids().clone()), &fixture);
}

#[test]
fn test_repository_named_namespace() {
    let fixture = note_fixture();
    let options = RepositoryOptions::default().with_namespace("notes");
    crud::run(
        || Repository::with_options(Memory::new(), fixture.ids().clone(), options.clone()),
        &fixture,
    );
}
