//! Transaction contract against both repository kinds

use crate::common::{account_fixture, init_tracing, note_fixture};
use memport::memport_contracts::one_phase_commit;
use memport::{EventLog, EventLogRepository, Memory, Repository};

#[test]
fn test_event_log_repository_transactions() {
    init_tracing();
    let fixture = note_fixture();
    one_phase_commit::run(|| EventLogRepository::new(EventLog::new(), fixture.ids().clone()), &fixture);
}

#[test]
fn test_event_log_repository_transactions_integer_ids() {
    let fixture = account_fixture();
    one_phase_commit::run(|| EventLogRepository::new(EventLog::new(), fixture.ids().clone()), &fixture);
}

#[test]
fn test_repository_transactions() {
    init_tracing();
    let fixture = note_fixture();
    one_phase_commit::run(|| Repository::new(Memory::new(), fixture.ids().clone()), &fixture);
}

#[test]
fn test_repository_transactions_integer_ids() {
    let fixture = account_fixture();
    one_phase_commit::run(|| Repository::new(Memory::new(), fixture.ids().clone()), &fixture);
}
