//! Schedule-state repository: last-run records plus per-schedule locks
//!
//! A scheduler keeps one [`ScheduleState`] per schedule id and takes the
//! matching lock before deciding whether a run is due.

use crate::repository::Repository;
use chrono::{DateTime, Utc};
use memport_concurrency::LockFactory;
use memport_core::{ByIdFinder, Context, HasId, IdAccessor, RepositoryOptions, Result, Upserter};
use memport_storage::Memory;
use std::fmt;
use std::sync::Arc;

/// When a schedule last ran
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleState {
    /// Schedule id
    pub id: String,
    /// Time of the last run
    pub timestamp: DateTime<Utc>,
}

impl HasId for ScheduleState {
    type Id = String;

    fn id(&self) -> String {
        self.id.clone()
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }
}

/// State records and locks keyed by schedule id
#[derive(Clone)]
pub struct ScheduleStateRepository {
    states: Repository<ScheduleState, String>,
    locks: Arc<LockFactory<String>>,
}

impl ScheduleStateRepository {
    /// Namespace the state records live under
    pub const NAMESPACE: &'static str = "memport.schedule_state";

    /// Repository storing its records in `store`
    pub fn new(store: Memory) -> Self {
        let options = RepositoryOptions::default()
            .with_namespace(Self::NAMESPACE)
            .with_expect_id(true);
        Self {
            states: Repository::with_options(store, IdAccessor::of_entity(), options),
            locks: Arc::new(LockFactory::new()),
        }
    }

    /// The state records
    pub fn states(&self) -> &Repository<ScheduleState, String> {
        &self.states
    }

    /// The per-schedule locks
    pub fn locks(&self) -> &LockFactory<String> {
        &self.locks
    }

    /// Last recorded run of `id`, if any
    pub fn last_run(&self, ctx: &Context, id: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .states
            .find_by_id(ctx, &id.to_string())?
            .map(|state| state.timestamp))
    }

    /// Record that `id` ran at `at`
    pub fn record_run(&self, ctx: &Context, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.states.upsert(
            ctx,
            &ScheduleState {
                id: id.to_string(),
                timestamp: at,
            },
        )
    }
}

impl Default for ScheduleStateRepository {
    fn default() -> Self {
        Self::new(Memory::new())
    }
}

impl fmt::Debug for ScheduleStateRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduleStateRepository")
            .field("states", &self.states)
            .field("locks", &self.locks.len())
            .finish()
    }
}
