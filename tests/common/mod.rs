//! Shared test utilities for the root integration suites.
//!
//! Import via `#[path = "../common/mod.rs"] mod common;` from a suite's main.rs.

#![allow(dead_code)]

use memport::memport_contracts::Fixture;
use memport::{HasId, IdAccessor};
use std::sync::Once;

// ============================================================================
// Tracing
// ============================================================================

static TRACING: Once = Once::new();

/// Install a test-writer subscriber once per test binary
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

// ============================================================================
// Entities
// ============================================================================

/// Entity keyed by a minted string id
#[derive(Debug, Clone, PartialEq)]
pub struct Note {
    pub id: String,
    pub body: String,
}

impl HasId for Note {
    type Id = String;

    fn id(&self) -> String {
        self.id.clone()
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }
}

/// Entity keyed by a minted integer id
#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    pub id: i64,
    pub owner: String,
    pub balance: i64,
}

impl HasId for Account {
    type Id = i64;

    fn id(&self) -> i64 {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = id;
    }
}

pub fn note(id: &str, body: &str) -> Note {
    Note {
        id: id.to_string(),
        body: body.to_string(),
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub fn note_fixture() -> Fixture<Note, String> {
    Fixture::new(
        IdAccessor::of_entity(),
        |n| note("", &format!("note {}", n)),
        |n: &Note| Note {
            body: format!("{} (edited)", n.body),
            ..n.clone()
        },
    )
}

pub fn account_fixture() -> Fixture<Account, i64> {
    Fixture::new(
        IdAccessor::of_entity(),
        |n| Account {
            id: 0,
            owner: format!("owner-{}", n),
            balance: i64::from(n) * 100,
        },
        |a: &Account| Account {
            balance: a.balance + 1,
            ..a.clone()
        },
    )
}
