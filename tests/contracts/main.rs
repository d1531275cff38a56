//! Contract Suites
//!
//! Runs every `memport-contracts` suite against the implementations in this
//! workspace.

#[path = "../common/mod.rs"]
mod common;

mod cache;
mod crud;
mod lock;
mod one_phase_commit;
mod queue;
