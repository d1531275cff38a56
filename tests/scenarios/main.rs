//! End-to-End Scenarios
//!
//! Whole workflows across crates, each checked step by step.

#[path = "../common/mod.rs"]
mod common;

mod cache;
mod event_log;
mod lock;
mod messaging;
