//! Executable contracts for memport components
//!
//! Each module exposes `run` functions that exercise a subject through its
//! public capability traits and panic on the first violated property. Call
//! them from a `#[test]` with a factory producing fresh subjects:
//!
//! ```
//! use memport_contracts::{crud, Fixture};
//! use memport_core::IdAccessor;
//! use memport_primitives::Repository;
//! use memport_storage::Memory;
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct Tag { id: String, label: String }
//!
//! let fixture = Fixture::new(
//!     IdAccessor::new(|t: &Tag| t.id.clone(), |t: &mut Tag, id| t.id = id),
//!     |n| Tag { id: String::new(), label: format!("tag-{}", n) },
//!     |t: &Tag| Tag { label: format!("{}!", t.label), ..t.clone() },
//! );
//! crud::run(|| Repository::new(Memory::new(), fixture.ids().clone()), &fixture);
//! ```
//!
//! ## Suites
//!
//! - [`crud`]: create/find/update/delete/save semantics
//! - [`one_phase_commit`]: transaction visibility, nesting and misuse
//! - [`queue`]: ordering, leasing, acknowledgement and transactional publish
//! - [`lock`]: exclusion, re-entrance and release on cancellation
//! - [`cache`]: read-through, invalidation and drop semantics

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod crud;
pub mod fixture;
pub mod lock;
pub mod one_phase_commit;
pub mod queue;

pub use fixture::{expect_kind, ok, Fixture};
