//! Cached query records and their identifiers
//!
//! A [`Query`] names a cached lookup and its arguments. Its encoding is the
//! [`HitId`] under which the cache stores the resulting [`Hit`].
//!
//! ## Encoding
//!
//! - no arguments: `0:<name>`
//! - with arguments: `0:<name>:[k1:v1 k2:v2]`, keys sorted
//!
//! The leading `0` is the encoding version.

use chrono::{DateTime, Utc};
use memport_core::{EntityId, HasId};
use std::collections::BTreeMap;
use std::fmt;

const ENCODING_VERSION: u32 = 0;

/// Name of the canonical single-entity query
pub const FIND_BY_ID: &str = "FindByID";
/// Name of the canonical list-everything query
pub const FIND_ALL: &str = "FindAll";

/// Stable key of a cached query
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HitId(String);

impl HitId {
    /// Wrap an already encoded id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The encoded form
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl EntityId for HitId {
    fn id_key(&self) -> String {
        self.0.clone()
    }
}

impl fmt::Display for HitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HitId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for HitId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<Query> for HitId {
    fn from(query: Query) -> Self {
        query.hit_id()
    }
}

impl From<&Query> for HitId {
    fn from(query: &Query) -> Self {
        query.hit_id()
    }
}

/// Named query with ordered arguments
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    name: String,
    args: BTreeMap<String, String>,
}

impl Query {
    /// Query without arguments
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: BTreeMap::new(),
        }
    }

    /// Add or replace an argument
    pub fn with_arg(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.args.insert(key.into(), value.to_string());
        self
    }

    /// The canonical query for one entity by id
    pub fn find_by_id<I: EntityId>(id: &I) -> Self {
        Self::new(FIND_BY_ID).with_arg("ID", id.id_key())
    }

    /// The canonical query for every entity
    pub fn find_all() -> Self {
        Self::new(FIND_ALL)
    }

    /// Query name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Arguments, sorted by key
    pub fn args(&self) -> &BTreeMap<String, String> {
        &self.args
    }

    /// The encoded id
    pub fn hit_id(&self) -> HitId {
        HitId(self.to_string())
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", ENCODING_VERSION, self.name)?;
        if self.args.is_empty() {
            return Ok(());
        }
        f.write_str(":[")?;
        for (i, (key, value)) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}:{}", key, value)?;
        }
        f.write_str("]")
    }
}

/// The cached outcome of one query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hit<I> {
    /// Query key
    pub id: HitId,
    /// Ids the query produced, in order
    pub entity_ids: Vec<I>,
    /// When the result was cached
    pub timestamp: DateTime<Utc>,
}

impl<I> Hit<I> {
    /// Hit recorded now
    pub fn new(id: HitId, entity_ids: Vec<I>) -> Self {
        Self {
            id,
            entity_ids,
            timestamp: Utc::now(),
        }
    }
}

impl<I: PartialEq> Hit<I> {
    /// Whether the hit references `id`
    pub fn references(&self, id: &I) -> bool {
        self.entity_ids.contains(id)
    }
}

impl<I> HasId for Hit<I> {
    type Id = HitId;

    fn id(&self) -> HitId {
        self.id.clone()
    }

    fn set_id(&mut self, id: HitId) {
        self.id = id;
    }
}
