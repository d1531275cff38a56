//! Entity identifiers
//!
//! - [`EntityId`]: what a type needs to act as an entity id (zero value,
//!   stable string key, optional counter minting)
//! - [`IdAccessor`]: reads and writes the id field of an entity
//! - [`IdMinter`]: issues ids for entities created without one
//!
//! ## ID key
//!
//! Repositories index entities by the string form of their id:
//! strings use their value, types with a natural `Display` use it, and
//! everything else falls back to the `Debug` rendering.

use crate::context::Context;
use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::any::type_name;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

/// A type usable as an entity identifier
pub trait EntityId: Clone + Default + Eq + Hash + Debug + Send + Sync + 'static {
    /// Stable string key used to index the entity
    fn id_key(&self) -> String {
        format!("{:?}", self)
    }

    /// Whether this is the zero value, meaning "no id assigned"
    fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    /// Convert the process-wide mint counter into an id
    ///
    /// Fails with `UnsupportedIdType` when the default minter cannot produce
    /// this type at all.
    fn from_counter(_n: u64) -> Result<Self> {
        Err(Error::UnsupportedIdType(type_name::<Self>()))
    }
}

impl EntityId for String {
    fn id_key(&self) -> String {
        self.clone()
    }

    fn from_counter(n: u64) -> Result<Self> {
        Ok(n.to_string())
    }
}

macro_rules! signed_entity_id {
    ($($t:ty),*) => {$(
        impl EntityId for $t {
            fn id_key(&self) -> String {
                self.to_string()
            }

            fn from_counter(n: u64) -> Result<Self> {
                <$t>::try_from(n).map_err(|_| {
                    Error::Internal(format!("id counter {} overflows {}", n, stringify!($t)))
                })
            }
        }
    )*};
}

macro_rules! unsigned_entity_id {
    ($($t:ty),*) => {$(
        impl EntityId for $t {
            fn id_key(&self) -> String {
                self.to_string()
            }
        }
    )*};
}

signed_entity_id!(i8, i16, i32, i64, i128, isize);
unsigned_entity_id!(u8, u16, u32, u64, u128, usize);

impl EntityId for uuid::Uuid {
    fn id_key(&self) -> String {
        self.to_string()
    }

    fn is_zero(&self) -> bool {
        self.is_nil()
    }
}

/// Entities that expose their id field by convention
pub trait HasId {
    /// Id type
    type Id: EntityId;

    /// Read the id
    fn id(&self) -> Self::Id;

    /// Write the id
    fn set_id(&mut self, id: Self::Id);
}

type Getter<E, I> = Arc<dyn Fn(&E) -> I + Send + Sync>;
type Setter<E, I> = Arc<dyn Fn(&mut E, I) + Send + Sync>;

/// Reads and writes the id of an entity
pub struct IdAccessor<E, I> {
    get: Getter<E, I>,
    set: Option<Setter<E, I>>,
}

impl<E, I> Clone for IdAccessor<E, I> {
    fn clone(&self) -> Self {
        Self {
            get: Arc::clone(&self.get),
            set: self.set.clone(),
        }
    }
}

impl<E, I: EntityId> IdAccessor<E, I> {
    /// Accessor from explicit getter and setter
    pub fn new(
        get: impl Fn(&E) -> I + Send + Sync + 'static,
        set: impl Fn(&mut E, I) + Send + Sync + 'static,
    ) -> Self {
        Self {
            get: Arc::new(get),
            set: Some(Arc::new(set)),
        }
    }

    /// Accessor that can read but never assign ids
    pub fn read_only(get: impl Fn(&E) -> I + Send + Sync + 'static) -> Self {
        Self {
            get: Arc::new(get),
            set: None,
        }
    }

    /// The entity's id, possibly zero
    pub fn get(&self, entity: &E) -> I {
        (self.get)(entity)
    }

    /// The entity's id, `None` when zero
    pub fn lookup(&self, entity: &E) -> Option<I> {
        let id = self.get(entity);
        if id.is_zero() {
            None
        } else {
            Some(id)
        }
    }

    /// Assign `id` to the entity
    pub fn set(&self, entity: &mut E, id: I) -> Result<()> {
        match &self.set {
            Some(set) => {
                set(entity, id);
                Ok(())
            }
            None => Err(Error::NilPointer(format!(
                "no id setter configured for {}",
                type_name::<E>()
            ))),
        }
    }
}

impl<E: HasId> IdAccessor<E, E::Id> {
    /// Accessor using the entity's [`HasId`] implementation
    pub fn of_entity() -> Self {
        Self::new(|e: &E| e.id(), |e: &mut E, id| e.set_id(id))
    }
}

impl<E: HasId> Default for IdAccessor<E, E::Id> {
    fn default() -> Self {
        Self::of_entity()
    }
}

/// Issues ids for new entities
pub trait IdMinter<I>: Send + Sync {
    /// Produce a fresh id
    fn new_id(&self, ctx: &Context) -> Result<I>;
}

static MINT_COUNTER: Lazy<Mutex<u64>> = Lazy::new(|| Mutex::new(0));

/// Default minter backed by a process-wide counter
///
/// Strings receive the decimal counter, signed integers the counter itself.
/// Other id types need a caller-supplied minter.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultMinter;

impl<I: EntityId> IdMinter<I> for DefaultMinter {
    fn new_id(&self, ctx: &Context) -> Result<I> {
        ctx.check()?;
        let n = {
            let mut counter = MINT_COUNTER.lock();
            *counter += 1;
            *counter
        };
        I::from_counter(n)
    }
}

/// Minter from a closure
pub struct FnMinter<F>(pub F);

impl<I, F> IdMinter<I> for FnMinter<F>
where
    F: Fn(&Context) -> Result<I> + Send + Sync,
{
    fn new_id(&self, ctx: &Context) -> Result<I> {
        (self.0)(ctx)
    }
}
