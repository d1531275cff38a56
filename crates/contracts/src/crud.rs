//! CRUD contract
//!
//! Every case runs against a fresh subject from the factory.

use crate::fixture::{expect_kind, ok, Fixture};
use memport_core::{Context, Crud, EntityId, ErrorKind, Result};
use std::collections::HashSet;
use std::fmt::Debug;
use tracing::debug;

/// Run every CRUD case
pub fn run<R, E, I, F>(factory: F, fixture: &Fixture<E, I>)
where
    R: Crud<E, I>,
    E: Clone + Debug + PartialEq,
    I: EntityId,
    F: Fn() -> R,
{
    let cases: [(&str, fn(&R, &Fixture<E, I>)); 9] = [
        ("create_then_find", create_then_find),
        ("create_mints_distinct_ids", create_mints_distinct_ids),
        ("create_duplicate", create_duplicate),
        ("update", update),
        ("update_missing", update_missing),
        ("delete", delete),
        ("find_all_agrees_with_find_by_id", find_all_agrees_with_find_by_id),
        ("find_by_ids", find_by_ids),
        ("save_and_delete_all", save_and_delete_all),
    ];
    for (name, case) in cases {
        debug!(case = name, "crud contract");
        case(&factory(), fixture);
    }
    cancelled_context(&factory(), fixture);
}

fn created<R, E, I>(subject: &R, fixture: &Fixture<E, I>, n: u32) -> E
where
    R: Crud<E, I>,
    I: EntityId,
{
    let mut entity = fixture.make(n);
    ok(subject.create(&Context::background(), &mut entity), "create");
    entity
}

/// A created entity is found by its id
pub fn create_then_find<R, E, I>(subject: &R, fixture: &Fixture<E, I>)
where
    R: Crud<E, I>,
    E: Clone + Debug + PartialEq,
    I: EntityId,
{
    let entity = created(subject, fixture, 1);
    let id = fixture.id_of(&entity);
    assert!(!id.is_zero(), "create must assign an id");
    let found = ok(subject.find_by_id(&Context::background(), &id), "find_by_id");
    assert_eq!(found.as_ref(), Some(&entity));
}

/// Entities created without id receive distinct ids
pub fn create_mints_distinct_ids<R, E, I>(subject: &R, fixture: &Fixture<E, I>)
where
    R: Crud<E, I>,
    E: Clone + Debug + PartialEq,
    I: EntityId,
{
    let ids: HashSet<I> = (0..10)
        .map(|n| fixture.id_of(&created(subject, fixture, n)))
        .collect();
    assert_eq!(ids.len(), 10, "minted ids must be distinct");
}

/// Creating an existing id fails with `AlreadyExists`
pub fn create_duplicate<R, E, I>(subject: &R, fixture: &Fixture<E, I>)
where
    R: Crud<E, I>,
    E: Clone + Debug + PartialEq,
    I: EntityId,
{
    let entity = created(subject, fixture, 1);
    let mut again = fixture.change(&entity);
    expect_kind(
        subject.create(&Context::background(), &mut again),
        ErrorKind::AlreadyExists,
        "create duplicate",
    );
    let found = ok(subject.find_by_id(&Context::background(), &fixture.id_of(&entity)), "find_by_id");
    assert_eq!(found.as_ref(), Some(&entity), "failed create must not overwrite");
}

/// Update replaces the stored entity
pub fn update<R, E, I>(subject: &R, fixture: &Fixture<E, I>)
where
    R: Crud<E, I>,
    E: Clone + Debug + PartialEq,
    I: EntityId,
{
    let ctx = Context::background();
    let entity = created(subject, fixture, 1);
    let changed = fixture.change(&entity);
    ok(subject.update(&ctx, &changed), "update");
    let found = ok(subject.find_by_id(&ctx, &fixture.id_of(&entity)), "find_by_id");
    assert_eq!(found, Some(changed));
}

/// Updating an absent id fails with `NotFound`
pub fn update_missing<R, E, I>(subject: &R, fixture: &Fixture<E, I>)
where
    R: Crud<E, I>,
    E: Clone + Debug + PartialEq,
    I: EntityId,
{
    let ctx = Context::background();
    let entity = created(subject, fixture, 1);
    ok(subject.delete_by_id(&ctx, &fixture.id_of(&entity)), "delete_by_id");
    expect_kind(subject.update(&ctx, &entity), ErrorKind::NotFound, "update missing");
}

/// Delete removes the entity; deleting again fails with `NotFound`
pub fn delete<R, E, I>(subject: &R, fixture: &Fixture<E, I>)
where
    R: Crud<E, I>,
    E: Clone + Debug + PartialEq,
    I: EntityId,
{
    let ctx = Context::background();
    let entity = created(subject, fixture, 1);
    let id = fixture.id_of(&entity);
    ok(subject.delete_by_id(&ctx, &id), "delete_by_id");
    assert_eq!(ok(subject.find_by_id(&ctx, &id), "find_by_id"), None);
    expect_kind(subject.delete_by_id(&ctx, &id), ErrorKind::NotFound, "delete missing");
}

/// An id is listed by `find_all` exactly when `find_by_id` finds it
pub fn find_all_agrees_with_find_by_id<R, E, I>(subject: &R, fixture: &Fixture<E, I>)
where
    R: Crud<E, I>,
    E: Clone + Debug + PartialEq,
    I: EntityId,
{
    let ctx = Context::background();
    let entities: Vec<E> = (0..6).map(|n| created(subject, fixture, n)).collect();
    for gone in entities.iter().step_by(2) {
        ok(subject.delete_by_id(&ctx, &fixture.id_of(gone)), "delete_by_id");
    }

    let listed: Vec<E> = ok(subject.find_all(&ctx).collect::<Result<_>>(), "find_all");
    assert_eq!(listed.len(), 3);
    for entity in &entities {
        let found = ok(subject.find_by_id(&ctx, &fixture.id_of(entity)), "find_by_id");
        assert_eq!(found.is_some(), listed.contains(entity));
    }
}

/// `find_by_ids` yields in request order and fails on an absent id
pub fn find_by_ids<R, E, I>(subject: &R, fixture: &Fixture<E, I>)
where
    R: Crud<E, I>,
    E: Clone + Debug + PartialEq,
    I: EntityId,
{
    let ctx = Context::background();
    let a = created(subject, fixture, 1);
    let b = created(subject, fixture, 2);
    let ids = vec![fixture.id_of(&b), fixture.id_of(&a)];
    let found: Vec<E> = ok(subject.find_by_ids(&ctx, &ids).collect::<Result<_>>(), "find_by_ids");
    assert_eq!(found, vec![b.clone(), a]);

    ok(subject.delete_by_id(&ctx, &fixture.id_of(&b)), "delete_by_id");
    let result: Result<Vec<E>> = subject.find_by_ids(&ctx, &ids).collect();
    expect_kind(result, ErrorKind::NotFound, "find_by_ids with absent id");
}

/// Save creates or replaces; `delete_all` empties
pub fn save_and_delete_all<R, E, I>(subject: &R, fixture: &Fixture<E, I>)
where
    R: Crud<E, I>,
    E: Clone + Debug + PartialEq,
    I: EntityId,
{
    let ctx = Context::background();
    let mut fresh = fixture.make(1);
    ok(subject.save(&ctx, &mut fresh), "save new");
    let id = fixture.id_of(&fresh);
    assert!(!id.is_zero(), "save must assign an id");

    let mut changed = fixture.change(&fresh);
    ok(subject.save(&ctx, &mut changed), "save existing");
    assert_eq!(ok(subject.find_by_id(&ctx, &id), "find_by_id"), Some(changed));

    created(subject, fixture, 2);
    ok(subject.delete_all(&ctx), "delete_all");
    assert_eq!(subject.find_all(&ctx).count(), 0);
}

/// Every operation refuses a cancelled context
pub fn cancelled_context<R, E, I>(subject: &R, fixture: &Fixture<E, I>)
where
    R: Crud<E, I>,
    E: Clone + Debug + PartialEq,
    I: EntityId,
{
    let entity = created(subject, fixture, 1);
    let id = fixture.id_of(&entity);
    let (ctx, cancel) = Context::background().with_cancel();
    cancel.cancel();

    let mut fresh = fixture.make(2);
    expect_kind(subject.create(&ctx, &mut fresh), ErrorKind::Cancelled, "create");
    expect_kind(subject.find_by_id(&ctx, &id), ErrorKind::Cancelled, "find_by_id");
    expect_kind(subject.update(&ctx, &entity), ErrorKind::Cancelled, "update");
    expect_kind(subject.delete_by_id(&ctx, &id), ErrorKind::Cancelled, "delete_by_id");
    let listed: Result<Vec<E>> = subject.find_all(&ctx).collect();
    expect_kind(listed, ErrorKind::Cancelled, "find_all");
    assert!(ok(subject.find_by_id(&Context::background(), &id), "find_by_id").is_some());
}
