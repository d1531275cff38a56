//! One-phase-commit contract
//!
//! The subject is a repository that is also its own transaction protocol.
//! Writes inside a transaction become visible to plain contexts only when
//! the outermost transaction commits.

use crate::fixture::{expect_kind, ok, Fixture};
use memport_core::{in_tx, Context, Crud, EntityId, Error, ErrorKind, OnePhaseCommitProtocol};
use std::fmt::Debug;
use tracing::debug;

/// Run every transaction case
pub fn run<R, E, I, F>(factory: F, fixture: &Fixture<E, I>)
where
    R: Crud<E, I> + OnePhaseCommitProtocol,
    E: Clone + Debug + PartialEq,
    I: EntityId,
    F: Fn() -> R,
{
    let cases: [(&str, fn(&R, &Fixture<E, I>)); 8] = [
        ("commit_makes_visible", commit_makes_visible),
        ("rollback_discards", rollback_discards),
        ("nested_commit_folds_into_parent", nested_commit_folds_into_parent),
        ("outer_rollback_discards_inner_commit", outer_rollback_discards_inner_commit),
        ("finished_tx_is_done", finished_tx_is_done),
        ("commit_without_tx", commit_without_tx),
        ("cancelled_commit_rolls_back", cancelled_commit_rolls_back),
        ("in_tx_rolls_back_on_error", in_tx_rolls_back_on_error),
    ];
    for (name, case) in cases {
        debug!(case = name, "one-phase-commit contract");
        case(&factory(), fixture);
    }
}

fn visible<R, E, I>(subject: &R, ctx: &Context, fixture: &Fixture<E, I>, entity: &E) -> bool
where
    R: Crud<E, I>,
    I: EntityId,
{
    ok(subject.find_by_id(ctx, &fixture.id_of(entity)), "find_by_id").is_some()
}

/// Writes are seen inside the tx, hidden outside it until commit
pub fn commit_makes_visible<R, E, I>(subject: &R, fixture: &Fixture<E, I>)
where
    R: Crud<E, I> + OnePhaseCommitProtocol,
    E: Clone + Debug + PartialEq,
    I: EntityId,
{
    let ctx = Context::background();
    let tx = ok(subject.begin_tx(&ctx), "begin_tx");
    let mut entity = fixture.make(1);
    ok(subject.create(&tx, &mut entity), "create");

    assert!(visible(subject, &tx, fixture, &entity));
    assert!(!visible(subject, &ctx, fixture, &entity), "uncommitted write leaked");

    ok(subject.commit_tx(&tx), "commit_tx");
    assert!(visible(subject, &ctx, fixture, &entity));
}

/// Rollback discards creates, updates and deletes
pub fn rollback_discards<R, E, I>(subject: &R, fixture: &Fixture<E, I>)
where
    R: Crud<E, I> + OnePhaseCommitProtocol,
    E: Clone + Debug + PartialEq,
    I: EntityId,
{
    let ctx = Context::background();
    let mut kept = fixture.make(1);
    ok(subject.create(&ctx, &mut kept), "create");

    let tx = ok(subject.begin_tx(&ctx), "begin_tx");
    let mut fresh = fixture.make(2);
    ok(subject.create(&tx, &mut fresh), "create in tx");
    ok(subject.update(&tx, &fixture.change(&kept)), "update in tx");
    ok(subject.delete_by_id(&tx, &fixture.id_of(&kept)), "delete in tx");
    ok(subject.rollback_tx(&tx), "rollback_tx");

    assert!(!visible(subject, &ctx, fixture, &fresh));
    let found = ok(subject.find_by_id(&ctx, &fixture.id_of(&kept)), "find_by_id");
    assert_eq!(found, Some(kept));
}

/// A nested commit lands in the parent, not in committed state
pub fn nested_commit_folds_into_parent<R, E, I>(subject: &R, fixture: &Fixture<E, I>)
where
    R: Crud<E, I> + OnePhaseCommitProtocol,
    E: Clone + Debug + PartialEq,
    I: EntityId,
{
    let ctx = Context::background();
    let outer = ok(subject.begin_tx(&ctx), "begin outer");
    let inner = ok(subject.begin_tx(&outer), "begin inner");
    let mut entity = fixture.make(1);
    ok(subject.create(&inner, &mut entity), "create");
    ok(subject.commit_tx(&inner), "commit inner");

    assert!(visible(subject, &outer, fixture, &entity));
    assert!(!visible(subject, &ctx, fixture, &entity), "inner commit leaked");

    ok(subject.commit_tx(&outer), "commit outer");
    assert!(visible(subject, &ctx, fixture, &entity));
}

/// Rolling back the outer tx discards what the inner one committed
pub fn outer_rollback_discards_inner_commit<R, E, I>(subject: &R, fixture: &Fixture<E, I>)
where
    R: Crud<E, I> + OnePhaseCommitProtocol,
    E: Clone + Debug + PartialEq,
    I: EntityId,
{
    let ctx = Context::background();
    let outer = ok(subject.begin_tx(&ctx), "begin outer");
    let inner = ok(subject.begin_tx(&outer), "begin inner");
    let mut entity = fixture.make(1);
    ok(subject.create(&inner, &mut entity), "create");
    ok(subject.commit_tx(&inner), "commit inner");
    ok(subject.rollback_tx(&outer), "rollback outer");

    assert!(!visible(subject, &ctx, fixture, &entity));
}

/// A committed or rolled back tx refuses further use with `TxDone`
pub fn finished_tx_is_done<R, E, I>(subject: &R, fixture: &Fixture<E, I>)
where
    R: Crud<E, I> + OnePhaseCommitProtocol,
    E: Clone + Debug + PartialEq,
    I: EntityId,
{
    let ctx = Context::background();
    let committed = ok(subject.begin_tx(&ctx), "begin_tx");
    ok(subject.commit_tx(&committed), "commit_tx");
    expect_kind(subject.commit_tx(&committed), ErrorKind::TxDone, "second commit");
    expect_kind(subject.rollback_tx(&committed), ErrorKind::TxDone, "rollback after commit");

    let rolled_back = ok(subject.begin_tx(&ctx), "begin_tx");
    ok(subject.rollback_tx(&rolled_back), "rollback_tx");
    expect_kind(subject.commit_tx(&rolled_back), ErrorKind::TxDone, "commit after rollback");
    let mut entity = fixture.make(1);
    assert!(subject.create(&rolled_back, &mut entity).is_err(), "write in finished tx");
}

/// Commit and rollback need a transaction
pub fn commit_without_tx<R, E, I>(subject: &R, _fixture: &Fixture<E, I>)
where
    R: Crud<E, I> + OnePhaseCommitProtocol,
    E: Clone + Debug + PartialEq,
    I: EntityId,
{
    let ctx = Context::background();
    expect_kind(subject.commit_tx(&ctx), ErrorKind::NoTx, "commit without tx");
    expect_kind(subject.rollback_tx(&ctx), ErrorKind::NoTx, "rollback without tx");
}

/// Committing through a cancelled context rolls back instead
pub fn cancelled_commit_rolls_back<R, E, I>(subject: &R, fixture: &Fixture<E, I>)
where
    R: Crud<E, I> + OnePhaseCommitProtocol,
    E: Clone + Debug + PartialEq,
    I: EntityId,
{
    let ctx = Context::background();
    let tx = ok(subject.begin_tx(&ctx), "begin_tx");
    let mut entity = fixture.make(1);
    ok(subject.create(&tx, &mut entity), "create");

    let (cancelled, cancel) = tx.with_cancel();
    cancel.cancel();
    expect_kind(subject.commit_tx(&cancelled), ErrorKind::Cancelled, "cancelled commit");
    assert!(!visible(subject, &ctx, fixture, &entity));
    expect_kind(subject.commit_tx(&tx), ErrorKind::TxDone, "commit after cancelled commit");
}

/// `in_tx` commits on success and rolls back on error
pub fn in_tx_rolls_back_on_error<R, E, I>(subject: &R, fixture: &Fixture<E, I>)
where
    R: Crud<E, I> + OnePhaseCommitProtocol,
    E: Clone + Debug + PartialEq,
    I: EntityId,
{
    let ctx = Context::background();
    let kept = ok(
        in_tx(subject, &ctx, |tx| {
            let mut entity = fixture.make(1);
            subject.create(tx, &mut entity)?;
            Ok(entity)
        }),
        "in_tx",
    );
    assert!(visible(subject, &ctx, fixture, &kept));

    let mut lost = fixture.make(2);
    let result = in_tx(subject, &ctx, |tx| {
        subject.create(tx, &mut lost)?;
        Err::<(), _>(Error::Internal("abort".into()))
    });
    expect_kind(result, ErrorKind::Internal, "failing in_tx");
    assert!(!visible(subject, &ctx, fixture, &lost));
}
