//! # Namespace Structure
//!
//! Hierarchy bookkeeping through the engine's administrative surface.

mod common;

use common::{bind, contents, create_child, create_root, engine_at, protection, row};
use std::collections::BTreeSet;
use std::sync::Barrier;
use std::thread;
use tempfile::tempdir;
use tuplespace_core::{EnvId, EnvironmentDescriptor, StoreError};

fn ids(children: Vec<EnvironmentDescriptor>) -> BTreeSet<EnvId> {
    children.into_iter().map(|d| d.id).collect()
}

#[test]
fn create_move_delete() {
    let temp = tempdir().expect("temp dir");
    let (engine, _leases) = engine_at(temp.path());

    let root = create_root(&engine, "root");
    let a = create_child(&engine, root, "a");
    let b = create_child(&engine, root, "b");
    let c = create_child(&engine, a, "c");
    let writer = bind(&engine, c, "writer");
    for n in 0..3 {
        writer.write(row(n)).expect("write");
    }
    writer.revoke();
    let stored = contents(&engine, c);

    assert_eq!(ids(engine.children(root).expect("children")), BTreeSet::from([a, b]));
    assert_eq!(ids(engine.children(a).expect("children")), BTreeSet::from([c]));

    engine.move_environment(c, root).expect("move");
    assert!(engine.children(a).expect("children").is_empty());
    assert_eq!(ids(engine.children(root).expect("children")), BTreeSet::from([a, b, c]));
    let moved = engine.descriptor(c).expect("lookup").expect("present");
    assert_eq!(moved.parent, Some(root));
    assert_eq!(moved.protection, protection());
    assert_eq!(contents(&engine, c), stored);

    engine.delete(&[a]).expect("delete leaf");
    assert_eq!(engine.descriptor(a).expect("lookup"), None);
    assert_eq!(ids(engine.children(root).expect("children")), BTreeSet::from([b, c]));
}

#[test]
fn rename_survives_restart() {
    let temp = tempdir().expect("temp dir");
    let (root, a) = {
        let (engine, _leases) = engine_at(temp.path());
        let root = create_root(&engine, "root");
        let a = create_child(&engine, root, "a");
        engine.rename(a, "alpha").expect("rename");
        (root, a)
    };

    let (engine, _leases) = engine_at(temp.path());
    let a = engine.descriptor(a).expect("lookup").expect("present");
    assert_eq!(a.name, "alpha");
    assert_eq!(a.parent, Some(root));
    assert_eq!(engine.roots().expect("roots").len(), 1);
}

#[test]
fn subtree_lists_parents_first() {
    let temp = tempdir().expect("temp dir");
    let (engine, _leases) = engine_at(temp.path());
    let root = create_root(&engine, "root");
    let a = create_child(&engine, root, "a");
    let c = create_child(&engine, a, "c");
    let d = create_child(&engine, c, "d");

    let order: Vec<EnvId> = engine.subtree(a).expect("subtree").into_iter().map(|e| e.id).collect();
    assert_eq!(order, vec![a, c, d]);

    engine.delete(&order).expect("delete subtree");
    assert!(engine.children(root).expect("children").is_empty());
}

#[test]
fn invalid_operations_are_reported() {
    let temp = tempdir().expect("temp dir");
    let (engine, _leases) = engine_at(temp.path());
    let root = create_root(&engine, "root");
    let a = create_child(&engine, root, "a");

    assert!(matches!(
        engine.move_environment(EnvId::new_v4(), root),
        Err(StoreError::NoSuchEnvironment(_))
    ));
    assert!(matches!(
        engine.move_environment(root, a),
        Err(StoreError::InvalidDescriptor(_))
    ));
    assert!(matches!(
        engine.subtree(EnvId::new_v4()),
        Err(StoreError::NoSuchEnvironment(_))
    ));
}

#[test]
fn crossing_moves_never_form_a_cycle() {
    let temp = tempdir().expect("temp dir");
    let (engine, _leases) = engine_at(temp.path());
    let root = create_root(&engine, "root");

    for _ in 0..50 {
        let a = create_child(&engine, root, "a");
        let c = create_child(&engine, root, "c");
        let barrier = Barrier::new(2);

        let (left, right) = thread::scope(|scope| {
            let left = scope.spawn(|| {
                barrier.wait();
                engine.move_environment(a, c)
            });
            let right = scope.spawn(|| {
                barrier.wait();
                engine.move_environment(c, a)
            });
            (left.join().expect("join"), right.join().expect("join"))
        });

        // exactly one wins; the loser sees the winner's link
        assert!(left.is_ok() != right.is_ok(), "left {left:?}, right {right:?}");
        let loser = if left.is_err() { left } else { right };
        assert!(matches!(loser, Err(StoreError::InvalidDescriptor(_))));

        let reachable = ids(engine.subtree(root).expect("subtree"));
        assert!(reachable.contains(&a) && reachable.contains(&c));

        let parent_of = |id| engine.descriptor(id).expect("lookup").expect("present").parent;
        let top = if parent_of(a) == Some(root) { a } else { c };
        let pair: Vec<EnvId> =
            engine.subtree(top).expect("subtree").into_iter().map(|d| d.id).collect();
        assert_eq!(pair.len(), 2);
        engine.delete(&pair).expect("delete pair");
    }
    assert!(engine.children(root).expect("children").is_empty());
}
