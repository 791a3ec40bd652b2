//! # Clone / Move / Copy
//!
//! Two-phase transfers between engines and within one engine.

mod common;

use common::{bind, contents, create_child, create_root, engine_at, row};
use tempfile::tempdir;
use tuplespace_core::{
    ContentType, DestSession, Engine, EnvId, EnvironmentDescriptor, RawRecord, ResourceDescriptor,
    SourceSession, StoreError, StorePhase, TransferMode, TupleId, WriteStatus,
};

/// Stream every held environment of `session` into the matching accepted one.
fn pump(
    source: &Engine,
    session: &SourceSession,
    dest: &Engine,
    accept: &DestSession,
) {
    for descriptor in session.descriptors() {
        for record in source.stream_tuples(descriptor.id, session).expect("stream") {
            let record = record.expect("record");
            // exercise the wire form on the way
            let wire = RawRecord::from_wire(&record.to_wire()).expect("wire");
            dest.write_record(descriptor.id, &wire, accept).expect("write record");
        }
    }
}

#[test]
fn copy_between_engines_leaves_source_untouched() {
    let src_dir = tempdir().expect("temp dir");
    let dst_dir = tempdir().expect("temp dir");
    let (source, _) = engine_at(src_dir.path());
    let (dest, _) = engine_at(dst_dir.path());

    let src_root = create_root(&source, "root");
    let env = create_child(&source, src_root, "env");
    let nested = create_child(&source, env, "nested");
    let writer = bind(&source, env, "writer");
    for n in 0..50 {
        writer.write(row(n)).expect("write");
    }
    bind(&source, nested, "writer").write(row(999)).expect("write");
    let before = contents(&source, env);

    let dst_root = create_root(&dest, "root");
    let ids: Vec<EnvId> = source
        .subtree(env)
        .expect("subtree")
        .into_iter()
        .map(|d| d.id)
        .collect();
    let session = source.start_transfer(&ids, TransferMode::Copy).expect("start transfer");
    let accept = dest
        .start_accept(&session.descriptors_under(Some(dst_root)))
        .expect("start accept");
    pump(&source, &session, &dest, &accept);
    dest.commit_accept(accept).expect("commit accept");
    source.commit_transfer(session).expect("commit transfer");

    assert_eq!(contents(&dest, env), before);
    assert_eq!(contents(&dest, nested).len(), 1);
    assert_eq!(contents(&source, env), before);
    assert_eq!(dest.children(dst_root).expect("children").len(), 1);
    assert_eq!(dest.children(env).expect("children")[0].id, nested);
    assert_ne!(source.store_phase(env), Some(StorePhase::ReadOnly));
}

#[test]
fn move_between_engines_removes_source() {
    let src_dir = tempdir().expect("temp dir");
    let dst_dir = tempdir().expect("temp dir");
    let (source, _) = engine_at(src_dir.path());
    let (dest, _) = engine_at(dst_dir.path());

    let src_root = create_root(&source, "root");
    let env = create_child(&source, src_root, "env");
    let writer = bind(&source, env, "writer");
    for n in 0..30 {
        writer.write(row(n)).expect("write");
    }
    let before = contents(&source, env);

    let dst_root = create_root(&dest, "root");
    let session = source.start_transfer(&[env], TransferMode::Move).expect("start transfer");
    assert!(!writer.is_running());
    let accept = dest
        .start_accept(&session.descriptors_under(Some(dst_root)))
        .expect("start accept");
    pump(&source, &session, &dest, &accept);
    dest.commit_accept(accept).expect("commit accept");
    source.commit_transfer(session).expect("commit transfer");

    assert_eq!(source.descriptor(env).expect("lookup"), None);
    assert!(source.children(src_root).expect("children").is_empty());
    assert_eq!(contents(&dest, env), before);
    assert_eq!(dest.descriptor(env).expect("lookup").expect("present").parent, Some(dst_root));
}

#[test]
fn aborted_accept_leaves_no_trace() {
    let dst_dir = tempdir().expect("temp dir");
    let (dest, _) = engine_at(dst_dir.path());
    let root = create_root(&dest, "root");

    let a = EnvironmentDescriptor::child(EnvId::new_v4(), "a", root, common::protection());
    let b = EnvironmentDescriptor::child(EnvId::new_v4(), "b", a.id, common::protection());
    let accept = dest.start_accept(&[a.clone(), b.clone()]).expect("start accept");
    for n in 0..5 {
        let record = RawRecord::from_tuple(&row(n)).expect("encode");
        dest.write_record(b.id, &record, &accept).expect("write");
    }
    dest.abort_accept(accept);

    assert_eq!(dest.descriptor(a.id).expect("lookup"), None);
    assert_eq!(dest.descriptor(b.id).expect("lookup"), None);
    assert!(dest.children(root).expect("children").is_empty());
    assert!(matches!(
        dest.bind(&ResourceDescriptor::storage(b.id), "late", None),
        Err(StoreError::NoSuchEnvironment(_))
    ));
}

#[test]
fn accept_refuses_existing_environments() {
    let dir = tempdir().expect("temp dir");
    let (engine, _) = engine_at(dir.path());
    let root = create_root(&engine, "root");
    let existing = create_child(&engine, root, "taken");
    let fresh = EnvironmentDescriptor::child(EnvId::new_v4(), "fresh", root, common::protection());
    let clash = engine.descriptor(existing).expect("lookup").expect("present");

    assert!(matches!(
        engine.start_accept(&[fresh.clone(), clash]),
        Err(StoreError::AlreadyExists(_))
    ));
    // the part created before the clash is rolled back
    assert_eq!(engine.descriptor(fresh.id).expect("lookup"), None);
}

#[test]
fn unknown_content_types_are_carried_but_not_queried() {
    let dir = tempdir().expect("temp dir");
    let (engine, _) = engine_at(dir.path());
    let root = create_root(&engine, "root");
    let target = EnvironmentDescriptor::child(EnvId::new_v4(), "t", root, common::protection());

    let accept = engine.start_accept(std::slice::from_ref(&target)).expect("accept");
    let opaque = RawRecord {
        id: TupleId::new_v4(),
        content_type: ContentType::Unknown(9),
        payload: vec![1, 2, 3],
    };
    engine.write_record(target.id, &opaque, &accept).expect("write");
    engine
        .write_record(target.id, &RawRecord::from_tuple(&row(1)).expect("encode"), &accept)
        .expect("write");
    engine.commit_accept(accept).expect("commit");

    assert_eq!(contents(&engine, target.id).len(), 1);

    let session = engine.start_transfer(&[target.id], TransferMode::Copy).expect("start");
    let streamed: Vec<RawRecord> = engine
        .stream_tuples(target.id, &session)
        .expect("stream")
        .map(|r| r.expect("record"))
        .collect();
    assert_eq!(streamed.len(), 2);
    assert!(streamed.contains(&opaque));
    engine.abort_transfer(session);
}

#[test]
fn streams_close_when_the_transfer_ends() {
    let dir = tempdir().expect("temp dir");
    let (engine, _) = engine_at(dir.path());
    let root = create_root(&engine, "root");
    let env = create_child(&engine, root, "env");
    let writer = bind(&engine, env, "writer");
    for n in 0..3 {
        writer.write(row(n)).expect("write");
    }

    let session = engine.start_transfer(&[env], TransferMode::Copy).expect("start");
    let mut stream = engine.stream_tuples(env, &session).expect("stream");
    assert!(stream.next().expect("first").is_ok());
    engine.abort_transfer(session);
    assert!(matches!(stream.next(), Some(Err(StoreError::Revoked))));
}

#[test]
fn copy_within_engine_queues_writes_until_commit() {
    let dir = tempdir().expect("temp dir");
    let (engine, _) = engine_at(dir.path());
    let root = create_root(&engine, "root");
    let env = create_child(&engine, root, "env");
    create_child(&engine, env, "leaf");
    let writer = bind(&engine, env, "writer");
    for n in 0..10 {
        writer.write(row(n)).expect("write");
    }
    let before = contents(&engine, env);

    let targets = engine.plan_copy(env, root, "env-copy").expect("plan");
    assert_eq!(targets.len(), 2);
    let session = engine.start_copy(&targets).expect("start copy");
    assert_eq!(engine.store_phase(env), Some(StorePhase::ReadOnly));
    assert_eq!(writer.write(row(100)).expect("deferred"), WriteStatus::Deferred);
    engine.commit_copy(session).expect("commit copy");

    let copy = targets[0].dest.id;
    assert_eq!(contents(&engine, copy).len(), before.len());
    assert_eq!(engine.children(copy).expect("children")[0].name, "leaf");
    // the queued write lands on the source only
    assert_eq!(contents(&engine, env).len(), before.len() + 1);
    assert_eq!(engine.store_phase(env), Some(StorePhase::Open));
}

#[test]
fn aborted_copy_restores_the_source() {
    let dir = tempdir().expect("temp dir");
    let (engine, _) = engine_at(dir.path());
    let root = create_root(&engine, "root");
    let env = create_child(&engine, root, "env");
    let writer = bind(&engine, env, "writer");
    writer.write(row(1)).expect("write");

    let targets = engine.plan_copy(env, root, "env-copy").expect("plan");
    let session = engine.start_copy(&targets).expect("start copy");
    assert_eq!(writer.write(row(2)).expect("deferred"), WriteStatus::Deferred);
    engine.abort_copy(session);

    assert_eq!(engine.descriptor(targets[0].dest.id).expect("lookup"), None);
    assert_eq!(engine.children(root).expect("children").len(), 1);
    assert_eq!(contents(&engine, env).len(), 2);
}
