//! # Clone / Move / Copy
//!
//! Two-phase transfer of environment subtrees.
//!
//! The source side quiesces its environments ([`Engine::start_transfer`]):
//! `Move` takes each store exclusively (revoking every binding), `Copy`
//! opens a read-only window so reads continue and writes queue. Raw records
//! are then streamed out lazily.
//!
//! The destination side ([`Engine::start_accept`]) creates every target
//! environment under a pending-create marker and accepts raw records
//! directly into the tables. Until [`Engine::commit_accept`] clears the
//! markers, a crash leaves the destination as if the accept never started.
//!
//! Abort paths always succeed; errors met while aborting are logged and
//! swallowed.

use crate::admission::StorePhase;
use crate::engine::Engine;
use crate::session::Manager;
use crate::storage::table::{RawRecord, TupleStream, TupleTable};
use crate::types::{EnvId, EnvironmentDescriptor, StoreError};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// How the source environments are held during a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Exclusive; the sources are deleted on commit.
    Move,
    /// Shared read-only window; the sources survive.
    Copy,
}

// =============================================================================
// SESSIONS
// =============================================================================

struct Source {
    descriptor: EnvironmentDescriptor,
    manager: Manager,
}

/// The source half of a transfer. Consumed by commit or abort.
pub struct SourceSession {
    mode: TransferMode,
    sources: Vec<Source>,
    streams: Mutex<Vec<Arc<AtomicBool>>>,
}

impl fmt::Debug for SourceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceSession")
            .field("mode", &self.mode)
            .field("envs", &self.sources.iter().map(|s| s.descriptor.id).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl SourceSession {
    #[must_use]
    pub fn mode(&self) -> TransferMode {
        self.mode
    }

    /// Descriptors of the held environments, in the order given.
    #[must_use]
    pub fn descriptors(&self) -> Vec<EnvironmentDescriptor> {
        self.sources.iter().map(|s| s.descriptor.clone()).collect()
    }

    /// The descriptors, with every environment whose parent is not part of
    /// the transfer re-parented under `parent`.
    #[must_use]
    pub fn descriptors_under(&self, parent: Option<EnvId>) -> Vec<EnvironmentDescriptor> {
        let held: BTreeSet<EnvId> = self.sources.iter().map(|s| s.descriptor.id).collect();
        self.sources
            .iter()
            .map(|s| {
                let mut d = s.descriptor.clone();
                if !d.parent.is_some_and(|p| held.contains(&p)) {
                    d.parent = parent;
                }
                d
            })
            .collect()
    }

    fn source(&self, env: EnvId) -> Result<&Source, StoreError> {
        self.sources
            .iter()
            .find(|s| s.descriptor.id == env)
            .ok_or_else(|| {
                StoreError::UnknownResource(format!("{env} is not part of this transfer"))
            })
    }

    fn close_streams(&self) {
        let mut guard = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        let streams = std::mem::take(&mut *guard);
        drop(guard);
        for closed in streams {
            closed.store(true, Ordering::Release);
        }
    }
}

/// The destination half of a transfer. Consumed by commit or abort.
pub struct DestSession {
    envs: Vec<EnvId>,
    tables: BTreeMap<EnvId, TupleTable>,
}

impl fmt::Debug for DestSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestSession")
            .field("envs", &self.envs)
            .finish_non_exhaustive()
    }
}

impl DestSession {
    #[must_use]
    pub fn envs(&self) -> &[EnvId] {
        &self.envs
    }
}

/// One environment of a copy: where it comes from, what it becomes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyTarget {
    pub source: EnvId,
    pub dest: EnvironmentDescriptor,
}

/// Both halves of a same-engine copy, with every record already streamed.
#[derive(Debug)]
pub struct CopySession {
    source: SourceSession,
    dest: DestSession,
}

impl CopySession {
    #[must_use]
    pub fn dest_envs(&self) -> &[EnvId] {
        self.dest.envs()
    }
}

// =============================================================================
// SOURCE SIDE
// =============================================================================

impl Engine {
    /// Hold `envs` for a transfer. On failure every environment already
    /// held is released before the error is returned.
    pub fn start_transfer(
        &self,
        envs: &[EnvId],
        mode: TransferMode,
    ) -> Result<SourceSession, StoreError> {
        let mut session = SourceSession {
            mode,
            sources: Vec::with_capacity(envs.len()),
            streams: Mutex::new(Vec::new()),
        };
        for env in envs {
            match self.hold_source(*env, mode) {
                Ok(source) => session.sources.push(source),
                Err(e) => {
                    tracing::warn!(
                        env = %env,
                        error = %e,
                        "transfer start failed, releasing held environments"
                    );
                    self.release_sources(session);
                    return Err(e);
                }
            }
        }
        tracing::info!(envs = envs.len(), ?mode, "transfer started");
        Ok(session)
    }

    fn hold_source(&self, env: EnvId, mode: TransferMode) -> Result<Source, StoreError> {
        let descriptor = self.descriptor(env)?.ok_or(StoreError::NoSuchEnvironment(env))?;
        let manager = self.bind_internal(env)?;
        let held = match mode {
            TransferMode::Move => manager.store().begin_move(Some(manager.id())),
            TransferMode::Copy => manager.store().begin_read_only(),
        };
        if let Err(e) = held {
            manager.revoke();
            return Err(e);
        }
        Ok(Source { descriptor, manager })
    }

    /// Undo the hold on every source: a moving store is closed without
    /// deleting its data, a read-only window is ended.
    fn release_sources(&self, session: SourceSession) {
        session.close_streams();
        for source in session.sources {
            let store = source.manager.store();
            match session.mode {
                TransferMode::Move => self.registry().shutdown(store.env()),
                TransferMode::Copy => {
                    if store.phase() == StorePhase::ReadOnly {
                        store.end_read_only();
                    }
                    source.manager.revoke();
                }
            }
        }
    }

    /// Lazy forward stream of the raw records of one held environment.
    pub fn stream_tuples(
        &self,
        env: EnvId,
        session: &SourceSession,
    ) -> Result<TupleStream, StoreError> {
        let source = session.source(env)?;
        let closed = Arc::new(AtomicBool::new(false));
        let stream = source.manager.store().stream(Arc::clone(&closed))?;
        session
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(closed);
        Ok(stream)
    }

    /// Finish the source side: a move deletes every source environment, a
    /// copy ends the read-only windows (replaying queued writes).
    pub fn commit_transfer(&self, session: SourceSession) -> Result<(), StoreError> {
        let mode = session.mode;
        let ids: Vec<EnvId> = session.sources.iter().map(|s| s.descriptor.id).collect();
        match mode {
            TransferMode::Move => {
                session.close_streams();
                // bindings were revoked by begin_move; no per-binding notice here
                self.drop_environments(&ids)?;
            }
            TransferMode::Copy => self.release_sources(session),
        }
        tracing::info!(envs = ids.len(), ?mode, "transfer committed");
        Ok(())
    }

    /// Abandon the source side. Moved environments survive with their data
    /// but their former bindings are not restored.
    pub fn abort_transfer(&self, session: SourceSession) {
        let mode = session.mode;
        let envs = session.sources.len();
        self.release_sources(session);
        tracing::info!(envs, ?mode, "transfer aborted");
    }

    // =========================================================================
    // DESTINATION SIDE
    // =========================================================================

    /// Create every target environment (parents first) under a pending
    /// marker and open it for bulk writes. None may already exist.
    pub fn start_accept(
        &self,
        descriptors: &[EnvironmentDescriptor],
    ) -> Result<DestSession, StoreError> {
        let mut session = DestSession {
            envs: Vec::with_capacity(descriptors.len()),
            tables: BTreeMap::new(),
        };
        for descriptor in descriptors {
            match self.namespace().begin_create(descriptor) {
                Ok(table) => {
                    session.envs.push(descriptor.id);
                    session.tables.insert(descriptor.id, table);
                }
                Err(e) => {
                    tracing::warn!(
                        env = %descriptor.id,
                        error = %e,
                        "accept failed, removing created environments"
                    );
                    self.abort_accept(session);
                    return Err(e);
                }
            }
        }
        tracing::info!(envs = descriptors.len(), "accept started");
        Ok(session)
    }

    /// Raw upsert into an accepted environment, bypassing admission.
    pub fn write_record(
        &self,
        env: EnvId,
        record: &RawRecord,
        session: &DestSession,
    ) -> Result<(), StoreError> {
        session
            .tables
            .get(&env)
            .ok_or_else(|| {
                StoreError::UnknownResource(format!("{env} is not part of this accept"))
            })?
            .write_raw(record)
    }

    /// Close the bulk tables and clear every pending marker in one
    /// transaction. The environments are durable once this returns.
    pub fn commit_accept(&self, session: DestSession) -> Result<(), StoreError> {
        let DestSession { envs, tables } = session;
        drop(tables);
        self.namespace().clear_pending(&envs)?;
        tracing::info!(envs = envs.len(), "accept committed");
        Ok(())
    }

    /// Remove every environment the accept created. Never fails.
    pub fn abort_accept(&self, session: DestSession) {
        let DestSession { envs, tables } = session;
        drop(tables);
        let namespace = self.namespace();
        for env in envs.iter().rev() {
            if let Err(e) = namespace.remove(&[*env]) {
                tracing::warn!(env = %env, error = %e, "ignoring failure while aborting accept");
            }
        }
        if let Err(e) = namespace.clear_pending(&envs) {
            tracing::warn!(error = %e, "ignoring failure while clearing pending markers");
        }
        tracing::info!(envs = envs.len(), "accept aborted");
    }

    // =========================================================================
    // COPY
    // =========================================================================

    /// Targets for copying the subtree of `source_root` under `new_parent`
    /// as `name`, with fresh ids. Descendants keep their names.
    pub fn plan_copy(
        &self,
        source_root: EnvId,
        new_parent: EnvId,
        name: &str,
    ) -> Result<Vec<CopyTarget>, StoreError> {
        let subtree = self.subtree(source_root)?;
        let renamed: BTreeMap<EnvId, EnvId> =
            subtree.iter().map(|d| (d.id, EnvId::new_v4())).collect();
        let mut targets = Vec::with_capacity(subtree.len());
        for d in subtree {
            let id = renamed.get(&d.id).copied().ok_or(StoreError::NoSuchEnvironment(d.id))?;
            let dest = if d.id == source_root {
                EnvironmentDescriptor::child(id, name, new_parent, d.protection)
            } else {
                let parent = d
                    .parent
                    .and_then(|p| renamed.get(&p).copied())
                    .ok_or_else(|| StoreError::fatal(format!("{} escaped its own subtree", d.id)))?;
                EnvironmentDescriptor::child(id, d.name.clone(), parent, d.protection)
            };
            targets.push(CopyTarget { source: d.id, dest });
        }
        Ok(targets)
    }

    /// Hold the sources read-only, create the destinations, and stream every
    /// record across before returning.
    pub fn start_copy(&self, targets: &[CopyTarget]) -> Result<CopySession, StoreError> {
        let sources: Vec<EnvId> = targets.iter().map(|t| t.source).collect();
        let dests: Vec<EnvironmentDescriptor> = targets.iter().map(|t| t.dest.clone()).collect();

        let source = self.start_transfer(&sources, TransferMode::Copy)?;
        let dest = match self.start_accept(&dests) {
            Ok(dest) => dest,
            Err(e) => {
                self.abort_transfer(source);
                return Err(e);
            }
        };

        for target in targets {
            if let Err(e) = self.pump(target, &source, &dest) {
                tracing::warn!(source = %target.source, error = %e, "copy failed while streaming");
                self.abort_transfer(source);
                self.abort_accept(dest);
                return Err(e);
            }
        }
        Ok(CopySession { source, dest })
    }

    fn pump(
        &self,
        target: &CopyTarget,
        source: &SourceSession,
        dest: &DestSession,
    ) -> Result<(), StoreError> {
        let mut copied = 0u64;
        for record in self.stream_tuples(target.source, source)? {
            self.write_record(target.dest.id, &record?, dest)?;
            copied += 1;
        }
        tracing::debug!(
            source = %target.source,
            dest = %target.dest.id,
            copied,
            "environment copied"
        );
        Ok(())
    }

    /// Commit the destination, then the source.
    pub fn commit_copy(&self, session: CopySession) -> Result<(), StoreError> {
        let CopySession { source, dest } = session;
        if let Err(e) = self.commit_accept(dest) {
            self.abort_transfer(source);
            return Err(e);
        }
        self.commit_transfer(source)
    }

    /// Abort the source, then the destination.
    pub fn abort_copy(&self, session: CopySession) {
        let CopySession { source, dest } = session;
        self.abort_transfer(source);
        self.abort_accept(dest);
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::lease::LocalLeaseService;
    use crate::query::Query;
    use crate::session::ResourceDescriptor;
    use crate::tuple::Tuple;
    use crate::types::ProtectionId;
    use tempfile::tempdir;

    fn engine(root: &std::path::Path) -> Engine {
        Engine::startup(EngineConfig::with_data_root(root), Arc::new(LocalLeaseService::new()))
            .expect("startup")
    }

    fn populated(engine: &Engine) -> (EnvId, EnvId, Vec<Tuple>) {
        let root = EnvId::new_v4();
        let child = EnvId::new_v4();
        engine
            .create(&EnvironmentDescriptor::root(root, "root", ProtectionId::from_u128(1)))
            .expect("root");
        engine
            .create(&EnvironmentDescriptor::child(child, "src", root, ProtectionId::from_u128(1)))
            .expect("child");
        let m = engine.bind(&ResourceDescriptor::storage(child), "seed", None).expect("bind");
        let tuples: Vec<Tuple> = (0..10)
            .map(|i| Tuple::builder("Row").field("i", i as i64).build())
            .collect();
        for t in &tuples {
            m.write(t.clone()).expect("write");
        }
        (root, child, tuples)
    }

    #[test]
    fn unknown_env_in_session_is_reported() {
        let temp = tempdir().expect("temp dir");
        let engine = engine(temp.path());
        let (_, child, _) = populated(&engine);
        let session = engine.start_transfer(&[child], TransferMode::Copy).expect("start");
        assert!(matches!(
            engine.stream_tuples(EnvId::new_v4(), &session),
            Err(StoreError::UnknownResource(_))
        ));
        engine.abort_transfer(session);
    }

    #[test]
    fn failed_start_releases_held_sources() {
        let temp = tempdir().expect("temp dir");
        let engine = engine(temp.path());
        let (_, child, _) = populated(&engine);

        let missing = EnvId::new_v4();
        assert!(matches!(
            engine.start_transfer(&[child, missing], TransferMode::Copy),
            Err(StoreError::NoSuchEnvironment(_))
        ));
        assert_ne!(engine.store_phase(child), Some(StorePhase::ReadOnly));
    }

    #[test]
    fn copy_within_engine() {
        let temp = tempdir().expect("temp dir");
        let engine = engine(temp.path());
        let (root, child, tuples) = populated(&engine);

        let targets = engine.plan_copy(child, root, "copy").expect("plan");
        let session = engine.start_copy(&targets).expect("start copy");
        engine.commit_copy(session).expect("commit copy");

        let dest = targets[0].dest.id;
        assert_eq!(engine.children(root).expect("children").len(), 2);
        let m = engine.bind(&ResourceDescriptor::storage(dest), "reader", None).expect("bind");
        for t in &tuples {
            assert_eq!(m.read_by_id(t.id()).expect("read"), Some(t.clone()));
        }

        // source untouched and open
        let src = engine.bind(&ResourceDescriptor::storage(child), "reader", None).expect("bind");
        assert!(src.write(Tuple::builder("Row").build()).is_ok());
    }

    #[test]
    fn aborted_copy_leaves_no_destination() {
        let temp = tempdir().expect("temp dir");
        let engine = engine(temp.path());
        let (root, child, _) = populated(&engine);

        let targets = engine.plan_copy(child, root, "copy").expect("plan");
        let session = engine.start_copy(&targets).expect("start copy");
        engine.abort_copy(session);

        assert_eq!(engine.descriptor(targets[0].dest.id).expect("lookup"), None);
        assert_eq!(engine.children(root).expect("children").len(), 1);
        let m = engine.bind(&ResourceDescriptor::storage(child), "w", None).expect("bind");
        assert!(m.read(&Query::Empty).expect("read").is_some());
    }
}
