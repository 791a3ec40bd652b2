//! # Engine
//!
//! The owned service object behind every administrative entry point: it
//! holds the namespace index, the registry of live stores and the lease
//! service, and has an explicit startup/shutdown lifecycle.
//!
//! Startup opens the namespace, checks its format marker and deletes every
//! environment left half-created by a crash before any bind is served.

use crate::admission::{ManagerId, StorePhase, StoreRegistry};
use crate::config::EngineConfig;
use crate::lease::LeaseService;
use crate::session::{BindContext, Manager, ResourceDescriptor};
use crate::storage::namespace::NamespaceIndex;
use crate::storage::shard;
use crate::storage::table::TupleTable;
use crate::types::{EnvId, EnvironmentDescriptor, StoreError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use std::time::Duration;

/// Holder name of the managers the engine binds for its own transfers.
const TRANSFER_HOLDER: &str = "transfer";

/// A running storage engine.
pub struct Engine {
    config: EngineConfig,
    namespace: RwLock<NamespaceIndex>,
    registry: Arc<StoreRegistry>,
    leases: Arc<dyn LeaseService>,
    next_manager: AtomicU64,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("data_root", &self.config.data_root)
            .field("stores", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Open the engine over `config.data_root` and run crash recovery.
    pub fn startup(
        config: EngineConfig,
        leases: Arc<dyn LeaseService>,
    ) -> Result<Self, StoreError> {
        config.validate()?;
        let namespace = NamespaceIndex::open(&config.data_root, &config.table_options())?;
        let recovered = namespace.recover()?;
        let environments = namespace.descriptor_count()?;
        tracing::info!(
            data_root = %config.data_root.display(),
            environments,
            recovered = recovered.len(),
            "engine started"
        );
        Ok(Self {
            config,
            namespace: RwLock::new(namespace),
            registry: Arc::new(StoreRegistry::default()),
            leases,
            next_manager: AtomicU64::new(0),
        })
    }

    /// Revoke every binding and close every store.
    pub fn shutdown(&self) {
        let stores = self.registry.len();
        self.registry.shutdown_all();
        tracing::info!(stores, "engine shut down");
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn namespace(&self) -> RwLockReadGuard<'_, NamespaceIndex> {
        self.namespace.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn registry(&self) -> &Arc<StoreRegistry> {
        &self.registry
    }

    /// Phase of the live store of `env`, if one is open.
    #[must_use]
    pub fn store_phase(&self, env: EnvId) -> Option<StorePhase> {
        self.registry.get(env).map(|store| store.phase())
    }

    // =========================================================================
    // BIND
    // =========================================================================

    /// Bind `holder` to the resource, under a lease of `duration` (the
    /// configured default when `None`).
    pub fn bind(
        &self,
        resource: &ResourceDescriptor,
        holder: &str,
        duration: Option<Duration>,
    ) -> Result<Manager, StoreError> {
        resource.ensure_storage()?;
        let duration = duration.unwrap_or_else(|| self.config.default_lease());
        self.bind_env(resource.env, holder, duration, Some(Arc::clone(&self.leases)))
    }

    /// A lease-free manager for a transfer.
    pub(crate) fn bind_internal(&self, env: EnvId) -> Result<Manager, StoreError> {
        self.bind_env(env, TRANSFER_HOLDER, Duration::ZERO, None)
    }

    fn bind_env(
        &self,
        env: EnvId,
        holder: &str,
        duration: Duration,
        leases: Option<Arc<dyn LeaseService>>,
    ) -> Result<Manager, StoreError> {
        loop {
            let store = self.open_store(env)?;
            let bound = Manager::bind(BindContext {
                id: ManagerId(self.next_manager.fetch_add(1, Ordering::Relaxed)),
                holder: holder.to_owned(),
                lease_duration: duration,
                store: Arc::clone(&store),
                registry: Arc::downgrade(&self.registry),
                leases: leases.clone(),
            });
            match bound {
                // the store closed between lookup and attach; open a fresh one
                Err(StoreError::Revoked) if store.phase().is_terminal() => {
                    self.registry.forget(&store);
                }
                other => return other,
            }
        }
    }

    fn open_store(&self, env: EnvId) -> Result<Arc<crate::admission::Store>, StoreError> {
        let namespace = self.namespace();
        namespace.ensure_bindable(env)?;
        let path = shard::table_path(namespace.data_root(), env);
        let options = namespace.options().clone();
        drop(namespace);
        self.registry
            .get_or_open(env, || TupleTable::open(env, &path, &options))
    }

    // =========================================================================
    // NAMESPACE ADMINISTRATION
    // =========================================================================

    /// Create one environment.
    pub fn create(&self, descriptor: &EnvironmentDescriptor) -> Result<(), StoreError> {
        self.namespace().create(descriptor)?;
        tracing::info!(
            env = %descriptor.id,
            name = %descriptor.name,
            parent = ?descriptor.parent,
            "environment created"
        );
        Ok(())
    }

    /// Delete environments. `ids` must be the full closure of every subtree
    /// being deleted. Refused while any target is read-only or moving.
    pub fn delete(&self, ids: &[EnvId]) -> Result<(), StoreError> {
        for id in ids {
            let phase = self.store_phase(*id);
            if let Some(phase @ (StorePhase::ReadOnly | StorePhase::Moving)) = phase {
                tracing::debug!(env = %id, ?phase, "delete refused");
                return Err(StoreError::Busy(*id));
            }
        }
        self.drop_environments(ids)
    }

    /// Delete without the busy check: the caller already quiesced and
    /// notified every binding.
    pub(crate) fn drop_environments(&self, ids: &[EnvId]) -> Result<(), StoreError> {
        for id in ids {
            self.registry.shutdown(*id);
        }
        self.namespace().remove(ids)?;
        tracing::info!(count = ids.len(), "environments deleted");
        Ok(())
    }

    /// Re-parent `id` under `new_parent`.
    pub fn move_environment(&self, id: EnvId, new_parent: EnvId) -> Result<(), StoreError> {
        self.namespace().move_env(id, new_parent)
    }

    pub fn rename(&self, id: EnvId, name: &str) -> Result<(), StoreError> {
        self.namespace().rename(id, name)
    }

    pub fn descriptor(&self, id: EnvId) -> Result<Option<EnvironmentDescriptor>, StoreError> {
        self.namespace().guid_to_descriptor(id)
    }

    pub fn children(&self, id: EnvId) -> Result<Vec<EnvironmentDescriptor>, StoreError> {
        self.namespace().get_children(id)
    }

    pub fn roots(&self) -> Result<Vec<EnvironmentDescriptor>, StoreError> {
        self.namespace().roots()
    }

    /// `id` and every descendant, parents first.
    pub fn subtree(&self, id: EnvId) -> Result<Vec<EnvironmentDescriptor>, StoreError> {
        self.namespace().subtree(id)
    }

    /// Reclaim free pages of the namespace index.
    pub fn compact_namespace(&self) -> Result<bool, StoreError> {
        self.namespace
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .compact()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if !self.registry.is_empty() {
            self.registry.shutdown_all();
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
