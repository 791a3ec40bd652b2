//! # Namespace Index
//!
//! The environment hierarchy, persisted in one redb database at
//! `<data_root>/namespace.redb`:
//!
//! | table            | key         | value                                   |
//! |------------------|-------------|-----------------------------------------|
//! | `descriptors`    | env id      | postcard row (parent, protection, name) |
//! | `children`       | parent id   | child ids (multimap; root under nil)    |
//! | `pending_create` | env id      | unit marker of an unfinished create     |
//! | `metadata`       | `&str`      | format marker (`format_major/minor`)    |
//!
//! ## Crash Safety
//!
//! Creating an environment is split in phases. A pending-create marker is
//! committed first, then the shard directory, tuple table and index rows are
//! created, and the marker is cleared last. Any marker (or shard lock
//! marker) left behind at startup names an environment that never finished
//! being created; [`NamespaceIndex::recover`] deletes it.

use crate::primitives::{FORMAT_MAJOR, FORMAT_MINOR, LEGACY_FORMAT_MINOR, NAMESPACE_FILE};
use crate::storage::retry::{EngineError, retry_transient};
use crate::storage::shard;
use crate::storage::table::{TableOptions, TupleTable};
use crate::types::{EnvId, EnvironmentDescriptor, ProtectionId, StoreError};
use redb::{
    Database, MultimapTableDefinition, ReadTransaction, ReadableDatabase, ReadableMultimapTable,
    ReadableTable, ReadableTableMetadata, TableDefinition, WriteTransaction,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Table of descriptors: EnvId(u128) -> serialized row
const DESCRIPTORS: TableDefinition<u128, &[u8]> = TableDefinition::new("descriptors");

/// Parent -> children links. Roots are linked under the nil id.
const CHILDREN: MultimapTableDefinition<u128, u128> = MultimapTableDefinition::new("children");

/// Environments whose creation has not been committed yet.
const PENDING_CREATE: TableDefinition<u128, ()> = TableDefinition::new("pending_create");

/// Table for metadata: key string -> value u64
const METADATA: TableDefinition<&str, u64> = TableDefinition::new("metadata");

const FORMAT_MAJOR_KEY: &str = "format_major";
const FORMAT_MINOR_KEY: &str = "format_minor";

/// Parent key under which root environments are linked.
const ROOT_PARENT: u128 = Uuid::nil().as_u128();

// =============================================================================
// ROWS
// =============================================================================

/// On-disk format of a namespace index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatVersion {
    pub major: u64,
    pub minor: u64,
}

impl FormatVersion {
    pub const CURRENT: Self = Self {
        major: FORMAT_MAJOR,
        minor: FORMAT_MINOR,
    };

    /// Rows of the legacy minor version carry no protection domain.
    #[must_use]
    pub fn is_legacy(self) -> bool {
        self.major == FORMAT_MAJOR && self.minor == LEGACY_FORMAT_MINOR
    }

    fn is_supported(self) -> bool {
        self == Self::CURRENT || self.is_legacy()
    }
}

#[derive(Serialize, Deserialize)]
struct DescriptorRow {
    parent: Option<EnvId>,
    protection: ProtectionId,
    name: String,
}

#[derive(Serialize, Deserialize)]
struct LegacyDescriptorRow {
    parent: Option<EnvId>,
    name: String,
}

// =============================================================================
// NAMESPACE INDEX
// =============================================================================

/// The persistent environment hierarchy.
pub struct NamespaceIndex {
    db: Database,
    data_root: PathBuf,
    options: TableOptions,
    format: FormatVersion,
}

impl std::fmt::Debug for NamespaceIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespaceIndex")
            .field("data_root", &self.data_root)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

impl NamespaceIndex {
    /// Open or create the index under `data_root` and check its format
    /// marker. A fresh index is stamped with the current format.
    pub fn open(data_root: &Path, options: &TableOptions) -> Result<Self, StoreError> {
        fs::create_dir_all(data_root)?;
        let path = data_root.join(NAMESPACE_FILE);

        let (db, format) = retry_transient(options.retry_backoff, || {
            let db = Database::builder()
                .set_cache_size(options.cache_size_bytes)
                .create(&path)?;
            let txn = db.begin_write()?;
            let format = {
                txn.open_table(DESCRIPTORS)?;
                txn.open_multimap_table(CHILDREN)?;
                txn.open_table(PENDING_CREATE)?;
                let mut meta = txn.open_table(METADATA)?;
                let major = meta.get(FORMAT_MAJOR_KEY)?.map(|v| v.value());
                let minor = meta.get(FORMAT_MINOR_KEY)?.map(|v| v.value());
                match (major, minor) {
                    (Some(major), Some(minor)) => FormatVersion { major, minor },
                    (None, None) => {
                        meta.insert(FORMAT_MAJOR_KEY, FORMAT_MAJOR)?;
                        meta.insert(FORMAT_MINOR_KEY, FORMAT_MINOR)?;
                        FormatVersion::CURRENT
                    }
                    // half-written marker: report what is there
                    (major, minor) => FormatVersion {
                        major: major.unwrap_or(0),
                        minor: minor.unwrap_or(0),
                    },
                }
            };
            txn.commit()?;
            Ok((db, format))
        })?;

        if !format.is_supported() {
            tracing::error!(
                major = format.major,
                minor = format.minor,
                "unsupported namespace format"
            );
            return Err(StoreError::UnsupportedFormat {
                major: format.major,
                minor: format.minor,
            });
        }
        if format.is_legacy() {
            tracing::warn!(
                minor = format.minor,
                "legacy namespace format: protection domains were not recorded and read as unknown"
            );
        }

        tracing::info!(
            path = %path.display(),
            major = format.major,
            minor = format.minor,
            "namespace index opened"
        );
        Ok(Self {
            db,
            data_root: data_root.to_path_buf(),
            options: options.clone(),
            format,
        })
    }

    #[must_use]
    pub fn format(&self) -> FormatVersion {
        self.format
    }

    #[must_use]
    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    #[must_use]
    pub fn options(&self) -> &TableOptions {
        &self.options
    }

    // =========================================================================
    // TRANSACTION HELPERS
    // =========================================================================

    fn read<T>(
        &self,
        op: impl Fn(&ReadTransaction) -> Result<T, EngineError>,
    ) -> Result<T, StoreError> {
        retry_transient(self.options.retry_backoff, || {
            let txn = self.db.begin_read()?;
            op(&txn)
        })
    }

    fn write<T>(
        &self,
        op: impl Fn(&WriteTransaction) -> Result<T, EngineError>,
    ) -> Result<T, StoreError> {
        retry_transient(self.options.retry_backoff, || {
            let txn = self.db.begin_write()?;
            let out = op(&txn)?;
            txn.commit()?;
            Ok(out)
        })
    }

    fn encode(&self, descriptor: &EnvironmentDescriptor) -> Result<Vec<u8>, StoreError> {
        let bytes = if self.format.is_legacy() {
            postcard::to_allocvec(&LegacyDescriptorRow {
                parent: descriptor.parent,
                name: descriptor.name.clone(),
            })?
        } else {
            postcard::to_allocvec(&DescriptorRow {
                parent: descriptor.parent,
                protection: descriptor.protection,
                name: descriptor.name.clone(),
            })?
        };
        Ok(bytes)
    }

    fn decode(&self, id: u128, bytes: &[u8]) -> Result<EnvironmentDescriptor, StoreError> {
        let id = EnvId::from_u128(id);
        let corrupt = |e: postcard::Error| {
            StoreError::fatal(format!("descriptor row of {id} is corrupt: {e}"))
        };
        if self.format.is_legacy() {
            let row: LegacyDescriptorRow = postcard::from_bytes(bytes).map_err(corrupt)?;
            Ok(EnvironmentDescriptor {
                id,
                name: row.name,
                parent: row.parent,
                protection: ProtectionId::UNKNOWN,
            })
        } else {
            let row: DescriptorRow = postcard::from_bytes(bytes).map_err(corrupt)?;
            Ok(EnvironmentDescriptor {
                id,
                name: row.name,
                parent: row.parent,
                protection: row.protection,
            })
        }
    }

    fn load(
        &self,
        txn: &ReadTransaction,
        id: u128,
    ) -> Result<Option<EnvironmentDescriptor>, EngineError> {
        self.lookup(&txn.open_table(DESCRIPTORS)?, id)
    }

    /// Decode the row of `id` from an already opened descriptor table.
    fn lookup(
        &self,
        table: &impl ReadableTable<u128, &'static [u8]>,
        id: u128,
    ) -> Result<Option<EnvironmentDescriptor>, EngineError> {
        match table.get(id)? {
            Some(bytes) => Ok(Some(self.decode(id, bytes.value())?)),
            None => Ok(None),
        }
    }

    // =========================================================================
    // LOOKUPS
    // =========================================================================

    /// Point lookup of a descriptor.
    pub fn guid_to_descriptor(
        &self,
        id: EnvId,
    ) -> Result<Option<EnvironmentDescriptor>, StoreError> {
        self.read(|txn| self.load(txn, id.as_u128()))
    }

    pub fn contains(&self, id: EnvId) -> Result<bool, StoreError> {
        Ok(self.guid_to_descriptor(id)?.is_some())
    }

    /// Whether `id` may be bound: it exists and its create has committed.
    ///
    /// A pending environment's table is held open by its creator, so a bind
    /// is refused as busy until the create commits or is rolled back.
    pub fn ensure_bindable(&self, id: EnvId) -> Result<(), StoreError> {
        self.read(|txn| {
            if txn.open_table(PENDING_CREATE)?.get(id.as_u128())?.is_some() {
                return Err(StoreError::Busy(id).into());
            }
            if txn.open_table(DESCRIPTORS)?.get(id.as_u128())?.is_none() {
                return Err(StoreError::NoSuchEnvironment(id).into());
            }
            Ok(())
        })
    }

    /// Children of `id`, in id order.
    ///
    /// A linked child that is missing or points at another parent means
    /// the index is corrupt; that is fatal.
    pub fn get_children(&self, id: EnvId) -> Result<Vec<EnvironmentDescriptor>, StoreError> {
        self.children_of(id.as_u128(), Some(id))
    }

    /// Every root environment (there is at most one).
    pub fn roots(&self) -> Result<Vec<EnvironmentDescriptor>, StoreError> {
        self.children_of(ROOT_PARENT, None)
    }

    fn children_of(
        &self,
        key: u128,
        parent: Option<EnvId>,
    ) -> Result<Vec<EnvironmentDescriptor>, StoreError> {
        self.read(|txn| {
            let links = txn.open_multimap_table(CHILDREN)?;
            let mut children = Vec::new();
            for child in links.get(key)? {
                let child = child?.value();
                let descriptor = self.load(txn, child)?.ok_or_else(|| {
                    StoreError::fatal(format!(
                        "child link {} -> {} has no descriptor",
                        EnvId::from_u128(key),
                        EnvId::from_u128(child)
                    ))
                })?;
                if descriptor.parent != parent {
                    return Err(StoreError::fatal(format!(
                        "environment {} is linked under {} but names parent {:?}",
                        descriptor.id,
                        EnvId::from_u128(key),
                        descriptor.parent
                    ))
                    .into());
                }
                children.push(descriptor);
            }
            Ok(children)
        })
    }

    /// `id` and all of its descendants, parents before children.
    pub fn subtree(&self, id: EnvId) -> Result<Vec<EnvironmentDescriptor>, StoreError> {
        let root = self
            .guid_to_descriptor(id)?
            .ok_or(StoreError::NoSuchEnvironment(id))?;
        let mut closure = Vec::new();
        let mut queue = VecDeque::from([root]);
        while let Some(descriptor) = queue.pop_front() {
            queue.extend(self.get_children(descriptor.id)?);
            closure.push(descriptor);
        }
        Ok(closure)
    }

    pub fn descriptor_count(&self) -> Result<u64, StoreError> {
        self.read(|txn| Ok(txn.open_table(DESCRIPTORS)?.len()?))
    }

    /// Environments whose create was never committed.
    pub fn pending(&self) -> Result<Vec<EnvId>, StoreError> {
        self.read(|txn| {
            let table = txn.open_table(PENDING_CREATE)?;
            let mut ids = Vec::new();
            for entry in table.iter()? {
                let (key, _) = entry?;
                ids.push(EnvId::from_u128(key.value()));
            }
            Ok(ids)
        })
    }

    // =========================================================================
    // CREATE
    // =========================================================================

    /// Create an environment and commit it in one call.
    pub fn create(&self, descriptor: &EnvironmentDescriptor) -> Result<(), StoreError> {
        let table = self.begin_create(descriptor)?;
        drop(table);
        self.clear_pending(&[descriptor.id])
    }

    /// Every phase of a create except clearing the pending marker. The
    /// returned table is open for bulk writes; until
    /// [`clear_pending`](Self::clear_pending) runs, startup recovery will
    /// delete the environment.
    pub fn begin_create(
        &self,
        descriptor: &EnvironmentDescriptor,
    ) -> Result<TupleTable, StoreError> {
        let id = descriptor.id;
        let row = self.encode(descriptor)?;

        self.write(|txn| {
            let descriptors = txn.open_table(DESCRIPTORS)?;
            let mut pending = txn.open_table(PENDING_CREATE)?;
            if descriptors.get(id.as_u128())?.is_some() || pending.get(id.as_u128())?.is_some() {
                return Err(StoreError::AlreadyExists(id).into());
            }
            match descriptor.parent {
                Some(parent) => {
                    if descriptors.get(parent.as_u128())?.is_none() {
                        return Err(StoreError::NoSuchEnvironment(parent).into());
                    }
                }
                None => {
                    let links = txn.open_multimap_table(CHILDREN)?;
                    if !links.get(ROOT_PARENT)?.is_empty() {
                        return Err(StoreError::InvalidDescriptor(format!(
                            "{id} has no parent but a root already exists"
                        ))
                        .into());
                    }
                }
            }
            pending.insert(id.as_u128(), ())?;
            Ok(())
        })?;

        match self.materialize(descriptor, &row) {
            Ok(table) => {
                tracing::debug!(
                    env = %id,
                    name = %descriptor.name,
                    "environment created, pending commit"
                );
                Ok(table)
            }
            Err(e) => {
                tracing::warn!(env = %id, error = %e, "create failed, rolling back");
                if let Err(cleanup) = self.remove(&[id]) {
                    tracing::warn!(
                        env = %id,
                        error = %cleanup,
                        "rollback of failed create incomplete"
                    );
                }
                Err(e)
            }
        }
    }

    fn materialize(
        &self,
        descriptor: &EnvironmentDescriptor,
        row: &[u8],
    ) -> Result<TupleTable, StoreError> {
        let id = descriptor.id;
        shard::prepare(&self.data_root, id)?;
        let table = TupleTable::open(id, &shard::table_path(&self.data_root, id), &self.options)?;

        let parent = descriptor.parent.map_or(ROOT_PARENT, EnvId::as_u128);
        self.write(|txn| {
            let mut descriptors = txn.open_table(DESCRIPTORS)?;
            let mut links = txn.open_multimap_table(CHILDREN)?;
            // the parent may have been deleted, or a root created, since the marker
            match descriptor.parent {
                Some(parent) if descriptors.get(parent.as_u128())?.is_none() => {
                    return Err(StoreError::NoSuchEnvironment(parent).into());
                }
                None if !links.get(ROOT_PARENT)?.is_empty() => {
                    return Err(StoreError::InvalidDescriptor(format!(
                        "{id} has no parent but a root already exists"
                    ))
                    .into());
                }
                _ => {}
            }
            descriptors.insert(id.as_u128(), row)?;
            links.insert(parent, id.as_u128())?;
            Ok(())
        })?;
        shard::release(&self.data_root, id)?;
        Ok(table)
    }

    /// Clear the pending-create markers of `ids` in one transaction. Once
    /// this returns the environments survive any crash.
    pub fn clear_pending(&self, ids: &[EnvId]) -> Result<(), StoreError> {
        self.write(|txn| {
            let mut pending = txn.open_table(PENDING_CREATE)?;
            for id in ids {
                pending.remove(id.as_u128())?;
            }
            Ok(())
        })
    }

    // =========================================================================
    // MUTATIONS
    // =========================================================================

    /// Rewrite the name of `id`, keeping parent and protection.
    pub fn rename(&self, id: EnvId, name: &str) -> Result<(), StoreError> {
        self.write(|txn| {
            let mut table = txn.open_table(DESCRIPTORS)?;
            let current = table
                .get(id.as_u128())?
                .map(|row| self.decode(id.as_u128(), row.value()))
                .transpose()?
                .ok_or(StoreError::NoSuchEnvironment(id))?;
            let renamed = EnvironmentDescriptor {
                name: name.to_owned(),
                ..current
            };
            table.insert(id.as_u128(), self.encode(&renamed)?.as_slice())?;
            Ok(())
        })?;
        tracing::info!(env = %id, name, "environment renamed");
        Ok(())
    }

    /// Re-parent `id` under `new_parent`. Every check runs in the
    /// transaction that relinks, so concurrent moves cannot form a cycle.
    pub fn move_env(&self, id: EnvId, new_parent: EnvId) -> Result<(), StoreError> {
        let old_parent = self.write(|txn| {
            let mut table = txn.open_table(DESCRIPTORS)?;
            let mut links = txn.open_multimap_table(CHILDREN)?;

            let current = self
                .lookup(&table, id.as_u128())?
                .ok_or(StoreError::NoSuchEnvironment(id))?;
            let Some(old_parent) = current.parent else {
                return Err(StoreError::InvalidDescriptor(format!("cannot move root {id}")).into());
            };
            if table.get(new_parent.as_u128())?.is_none() {
                return Err(StoreError::NoSuchEnvironment(new_parent).into());
            }
            self.ensure_not_below(&table, id, new_parent)?;

            let moved = EnvironmentDescriptor {
                parent: Some(new_parent),
                ..current
            };
            let row = self.encode(&moved)?;
            links.remove(old_parent.as_u128(), id.as_u128())?;
            table.insert(id.as_u128(), row.as_slice())?;
            links.insert(new_parent.as_u128(), id.as_u128())?;
            Ok(old_parent)
        })?;
        tracing::info!(env = %id, from = %old_parent, to = %new_parent, "environment moved");
        Ok(())
    }

    /// Walk the ancestors of `target` and fail if `id` is among them (or is
    /// `target` itself).
    fn ensure_not_below(
        &self,
        table: &impl ReadableTable<u128, &'static [u8]>,
        id: EnvId,
        target: EnvId,
    ) -> Result<(), EngineError> {
        let mut seen = BTreeSet::new();
        let mut cursor = Some(target);
        while let Some(current) = cursor {
            if current == id {
                return Err(StoreError::InvalidDescriptor(format!(
                    "cannot move {id} under its own descendant {target}"
                ))
                .into());
            }
            if !seen.insert(current) {
                return Err(StoreError::fatal(format!("ancestor chain of {target} loops")).into());
            }
            cursor = self
                .lookup(table, current.as_u128())?
                .ok_or_else(|| {
                    StoreError::fatal(format!("ancestor {current} of {target} has no descriptor"))
                })?
                .parent;
        }
        Ok(())
    }

    /// Remove the index rows of `ids`, then drop their shard directories.
    ///
    /// Callers pass the full closure of every subtree; a parent removed
    /// without its children leaves those children dangling. Tables must be
    /// closed before this is called.
    pub fn remove(&self, ids: &[EnvId]) -> Result<(), StoreError> {
        self.write(|txn| {
            let mut table = txn.open_table(DESCRIPTORS)?;
            let mut links = txn.open_multimap_table(CHILDREN)?;
            let mut pending = txn.open_table(PENDING_CREATE)?;
            for id in ids {
                let key = id.as_u128();
                let row = table.remove(key)?;
                if let Some(row) = row {
                    let descriptor = self.decode(key, row.value())?;
                    let parent = descriptor.parent.map_or(ROOT_PARENT, EnvId::as_u128);
                    links.remove(parent, key)?;
                }
                links.remove_all(key)?;
                pending.remove(key)?;
            }
            Ok(())
        })?;

        for id in ids {
            shard::remove(&self.data_root, *id)?;
        }
        Ok(())
    }

    /// Delete every environment left half-created by a crash: those with a
    /// pending-create marker and those whose shard still carries a lock
    /// marker. Returns the deleted ids.
    pub fn recover(&self) -> Result<Vec<EnvId>, StoreError> {
        let mut doomed: BTreeSet<EnvId> = self.pending()?.into_iter().collect();
        doomed.extend(shard::find_lock_markers(&self.data_root)?);
        if doomed.is_empty() {
            return Ok(Vec::new());
        }

        // take descendants along; nothing may hang under a deleted parent
        let mut closure = BTreeSet::new();
        for id in &doomed {
            closure.insert(*id);
            if self.contains(*id)? {
                closure.extend(self.subtree(*id)?.into_iter().map(|d| d.id));
            }
        }

        let ids: Vec<EnvId> = closure.into_iter().collect();
        for id in &ids {
            tracing::warn!(env = %id, "removing environment left by an interrupted create");
        }
        self.remove(&ids)?;
        Ok(ids)
    }

    /// Reclaim free pages of the index file.
    pub fn compact(&mut self) -> Result<bool, StoreError> {
        let compacted = self
            .db
            .compact()
            .map_err(|e| StoreError::fatal(format!("namespace compaction: {e}")))?;
        tracing::debug!(compacted, "namespace index compacted");
        Ok(compacted)
    }
}

// =============================================================================
// TESTS
// =============================================================================
