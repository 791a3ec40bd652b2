//! # Shard Placement
//!
//! Each environment's tuple table lives in its own directory, placed by
//! splitting the 32-digit hex form of its id into segments of widths
//! [`SHARD_WIDTHS`]:
//!
//! ```text
//! <data_root>/envs/1f/0a3/9c2e/77d1/1f0a39c2e77d1.../tuples.redb
//! ```
//!
//! While an environment is being created its directory carries a
//! [`LOCK_MARKER_FILE`]; startup recovery scans for leftovers.

use crate::primitives::{ENVIRONMENTS_DIR, LOCK_MARKER_FILE, SHARD_WIDTHS, TUPLE_TABLE_FILE};
use crate::types::{EnvId, StoreError};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use uuid::Uuid;
use walkdir::WalkDir;

/// Directory holding the tuple table of `id`.
#[must_use]
pub fn shard_dir(data_root: &Path, id: EnvId) -> PathBuf {
    let hex = id.0.simple().to_string();
    let mut path = data_root.join(ENVIRONMENTS_DIR);
    let mut offset = 0;
    for width in SHARD_WIDTHS {
        path.push(&hex[offset..offset + width]);
        offset += width;
    }
    path.push(&hex);
    path
}

/// Path of the tuple table file of `id`.
#[must_use]
pub fn table_path(data_root: &Path, id: EnvId) -> PathBuf {
    shard_dir(data_root, id).join(TUPLE_TABLE_FILE)
}

/// Create the shard directory of `id` and drop a lock marker in it.
pub fn prepare(data_root: &Path, id: EnvId) -> Result<PathBuf, StoreError> {
    let dir = shard_dir(data_root, id);
    fs::create_dir_all(&dir)?;
    fs::write(dir.join(LOCK_MARKER_FILE), id.to_string())?;
    Ok(dir)
}

/// Remove the lock marker of `id`; a missing marker is not an error.
pub fn release(data_root: &Path, id: EnvId) -> Result<(), StoreError> {
    let marker = shard_dir(data_root, id).join(LOCK_MARKER_FILE);
    match fs::remove_file(marker) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Delete the shard directory of `id` and prune the emptied segment
/// directories above it. A missing directory is not an error.
pub fn remove(data_root: &Path, id: EnvId) -> Result<(), StoreError> {
    let dir = shard_dir(data_root, id);
    match fs::remove_dir_all(&dir) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let stop = data_root.join(ENVIRONMENTS_DIR);
    let mut parent = dir.parent();
    while let Some(segment) = parent {
        if segment == stop || !segment.starts_with(&stop) {
            break;
        }
        // non-empty: another environment shares this segment
        if fs::remove_dir(segment).is_err() {
            break;
        }
        parent = segment.parent();
    }
    Ok(())
}

/// Environments whose shard directory still carries a lock marker.
pub fn find_lock_markers(data_root: &Path) -> Result<Vec<EnvId>, StoreError> {
    let root = data_root.join(ENVIRONMENTS_DIR);
    if !root.exists() {
        return Ok(Vec::new());
    }

    let depth = SHARD_WIDTHS.len() + 2;
    let mut found = Vec::new();
    for entry in WalkDir::new(&root).min_depth(depth).max_depth(depth) {
        let entry = entry.map_err(|e| StoreError::Io(e.to_string()))?;
        if entry.file_name() != LOCK_MARKER_FILE {
            continue;
        }
        let id = entry
            .path()
            .parent()
            .and_then(Path::file_name)
            .and_then(|name| name.to_str())
            .and_then(|name| Uuid::parse_str(name).ok());
        match id {
            Some(id) => found.push(EnvId(id)),
            None => tracing::warn!(
                path = %entry.path().display(),
                "lock marker outside a shard directory"
            ),
        }
    }
    found.sort();
    Ok(found)
}
