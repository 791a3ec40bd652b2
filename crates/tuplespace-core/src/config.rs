//! # Engine Configuration
//!
//! Loaded from TOML. Every field has a default, so an empty document is a
//! valid configuration:
//!
//! ```toml
//! data_root = "/var/lib/tuplespace"
//! cache_size_bytes = 16777216
//! retry_backoff_ms = 1
//! scan_batch = 256
//! default_lease_ms = 60000
//! ```

use crate::storage::table::TableOptions;
use crate::types::StoreError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration of a storage engine instance.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Directory holding the namespace index and the environment shards.
    pub data_root: PathBuf,
    /// redb page cache per opened database.
    pub cache_size_bytes: usize,
    /// Pause between retries of a transaction that hit a lock conflict.
    pub retry_backoff_ms: u64,
    /// Records fetched per step of a lazy transfer stream.
    pub scan_batch: usize,
    /// Lease duration requested by `bind` when the caller gives none.
    pub default_lease_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("tuplespace-data"),
            cache_size_bytes: 16 * 1024 * 1024,
            retry_backoff_ms: 1,
            scan_batch: 256,
            default_lease_ms: 60_000,
        }
    }
}

impl EngineConfig {
    /// Default configuration rooted at `data_root`.
    #[must_use]
    pub fn with_data_root(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            ..Self::default()
        }
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, StoreError> {
        let config: Self = toml::from_str(text).map_err(|e| StoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.data_root.as_os_str().is_empty() {
            return Err(StoreError::Config("data_root must not be empty".into()));
        }
        if self.scan_batch == 0 {
            return Err(StoreError::Config("scan_batch must be at least 1".into()));
        }
        Ok(())
    }

    #[must_use]
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    #[must_use]
    pub fn default_lease(&self) -> Duration {
        Duration::from_millis(self.default_lease_ms)
    }

    pub(crate) fn table_options(&self) -> TableOptions {
        TableOptions {
            cache_size_bytes: self.cache_size_bytes,
            retry_backoff: self.retry_backoff(),
            scan_batch: self.scan_batch,
        }
    }
}
