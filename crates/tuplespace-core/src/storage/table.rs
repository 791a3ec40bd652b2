//! # Tuple Table
//!
//! One redb database per environment, holding a single table keyed by tuple
//! id. Values are raw records: a one-byte content-type tag followed by the
//! payload (a postcard-encoded [`Tuple`] for [`ContentType::Postcard`]).
//!
//! Scans never fail because of one bad record: a record that cannot be
//! decoded is logged and skipped.

use crate::filter::Filter;
use crate::storage::retry::{EngineError, fatal, retry_transient};
use crate::tuple::Tuple;
use crate::types::{EnvId, StoreError, TupleId};
use redb::{
    Database, ReadOnlyTable, ReadableDatabase, ReadableTable, ReadableTableMetadata,
    TableDefinition,
};
use std::collections::VecDeque;
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Table of tuples: TupleId(u128) -> tagged record bytes
const TUPLES: TableDefinition<u128, &[u8]> = TableDefinition::new("tuples");

/// Tuning knobs shared by every tuple table of an engine.
#[derive(Debug, Clone)]
pub struct TableOptions {
    pub cache_size_bytes: usize,
    pub retry_backoff: Duration,
    pub scan_batch: usize,
}

// =============================================================================
// RAW RECORDS
// =============================================================================

/// Encoding of a record payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    /// A postcard-serialized [`Tuple`].
    Postcard,
    /// A tag this engine does not know how to decode. Carried through
    /// transfers untouched, skipped by queries.
    Unknown(u8),
}

impl ContentType {
    const POSTCARD_TAG: u8 = 1;

    #[must_use]
    pub fn tag(self) -> u8 {
        match self {
            Self::Postcard => Self::POSTCARD_TAG,
            Self::Unknown(tag) => tag,
        }
    }

    #[must_use]
    pub fn from_tag(tag: u8) -> Self {
        match tag {
            Self::POSTCARD_TAG => Self::Postcard,
            other => Self::Unknown(other),
        }
    }
}

/// A stored record in transfer form: id, content-type tag, opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub id: TupleId,
    pub content_type: ContentType,
    pub payload: Vec<u8>,
}

impl RawRecord {
    /// Serialize a tuple into its stored form.
    pub fn from_tuple(tuple: &Tuple) -> Result<Self, StoreError> {
        Ok(Self {
            id: tuple.id(),
            content_type: ContentType::Postcard,
            payload: postcard::to_allocvec(tuple)?,
        })
    }

    /// Decode the payload back into a tuple.
    pub fn to_tuple(&self) -> Result<Tuple, StoreError> {
        match self.content_type {
            ContentType::Postcard => {
                let tuple: Tuple = postcard::from_bytes(&self.payload)?;
                if tuple.id() != self.id {
                    return Err(StoreError::Serialization(format!(
                        "record {} holds tuple {}",
                        self.id,
                        tuple.id()
                    )));
                }
                Ok(tuple)
            }
            ContentType::Unknown(tag) => Err(StoreError::Serialization(format!(
                "unknown content type {tag}"
            ))),
        }
    }

    /// Table value: tag byte followed by the payload.
    fn to_value(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.payload.len() + 1);
        bytes.push(self.content_type.tag());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    fn from_value(id: TupleId, value: &[u8]) -> Result<Self, StoreError> {
        let (tag, payload) = value
            .split_first()
            .ok_or_else(|| StoreError::Serialization(format!("record {id} is empty")))?;
        Ok(Self {
            id,
            content_type: ContentType::from_tag(*tag),
            payload: payload.to_vec(),
        })
    }

    /// Wire form: 16-byte big-endian id, tag byte, payload.
    #[must_use]
    pub fn to_wire(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.payload.len() + 17);
        bytes.extend_from_slice(&self.id.as_u128().to_be_bytes());
        bytes.extend_from_slice(&self.to_value());
        bytes
    }

    pub fn from_wire(bytes: &[u8]) -> Result<Self, StoreError> {
        let Some((id, value)) = bytes.split_first_chunk::<16>() else {
            return Err(StoreError::Serialization("wire record shorter than its id".into()));
        };
        Self::from_value(TupleId::from_u128(u128::from_be_bytes(*id)), value)
    }
}

/// A query hit: the whole tuple, or only its id.
#[derive(Debug, Clone, PartialEq)]
pub enum Match {
    Id(TupleId),
    Tuple(Tuple),
}

impl Match {
    #[must_use]
    pub fn id(&self) -> TupleId {
        match self {
            Self::Id(id) => *id,
            Self::Tuple(t) => t.id(),
        }
    }

    /// The tuple, if this hit carries one.
    #[must_use]
    pub fn into_tuple(self) -> Option<Tuple> {
        match self {
            Self::Id(_) => None,
            Self::Tuple(t) => Some(t),
        }
    }

    fn new(tuple: Tuple, id_only: bool) -> Self {
        if id_only {
            Self::Id(tuple.id())
        } else {
            Self::Tuple(tuple)
        }
    }
}

/// Decode a stored value, logging and discarding records that do not decode.
fn decode_or_skip(env: EnvId, key: u128, value: &[u8]) -> Option<Tuple> {
    let id = TupleId::from_u128(key);
    match RawRecord::from_value(id, value).and_then(|raw| raw.to_tuple()) {
        Ok(tuple) => Some(tuple),
        Err(e) => {
            tracing::warn!(env = %env, tuple = %id, error = %e, "skipping undecodable record");
            None
        }
    }
}

// =============================================================================
// TUPLE TABLE
// =============================================================================

/// The persistent tuple table of one environment.
pub struct TupleTable {
    env: EnvId,
    db: Database,
    options: TableOptions,
}

impl std::fmt::Debug for TupleTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TupleTable")
            .field("env", &self.env)
            .finish_non_exhaustive()
    }
}

impl TupleTable {
    /// Open the table at `path`, creating the file if needed.
    pub fn open(env: EnvId, path: &Path, options: &TableOptions) -> Result<Self, StoreError> {
        let db = retry_transient(options.retry_backoff, || {
            let db = Database::builder()
                .set_cache_size(options.cache_size_bytes)
                .create(path)?;
            let txn = db.begin_write()?;
            txn.open_table(TUPLES)?;
            txn.commit()?;
            Ok(db)
        })?;
        tracing::debug!(env = %env, path = %path.display(), "tuple table opened");
        Ok(Self {
            env,
            db,
            options: options.clone(),
        })
    }

    #[must_use]
    pub fn env(&self) -> EnvId {
        self.env
    }

    fn read<T>(
        &self,
        op: impl Fn(&ReadOnlyTable<u128, &'static [u8]>) -> Result<T, EngineError>,
    ) -> Result<T, StoreError> {
        retry_transient(self.options.retry_backoff, || {
            let txn = self.db.begin_read()?;
            let table = txn.open_table(TUPLES)?;
            op(&table)
        })
    }

    /// Point lookup by id.
    pub fn get_by_id(&self, id: TupleId) -> Result<Option<Tuple>, StoreError> {
        self.read(|table| {
            Ok(table
                .get(id.as_u128())?
                .and_then(|value| decode_or_skip(self.env, id.as_u128(), value.value())))
        })
    }

    /// First tuple matching `filter`, in storage order.
    pub fn get_one(&self, filter: &Filter, id_only: bool) -> Result<Option<Match>, StoreError> {
        if filter.is_nothing() {
            return Ok(None);
        }
        if let Some(id) = filter.fast_path() {
            // a point hit still has to satisfy the rest of the predicate
            let hit = self.get_by_id(id)?.filter(|t| filter.matches(t));
            return Ok(hit.map(|t| Match::new(t, id_only)));
        }
        self.read(|table| {
            for entry in table.iter()? {
                let (key, value) = entry?;
                if let Some(tuple) = decode_or_skip(self.env, key.value(), value.value()) {
                    if filter.matches(&tuple) {
                        return Ok(Some(Match::new(tuple, id_only)));
                    }
                }
            }
            Ok(None)
        })
    }

    /// Every tuple matching `filter`, in storage order.
    pub fn get_all(&self, filter: &Filter, id_only: bool) -> Result<Vec<Match>, StoreError> {
        if filter.is_nothing() {
            return Ok(Vec::new());
        }
        if let Some(id) = filter.fast_path() {
            let hit = self.get_by_id(id)?.filter(|t| filter.matches(t));
            return Ok(hit.into_iter().map(|t| Match::new(t, id_only)).collect());
        }
        self.scan_all(filter, id_only)
    }

    /// Full scan, ignoring any fast path.
    pub fn scan_all(&self, filter: &Filter, id_only: bool) -> Result<Vec<Match>, StoreError> {
        self.read(|table| {
            let mut hits = Vec::new();
            for entry in table.iter()? {
                let (key, value) = entry?;
                if let Some(tuple) = decode_or_skip(self.env, key.value(), value.value()) {
                    if filter.matches(&tuple) {
                        hits.push(Match::new(tuple, id_only));
                    }
                }
            }
            Ok(hits)
        })
    }

    /// Insert or replace a tuple by id.
    pub fn put(&self, tuple: &Tuple) -> Result<(), StoreError> {
        self.write_raw(&RawRecord::from_tuple(tuple)?)
    }

    /// Insert or replace a raw record by id, bypassing decoding.
    pub fn write_raw(&self, record: &RawRecord) -> Result<(), StoreError> {
        let value = record.to_value();
        retry_transient(self.options.retry_backoff, || {
            let txn = self.db.begin_write()?;
            {
                let mut table = txn.open_table(TUPLES)?;
                table.insert(record.id.as_u128(), value.as_slice())?;
            }
            txn.commit()?;
            Ok(())
        })
    }

    /// Delete a tuple. A missing tuple is reported, not fatal.
    pub fn delete(&self, id: TupleId) -> Result<(), StoreError> {
        let removed = retry_transient(self.options.retry_backoff, || {
            let txn = self.db.begin_write()?;
            let removed = {
                let mut table = txn.open_table(TUPLES)?;
                table.remove(id.as_u128())?.is_some()
            };
            if removed {
                txn.commit()?;
            } else {
                txn.abort()?;
            }
            Ok(removed)
        })?;
        if removed {
            Ok(())
        } else {
            Err(StoreError::NoSuchTuple(id))
        }
    }

    /// Number of stored records.
    pub fn len(&self) -> Result<u64, StoreError> {
        self.read(|table| Ok(table.len()?))
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// A lazy forward stream over every raw record, reading from one
    /// snapshot. Setting `closed` makes the stream end with `Revoked`.
    pub fn stream(&self, closed: Arc<AtomicBool>) -> Result<TupleStream, StoreError> {
        let table = retry_transient(self.options.retry_backoff, || {
            let txn = self.db.begin_read()?;
            Ok(txn.open_table(TUPLES)?)
        })?;
        Ok(TupleStream {
            env: self.env,
            table,
            cursor: Bound::Unbounded,
            buffer: VecDeque::new(),
            batch: self.options.scan_batch.max(1),
            exhausted: false,
            closed,
        })
    }
}

// =============================================================================
// STREAM
// =============================================================================

/// Lazy, batched forward iterator over a table snapshot.
pub struct TupleStream {
    env: EnvId,
    table: ReadOnlyTable<u128, &'static [u8]>,
    /// Key of the last record fetched.
    cursor: Bound<u128>,
    buffer: VecDeque<RawRecord>,
    batch: usize,
    exhausted: bool,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for TupleStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TupleStream")
            .field("env", &self.env)
            .field("buffered", &self.buffer.len())
            .field("exhausted", &self.exhausted)
            .finish_non_exhaustive()
    }
}

impl TupleStream {
    /// Read the next batch past the cursor; an empty batch ends the stream.
    fn fill(&mut self) -> Result<(), StoreError> {
        let range = self
            .table
            .range::<u128>((self.cursor, Bound::Unbounded))
            .map_err(fatal)?;
        let mut fetched = 0usize;
        for entry in range.take(self.batch) {
            let (key, value) = entry.map_err(fatal)?;
            let key = key.value();
            self.cursor = Bound::Excluded(key);
            fetched += 1;
            match RawRecord::from_value(TupleId::from_u128(key), value.value()) {
                Ok(record) => self.buffer.push_back(record),
                Err(e) => {
                    tracing::warn!(
                        env = %self.env,
                        error = %e,
                        "skipping unreadable record in stream"
                    );
                }
            }
        }
        if fetched == 0 {
            self.exhausted = true;
        }
        Ok(())
    }
}

impl Iterator for TupleStream {
    type Item = Result<RawRecord, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        if self.closed.load(Ordering::Acquire) {
            self.exhausted = true;
            return Some(Err(StoreError::Revoked));
        }
        while self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

// =============================================================================
// TESTS
// =============================================================================
