//! # Lock-Conflict Retry
//!
//! Every index and table transaction runs through [`retry_transient`]: a
//! lock conflict from the engine restarts the whole closure on a fresh
//! transaction, any other engine error is fatal.
//!
//! redb serializes writers inside one `Database`, so the only conflict
//! surfaced to us is `DatabaseAlreadyOpen`: a file whose previous handle is
//! still being released by another thread.

use crate::types::StoreError;
use std::thread;
use std::time::Duration;

/// Outcome of one transaction attempt.
#[derive(Debug)]
pub(crate) enum EngineError {
    /// Transient lock conflict; the attempt had no effect and may be retried.
    Conflict(String),
    /// Anything else, already classified.
    Store(StoreError),
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<redb::Error> for EngineError {
    fn from(e: redb::Error) -> Self {
        match e {
            redb::Error::DatabaseAlreadyOpen => Self::Conflict("database already open".into()),
            other => Self::Store(StoreError::fatal(format!("storage engine: {other}"))),
        }
    }
}

macro_rules! engine_error_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for EngineError {
                fn from(e: $ty) -> Self {
                    Self::from(redb::Error::from(e))
                }
            }
        )*
    };
}

engine_error_from!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

impl From<postcard::Error> for EngineError {
    fn from(e: postcard::Error) -> Self {
        Self::Store(StoreError::from(e))
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        Self::Store(StoreError::from(e))
    }
}

/// Classify an engine error outside a retry loop: conflicts are fatal here.
pub(crate) fn fatal(e: impl Into<EngineError>) -> StoreError {
    match e.into() {
        EngineError::Conflict(reason) => StoreError::fatal(format!("storage engine: {reason}")),
        EngineError::Store(err) => err,
    }
}

/// Run `op` until it succeeds or fails with a non-transient error.
pub(crate) fn retry_transient<T>(
    backoff: Duration,
    mut op: impl FnMut() -> Result<T, EngineError>,
) -> Result<T, StoreError> {
    let mut attempts: u64 = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(EngineError::Store(e)) => return Err(e),
            Err(EngineError::Conflict(reason)) => {
                attempts = attempts.saturating_add(1);
                tracing::debug!(attempts, %reason, "lock conflict, retrying transaction");
                if backoff.is_zero() {
                    thread::yield_now();
                } else {
                    thread::sleep(backoff);
                }
            }
        }
    }
}
