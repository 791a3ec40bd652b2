//! # Core Type Definitions
//!
//! This module contains the identifiers, descriptors and errors shared by
//! every layer of the engine:
//! - Identifiers (`EnvId`, `TupleId`, `ProtectionId`)
//! - Namespace rows (`EnvironmentDescriptor`)
//! - Error types (`StoreError`)
//!
//! ## Identifier Guarantees
//!
//! All identifiers are 128-bit UUIDs. They are stored in redb as `u128`
//! keys, so the big-endian integer order of the key is the iteration order
//! of every table.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

// =============================================================================
// IDENTIFIERS
// =============================================================================

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random identifier.
            #[must_use]
            pub fn new_v4() -> Self {
                Self(Uuid::new_v4())
            }

            /// Rebuild an identifier from its redb key.
            #[must_use]
            pub const fn from_u128(raw: u128) -> Self {
                Self(Uuid::from_u128(raw))
            }

            /// The redb key for this identifier.
            #[must_use]
            pub const fn as_u128(self) -> u128 {
                self.0.as_u128()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

uuid_id!(
    /// Identifier of an environment (one namespace node, one tuple table).
    EnvId
);

uuid_id!(
    /// Identifier of a tuple, unique within its owning environment.
    TupleId
);

uuid_id!(
    /// Identifier of the protection domain an environment belongs to.
    ProtectionId
);

impl ProtectionId {
    /// The protection domain reported for rows written by the legacy
    /// (minor = 0) format, which did not record one.
    pub const UNKNOWN: Self = Self(Uuid::nil());
}

// =============================================================================
// ENVIRONMENT DESCRIPTOR
// =============================================================================

/// A namespace row: one environment in the hierarchy.
///
/// Every non-root descriptor's `parent` resolves to an existing descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentDescriptor {
    pub id: EnvId,
    pub name: String,
    /// `None` only for the root environment.
    pub parent: Option<EnvId>,
    pub protection: ProtectionId,
}

impl EnvironmentDescriptor {
    /// Descriptor for the root environment.
    #[must_use]
    pub fn root(id: EnvId, name: impl Into<String>, protection: ProtectionId) -> Self {
        Self {
            id,
            name: name.into(),
            parent: None,
            protection,
        }
    }

    /// Descriptor for a child environment of `parent`.
    #[must_use]
    pub fn child(
        id: EnvId,
        name: impl Into<String>,
        parent: EnvId,
        protection: ProtectionId,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            parent: Some(parent),
            protection,
        }
    }

    /// Whether this descriptor names the root of the hierarchy.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors reported by the storage engine.
///
/// `Fatal` marks an internal invariant failure (index corruption, a child
/// whose parent pointer disagrees with the index, an engine error other than
/// a lock conflict). Everything else is a normal, recoverable report.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The manager, iterator or store backing this request has been torn down.
    #[error("resource revoked")]
    Revoked,

    /// The lease service refused to grant a lease.
    #[error("lease denied: {0}")]
    LeaseDenied(String),

    /// A delete named a tuple that does not exist.
    #[error("no such tuple: {0}")]
    NoSuchTuple(TupleId),

    /// The resource descriptor is malformed or of an unknown kind.
    #[error("unknown resource: {0}")]
    UnknownResource(String),

    /// The environment does not exist in the namespace.
    #[error("no such environment: {0}")]
    NoSuchEnvironment(EnvId),

    /// The environment already exists in the namespace.
    #[error("environment already exists: {0}")]
    AlreadyExists(EnvId),

    /// The environment is moving, or a delete targeted a read-only store.
    #[error("environment busy: {0}")]
    Busy(EnvId),

    /// A query iterator has no more elements.
    #[error("no more elements")]
    Exhausted,

    /// The on-disk namespace format is not one this engine reads.
    #[error("unsupported on-disk format {major}.{minor}")]
    UnsupportedFormat { major: u64, minor: u64 },

    /// A descriptor violates a namespace rule (second root, self-parent, ...).
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    /// An internal invariant was violated; the data may be corrupt.
    #[error("internal invariant violated: {0}")]
    Fatal(String),

    /// A record could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A filesystem operation failed.
    #[error("I/O error: {0}")]
    Io(String),

    /// The engine configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(String),
}

impl StoreError {
    /// Whether this error is an internal invariant failure.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    /// Build a fatal error and log it at the point it is raised.
    pub(crate) fn fatal(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!(%message, "internal invariant violated");
        Self::Fatal(message)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<postcard::Error> for StoreError {
    fn from(e: postcard::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

// =============================================================================
// TESTS
// =============================================================================
