//! # Leases
//!
//! A lease is a time-bounded access grant held by a requester. The engine
//! only consumes leases: it acquires one per bind (and one per listen
//! subscription or query iterator), and reacts when one is cancelled.
//! Duration negotiation and renewal belong to the service.
//!
//! [`LocalLeaseService`] is an in-process service for embedding hosts and
//! tests. It grants every request until closed (or until a holder reaches
//! its quota), and runs each lease's revoke hook exactly once, on cancel,
//! on expiry sweep or on close.

use crate::types::StoreError;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Identifier of a granted lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LeaseId(pub u64);

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lease-{}", self.0)
    }
}

/// Callback run once when a lease ends for any reason.
pub type RevokeHook = Box<dyn FnOnce() + Send>;

/// A granted lease.
pub trait Lease: Send + Sync {
    fn id(&self) -> LeaseId;

    /// End the lease now. Runs the revoke hook if it has not run yet.
    fn cancel(&self);

    fn is_active(&self) -> bool;
}

/// The external lease collaborator.
pub trait LeaseService: Send + Sync {
    /// Grant `holder` a lease for `duration`. `on_revoke` runs once when
    /// the lease is cancelled or expires.
    fn acquire(
        &self,
        holder: &str,
        duration: Duration,
        on_revoke: RevokeHook,
    ) -> Result<Box<dyn Lease>, StoreError>;
}

// =============================================================================
// LOCAL SERVICE
// =============================================================================

struct Grant {
    holder: String,
    expires: Instant,
    hook: Option<RevokeHook>,
}

#[derive(Default)]
struct LeaseTable {
    next: u64,
    grants: BTreeMap<LeaseId, Grant>,
    closed: bool,
}

struct Shared {
    table: Mutex<LeaseTable>,
    per_holder_limit: Option<usize>,
}

impl Shared {
    /// Remove a grant and run its hook outside the lock.
    fn end(&self, id: LeaseId) -> bool {
        let hook = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            table.grants.remove(&id).and_then(|grant| grant.hook)
        };
        match hook {
            Some(hook) => {
                tracing::debug!(lease = %id, "lease revoked");
                hook();
                true
            }
            None => false,
        }
    }

    fn is_active(&self, id: LeaseId) -> bool {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table.grants.contains_key(&id)
    }
}

/// In-process [`LeaseService`].
#[derive(Clone)]
pub struct LocalLeaseService {
    shared: Arc<Shared>,
}

impl fmt::Debug for LocalLeaseService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalLeaseService")
            .field("active", &self.active_count())
            .finish_non_exhaustive()
    }
}

impl Default for LocalLeaseService {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalLeaseService {
    #[must_use]
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A service that denies a holder more than `limit` concurrent leases.
    #[must_use]
    pub fn with_holder_limit(limit: usize) -> Self {
        Self::build(Some(limit))
    }

    fn build(per_holder_limit: Option<usize>) -> Self {
        Self {
            shared: Arc::new(Shared {
                table: Mutex::new(LeaseTable::default()),
                per_holder_limit,
            }),
        }
    }

    /// Cancel a lease by id. Returns whether it was still active.
    pub fn cancel(&self, id: LeaseId) -> bool {
        self.shared.end(id)
    }

    /// Cancel every lease whose term ended before `now`.
    pub fn expire(&self, now: Instant) -> Vec<LeaseId> {
        let expired: Vec<LeaseId> = {
            let table = self.shared.table.lock().unwrap_or_else(PoisonError::into_inner);
            table
                .grants
                .iter()
                .filter(|(_, grant)| grant.expires <= now)
                .map(|(id, _)| *id)
                .collect()
        };
        expired.into_iter().filter(|id| self.shared.end(*id)).collect()
    }

    /// Refuse new leases and cancel every outstanding one.
    pub fn close(&self) {
        let ids: Vec<LeaseId> = {
            let mut table = self.shared.table.lock().unwrap_or_else(PoisonError::into_inner);
            table.closed = true;
            table.grants.keys().copied().collect()
        };
        for id in ids {
            self.shared.end(id);
        }
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        let table = self.shared.table.lock().unwrap_or_else(PoisonError::into_inner);
        table.grants.len()
    }

    /// Ids of the active leases of `holder`.
    #[must_use]
    pub fn leases_of(&self, holder: &str) -> Vec<LeaseId> {
        let table = self.shared.table.lock().unwrap_or_else(PoisonError::into_inner);
        table
            .grants
            .iter()
            .filter(|(_, grant)| grant.holder == holder)
            .map(|(id, _)| *id)
            .collect()
    }
}

impl LeaseService for LocalLeaseService {
    fn acquire(
        &self,
        holder: &str,
        duration: Duration,
        on_revoke: RevokeHook,
    ) -> Result<Box<dyn Lease>, StoreError> {
        let mut table = self.shared.table.lock().unwrap_or_else(PoisonError::into_inner);
        if table.closed {
            return Err(StoreError::LeaseDenied(format!("{holder}: lease service closed")));
        }
        if let Some(limit) = self.shared.per_holder_limit {
            let held = table.grants.values().filter(|g| g.holder == holder).count();
            if held >= limit {
                return Err(StoreError::LeaseDenied(format!(
                    "{holder}: holds {held} leases, limit {limit}"
                )));
            }
        }

        table.next = table.next.saturating_add(1);
        let id = LeaseId(table.next);
        let now = Instant::now();
        table.grants.insert(
            id,
            Grant {
                holder: holder.to_owned(),
                expires: now.checked_add(duration).unwrap_or(now),
                hook: Some(on_revoke),
            },
        );
        tracing::debug!(lease = %id, holder, ?duration, "lease granted");
        Ok(Box::new(LocalLease {
            id,
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct LocalLease {
    id: LeaseId,
    shared: Arc<Shared>,
}

impl Lease for LocalLease {
    fn id(&self) -> LeaseId {
        self.id
    }

    fn cancel(&self) {
        self.shared.end(self.id);
    }

    fn is_active(&self) -> bool {
        self.shared.is_active(self.id)
    }
}
