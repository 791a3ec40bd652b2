//! # Session Module
//!
//! A [`Manager`] is one active bind of a requester to an environment. It
//! scopes the requester's query iterators and listen subscriptions, and its
//! lifetime is bound to one lease: when the lease is cancelled the manager
//! stops, and everything it owns is revoked with it.
//!
//! Revocation is idempotent. The RUNNING -> STOPPED transition happens once;
//! it ends every pending listen with `Revoked`, revokes every open
//! iterator, cancels their sub-leases, and shuts the store down if this was
//! its last manager.

use crate::admission::{
    Detached, ManagerId, Revocable, Store, StoreRegistry, SubscriptionId, WriteOp, WriteStatus,
};
use crate::filter::Filter;
use crate::lease::{Lease, LeaseService};
use crate::primitives::STORAGE_RESOURCE_KIND;
use crate::query::Query;
use crate::storage::table::Match;
use crate::tuple::Tuple;
use crate::types::{EnvId, StoreError, TupleId};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use uuid::Uuid;

// =============================================================================
// RESOURCE DESCRIPTOR
// =============================================================================

/// The opaque resource named by a bind request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub kind: String,
    pub env: EnvId,
}

impl ResourceDescriptor {
    /// Descriptor of the tuple storage of `env`.
    #[must_use]
    pub fn storage(env: EnvId) -> Self {
        Self {
            kind: STORAGE_RESOURCE_KIND.to_owned(),
            env,
        }
    }

    /// Parse the `kind:<uuid>` form.
    pub fn parse(text: &str) -> Result<Self, StoreError> {
        let (kind, id) = text
            .split_once(':')
            .ok_or_else(|| StoreError::UnknownResource(text.to_owned()))?;
        let id = Uuid::parse_str(id.trim())
            .map_err(|_| StoreError::UnknownResource(text.to_owned()))?;
        Ok(Self {
            kind: kind.trim().to_owned(),
            env: EnvId(id),
        })
    }

    /// Reject descriptors this engine does not serve.
    pub fn ensure_storage(&self) -> Result<(), StoreError> {
        if self.kind == STORAGE_RESOURCE_KIND {
            Ok(())
        } else {
            Err(StoreError::UnknownResource(self.to_string()))
        }
    }
}

impl fmt::Display for ResourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.env)
    }
}

impl FromStr for ResourceDescriptor {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// =============================================================================
// REQUESTER
// =============================================================================

/// Receiver of listen notifications.
pub trait Requester: Send {
    fn deliver(&self, result: Result<Tuple, StoreError>);
}

impl Requester for crossbeam_channel::Sender<Result<Tuple, StoreError>> {
    fn deliver(&self, result: Result<Tuple, StoreError>) {
        if self.send(result).is_err() {
            tracing::debug!("listen requester went away before delivery");
        }
    }
}

// =============================================================================
// QUERY ITERATOR
// =============================================================================

/// Identifier of an open query iterator within its manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IteratorId(pub u64);

/// A snapshot of query matches, taken when the query ran.
pub struct QueryIterator {
    snapshot: VecDeque<Match>,
    lease: Option<Box<dyn Lease>>,
    revoked: bool,
}

impl fmt::Debug for QueryIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryIterator")
            .field("remaining", &self.snapshot.len())
            .field("revoked", &self.revoked)
            .finish_non_exhaustive()
    }
}

impl QueryIterator {
    #[must_use]
    pub fn new(matches: Vec<Match>) -> Self {
        Self {
            snapshot: matches.into(),
            lease: None,
            revoked: false,
        }
    }

    fn with_lease(mut self, lease: Box<dyn Lease>) -> Self {
        self.lease = Some(lease);
        self
    }

    /// Pop the next match.
    pub fn next_match(&mut self) -> Result<Match, StoreError> {
        if self.revoked {
            return Err(StoreError::Revoked);
        }
        self.snapshot.pop_front().ok_or(StoreError::Exhausted)
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.snapshot.len()
    }

    /// Drop the snapshot. Every later request reports `Revoked`. Returns
    /// the sub-lease for the caller to cancel outside any lock.
    fn revoke(&mut self) -> Option<Box<dyn Lease>> {
        self.revoked = true;
        self.snapshot.clear();
        self.lease.take()
    }
}

// =============================================================================
// MANAGER
// =============================================================================

struct ManagerInner {
    id: ManagerId,
    env: EnvId,
    holder: String,
    lease_duration: Duration,
    store: Arc<Store>,
    registry: Weak<StoreRegistry>,
    leases: Option<Arc<dyn LeaseService>>,
    lease: Mutex<Option<Box<dyn Lease>>>,
    running: AtomicBool,
    iterators: Mutex<BTreeMap<IteratorId, QueryIterator>>,
    next_iterator: AtomicU64,
}

impl ManagerInner {
    fn iterators(&self) -> MutexGuard<'_, BTreeMap<IteratorId, QueryIterator>> {
        self.iterators.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// RUNNING -> STOPPED, at most once.
    fn stop(&self, shutdown_store: bool) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(
            env = %self.env,
            manager = self.id.0,
            holder = %self.holder,
            "manager revoked"
        );

        self.store.revoke_subscriptions(self.id);

        let sub_leases: Vec<Box<dyn Lease>> = {
            let mut iterators = self.iterators();
            let leases = iterators.values_mut().filter_map(QueryIterator::revoke).collect();
            iterators.clear();
            leases
        };
        for lease in sub_leases {
            lease.cancel();
        }

        let own = self.lease.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(lease) = own {
            lease.cancel();
        }

        if self.store.detach(self.id) == Detached::Last && shutdown_store {
            tracing::debug!(env = %self.env, "last manager gone, closing store");
            match self.registry.upgrade() {
                Some(registry) => registry.shutdown_store(&self.store),
                None => self.store.revoke_all(),
            }
        }
    }

    /// Sub-lease expiry of one iterator.
    fn revoke_iterator(&self, id: IteratorId) {
        let lease = self.iterators().get_mut(&id).and_then(QueryIterator::revoke);
        if let Some(lease) = lease {
            lease.cancel();
        }
    }
}

impl Revocable for ManagerInner {
    fn revoke_by_store(&self) {
        self.stop(false);
    }
}

/// Handle to one bind session. Clones share the session.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("id", &self.inner.id)
            .field("env", &self.inner.env)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

/// Everything a manager needs at bind time.
pub(crate) struct BindContext {
    pub id: ManagerId,
    pub holder: String,
    pub lease_duration: Duration,
    pub store: Arc<Store>,
    pub registry: Weak<StoreRegistry>,
    /// `None` for the engine's own transfer managers, which hold no lease.
    pub leases: Option<Arc<dyn LeaseService>>,
}

impl Manager {
    /// Attach a new manager to its store and acquire its lease.
    pub(crate) fn bind(ctx: BindContext) -> Result<Self, StoreError> {
        let inner = Arc::new(ManagerInner {
            id: ctx.id,
            env: ctx.store.env(),
            holder: ctx.holder,
            lease_duration: ctx.lease_duration,
            store: ctx.store,
            registry: ctx.registry,
            leases: ctx.leases,
            lease: Mutex::new(None),
            running: AtomicBool::new(true),
            iterators: Mutex::new(BTreeMap::new()),
            next_iterator: AtomicU64::new(0),
        });

        if let Some(service) = &inner.leases {
            let weak = Arc::downgrade(&inner);
            let lease = service.acquire(
                &inner.holder,
                inner.lease_duration,
                Box::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.stop(true);
                    }
                }),
            )?;
            *inner.lease.lock().unwrap_or_else(PoisonError::into_inner) = Some(lease);
        }

        let revocable: Arc<dyn Revocable> = inner.clone();
        if let Err(e) = inner.store.attach(inner.id, Arc::downgrade(&revocable)) {
            let lease = inner.lease.lock().unwrap_or_else(PoisonError::into_inner).take();
            inner.running.store(false, Ordering::Release);
            if let Some(lease) = lease {
                lease.cancel();
            }
            return Err(e);
        }
        tracing::debug!(
            env = %inner.env,
            manager = inner.id.0,
            holder = %inner.holder,
            "manager bound"
        );
        Ok(Self { inner })
    }

    #[must_use]
    pub fn id(&self) -> ManagerId {
        self.inner.id
    }

    #[must_use]
    pub fn env(&self) -> EnvId {
        self.inner.env
    }

    #[must_use]
    pub fn holder(&self) -> &str {
        &self.inner.holder
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub(crate) fn store(&self) -> &Arc<Store> {
        &self.inner.store
    }

    fn ensure_running(&self) -> Result<(), StoreError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(StoreError::Revoked)
        }
    }

    fn sub_lease(
        &self,
        on_revoke: crate::lease::RevokeHook,
    ) -> Result<Option<Box<dyn Lease>>, StoreError> {
        match &self.inner.leases {
            Some(service) => Ok(Some(service.acquire(
                &self.inner.holder,
                self.inner.lease_duration,
                on_revoke,
            )?)),
            None => Ok(None),
        }
    }

    // =========================================================================
    // WRITES
    // =========================================================================

    /// Insert or replace a tuple.
    pub fn write(&self, tuple: Tuple) -> Result<WriteStatus, StoreError> {
        self.ensure_running()?;
        self.inner.store.write(WriteOp::Put(tuple))
    }

    /// Delete a tuple by id.
    pub fn delete(&self, id: TupleId) -> Result<WriteStatus, StoreError> {
        self.ensure_running()?;
        self.inner.store.write(WriteOp::Delete(id))
    }

    /// Remove and return the first tuple matching `query`.
    pub fn take(&self, query: &Query) -> Result<Option<Tuple>, StoreError> {
        self.ensure_running()?;
        self.inner.store.take(&Filter::compile(query))
    }

    // =========================================================================
    // READS
    // =========================================================================

    /// First tuple matching `query`.
    pub fn read(&self, query: &Query) -> Result<Option<Tuple>, StoreError> {
        self.ensure_running()?;
        let filter = Filter::compile(query);
        let hit = self.inner.store.read(|table| table.get_one(&filter, false))?;
        Ok(hit.and_then(Match::into_tuple))
    }

    pub fn read_by_id(&self, id: TupleId) -> Result<Option<Tuple>, StoreError> {
        self.ensure_running()?;
        self.inner.store.read(|table| table.get_by_id(id))
    }

    /// Run `query` and open an iterator over a snapshot of the matching
    /// tuples.
    pub fn query(&self, query: &Query) -> Result<IteratorId, StoreError> {
        self.open_iterator(query, false)
    }

    /// As [`query`](Self::query), yielding only ids.
    pub fn query_ids(&self, query: &Query) -> Result<IteratorId, StoreError> {
        self.open_iterator(query, true)
    }

    fn open_iterator(&self, query: &Query, id_only: bool) -> Result<IteratorId, StoreError> {
        self.ensure_running()?;
        let filter = Filter::compile(query);
        let matches = self.inner.store.read(|table| table.get_all(&filter, id_only))?;

        let id = IteratorId(self.inner.next_iterator.fetch_add(1, Ordering::Relaxed));
        let weak = Arc::downgrade(&self.inner);
        let lease = self.sub_lease(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.revoke_iterator(id);
            }
        }))?;

        let mut iterator = QueryIterator::new(matches);
        if let Some(lease) = lease {
            iterator = iterator.with_lease(lease);
        }
        let rejected = {
            let mut iterators = self.inner.iterators();
            if self.is_running() {
                iterators.insert(id, iterator);
                None
            } else {
                Some(iterator)
            }
        };
        // revoked while the snapshot was being taken
        if let Some(mut iterator) = rejected {
            if let Some(lease) = iterator.revoke() {
                lease.cancel();
            }
            return Err(StoreError::Revoked);
        }
        Ok(id)
    }

    /// Pop the next element of an iterator.
    pub fn next(&self, iterator: IteratorId) -> Result<Match, StoreError> {
        self.ensure_running()?;
        let mut iterators = self.inner.iterators();
        iterators
            .get_mut(&iterator)
            .ok_or_else(|| StoreError::UnknownResource(format!("iterator {}", iterator.0)))?
            .next_match()
    }

    /// Release an iterator before it is exhausted.
    pub fn close_iterator(&self, iterator: IteratorId) -> Result<(), StoreError> {
        self.ensure_running()?;
        let removed = self.inner.iterators().remove(&iterator);
        let mut removed =
            removed.ok_or_else(|| StoreError::UnknownResource(format!("iterator {}", iterator.0)))?;
        if let Some(lease) = removed.revoke() {
            lease.cancel();
        }
        Ok(())
    }

    #[must_use]
    pub fn open_iterators(&self) -> usize {
        self.inner.iterators().len()
    }

    // =========================================================================
    // LISTEN
    // =========================================================================

    /// Deliver the next committed tuple matching `query` to `requester`,
    /// once. Pending until matched, revoked or its sub-lease ends.
    pub fn listen(
        &self,
        query: &Query,
        requester: Box<dyn Requester>,
    ) -> Result<SubscriptionId, StoreError> {
        self.ensure_running()?;
        let store = &self.inner.store;
        let id = store.next_subscription_id();
        let weak_store = Arc::downgrade(store);
        let lease = self.sub_lease(Box::new(move || {
            if let Some(store) = weak_store.upgrade() {
                store.unsubscribe(id);
            }
        }))?;
        store.subscribe(id, self.inner.id, Filter::compile(query), requester, lease)?;
        if !self.is_running() {
            store.unsubscribe(id);
            return Err(StoreError::Revoked);
        }
        Ok(id)
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Stop this manager. Idempotent.
    pub fn revoke(&self) {
        self.inner.stop(true);
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::StorePhase;
    use crate::lease::LocalLeaseService;
    use crate::storage::table::{TableOptions, TupleTable};
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        _temp: TempDir,
        registry: Arc<StoreRegistry>,
        store: Arc<Store>,
        leases: LocalLeaseService,
        next: u64,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = tempdir().expect("temp dir");
            let options = TableOptions {
                cache_size_bytes: 1024 * 1024,
                retry_backoff: Duration::from_millis(1),
                scan_batch: 8,
            };
            let env = EnvId::new_v4();
            let path = temp.path().join("t.redb");
            let registry = Arc::new(StoreRegistry::default());
            let store = registry
                .get_or_open(env, || TupleTable::open(env, &path, &options))
                .expect("store");
            Self {
                _temp: temp,
                registry,
                store,
                leases: LocalLeaseService::new(),
                next: 0,
            }
        }

        fn bind(&mut self, holder: &str) -> Manager {
            self.next += 1;
            Manager::bind(BindContext {
                id: ManagerId(self.next),
                holder: holder.to_owned(),
                lease_duration: Duration::from_secs(60),
                store: Arc::clone(&self.store),
                registry: Arc::downgrade(&self.registry),
                leases: Some(Arc::new(self.leases.clone())),
            })
            .expect("bind")
        }
    }

    fn item(n: i32) -> Tuple {
        Tuple::builder("Item").field("n", n).build()
    }

    #[test]
    fn resource_descriptor_parses() {
        let env = EnvId::new_v4();
        let parsed: ResourceDescriptor = format!("storage:{env}").parse().expect("parse");
        assert_eq!(parsed, ResourceDescriptor::storage(env));
        assert!(parsed.ensure_storage().is_ok());

        let other = ResourceDescriptor::parse(&format!("queue:{env}")).expect("parse");
        assert!(matches!(other.ensure_storage(), Err(StoreError::UnknownResource(_))));
        assert!(ResourceDescriptor::parse("storage").is_err());
        assert!(ResourceDescriptor::parse("storage:not-a-uuid").is_err());
    }

    #[test]
    fn write_read_take_delete() {
        let mut fx = Fixture::new();
        let m = fx.bind("alice");
        let a = item(1);
        m.write(a.clone()).expect("write");
        m.write(item(2)).expect("write");

        assert_eq!(m.read_by_id(a.id()).expect("read"), Some(a.clone()));
        assert_eq!(m.read(&Query::eq("n", 1i32)).expect("read"), Some(a.clone()));
        assert_eq!(m.take(&Query::eq("n", 1i32)).expect("take"), Some(a.clone()));
        assert_eq!(m.read_by_id(a.id()).expect("read"), None);
        assert!(matches!(m.delete(a.id()), Err(StoreError::NoSuchTuple(_))));
    }

    #[test]
    fn iterator_is_a_snapshot_and_exhausts() {
        let mut fx = Fixture::new();
        let m = fx.bind("alice");
        m.write(item(1)).expect("write");
        m.write(item(2)).expect("write");

        let it = m.query(&Query::Empty).expect("query");
        m.write(item(3)).expect("write after snapshot");

        assert!(m.next(it).is_ok());
        assert!(m.next(it).is_ok());
        assert!(matches!(m.next(it), Err(StoreError::Exhausted)));

        let ids = m.query_ids(&Query::Empty).expect("query");
        assert!(matches!(m.next(ids).expect("id"), Match::Id(_)));
        m.close_iterator(ids).expect("close");
        assert!(matches!(m.next(ids), Err(StoreError::UnknownResource(_))));
    }

    #[test]
    fn malformed_query_matches_nothing() {
        let mut fx = Fixture::new();
        let m = fx.bind("alice");
        m.write(item(1)).expect("write");
        let bad = Query::compare("", crate::query::Op::Equal, 1i32);
        assert_eq!(m.read(&bad).expect("read"), None);
    }

    #[test]
    fn listen_is_one_shot() {
        let mut fx = Fixture::new();
        let m = fx.bind("alice");
        let (tx, rx) = crossbeam_channel::unbounded::<Result<Tuple, StoreError>>();
        m.listen(&Query::eq("n", 7i32), Box::new(tx)).expect("listen");

        let hit = item(7);
        m.write(item(1)).expect("write");
        m.write(hit.clone()).expect("write");
        m.write(item(7)).expect("write");

        assert_eq!(rx.try_recv().expect("one").expect("tuple"), hit);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn lease_cancel_revokes_everything() {
        let mut fx = Fixture::new();
        let m = fx.bind("alice");
        let other = fx.bind("bob");
        m.write(item(1)).expect("write");
        let it = m.query(&Query::Empty).expect("query");
        let (tx, rx) = crossbeam_channel::unbounded::<Result<Tuple, StoreError>>();
        m.listen(&Query::Empty, Box::new(tx)).expect("listen");
        assert_eq!(fx.leases.leases_of("alice").len(), 3);

        for lease in fx.leases.leases_of("alice") {
            fx.leases.cancel(lease);
        }

        assert!(!m.is_running());
        assert!(matches!(m.next(it), Err(StoreError::Revoked)));
        assert!(matches!(m.write(item(2)), Err(StoreError::Revoked)));
        assert!(matches!(rx.try_recv().expect("notified"), Err(StoreError::Revoked)));
        assert!(fx.leases.leases_of("alice").is_empty());

        // bob still holds the store open
        assert_eq!(fx.store.phase(), StorePhase::Open);
        assert!(other.read(&Query::Empty).expect("read").is_some());
    }

    #[test]
    fn last_revoke_shuts_the_store_down() {
        let mut fx = Fixture::new();
        let m = fx.bind("alice");
        m.revoke();
        m.revoke();

        assert_eq!(fx.store.phase(), StorePhase::Closed);
        assert!(fx.registry.is_empty());
        assert_eq!(fx.leases.active_count(), 0);
    }

    #[test]
    fn iterator_sub_lease_expiry_revokes_only_that_iterator() {
        let mut fx = Fixture::new();
        let m = fx.bind("alice");
        m.write(item(1)).expect("write");
        let it = m.query(&Query::Empty).expect("query");
        let kept = m.query(&Query::Empty).expect("query");

        // manager lease is the first grant, then one per iterator
        let leases = fx.leases.leases_of("alice");
        fx.leases.cancel(leases[1]);

        assert!(matches!(m.next(it), Err(StoreError::Revoked)));
        assert!(m.next(kept).is_ok());
        assert!(m.is_running());
    }
}
