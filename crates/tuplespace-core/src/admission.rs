//! # Admission Control
//!
//! One [`Store`] per environment gates every read and write against its
//! tuple table.
//!
//! ```text
//!            begin_read_only (stacked)          end_read_only (count = 0)
//!   OPEN ───────────────────────────▶ READONLY ──────────────────────────▶ OPEN
//!    │                                                   (deferred writes replayed)
//!    │ begin_move
//!    ▼
//!  MOVING            any state ──revoke_all──▶ CLOSING ──▶ CLOSED
//! ```
//!
//! ## Counters
//!
//! `outstanding` counts every admitted operation, `writes` the admitted
//! writes among them. Each is decremented by the [`Admission`] permit that
//! incremented it. Quiescence waits block on a condition variable until the
//! relevant counter reaches zero.

use crate::filter::Filter;
use crate::lease::Lease;
use crate::session::Requester;
use crate::storage::table::{Match, TupleStream, TupleTable};
use crate::tuple::Tuple;
use crate::types::{EnvId, StoreError, TupleId};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};

/// Lifecycle state of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorePhase {
    Open,
    ReadOnly,
    Moving,
    Closing,
    Closed,
}

impl StorePhase {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }
}

/// A mutation submitted to a store.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Put(Tuple),
    Delete(TupleId),
}

/// Whether a write reached the table or was queued behind a read-only
/// window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Applied,
    Deferred,
}

/// Identifier of a bound manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ManagerId(pub u64);

/// Identifier of a listen subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(pub u64);

/// A binding the store can tear down.
pub(crate) trait Revocable: Send + Sync {
    /// Stop the binding. The store is already shutting it out, so this must
    /// not call back into store shutdown.
    fn revoke_by_store(&self);
}

/// Outcome of detaching a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Detached {
    /// Other managers remain, or the store is owned by a transfer.
    Remaining,
    /// That was the last manager; the store is now closing.
    Last,
}

struct Subscription {
    id: SubscriptionId,
    manager: ManagerId,
    filter: Filter,
    requester: Box<dyn Requester>,
    lease: Option<Box<dyn Lease>>,
}

impl Subscription {
    fn finish(self, result: Result<Tuple, StoreError>) {
        self.requester.deliver(result);
        if let Some(lease) = self.lease {
            lease.cancel();
        }
    }
}

struct State {
    phase: StorePhase,
    read_only: usize,
    outstanding: usize,
    writes: usize,
    draining: bool,
    deferred: VecDeque<WriteOp>,
    managers: BTreeMap<ManagerId, Weak<dyn Revocable>>,
    table: Option<Arc<TupleTable>>,
}

// =============================================================================
// STORE
// =============================================================================

/// Admission state of one environment's tuple table.
pub struct Store {
    env: EnvId,
    state: Mutex<State>,
    changed: Condvar,
    subscriptions: Mutex<Vec<Subscription>>,
    next_subscription: AtomicU64,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Store")
            .field("env", &self.env)
            .field("phase", &state.phase)
            .field("outstanding", &state.outstanding)
            .field("deferred", &state.deferred.len())
            .finish_non_exhaustive()
    }
}

/// An admitted operation. Dropping it releases the admission.
pub(crate) struct Admission<'a> {
    store: &'a Store,
    write: bool,
    table: Arc<TupleTable>,
}

impl Admission<'_> {
    pub(crate) fn table(&self) -> &TupleTable {
        &self.table
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        let mut state = self.store.lock();
        state.outstanding = state.outstanding.saturating_sub(1);
        if self.write {
            state.writes = state.writes.saturating_sub(1);
        }
        self.store.changed.notify_all();
    }
}

impl Store {
    pub(crate) fn new(table: TupleTable) -> Arc<Self> {
        Arc::new(Self {
            env: table.env(),
            state: Mutex::new(State {
                phase: StorePhase::Open,
                read_only: 0,
                outstanding: 0,
                writes: 0,
                draining: false,
                deferred: VecDeque::new(),
                managers: BTreeMap::new(),
                table: Some(Arc::new(table)),
            }),
            changed: Condvar::new(),
            subscriptions: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn env(&self) -> EnvId {
        self.env
    }

    #[must_use]
    pub fn phase(&self) -> StorePhase {
        self.lock().phase
    }

    /// Writes queued behind a read-only window.
    #[must_use]
    pub fn deferred_len(&self) -> usize {
        self.lock().deferred.len()
    }

    #[must_use]
    pub fn manager_count(&self) -> usize {
        self.lock().managers.len()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_until<'a>(
        &'a self,
        mut state: MutexGuard<'a, State>,
        done: impl Fn(&State) -> bool,
    ) -> MutexGuard<'a, State> {
        while !done(&state) {
            state = self.changed.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        state
    }

    fn refuse(&self, phase: StorePhase) -> StoreError {
        if phase.is_terminal() {
            StoreError::Revoked
        } else {
            StoreError::Busy(self.env)
        }
    }

    fn admit(&self, state: &mut State, write: bool) -> Result<Admission<'_>, StoreError> {
        let table = state.table.clone().ok_or(StoreError::Revoked)?;
        state.outstanding += 1;
        if write {
            state.writes += 1;
        }
        Ok(Admission {
            store: self,
            write,
            table,
        })
    }

    // =========================================================================
    // OPERATIONS
    // =========================================================================

    /// Admit a read. Reads run in OPEN and READONLY.
    pub(crate) fn admit_read(&self) -> Result<Admission<'_>, StoreError> {
        let mut state = self.lock();
        match state.phase {
            StorePhase::Open | StorePhase::ReadOnly => self.admit(&mut state, false),
            other => Err(self.refuse(other)),
        }
    }

    /// Run `op` against the table under a read admission.
    pub(crate) fn read<T>(
        &self,
        op: impl FnOnce(&TupleTable) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let admission = self.admit_read()?;
        op(admission.table())
    }

    /// Apply a write, or queue it while the store is read-only.
    pub(crate) fn write(&self, op: WriteOp) -> Result<WriteStatus, StoreError> {
        let admission = {
            let mut state = self.lock();
            match state.phase {
                StorePhase::Open => self.admit(&mut state, true)?,
                StorePhase::ReadOnly => {
                    tracing::debug!(
                        env = %self.env,
                        queued = state.deferred.len() + 1,
                        "write deferred"
                    );
                    state.deferred.push_back(op);
                    return Ok(WriteStatus::Deferred);
                }
                other => return Err(self.refuse(other)),
            }
        };
        let committed = Self::apply(admission.table(), op)?;
        drop(admission);
        if let Some(tuple) = committed {
            self.notify(&tuple);
        }
        Ok(WriteStatus::Applied)
    }

    /// Remove and return the first tuple matching `filter`. A destructive
    /// read cannot be deferred, so it needs an OPEN store.
    pub(crate) fn take(&self, filter: &Filter) -> Result<Option<Tuple>, StoreError> {
        let admission = {
            let mut state = self.lock();
            match state.phase {
                StorePhase::Open => self.admit(&mut state, true)?,
                StorePhase::ReadOnly => return Err(StoreError::Busy(self.env)),
                other => return Err(self.refuse(other)),
            }
        };
        let table = admission.table();
        // a concurrent take may win the delete; look for the next match
        loop {
            let Some(hit) = table.get_one(filter, false)?.and_then(Match::into_tuple) else {
                return Ok(None);
            };
            match table.delete(hit.id()) {
                Ok(()) => return Ok(Some(hit)),
                Err(StoreError::NoSuchTuple(_)) => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn apply(table: &TupleTable, op: WriteOp) -> Result<Option<Tuple>, StoreError> {
        match op {
            WriteOp::Put(tuple) => {
                table.put(&tuple)?;
                Ok(Some(tuple))
            }
            WriteOp::Delete(id) => {
                table.delete(id)?;
                Ok(None)
            }
        }
    }

    /// A lazy stream over the raw records, for transfers. Bypasses admission:
    /// the caller holds the store in READONLY or MOVING.
    pub(crate) fn stream(&self, closed: Arc<AtomicBool>) -> Result<TupleStream, StoreError> {
        let table = self.lock().table.clone().ok_or(StoreError::Revoked)?;
        table.stream(closed)
    }

    // =========================================================================
    // MANAGERS
    // =========================================================================

    pub(crate) fn attach(
        &self,
        id: ManagerId,
        manager: Weak<dyn Revocable>,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state.phase.is_terminal() {
            return Err(StoreError::Revoked);
        }
        state.managers.insert(id, manager);
        Ok(())
    }

    /// Forget a manager. When it was the last one on an OPEN or READONLY
    /// store, the store starts closing and the caller must finish the
    /// shutdown.
    pub(crate) fn detach(&self, id: ManagerId) -> Detached {
        let mut state = self.lock();
        if state.managers.remove(&id).is_none() || !state.managers.is_empty() {
            return Detached::Remaining;
        }
        match state.phase {
            StorePhase::Open | StorePhase::ReadOnly => {
                state.phase = StorePhase::Closing;
                self.changed.notify_all();
                Detached::Last
            }
            _ => Detached::Remaining,
        }
    }

    fn revoke_managers(&self, managers: BTreeMap<ManagerId, Weak<dyn Revocable>>) {
        for (id, manager) in managers {
            if let Some(manager) = manager.upgrade() {
                tracing::debug!(env = %self.env, manager = id.0, "revoking manager");
                manager.revoke_by_store();
            }
        }
    }

    // =========================================================================
    // LISTEN
    // =========================================================================

    pub(crate) fn next_subscription_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn subscribe(
        &self,
        id: SubscriptionId,
        manager: ManagerId,
        filter: Filter,
        requester: Box<dyn Requester>,
        lease: Option<Box<dyn Lease>>,
    ) -> Result<(), StoreError> {
        let phase = self.phase();
        if !matches!(phase, StorePhase::Open | StorePhase::ReadOnly) {
            return Err(self.refuse(phase));
        }
        let mut subs = self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner);
        subs.push(Subscription {
            id,
            manager,
            filter,
            requester,
            lease,
        });
        Ok(())
    }

    /// End one subscription with `Revoked`, if it is still pending.
    pub(crate) fn unsubscribe(&self, id: SubscriptionId) {
        let ended = self.take_subscriptions(|s| s.id == id);
        for sub in ended {
            sub.finish(Err(StoreError::Revoked));
        }
    }

    /// End every subscription of `manager` with `Revoked`.
    pub(crate) fn revoke_subscriptions(&self, manager: ManagerId) {
        let ended = self.take_subscriptions(|s| s.manager == manager);
        for sub in ended {
            sub.finish(Err(StoreError::Revoked));
        }
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn take_subscriptions(&self, pick: impl Fn(&Subscription) -> bool) -> Vec<Subscription> {
        let mut subs = self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner);
        let (taken, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut *subs).into_iter().partition(|s| pick(s));
        *subs = kept;
        taken
    }

    /// Deliver a committed tuple to every one-shot subscription it matches.
    fn notify(&self, tuple: &Tuple) {
        let hits = self.take_subscriptions(|s| s.filter.matches(tuple));
        for sub in hits {
            tracing::debug!(
                env = %self.env,
                subscription = sub.id.0,
                tuple = %tuple.id(),
                "listen matched"
            );
            sub.finish(Ok(tuple.clone()));
        }
    }

    // =========================================================================
    // STATE TRANSITIONS
    // =========================================================================

    /// Enter (or stack another) read-only window. Returns once every write
    /// admitted before the window has finished.
    pub(crate) fn begin_read_only(&self) -> Result<(), StoreError> {
        let mut state = self.lock();
        match state.phase {
            StorePhase::Open => state.phase = StorePhase::ReadOnly,
            StorePhase::ReadOnly => {}
            other => return Err(self.refuse(other)),
        }
        state.read_only += 1;
        let depth = state.read_only;
        let _state = self.wait_until(state, |s| s.writes == 0);
        tracing::debug!(env = %self.env, depth, "read-only window opened");
        Ok(())
    }

    /// Close one read-only window. The last one replays the deferred writes
    /// in submission order before returning.
    pub(crate) fn end_read_only(&self) {
        {
            let mut state = self.lock();
            if state.phase != StorePhase::ReadOnly || state.read_only == 0 {
                tracing::warn!(
                    env = %self.env,
                    phase = ?state.phase,
                    "end_read_only without a read-only window"
                );
                return;
            }
            state.read_only -= 1;
            if state.read_only > 0 || state.draining {
                return;
            }
            state.draining = true;
        }

        let mut replayed = 0usize;
        loop {
            let (op, admission) = {
                let mut state = self.lock();
                if state.phase != StorePhase::ReadOnly || state.read_only > 0 {
                    // closed underneath us, or a new window opened
                    state.draining = false;
                    break;
                }
                let Some(op) = state.deferred.pop_front() else {
                    state.phase = StorePhase::Open;
                    state.draining = false;
                    self.changed.notify_all();
                    break;
                };
                match self.admit(&mut state, true) {
                    Ok(admission) => (op, admission),
                    Err(_) => {
                        state.draining = false;
                        break;
                    }
                }
            };
            match Self::apply(admission.table(), op) {
                Ok(Some(tuple)) => {
                    drop(admission);
                    self.notify(&tuple);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(env = %self.env, error = %e, "deferred write failed on replay")
                }
            }
            replayed += 1;
        }
        tracing::debug!(env = %self.env, replayed, "read-only window closed");
    }

    /// OPEN -> MOVING. Revokes every manager except `keep`, then waits for
    /// every admitted operation to finish.
    pub(crate) fn begin_move(&self, keep: Option<ManagerId>) -> Result<(), StoreError> {
        let doomed = {
            let mut state = self.lock();
            if state.phase != StorePhase::Open {
                return Err(self.refuse(state.phase));
            }
            state.phase = StorePhase::Moving;
            let (kept, doomed): (BTreeMap<_, _>, BTreeMap<_, _>) =
                std::mem::take(&mut state.managers)
                    .into_iter()
                    .partition(|(id, _)| Some(*id) == keep);
            state.managers = kept;
            doomed
        };
        tracing::info!(env = %self.env, revoked = doomed.len(), "store moving");
        self.revoke_managers(doomed);
        self.revoke_all_subscriptions();

        let state = self.lock();
        let _state = self.wait_until(state, |s| s.outstanding == 0);
        Ok(())
    }

    /// Move any state to CLOSING then CLOSED: revoke every manager, wait for
    /// admitted operations, close the table. Idempotent.
    pub(crate) fn revoke_all(&self) {
        let managers = {
            let mut state = self.lock();
            if state.phase == StorePhase::Closed {
                return;
            }
            state.phase = StorePhase::Closing;
            if !state.deferred.is_empty() {
                tracing::warn!(
                    env = %self.env,
                    dropped = state.deferred.len(),
                    "discarding deferred writes of a closing store"
                );
                state.deferred.clear();
            }
            self.changed.notify_all();
            std::mem::take(&mut state.managers)
        };
        self.revoke_managers(managers);
        self.revoke_all_subscriptions();

        let state = self.lock();
        let mut state = self.wait_until(state, |s| s.outstanding == 0);
        state.table = None;
        state.phase = StorePhase::Closed;
        self.changed.notify_all();
        tracing::debug!(env = %self.env, "store closed");
    }

    fn revoke_all_subscriptions(&self) {
        let ended = self.take_subscriptions(|_| true);
        for sub in ended {
            sub.finish(Err(StoreError::Revoked));
        }
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// The process-wide map of live stores, one per environment.
///
/// Table files are opened outside the map lock. An environment being
/// opened is parked in `opening`; other binds to it wait on `opened`.
#[derive(Default)]
pub struct StoreRegistry {
    slots: Mutex<Slots>,
    opened: Condvar,
}

#[derive(Default)]
struct Slots {
    live: BTreeMap<EnvId, Arc<Store>>,
    opening: BTreeSet<EnvId>,
}

impl std::fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreRegistry")
            .field("stores", &self.len())
            .finish()
    }
}

impl StoreRegistry {
    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn get(&self, env: EnvId) -> Option<Arc<Store>> {
        self.lock().live.get(&env).cloned()
    }

    /// The live store of `env`, opening its table on first use.
    pub(crate) fn get_or_open(
        &self,
        env: EnvId,
        open: impl FnOnce() -> Result<TupleTable, StoreError>,
    ) -> Result<Arc<Store>, StoreError> {
        let mut slots = self.lock();
        loop {
            if let Some(store) = slots.live.get(&env) {
                if !store.phase().is_terminal() {
                    return Ok(Arc::clone(store));
                }
            }
            if !slots.opening.contains(&env) {
                break;
            }
            slots = self
                .opened
                .wait(slots)
                .unwrap_or_else(PoisonError::into_inner);
        }
        slots.opening.insert(env);
        drop(slots);

        let opened = open();

        let mut slots = self.lock();
        slots.opening.remove(&env);
        self.opened.notify_all();
        let store = Store::new(opened?);
        slots.live.insert(env, Arc::clone(&store));
        tracing::debug!(env = %env, "store opened");
        Ok(store)
    }

    /// Unregister `store` if it is still the registered one for its env.
    pub(crate) fn forget(&self, store: &Arc<Store>) {
        let mut slots = self.lock();
        if slots
            .live
            .get(&store.env())
            .is_some_and(|s| Arc::ptr_eq(s, store))
        {
            slots.live.remove(&store.env());
        }
    }

    /// Unregister and close the store of `env`, if any.
    pub(crate) fn shutdown(&self, env: EnvId) {
        let store = self.lock().live.remove(&env);
        if let Some(store) = store {
            store.revoke_all();
        }
    }

    /// Close a store whose last manager just left. The table file is
    /// closed before the entry goes, so a reopen never races the old handle.
    pub(crate) fn shutdown_store(&self, store: &Arc<Store>) {
        store.revoke_all();
        self.forget(store);
    }

    pub(crate) fn shutdown_all(&self) {
        let stores = std::mem::take(&mut self.lock().live);
        for store in stores.into_values() {
            store.revoke_all();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().live.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Query;
    use crate::storage::table::TableOptions;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    fn store() -> (TempDir, Arc<Store>) {
        let temp = tempdir().expect("temp dir");
        let options = TableOptions {
            cache_size_bytes: 1024 * 1024,
            retry_backoff: Duration::from_millis(1),
            scan_batch: 8,
        };
        let table =
            TupleTable::open(EnvId::new_v4(), &temp.path().join("t.redb"), &options).expect("open");
        (temp, Store::new(table))
    }

    fn item(n: i32) -> Tuple {
        Tuple::builder("Item").field("n", n).build()
    }

    fn count(store: &Store) -> u64 {
        store.read(|t| t.len()).expect("len")
    }

    struct FakeManager {
        revoked: AtomicUsize,
    }

    impl Revocable for FakeManager {
        fn revoke_by_store(&self) {
            self.revoked.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fake_manager() -> Arc<FakeManager> {
        Arc::new(FakeManager {
            revoked: AtomicUsize::new(0),
        })
    }

    fn weak(p: &Arc<FakeManager>) -> Weak<dyn Revocable> {
        let p: Arc<dyn Revocable> = Arc::clone(p) as Arc<dyn Revocable>;
        Arc::downgrade(&p)
    }

    #[test]
    fn open_store_applies_writes() {
        let (_temp, store) = store();
        assert_eq!(store.write(WriteOp::Put(item(1))).expect("write"), WriteStatus::Applied);
        assert_eq!(count(&store), 1);
    }

    #[test]
    fn read_only_defers_writes_and_replays_in_order() {
        let (_temp, store) = store();
        let first = item(1);
        store.write(WriteOp::Put(first.clone())).expect("write");

        store.begin_read_only().expect("read only");
        store.begin_read_only().expect("stacked");
        let second = item(2);
        let deferred = store.write(WriteOp::Put(second.clone())).expect("write");
        assert_eq!(deferred, WriteStatus::Deferred);
        let deferred = store.write(WriteOp::Delete(first.id())).expect("delete");
        assert_eq!(deferred, WriteStatus::Deferred);

        // reads still see the data as of the window
        assert!(store.read(|t| t.get_by_id(first.id())).expect("read").is_some());
        assert_eq!(count(&store), 1);

        store.end_read_only();
        assert_eq!(store.phase(), StorePhase::ReadOnly);
        assert_eq!(store.deferred_len(), 2);

        store.end_read_only();
        assert_eq!(store.phase(), StorePhase::Open);
        assert_eq!(store.deferred_len(), 0);
        assert!(store.read(|t| t.get_by_id(first.id())).expect("read").is_none());
        assert!(store.read(|t| t.get_by_id(second.id())).expect("read").is_some());
    }

    #[test]
    fn take_is_refused_while_read_only() {
        let (_temp, store) = store();
        store.write(WriteOp::Put(item(1))).expect("write");
        store.begin_read_only().expect("read only");
        assert!(matches!(store.take(&Filter::all()), Err(StoreError::Busy(_))));
        store.end_read_only();
        assert!(store.take(&Filter::all()).expect("take").is_some());
        assert!(store.take(&Filter::all()).expect("take").is_none());
    }

    #[test]
    fn moving_store_is_busy_and_revokes_other_managers() {
        let (_temp, store) = store();
        let mine = fake_manager();
        let other = fake_manager();
        store.attach(ManagerId(1), weak(&mine)).expect("attach");
        store.attach(ManagerId(2), weak(&other)).expect("attach");

        store.begin_move(Some(ManagerId(1))).expect("move");
        assert_eq!(store.phase(), StorePhase::Moving);
        assert_eq!(mine.revoked.load(Ordering::SeqCst), 0);
        assert_eq!(other.revoked.load(Ordering::SeqCst), 1);

        assert!(matches!(store.admit_read(), Err(StoreError::Busy(_))));
        assert!(matches!(store.write(WriteOp::Put(item(1))), Err(StoreError::Busy(_))));
        assert!(matches!(store.begin_move(None), Err(StoreError::Busy(_))));
        assert!(matches!(store.begin_read_only(), Err(StoreError::Busy(_))));
    }

    #[test]
    fn begin_move_waits_for_outstanding_reads() {
        let (_temp, store) = store();
        let admission = store.admit_read().expect("admit");

        let mover = {
            let store = Arc::clone(&store);
            thread::spawn(move || store.begin_move(None))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!mover.is_finished());

        drop(admission);
        mover.join().expect("join").expect("move");
        assert_eq!(store.phase(), StorePhase::Moving);
    }

    #[test]
    fn revoke_all_closes_and_reports_revoked() {
        let (_temp, store) = store();
        let p = fake_manager();
        store.attach(ManagerId(1), weak(&p)).expect("attach");
        store.begin_read_only().expect("read only");
        store.write(WriteOp::Put(item(1))).expect("deferred");

        store.revoke_all();
        store.revoke_all();
        assert_eq!(store.phase(), StorePhase::Closed);
        assert_eq!(p.revoked.load(Ordering::SeqCst), 1);
        assert_eq!(store.deferred_len(), 0);
        assert!(matches!(store.admit_read(), Err(StoreError::Revoked)));
        assert!(matches!(store.write(WriteOp::Put(item(2))), Err(StoreError::Revoked)));
        assert!(matches!(store.attach(ManagerId(2), weak(&p)), Err(StoreError::Revoked)));
    }

    #[test]
    fn detach_of_last_manager_starts_closing() {
        let (_temp, store) = store();
        let a = fake_manager();
        let b = fake_manager();
        store.attach(ManagerId(1), weak(&a)).expect("attach");
        store.attach(ManagerId(2), weak(&b)).expect("attach");

        assert_eq!(store.detach(ManagerId(1)), Detached::Remaining);
        assert_eq!(store.detach(ManagerId(1)), Detached::Remaining);
        assert_eq!(store.detach(ManagerId(2)), Detached::Last);
        assert_eq!(store.phase(), StorePhase::Closing);
    }

    #[test]
    fn subscriptions_fire_once_on_matching_write() {
        let (_temp, store) = store();
        let (tx, rx) = crossbeam_channel::unbounded::<Result<Tuple, StoreError>>();
        let id = store.next_subscription_id();
        let filter = Filter::compile(&Query::eq("n", 2i32));
        store
            .subscribe(id, ManagerId(1), filter, Box::new(tx), None)
            .expect("subscribe");

        store.write(WriteOp::Put(item(1))).expect("write");
        assert!(rx.try_recv().is_err());

        let hit = item(2);
        store.write(WriteOp::Put(hit.clone())).expect("write");
        assert_eq!(rx.try_recv().expect("delivered").expect("tuple"), hit);

        store.write(WriteOp::Put(item(2))).expect("write");
        assert!(rx.try_recv().is_err());
        assert_eq!(store.subscription_count(), 0);
    }

    #[test]
    fn subscriptions_see_replayed_writes_and_revocation() {
        let (_temp, store) = store();
        let (tx, rx) = crossbeam_channel::unbounded::<Result<Tuple, StoreError>>();
        store
            .subscribe(
                store.next_subscription_id(),
                ManagerId(1),
                Filter::all(),
                Box::new(tx.clone()),
                None,
            )
            .expect("subscribe");
        store.begin_read_only().expect("read only");
        store.write(WriteOp::Put(item(5))).expect("deferred");
        assert!(rx.try_recv().is_err());
        store.end_read_only();
        assert!(rx.try_recv().expect("delivered").is_ok());

        store
            .subscribe(
                store.next_subscription_id(),
                ManagerId(1),
                Filter::all(),
                Box::new(tx),
                None,
            )
            .expect("subscribe");
        store.revoke_subscriptions(ManagerId(1));
        assert!(matches!(rx.try_recv().expect("delivered"), Err(StoreError::Revoked)));
    }

    fn options() -> TableOptions {
        TableOptions {
            cache_size_bytes: 1024 * 1024,
            retry_backoff: Duration::from_millis(1),
            scan_batch: 8,
        }
    }

    #[test]
    fn slow_open_does_not_block_other_environments() {
        let temp = tempdir().expect("temp dir");
        let registry = StoreRegistry::default();
        let (slow, fast) = (EnvId::new_v4(), EnvId::new_v4());
        let (started_tx, started_rx) = crossbeam_channel::bounded::<()>(1);
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);

        thread::scope(|scope| {
            let opener = scope.spawn(|| {
                registry.get_or_open(slow, || {
                    started_tx.send(()).expect("signal");
                    release_rx.recv().expect("release");
                    TupleTable::open(slow, &temp.path().join("slow.redb"), &options())
                })
            });
            started_rx.recv().expect("open started");

            let store = registry
                .get_or_open(fast, || {
                    TupleTable::open(fast, &temp.path().join("fast.redb"), &options())
                })
                .expect("open while another env opens");
            assert_eq!(store.env(), fast);
            assert!(registry.get(slow).is_none());

            release_tx.send(()).expect("release");
            opener.join().expect("join").expect("slow open");
        });
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn concurrent_opens_share_one_store() {
        let temp = tempdir().expect("temp dir");
        let registry = StoreRegistry::default();
        let env = EnvId::new_v4();
        let path = temp.path().join("shared.redb");
        let opens = AtomicUsize::new(0);

        let stores: Vec<Arc<Store>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(|| {
                        registry
                            .get_or_open(env, || {
                                opens.fetch_add(1, Ordering::SeqCst);
                                thread::sleep(Duration::from_millis(20));
                                TupleTable::open(env, &path, &options())
                            })
                            .expect("open")
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().expect("join")).collect()
        });

        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert!(stores.iter().all(|s| Arc::ptr_eq(s, &stores[0])));
    }

    #[test]
    fn failed_open_frees_the_slot() {
        let temp = tempdir().expect("temp dir");
        let registry = StoreRegistry::default();
        let env = EnvId::new_v4();

        let failed = registry.get_or_open(env, || Err(StoreError::Io("disk gone".into())));
        assert!(matches!(failed, Err(StoreError::Io(_))));
        assert!(registry.is_empty());

        registry
            .get_or_open(env, || TupleTable::open(env, &temp.path().join("t.redb"), &options()))
            .expect("second open");
        assert_eq!(registry.len(), 1);
    }
}
