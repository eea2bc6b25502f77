//! Live queries that re-run when a table they read is written.
//!
//! Every subscription owns one task parked on a [`Notify`]. A write stores a
//! single permit, so any number of writes that land while a re-run is in
//! flight collapse into exactly one more re-run. Writers only take the
//! registry lock long enough to hand out permits; query execution and
//! observer callbacks happen on the subscription's own task.

use std::{
    collections::{BTreeSet, HashMap},
    marker::PhantomData,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
};

use thiserror::Error;
use tokio::{runtime::Handle, sync::{watch, Notify}};

use tallydb_core::Table;

use crate::{
    invalidation::{InvalidationTracker, SubscriptionId},
    query::{FromQueryResult, QueryError, QueryExecutor, QueryResult, QuerySpec},
};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SubscriptionError {
    #[error("query failed: {0}")]
    Query(#[from] QueryError),
    #[error("query task aborted: {0}")]
    Aborted(String),
    #[error("store is closed")]
    Closed,
}

/// Receives the results of one subscription, in commit order.
///
/// Callbacks run on the subscription's task, so a slow observer delays only
/// its own subscription. Cancelling from inside a callback is allowed.
pub trait Observer: Send + Sync {
    fn on_next(&self, result: &QueryResult);
    /// Terminal: the subscription is already cancelled when this is called.
    fn on_error(&self, error: &SubscriptionError);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Created,
    Active,
    Cancelled,
}

struct Slot {
    id: SubscriptionId,
    spec: QuerySpec,
    state: Mutex<SubscriptionState>,
    wake: Notify,
    evaluations: AtomicU64,
}

impl Slot {
    fn state(&self) -> MutexGuard<'_, SubscriptionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_cancelled(&self) -> bool {
        *self.state() == SubscriptionState::Cancelled
    }

    /// Returns true if this call performed the transition.
    fn cancel(&self) -> bool {
        let mut state = self.state();
        if *state == SubscriptionState::Cancelled {
            return false;
        }
        *state = SubscriptionState::Cancelled;
        drop(state);
        self.wake.notify_one();
        true
    }

    fn activate(&self) {
        let mut state = self.state();
        if *state == SubscriptionState::Created {
            *state = SubscriptionState::Active;
        }
    }
}

#[derive(Default)]
struct Registry {
    tracker: InvalidationTracker,
    slots: HashMap<SubscriptionId, Arc<Slot>>,
}

struct Shared {
    executor: Arc<QueryExecutor>,
    registry: Mutex<Registry>,
    next_id: AtomicU64,
    closed: AtomicBool,
    runtime: Handle,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, id: SubscriptionId) {
        let mut registry = self.registry();
        registry.tracker.unregister(id);
        registry.slots.remove(&id);
    }
}

/// Owns every live subscription of a store.
pub struct SubscriptionManager {
    shared: Arc<Shared>,
}

impl SubscriptionManager {
    /// Subscription tasks are spawned on `runtime`.
    pub fn new(executor: Arc<QueryExecutor>, runtime: Handle) -> Self {
        Self {
            shared: Arc::new(Shared {
                executor,
                registry: Mutex::new(Registry::default()),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                runtime,
            }),
        }
    }

    /// Registers `spec`, then runs it once for the initial emission.
    pub fn subscribe(&self, spec: QuerySpec, observer: Arc<dyn Observer>) -> Result<SubscriptionHandle, SubscriptionError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(SubscriptionError::Closed);
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let slot = Arc::new(Slot {
            id,
            spec,
            state: Mutex::new(SubscriptionState::Created),
            wake: Notify::new(),
            evaluations: AtomicU64::new(0),
        });

        {
            let mut registry = self.shared.registry();
            // Checked again under the lock so close() cannot miss this slot.
            if self.shared.closed.load(Ordering::SeqCst) {
                return Err(SubscriptionError::Closed);
            }
            registry.tracker.register(id, slot.spec.tables().iter().copied());
            registry.slots.insert(id, slot.clone());
        }

        // Initial run; registering first means no commit can slip between the
        // initial read and the first invalidation.
        slot.wake.notify_one();
        self.shared
            .runtime
            .spawn(run_subscription(self.shared.clone(), slot.clone(), observer));
        tracing::debug!(subscription_id = id, spec = ?slot.spec, "Subscription created");

        Ok(SubscriptionHandle {
            slot,
            shared: Arc::downgrade(&self.shared),
        })
    }

    /// Schedules a re-run of every active subscription reading any of
    /// `tables`. Never waits for the re-runs themselves.
    pub fn notify_tables(&self, tables: &BTreeSet<Table>) {
        if tables.is_empty() {
            return;
        }
        let registry = self.shared.registry();
        let affected = registry.tracker.notify_writes(tables);
        for id in &affected {
            if let Some(slot) = registry.slots.get(id) {
                slot.wake.notify_one();
            }
        }
        tracing::debug!(?tables, subscriptions = affected.len(), "Invalidated subscriptions");
    }

    pub fn active_count(&self) -> usize {
        self.shared.registry().slots.len()
    }

    /// Cancels every subscription and refuses new ones.
    pub fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        let slots: Vec<Arc<Slot>> = {
            let mut registry = self.shared.registry();
            registry.tracker = InvalidationTracker::new();
            registry.slots.drain().map(|(_, slot)| slot).collect()
        };
        for slot in &slots {
            slot.cancel();
        }
        tracing::debug!(cancelled = slots.len(), "Subscription manager shut down");
    }
}

async fn run_subscription(shared: Arc<Shared>, slot: Arc<Slot>, observer: Arc<dyn Observer>) {
    let mut last: Option<QueryResult> = None;

    loop {
        slot.wake.notified().await;
        if slot.is_cancelled() {
            break;
        }

        let executor = shared.executor.clone();
        let spec = slot.spec.clone();
        let outcome = tokio::task::spawn_blocking(move || executor.execute(&spec)).await;
        slot.evaluations.fetch_add(1, Ordering::SeqCst);

        // Cancelled mid-run: the result is dropped, never delivered.
        if slot.is_cancelled() {
            break;
        }

        let error = match outcome {
            Ok(Ok(result)) => {
                slot.activate();
                if last.as_ref() == Some(&result) {
                    tracing::trace!(subscription_id = slot.id, "Result unchanged, skipping emission");
                    continue;
                }
                observer.on_next(&result);
                last = Some(result);
                continue;
            }
            Ok(Err(e)) => SubscriptionError::Query(e),
            Err(e) => SubscriptionError::Aborted(e.to_string()),
        };

        tracing::warn!(subscription_id = slot.id, error = %error, "Subscription failed");
        slot.cancel();
        shared.release(slot.id);
        observer.on_error(&error);
        break;
    }

    tracing::debug!(subscription_id = slot.id, "Subscription released");
}

/// Cancellation handle for one subscription. Dropping it does not cancel.
#[derive(Clone)]
pub struct SubscriptionHandle {
    slot: Arc<Slot>,
    shared: Weak<Shared>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.slot.id
    }

    pub fn state(&self) -> SubscriptionState {
        *self.slot.state()
    }

    /// Number of times the query has been executed, including the initial run.
    pub fn evaluations(&self) -> u64 {
        self.slot.evaluations.load(Ordering::SeqCst)
    }

    /// Takes effect no later than the next re-run boundary. Idempotent, and
    /// safe to call from inside an observer.
    pub fn cancel(&self) {
        if self.slot.cancel() {
            if let Some(shared) = self.shared.upgrade() {
                shared.release(self.slot.id);
            }
            tracing::debug!(subscription_id = self.slot.id, "Subscription cancelled");
        }
    }
}

type Update = Option<Result<QueryResult, SubscriptionError>>;

struct WatchObserver {
    tx: watch::Sender<Update>,
}

impl Observer for WatchObserver {
    fn on_next(&self, result: &QueryResult) {
        self.tx.send_replace(Some(Ok(result.clone())));
    }

    fn on_error(&self, error: &SubscriptionError) {
        self.tx.send_replace(Some(Err(error.clone())));
    }
}

/// Typed stream of a subscription's results.
///
/// Only the latest result is buffered: a consumer that falls behind skips
/// intermediate states but never sees them out of order. The stream ends
/// after cancellation, store close or a terminal error. Dropping it cancels
/// the subscription.
pub struct LiveQuery<T> {
    handle: SubscriptionHandle,
    updates: watch::Receiver<Update>,
    finished: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T: FromQueryResult> LiveQuery<T> {
    pub fn subscribe(manager: &SubscriptionManager, spec: QuerySpec) -> Result<Self, SubscriptionError> {
        let (tx, updates) = watch::channel(None);
        let handle = manager.subscribe(spec, Arc::new(WatchObserver { tx }))?;
        Ok(Self {
            handle,
            updates,
            finished: false,
            _marker: PhantomData,
        })
    }

    /// Waits for the next result that differs from the previous one.
    pub async fn next(&mut self) -> Option<Result<T, SubscriptionError>> {
        while !self.finished {
            if self.updates.changed().await.is_err() {
                self.finished = true;
                break;
            }
            let update = self.updates.borrow_and_update().clone();
            match update {
                Some(Ok(result)) => {
                    return Some(T::from_result(result).ok_or_else(|| {
                        SubscriptionError::Aborted("unexpected result shape".to_string())
                    }));
                }
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(Err(e));
                }
                None => continue,
            }
        }
        None
    }

    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }

    /// Ends the stream at once, dropping any result not yet read.
    pub fn cancel(&mut self) {
        self.finished = true;
        self.handle.cancel();
    }
}

impl<T> Drop for LiveQuery<T> {
    fn drop(&mut self) {
        self.handle.cancel();
    }
}
