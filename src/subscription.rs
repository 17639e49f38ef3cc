//! Live queries kept current across commits.
//!
//! Every live query holds its own state lock. The initial delivery happens
//! while that lock is held, so a commit-triggered delivery for the same query
//! always comes after it. Unsubscribing takes the same lock, which makes it
//! wait for a delivery that is already running.
//!
//! A commit never waits for a query's lock. It queues its triples on the query
//! and marks it stale; whoever holds the lock recomputes before letting go, so
//! callbacks of different queries may commit from different threads.

use std::collections::{BTreeMap, BTreeSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, TryLockError, Weak};
use std::thread::{self, ThreadId};

use tracing::{debug, warn};

use crate::construct::{EntityId, Triple};
use crate::error::Result;
use crate::query::{self, FetchResult, QueryDescriptor};
use crate::store::{Commit, TripleSource, TripleStore};

pub type ResultCallback = Box<dyn FnMut(&FetchResult) + Send>;
pub type TripleCallback = Box<dyn FnMut(&[Triple]) + Send>;

enum Delivery {
    Results(ResultCallback),
    Triples(TripleCallback),
}

struct LiveState {
    delivery: Delivery,
    digest: Option<blake3::Hash>,
    window: BTreeSet<EntityId>,
}

struct LiveQuery {
    id: u64,
    query: QueryDescriptor,
    state: Mutex<LiveState>,
    cancelled: AtomicBool,
    // set while a callback of this query runs, so it can unsubscribe itself
    delivering: Mutex<Option<ThreadId>>,
    stale: AtomicBool,
    // committed triples not yet recomputed against
    pending: Mutex<Vec<Triple>>,
}

impl LiveQuery {
    fn queue(&self, triples: &[Triple]) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.extend_from_slice(triples);
        }
        self.stale.store(true, Ordering::SeqCst);
    }
    fn delivering_here(&self) -> bool {
        self.delivering
            .lock()
            .map(|d| *d == Some(thread::current().id()))
            .unwrap_or(false)
    }
}

// What a recomputation found, computed under the store read lock.
enum Outcome {
    Results(FetchResult, blake3::Hash, BTreeSet<EntityId>),
    Triples(Vec<Triple>, BTreeSet<EntityId>),
}

pub struct SubscriptionEngine {
    store: Arc<RwLock<TripleStore>>,
    next_id: AtomicU64,
    live: Mutex<BTreeMap<u64, Arc<LiveQuery>>>,
}

impl SubscriptionEngine {
    pub fn new(store: Arc<RwLock<TripleStore>>) -> Self {
        Self {
            store,
            next_id: AtomicU64::new(1),
            live: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.live.lock().map(|live| live.len()).unwrap_or(0)
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers a live query delivering full results.
    pub fn subscribe(self: &Arc<Self>, query: QueryDescriptor, callback: ResultCallback) -> Result<Subscription> {
        self.register(query, Delivery::Results(callback))
    }

    /// Registers a live query delivering raw triples of the entities in its window.
    pub fn subscribe_triples(self: &Arc<Self>, query: QueryDescriptor, callback: TripleCallback) -> Result<Subscription> {
        self.register(query, Delivery::Triples(callback))
    }

    fn register(self: &Arc<Self>, query: QueryDescriptor, delivery: Delivery) -> Result<Subscription> {
        // fails early on an invalid descriptor
        {
            let store = self.store.read()?;
            query::plan(&query, store.schema()?.as_ref())?;
        }
        let live = Arc::new(LiveQuery {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            query,
            state: Mutex::new(LiveState {
                delivery,
                digest: None,
                window: BTreeSet::new(),
            }),
            cancelled: AtomicBool::new(false),
            delivering: Mutex::new(None),
            stale: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
        });
        let mut state = live.state.lock()?;
        self.live.lock()?.insert(live.id, Arc::clone(&live));
        self.refresh(&live, &mut state, None)?;
        self.catch_up(&live, &mut state)?;
        drop(state);
        self.drain(&live);
        debug!(subscription = live.id, collection = %live.query.collection_name, "Subscribed");
        Ok(Subscription {
            query: live,
            engine: Arc::downgrade(self),
        })
    }

    /// Recomputes the live queries a commit may have affected.
    pub fn notify(&self, commit: &Commit, triples: &[Triple]) {
        let affected: Vec<Arc<LiveQuery>> = match self.live.lock() {
            Ok(live) => live
                .values()
                .filter(|q| commit.touches_metadata() || commit.collections.contains(&q.query.collection_name))
                .cloned()
                .collect(),
            Err(e) => {
                warn!(error = %e, "Subscription registry unavailable");
                return;
            }
        };
        for live in affected {
            if live.cancelled.load(Ordering::SeqCst) {
                continue;
            }
            live.queue(triples);
            self.drain(&live);
        }
    }

    // Leaves a locked query to its holder. The flag is checked again after
    // unlocking, since a commit may have failed to get the lock in between.
    fn drain(&self, live: &LiveQuery) {
        while live.stale.load(Ordering::SeqCst) && !live.cancelled.load(Ordering::SeqCst) {
            let mut state = match live.state.try_lock() {
                Ok(state) => state,
                Err(TryLockError::WouldBlock) => return,
                Err(TryLockError::Poisoned(_)) => {
                    warn!(subscription = live.id, "Subscription state poisoned");
                    return;
                }
            };
            if let Err(e) = self.catch_up(live, &mut state) {
                warn!(subscription = live.id, error = %e, "Live query could not be recomputed");
            }
        }
    }

    // Runs with the query's state lock held, until no commit is queued.
    fn catch_up(&self, live: &LiveQuery, state: &mut LiveState) -> Result<()> {
        while live.stale.swap(false, Ordering::SeqCst) && !live.cancelled.load(Ordering::SeqCst) {
            let queued = std::mem::take(&mut *live.pending.lock()?);
            self.refresh(live, state, Some(&queued))?;
        }
        Ok(())
    }

    fn evaluate(&self, live: &LiveQuery, state: &LiveState, committed: Option<&[Triple]>) -> Result<Outcome> {
        let store = self.store.read()?;
        let schema = store.schema()?;
        let plan = query::plan(&live.query, schema.as_ref())?;
        match &state.delivery {
            Delivery::Results(_) => {
                let result = query::execute(&plan, &*store)?;
                let digest = blake3::hash(&serde_json::to_vec(&(result.ids(), result.to_json()))?);
                let window: BTreeSet<EntityId> = result
                    .ids()
                    .into_iter()
                    .map(|id| EntityId::new(plan.collection.as_str(), id))
                    .collect::<Result<_>>()?;
                Ok(Outcome::Results(result, digest, window))
            }
            Delivery::Triples(_) => {
                let window: BTreeSet<EntityId> = query::window_ids(&plan, &*store)?.into_iter().collect();
                let triples = match committed {
                    Some(committed) => committed
                        .iter()
                        .filter(|t| window.contains(&t.entity) || state.window.contains(&t.entity))
                        .cloned()
                        .collect(),
                    None => window
                        .iter()
                        .flat_map(|id| store.triples(id))
                        .cloned()
                        .collect(),
                };
                Ok(Outcome::Triples(triples, window))
            }
        }
    }

    // Runs with the query's state lock held and the store lock released.
    fn refresh(&self, live: &LiveQuery, state: &mut LiveState, committed: Option<&[Triple]>) -> Result<()> {
        match self.evaluate(live, state, committed)? {
            Outcome::Results(result, digest, window) => {
                state.window = window;
                if state.digest != Some(digest) {
                    state.digest = Some(digest);
                    if let Delivery::Results(callback) = &mut state.delivery {
                        self.deliver(live, || callback(&result));
                    }
                }
            }
            Outcome::Triples(triples, window) => {
                state.window = window;
                // the initial delivery happens even when nothing matches
                if committed.is_none() || !triples.is_empty() {
                    if let Delivery::Triples(callback) = &mut state.delivery {
                        self.deliver(live, || callback(&triples));
                    }
                }
            }
        }
        Ok(())
    }

    fn deliver(&self, live: &LiveQuery, callback: impl FnOnce()) {
        if live.cancelled.load(Ordering::SeqCst) {
            return;
        }
        if let Ok(mut delivering) = live.delivering.lock() {
            *delivering = Some(thread::current().id());
        }
        if catch_unwind(AssertUnwindSafe(callback)).is_err() {
            warn!(subscription = live.id, "Subscriber callback panicked");
        }
        if let Ok(mut delivering) = live.delivering.lock() {
            *delivering = None;
        }
    }

    fn remove(&self, id: u64) {
        if let Ok(mut live) = self.live.lock() {
            live.remove(&id);
        }
    }
}

/// Handle to a live query. Dropping it leaves the query live; call
/// [`Subscription::unsubscribe`] to stop deliveries.
#[must_use = "the subscription stays live until unsubscribe is called"]
pub struct Subscription {
    query: Arc<LiveQuery>,
    engine: Weak<SubscriptionEngine>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.query.id
    }
    pub fn is_active(&self) -> bool {
        !self.query.cancelled.load(Ordering::SeqCst)
    }
    /// Stops deliveries. Returns after any delivery already running for this
    /// query has finished; no callback runs after that. Calling it again does nothing.
    pub fn unsubscribe(&self) {
        if self.query.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(engine) = self.engine.upgrade() {
            engine.remove(self.query.id);
        }
        // from inside its own callback the lock is already held further up the stack
        if !self.query.delivering_here() {
            drop(self.query.state.lock());
        }
        debug!(subscription = self.query.id, "Unsubscribed");
    }
}
