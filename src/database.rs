//! The database facade.
//!
//! A [`Database`] owns the triple store and wires the transaction manager,
//! schema engine and subscription engine around it. Clones share the same
//! store. Writers are serialized: one transaction runs at a time, while reads
//! only wait for the short moment a commit is being indexed.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value as Json;
use tracing::{debug, info, warn};

use crate::construct::{AttributePath, Clock, EntityId, METADATA_COLLECTION, Triple};
use crate::datatype::AttributeDefinition;
use crate::error::{Result, TriadError};
use crate::materialize::Entity;
use crate::persist::PersistenceMode;
use crate::query::{self, FetchResult, QueryDescriptor};
use crate::schema::{self, CollectionSchema, Migration, MigrationDirection, MigrationReport, Schema};
use crate::store::{Commit, CommitListener, InsertListener, ScanPrefix, TripleStore};
use crate::subscription::{Subscription, SubscriptionEngine};
use crate::transaction::{EntityUpdate, Patch, Transaction, TransactionResult, TransactionState};

static INSTANCES: AtomicU64 = AtomicU64::new(0);

fn generate_client_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let mut hasher = blake3::Hasher::new();
    hasher.update(&std::process::id().to_le_bytes());
    hasher.update(&nanos.to_le_bytes());
    hasher.update(&INSTANCES.fetch_add(1, Ordering::SeqCst).to_le_bytes());
    hasher.finalize().to_hex().as_str()[..12].to_owned()
}

#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    pub persistence: PersistenceMode,
    /// Origin component of every timestamp this instance writes; generated when absent.
    pub client_id: Option<String>,
    /// Written when the store holds no schema yet.
    pub schema: Option<Schema>,
    /// Applied upward from the current version when the database opens.
    pub migrations: Vec<Migration>,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            persistence: PersistenceMode::InMemory,
            client_id: None,
            schema: None,
            migrations: Vec::new(),
        }
    }
}

#[derive(Clone)]
pub struct Database {
    store: Arc<RwLock<TripleStore>>,
    writer: Arc<Mutex<()>>,
    clock: Arc<Mutex<Clock>>,
    subscriptions: Arc<SubscriptionEngine>,
}

impl Database {
    pub fn new(persistence: PersistenceMode) -> Result<Self> {
        Self::with_options(DatabaseOptions {
            persistence,
            ..DatabaseOptions::default()
        })
    }
    pub fn in_memory() -> Result<Self> {
        Self::new(PersistenceMode::InMemory)
    }
    pub fn with_options(options: DatabaseOptions) -> Result<Self> {
        let store = TripleStore::open(options.persistence.open()?)?;
        let mut clock = Clock::new(options.client_id.unwrap_or_else(generate_client_id));
        if let Some(latest) = store.latest_timestamp() {
            clock.observe(latest);
        }
        let store = Arc::new(RwLock::new(store));
        let database = Self {
            subscriptions: Arc::new(SubscriptionEngine::new(Arc::clone(&store))),
            store,
            writer: Arc::new(Mutex::new(())),
            clock: Arc::new(Mutex::new(clock)),
        };
        if let Some(initial) = options.schema {
            if database.store.read()?.read_schema()?.is_none() {
                database.transact(|tx| tx.write_schema(&initial))?;
            }
        }
        if !options.migrations.is_empty() {
            database.migrate(&options.migrations, MigrationDirection::Up)?;
        }
        info!(
            client = %database.get_client_id()?,
            version = database.schema_version()?,
            "Opened database"
        );
        Ok(database)
    }

    // ------------- Transactions -------------
    /// Runs `callback` inside a transaction. The staged writes commit when the
    /// callback returns `Ok` without cancelling; an `Err` rolls them back and is
    /// returned. Calling `transact` again from inside the callback deadlocks.
    pub fn transact<T, F>(&self, callback: F) -> Result<TransactionResult<T>>
    where
        F: FnOnce(&mut Transaction) -> Result<T>,
    {
        let writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let timestamp = self.clock.lock()?.tick();
        let mut tx = Transaction::open(&self.store, timestamp);
        let output = match callback(&mut tx) {
            Ok(output) => output,
            Err(e) => {
                tx.mark(TransactionState::Failed);
                warn!(timestamp = %tx.timestamp(), error = %e, "Transaction rolled back");
                return Err(e);
            }
        };
        match tx.state() {
            TransactionState::Cancelled => {
                debug!(timestamp = %tx.timestamp(), "Transaction cancelled");
                return Ok(TransactionResult {
                    output,
                    state: TransactionState::Cancelled,
                });
            }
            TransactionState::Failed => return Err(TriadError::IllegalCommit),
            _ => (),
        }
        let triples = tx.take_staged();
        let (insert_listeners, commit_listeners) = {
            let mut store = self.store.write()?;
            if let Err(e) = store.insert(triples.clone()) {
                tx.mark(TransactionState::Failed);
                warn!(timestamp = %tx.timestamp(), error = %e, "Commit rejected");
                return Err(e);
            }
            (store.insert_listeners(), store.commit_listeners())
        };
        tx.mark(TransactionState::Committed);
        debug!(timestamp = %tx.timestamp(), triples = triples.len(), "Committed transaction");
        drop(tx);
        drop(writer);
        if !triples.is_empty() {
            self.publish(&triples, &insert_listeners, &commit_listeners);
        }
        Ok(TransactionResult {
            output,
            state: TransactionState::Committed,
        })
    }

    fn publish(&self, triples: &[Triple], inserted: &[InsertListener], committed: &[CommitListener]) {
        let commit = Commit::of(triples);
        for listener in inserted {
            if catch_unwind(AssertUnwindSafe(|| listener(triples))).is_err() {
                warn!("Insert listener panicked");
            }
        }
        for listener in committed {
            if catch_unwind(AssertUnwindSafe(|| listener(&commit))).is_err() {
                warn!("Commit listener panicked");
            }
        }
        self.subscriptions.notify(&commit, triples);
    }

    // ------------- Reads -------------
    /// Reads committed state only.
    pub fn fetch(&self, query: &QueryDescriptor) -> Result<FetchResult> {
        let store = self.store.read()?;
        query::fetch(&*store, query)
    }
    pub fn fetch_one(&self, query: &QueryDescriptor) -> Result<Option<Entity>> {
        let mut query = query.clone();
        query.limit = Some(1);
        Ok(self.fetch(&query)?.into_entities().into_iter().next())
    }
    pub fn fetch_by_id(&self, collection: &str, id: &str) -> Result<Option<Entity>> {
        let mut query = QueryDescriptor::new(collection);
        query.entity_id = Some(id.to_owned());
        self.fetch_one(&query)
    }
    /// The raw triples of the entities a query matches.
    pub fn query_triples(&self, query: &QueryDescriptor) -> Result<Vec<Triple>> {
        let store = self.store.read()?;
        query::fetch_triples(&*store, query)
    }
    pub fn scan(&self, prefix: &ScanPrefix) -> Result<Vec<Triple>> {
        Ok(self.store.read()?.scan(prefix))
    }

    // ------------- One-shot writes -------------
    pub fn insert(&self, collection: &str, document: Json) -> Result<String> {
        Ok(self.transact(|tx| tx.insert(collection, document))?.output)
    }
    pub fn insert_with_id(&self, collection: &str, id: &str, document: Json) -> Result<String> {
        Ok(self.transact(|tx| tx.insert_with_id(collection, id, document))?.output)
    }
    /// Inserts every document in one transaction, returning the ids per collection.
    pub fn bulk_insert(&self, documents: BTreeMap<String, Vec<Json>>) -> Result<BTreeMap<String, Vec<String>>> {
        let result = self.transact(|tx| {
            let mut ids = BTreeMap::new();
            for (collection, documents) in documents {
                let inserted = documents
                    .into_iter()
                    .map(|document| tx.insert(&collection, document))
                    .collect::<Result<Vec<_>>>()?;
                ids.insert(collection, inserted);
            }
            Ok(ids)
        })?;
        Ok(result.output)
    }
    pub fn update<F>(&self, collection: &str, id: &str, updater: F) -> Result<()>
    where
        F: FnOnce(&mut EntityUpdate) -> Result<()>,
    {
        self.transact(|tx| tx.update(collection, id, updater))?;
        Ok(())
    }
    pub fn apply(&self, collection: &str, id: &str, patches: &[Patch]) -> Result<()> {
        self.transact(|tx| tx.apply(collection, id, patches))?;
        Ok(())
    }
    pub fn delete(&self, collection: &str, id: &str) -> Result<()> {
        self.transact(|tx| tx.delete(collection, id))?;
        Ok(())
    }
    /// Tombstones the live facts under each `(entity, path)` pair in one commit.
    pub fn delete_attributes(&self, pairs: &[(EntityId, AttributePath)]) -> Result<()> {
        self.transact(|tx| tx.delete_attributes(pairs))?;
        Ok(())
    }

    // ------------- Live queries -------------
    pub fn subscribe<F>(&self, query: QueryDescriptor, callback: F) -> Result<Subscription>
    where
        F: FnMut(&FetchResult) + Send + 'static,
    {
        self.subscriptions.subscribe(query, Box::new(callback))
    }
    pub fn subscribe_triples<F>(&self, query: QueryDescriptor, callback: F) -> Result<Subscription>
    where
        F: FnMut(&[Triple]) + Send + 'static,
    {
        self.subscriptions.subscribe_triples(query, Box::new(callback))
    }
    pub fn on_insert<F>(&self, listener: F) -> Result<()>
    where
        F: Fn(&[Triple]) + Send + Sync + 'static,
    {
        self.store.write()?.on_insert(Arc::new(listener));
        Ok(())
    }
    pub fn on_commit<F>(&self, listener: F) -> Result<()>
    where
        F: Fn(&Commit) + Send + Sync + 'static,
    {
        self.store.write()?.on_commit(Arc::new(listener));
        Ok(())
    }

    // ------------- Schema -------------
    pub fn create_collection(&self, collection: CollectionSchema) -> Result<()> {
        self.transact(|tx| tx.create_collection(collection))?;
        Ok(())
    }
    pub fn drop_collection(&self, name: &str) -> Result<()> {
        self.transact(|tx| tx.drop_collection(name))?;
        Ok(())
    }
    pub fn add_attribute(&self, collection: &str, path: &str, definition: AttributeDefinition) -> Result<()> {
        self.transact(|tx| tx.add_attribute(collection, &AttributePath::parse(path), definition))?;
        Ok(())
    }
    pub fn drop_attribute(&self, collection: &str, path: &str) -> Result<()> {
        self.transact(|tx| tx.drop_attribute(collection, &AttributePath::parse(path)))?;
        Ok(())
    }
    pub fn rename_attribute(&self, collection: &str, path: &str, new_path: &str) -> Result<()> {
        self.transact(|tx| {
            tx.rename_attribute(collection, &AttributePath::parse(path), &AttributePath::parse(new_path))
        })?;
        Ok(())
    }
    /// A failing migration is rolled back and reported, not returned as an error.
    pub fn migrate(&self, migrations: &[Migration], direction: MigrationDirection) -> Result<MigrationReport> {
        schema::migrate(self, migrations, direction)
    }
    /// The committed schema, empty at version 0 when none was written.
    pub fn get_schema(&self) -> Result<Schema> {
        Ok(self.store.read()?.read_schema()?.unwrap_or_default())
    }
    pub fn schema_version(&self) -> Result<u64> {
        Ok(self.get_schema()?.version)
    }

    // ------------- Maintenance -------------
    pub fn get_client_id(&self) -> Result<String> {
        Ok(self.clock.lock()?.client().to_owned())
    }
    /// Live entity count per collection.
    pub fn collection_stats(&self) -> Result<BTreeMap<String, u64>> {
        Ok(self.store.read()?.collection_stats())
    }
    pub fn triple_count(&self) -> Result<usize> {
        Ok(self.store.read()?.triple_count())
    }
    /// Removes every triple, schema metadata included. Live queries are recomputed.
    pub fn clear(&self) -> Result<()> {
        let writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        self.store.write()?.clear()?;
        drop(writer);
        let commit = Commit {
            timestamp: None,
            collections: [METADATA_COLLECTION.to_owned()].into(),
            triples: 0,
        };
        self.subscriptions.notify(&commit, &[]);
        Ok(())
    }
}
