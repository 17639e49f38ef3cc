// used to keep the one-to-one mapping between entity ids and their numeric keys
use bimap::BiMap;
// filter results are kept as bitmaps of entity keys
use roaring::RoaringTreemap;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::construct::{
    AttributePath, EntityId, EntityKey, FactKey, KeyGenerator, KeyHasher,
    METADATA_COLLECTION, OtherHasher, SCHEMA_ENTITY, Timestamp, Triple, TripleValue, winners,
};
use crate::datatype::Value;
use crate::error::{Result, TriadError};
use crate::materialize::materialize;
use crate::persist::Storage;
use crate::query::{Filter, Operator, Predicate};
use crate::schema::Schema;

/// The `(path, value)` pairs one entity contributes to the value index.
type IndexEntries = BTreeSet<(AttributePath, Value)>;

pub type InsertListener = Arc<dyn Fn(&[Triple]) + Send + Sync>;
pub type CommitListener = Arc<dyn Fn(&Commit) + Send + Sync>;

/// Summary handed to commit listeners after a batch has landed.
#[derive(Debug, Clone)]
pub struct Commit {
    pub timestamp: Option<Timestamp>,
    pub collections: BTreeSet<String>,
    pub triples: usize,
}

impl Commit {
    pub fn of(triples: &[Triple]) -> Self {
        Self {
            timestamp: triples.iter().map(|t| &t.timestamp).max().cloned(),
            collections: triples
                .iter()
                .map(|t| t.entity.collection().to_owned())
                .collect(),
            triples: triples.len(),
        }
    }
    pub fn touches_metadata(&self) -> bool {
        self.collections.contains(METADATA_COLLECTION)
    }
}

pub enum ScanPrefix<'a> {
    Entity(&'a EntityId),
    Collection(&'a str),
    Attribute {
        collection: &'a str,
        path: &'a AttributePath,
    },
}

pub fn schema_entity() -> EntityId {
    EntityId::reserved(METADATA_COLLECTION, SCHEMA_ENTITY)
}

/// Staged writes of a transaction, one per fact.
pub type Staged = BTreeMap<EntityId, BTreeMap<FactKey, Triple>>;

/// Checks that after applying `incoming` no live path of the entity is both a
/// value and a prefix of another path, and no path mixes values with set elements.
pub fn validate_entity<'a, E, I>(existing: E, incoming: I) -> Result<()>
where
    E: IntoIterator<Item = &'a Triple>,
    I: IntoIterator<Item = &'a Triple>,
{
    let mut won: BTreeMap<FactKey, &Triple> = winners(existing);
    // incoming writes win ties, a transaction restages under one timestamp
    for triple in incoming {
        let key = triple.fact_key();
        let winner = match won.get(&key) {
            Some(current) if current.timestamp > triple.timestamp => *current,
            _ => triple,
        };
        won.insert(key, winner);
    }
    let mut paths: BTreeMap<&AttributePath, bool> = BTreeMap::new();
    for triple in won.values().filter(|t| t.value.is_live()) {
        let element = triple.value.is_element();
        if let Some(previous) = paths.insert(&triple.attribute, element) {
            if previous != element {
                return Err(TriadError::Validation(format!(
                    "attribute '{}' holds both a value and set elements",
                    triple.attribute
                )));
            }
        }
    }
    // sorted paths place every extension of a path right after it
    let sorted: Vec<&AttributePath> = paths.into_keys().collect();
    for pair in sorted.windows(2) {
        if pair[0].is_strict_prefix_of(pair[1]) {
            return Err(TriadError::NonTerminalPath {
                path: pair[0].dotted(),
            });
        }
    }
    Ok(())
}

/// The write that retracts a live fact: a tombstone, or an absent set element.
pub fn retraction(triple: &Triple, timestamp: &Timestamp) -> Triple {
    let value = match &triple.value {
        TripleValue::Element { element, .. } => TripleValue::Element {
            element: element.clone(),
            present: false,
        },
        _ => TripleValue::Tombstone,
    };
    Triple::new(triple.entity.clone(), triple.attribute.clone(), value, timestamp.clone())
}

/// Retractions for every live fact of an entity at or below `path`.
pub fn tombstones<'a, I>(triples: I, path: &AttributePath, timestamp: &Timestamp) -> Vec<Triple>
where
    I: IntoIterator<Item = &'a Triple>,
{
    winners(triples)
        .into_values()
        .filter(|t| t.value.is_live() && path.covers(&t.attribute))
        .map(|t| retraction(t, timestamp))
        .collect()
}

// ------------- Read access -------------
/// What the query engine, materializer and transactions read from.
pub trait TripleSource {
    /// Every triple recorded for one entity.
    fn triples(&self, entity: &EntityId) -> Vec<&Triple>;
    /// Entities of a collection that may be alive.
    fn entities(&self, collection: &str) -> Vec<EntityId>;
    /// A superset of the entities matching `filter`, `None` when the
    /// indexes cannot narrow it down.
    fn candidates(&self, collection: &str, filter: &Filter) -> Option<BTreeSet<EntityId>>;
    /// Whether some live fact in the collection lies strictly below `path`.
    fn non_terminal(&self, collection: &str, path: &AttributePath) -> bool;

    fn schema(&self) -> Result<Option<Schema>> {
        let entity = schema_entity();
        match materialize(&entity, self.triples(&entity), None)? {
            Some(metadata) => Schema::decode(&metadata).map(Some),
            None => Ok(None),
        }
    }
}

// ------------- Triple store -------------
pub struct TripleStore {
    keys: KeyGenerator,
    identities: BiMap<EntityId, EntityKey>,
    log: HashMap<EntityKey, Vec<Triple>, KeyHasher>,
    facts: HashMap<EntityKey, BTreeMap<FactKey, Triple>, KeyHasher>,
    collections: HashMap<String, RoaringTreemap, OtherHasher>,
    alive: RoaringTreemap,
    values: BTreeMap<(String, AttributePath, Value), RoaringTreemap>,
    latest: Option<Timestamp>,
    count: usize,
    storage: Mutex<Box<dyn Storage>>,
    insert_listeners: Vec<InsertListener>,
    commit_listeners: Vec<CommitListener>,
}

impl TripleStore {
    pub fn new(storage: Box<dyn Storage>) -> Self {
        Self {
            keys: KeyGenerator::new(),
            identities: BiMap::new(),
            log: HashMap::default(),
            facts: HashMap::default(),
            collections: HashMap::default(),
            alive: RoaringTreemap::new(),
            values: BTreeMap::new(),
            latest: None,
            count: 0,
            storage: Mutex::new(storage),
            insert_listeners: Vec::new(),
            commit_listeners: Vec::new(),
        }
    }
    /// Creates a store and rebuilds its indexes from everything the backend holds.
    pub fn open(storage: Box<dyn Storage>) -> Result<Self> {
        let mut store = Self::new(storage);
        let restored = store.storage.lock()?.load()?;
        let restored_count = restored.len();
        let mut touched = BTreeMap::new();
        for triple in restored {
            touched.insert(store.index(triple), IndexEntries::new());
        }
        store.refresh(touched);
        if restored_count > 0 {
            info!(
                triples = restored_count,
                entities = store.identities.len(),
                "Restored triple store"
            );
        }
        Ok(store)
    }
    pub fn latest_timestamp(&self) -> Option<&Timestamp> {
        self.latest.as_ref()
    }
    pub fn triple_count(&self) -> usize {
        self.count
    }
    pub fn on_insert(&mut self, listener: InsertListener) {
        self.insert_listeners.push(listener);
    }
    pub fn on_commit(&mut self, listener: CommitListener) {
        self.commit_listeners.push(listener);
    }
    pub fn insert_listeners(&self) -> Vec<InsertListener> {
        self.insert_listeners.clone()
    }
    pub fn commit_listeners(&self) -> Vec<CommitListener> {
        self.commit_listeners.clone()
    }

    /// Validates, persists and indexes a batch. Nothing is indexed unless the
    /// whole batch was accepted by the backend.
    pub fn insert(&mut self, triples: Vec<Triple>) -> Result<()> {
        if triples.is_empty() {
            return Ok(());
        }
        let mut by_entity: BTreeMap<&EntityId, Vec<&Triple>> = BTreeMap::new();
        for triple in &triples {
            by_entity.entry(&triple.entity).or_default().push(triple);
        }
        for (entity, incoming) in &by_entity {
            let existing = self
                .identities
                .get_by_left(*entity)
                .and_then(|key| self.facts.get(key))
                .into_iter()
                .flat_map(|facts| facts.values());
            validate_entity(existing, incoming.iter().copied())?;
        }
        let mut touched: BTreeMap<EntityKey, IndexEntries> = by_entity
            .keys()
            .filter_map(|entity| self.identities.get_by_left(*entity).copied())
            .map(|key| (key, self.value_entries(key)))
            .collect();
        self.storage.lock()?.append(&triples)?;
        let count = triples.len();
        for triple in triples {
            touched.entry(self.index(triple)).or_default();
        }
        self.refresh(touched);
        debug!(triples = count, "Inserted triples");
        Ok(())
    }

    pub fn scan(&self, prefix: &ScanPrefix) -> Vec<Triple> {
        match prefix {
            ScanPrefix::Entity(entity) => self.triples(entity).into_iter().cloned().collect(),
            ScanPrefix::Collection(collection) => self
                .keys_of(collection)
                .iter()
                .filter_map(|key| self.log.get(&key))
                .flatten()
                .cloned()
                .collect(),
            ScanPrefix::Attribute { collection, path } => self
                .keys_of(collection)
                .iter()
                .filter_map(|key| self.log.get(&key))
                .flatten()
                .filter(|t| path.covers(&t.attribute))
                .cloned()
                .collect(),
        }
    }

    pub fn read_schema(&self) -> Result<Option<Schema>> {
        self.schema()
    }

    /// Live entity count per collection, internal collections excluded.
    pub fn collection_stats(&self) -> BTreeMap<String, u64> {
        self.collections
            .iter()
            .filter(|(name, _)| name.as_str() != METADATA_COLLECTION)
            .map(|(name, keys)| (name.clone(), (keys & &self.alive).len()))
            .filter(|(_, count)| *count > 0)
            .collect()
    }

    /// Drops every triple, in memory and in the backend. Listeners stay registered.
    pub fn clear(&mut self) -> Result<()> {
        self.storage.lock()?.clear()?;
        self.keys = KeyGenerator::new();
        self.identities.clear();
        self.log.clear();
        self.facts.clear();
        self.collections.clear();
        self.alive.clear();
        self.values.clear();
        self.latest = None;
        self.count = 0;
        info!("Cleared triple store");
        Ok(())
    }

    fn key_for(&mut self, entity: &EntityId) -> EntityKey {
        if let Some(key) = self.identities.get_by_left(entity) {
            return *key;
        }
        let key = self.keys.generate();
        self.identities.insert(entity.clone(), key);
        self.collections
            .entry(entity.collection().to_owned())
            .or_default()
            .insert(key);
        key
    }

    fn keys_of(&self, collection: &str) -> RoaringTreemap {
        self.collections
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Records a triple and lets it replace the current fact if it is newer.
    /// The value index is brought up to date by [`TripleStore::refresh`].
    fn index(&mut self, triple: Triple) -> EntityKey {
        let key = self.key_for(&triple.entity);
        let fact_key = triple.fact_key();
        if self.latest.as_ref().is_none_or(|l| triple.timestamp > *l) {
            self.latest = Some(triple.timestamp.clone());
        }
        let facts = self.facts.entry(key).or_default();
        let wins = facts
            .get(&fact_key)
            .is_none_or(|current| triple.timestamp > current.timestamp);
        if wins {
            facts.insert(fact_key, triple.clone());
        }
        self.log.entry(key).or_default().push(triple);
        self.count += 1;
        key
    }

    fn value_entries(&self, key: EntityKey) -> IndexEntries {
        self.facts
            .get(&key)
            .into_iter()
            .flat_map(|facts| facts.values())
            .filter_map(|t| indexed_value(&t.value).map(|v| (t.attribute.clone(), v.clone())))
            .collect()
    }

    /// Recomputes the index entries and liveness of every touched entity from
    /// its winning facts, given the entries it had before the batch. Two facts
    /// may share an entry (a value and a set element under one path), so
    /// entries are diffed per entity instead of per fact.
    fn refresh(&mut self, touched: BTreeMap<EntityKey, IndexEntries>) {
        for (key, before) in touched {
            let Some(collection) = self
                .identities
                .get_by_right(&key)
                .map(|entity| entity.collection().to_owned())
            else {
                continue;
            };
            let after = self.value_entries(key);
            for (path, value) in before.difference(&after) {
                let entry = (collection.clone(), path.clone(), value.clone());
                if let Some(keys) = self.values.get_mut(&entry) {
                    keys.remove(key);
                    if keys.is_empty() {
                        self.values.remove(&entry);
                    }
                }
            }
            for (path, value) in after.difference(&before) {
                self.values
                    .entry((collection.clone(), path.clone(), value.clone()))
                    .or_default()
                    .insert(key);
            }
            let live = self
                .facts
                .get(&key)
                .is_some_and(|facts| facts.values().any(|t| t.value.is_live()));
            if live {
                self.alive.insert(key);
            } else {
                self.alive.remove(key);
            }
        }
    }

    fn predicate_keys(&self, collection: &str, predicate: &Predicate) -> Option<RoaringTreemap> {
        if predicate.value.is_null() {
            return None;
        }
        match predicate.operator {
            Operator::Ne => None,
            Operator::Eq => Some(
                self.values
                    .get(&(collection.to_owned(), predicate.path.clone(), predicate.value.clone()))
                    .cloned()
                    .unwrap_or_default(),
            ),
            _ => {
                let mut keys = RoaringTreemap::new();
                let start = (collection.to_owned(), predicate.path.clone(), Value::Null);
                for ((c, p, value), matching) in self.values.range((Bound::Included(start), Bound::Unbounded)) {
                    if c != collection || *p != predicate.path {
                        break;
                    }
                    if predicate.test(value) {
                        keys |= matching;
                    }
                }
                Some(keys)
            }
        }
    }

    fn filter_keys(&self, collection: &str, filter: &Filter) -> Option<RoaringTreemap> {
        match filter {
            Filter::Predicate(predicate) => self.predicate_keys(collection, predicate),
            Filter::And(children) => {
                let mut result: Option<RoaringTreemap> = None;
                for child in children {
                    if let Some(keys) = self.filter_keys(collection, child) {
                        result = Some(match result {
                            Some(acc) => acc & keys,
                            None => keys,
                        });
                    }
                }
                result
            }
            Filter::Or(children) => {
                let mut result = RoaringTreemap::new();
                for child in children {
                    result |= self.filter_keys(collection, child)?;
                }
                Some(result)
            }
        }
    }

    fn ids(&self, keys: &RoaringTreemap) -> Vec<EntityId> {
        keys.iter()
            .filter_map(|key| self.identities.get_by_right(&key).cloned())
            .collect()
    }
}

fn indexed_value(value: &TripleValue) -> Option<&Value> {
    match value {
        TripleValue::Value(v) => Some(v),
        TripleValue::Element { element, present: true } => Some(element),
        _ => None,
    }
}

impl TripleSource for TripleStore {
    fn triples(&self, entity: &EntityId) -> Vec<&Triple> {
        self.identities
            .get_by_left(entity)
            .and_then(|key| self.log.get(key))
            .map(|log| log.iter().collect())
            .unwrap_or_default()
    }
    fn entities(&self, collection: &str) -> Vec<EntityId> {
        self.ids(&(self.keys_of(collection) & &self.alive))
    }
    fn candidates(&self, collection: &str, filter: &Filter) -> Option<BTreeSet<EntityId>> {
        let keys = self.filter_keys(collection, filter)?;
        let keys = keys & &self.alive & self.keys_of(collection);
        Some(self.ids(&keys).into_iter().collect())
    }
    fn non_terminal(&self, collection: &str, path: &AttributePath) -> bool {
        // sorted order puts every extension of `path` right after this bound
        let start = (collection.to_owned(), path.child(""), Value::Null);
        self.values
            .range((Bound::Included(start), Bound::Unbounded))
            .next()
            .is_some_and(|((c, p, _), _)| c == collection && path.is_strict_prefix_of(p))
    }
}

// ------------- Transaction overlay -------------
/// Staged triples layered over the committed store.
pub struct Overlay<'a> {
    pub base: &'a TripleStore,
    pub staged: &'a Staged,
}

impl TripleSource for Overlay<'_> {
    fn triples(&self, entity: &EntityId) -> Vec<&Triple> {
        let mut triples = self.base.triples(entity);
        if let Some(staged) = self.staged.get(entity) {
            triples.extend(staged.values());
        }
        triples
    }
    fn entities(&self, collection: &str) -> Vec<EntityId> {
        let mut entities: BTreeSet<EntityId> = self.base.entities(collection).into_iter().collect();
        entities.extend(self.staged_in(collection));
        entities.into_iter().collect()
    }
    fn candidates(&self, collection: &str, filter: &Filter) -> Option<BTreeSet<EntityId>> {
        let mut candidates = self.base.candidates(collection, filter)?;
        candidates.extend(self.staged_in(collection));
        Some(candidates)
    }
    fn non_terminal(&self, collection: &str, path: &AttributePath) -> bool {
        self.base.non_terminal(collection, path)
            || self
                .staged
                .iter()
                .filter(|(entity, _)| entity.collection() == collection)
                .flat_map(|(_, triples)| triples.values())
                .any(|t| t.value.is_live() && path.is_strict_prefix_of(&t.attribute))
    }
}

impl Overlay<'_> {
    fn staged_in<'s>(&'s self, collection: &'s str) -> impl Iterator<Item = EntityId> + 's {
        self.staged
            .keys()
            .filter(move |entity| entity.collection() == collection)
            .cloned()
    }
}
