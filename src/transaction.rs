use std::collections::BTreeMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::debug;

use crate::construct::{
    AttributePath, COLLECTION_ATTRIBUTE, EntityId, FactKey, ID_ATTRIBUTE, Leaf, Timestamp, Triple,
    TripleValue, winners,
};
use crate::datatype::{AttributeType, Value, serialize_untyped};
use crate::error::{Result, TriadError};
use crate::materialize::Entity;
use crate::query::{self, FetchResult, QueryDescriptor};
use crate::schema::CollectionSchema;
use crate::store::{Overlay, Staged, TripleSource, TripleStore, retraction, tombstones, validate_entity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionState {
    Open,
    Committed,
    Cancelled,
    Failed,
}

#[derive(Debug)]
pub struct TransactionResult<T> {
    pub output: T,
    pub state: TransactionState,
}

impl<T> TransactionResult<T> {
    pub fn is_committed(&self) -> bool {
        self.state == TransactionState::Committed
    }
}

// ------------- Write batches -------------
/// One change to an entity: `["set", path, value]`, `["delete", path]`,
/// `["add", path, element]` or `["remove", path, element]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Json>", into = "Vec<Json>")]
pub enum Patch {
    Set(AttributePath, Json),
    Delete(AttributePath),
    Add(AttributePath, Value),
    Remove(AttributePath, Value),
}

fn patch_path(json: Option<&Json>) -> std::result::Result<AttributePath, String> {
    match json {
        Some(Json::String(dotted)) => Ok(AttributePath::parse(dotted)),
        Some(Json::Array(segments)) => segments
            .iter()
            .map(|s| s.as_str().map(str::to_owned).ok_or("path segments must be strings"))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map(AttributePath::new)
            .map_err(str::to_owned),
        _ => Err("patch needs an attribute path".to_owned()),
    }
}

fn patch_element(json: Option<&Json>) -> std::result::Result<Value, String> {
    json.and_then(Value::from_json)
        .ok_or_else(|| "set elements must be scalars".to_owned())
}

impl TryFrom<Vec<Json>> for Patch {
    type Error = String;
    fn try_from(parts: Vec<Json>) -> std::result::Result<Self, Self::Error> {
        let path = patch_path(parts.get(1))?;
        match parts.first().and_then(Json::as_str) {
            Some("set") => Ok(Patch::Set(path, parts.get(2).cloned().unwrap_or(Json::Null))),
            Some("delete") => Ok(Patch::Delete(path)),
            Some("add") => Ok(Patch::Add(path, patch_element(parts.get(2))?)),
            Some("remove") => Ok(Patch::Remove(path, patch_element(parts.get(2))?)),
            Some(other) => Err(format!("unknown patch '{}'", other)),
            None => Err("patch needs a name".to_owned()),
        }
    }
}

impl From<Patch> for Vec<Json> {
    fn from(patch: Patch) -> Self {
        let path = |p: AttributePath| Json::Array(p.segments().iter().cloned().map(Json::String).collect());
        match patch {
            Patch::Set(p, value) => vec![Json::from("set"), path(p), value],
            Patch::Delete(p) => vec![Json::from("delete"), path(p)],
            Patch::Add(p, element) => vec![Json::from("add"), path(p), element.to_json()],
            Patch::Remove(p, element) => vec![Json::from("remove"), path(p), element.to_json()],
        }
    }
}

/// Records the changes an updater makes to an entity.
#[derive(Debug)]
pub struct EntityUpdate<'e> {
    current: &'e Entity,
    patches: Vec<Patch>,
}

impl<'e> EntityUpdate<'e> {
    pub fn new(current: &'e Entity) -> Self {
        Self {
            current,
            patches: Vec::new(),
        }
    }
    /// The entity as it was before this update.
    pub fn current(&self) -> &Entity {
        self.current
    }
    pub fn set(&mut self, path: &str, value: impl Into<Json>) -> &mut Self {
        self.patches.push(Patch::Set(AttributePath::parse(path), value.into()));
        self
    }
    pub fn delete(&mut self, path: &str) -> &mut Self {
        self.patches.push(Patch::Delete(AttributePath::parse(path)));
        self
    }
    pub fn add(&mut self, path: &str, element: impl Into<Value>) -> &mut Self {
        self.patches.push(Patch::Add(AttributePath::parse(path), element.into()));
        self
    }
    pub fn remove(&mut self, path: &str, element: impl Into<Value>) -> &mut Self {
        self.patches.push(Patch::Remove(AttributePath::parse(path), element.into()));
        self
    }
    pub fn patches(&self) -> &[Patch] {
        &self.patches
    }
    pub fn into_patches(self) -> Vec<Patch> {
        self.patches
    }
}

// ------------- Transaction -------------
/// Writes staged against the committed store under one timestamp.
///
/// Reads through the transaction see its own staged writes. Nothing reaches
/// the store unless the surrounding `transact` call commits; dropping the
/// transaction in any other state discards the staged writes.
pub struct Transaction<'db> {
    store: &'db RwLock<TripleStore>,
    timestamp: Timestamp,
    staged: Staged,
    state: TransactionState,
    generated: u64,
}

impl<'db> Transaction<'db> {
    pub(crate) fn open(store: &'db RwLock<TripleStore>, timestamp: Timestamp) -> Self {
        Self {
            store,
            timestamp,
            staged: BTreeMap::new(),
            state: TransactionState::Open,
            generated: 0,
        }
    }
    pub fn state(&self) -> TransactionState {
        self.state
    }
    pub fn timestamp(&self) -> &Timestamp {
        &self.timestamp
    }
    pub(crate) fn mark(&mut self, state: TransactionState) {
        self.state = state;
    }
    pub(crate) fn take_staged(&mut self) -> Vec<Triple> {
        std::mem::take(&mut self.staged)
            .into_values()
            .flat_map(BTreeMap::into_values)
            .collect()
    }
    pub(crate) fn read<T>(&self, reader: impl FnOnce(&Overlay) -> Result<T>) -> Result<T> {
        let base = self.store.read()?;
        let overlay = Overlay {
            base: &base,
            staged: &self.staged,
        };
        reader(&overlay)
    }
    fn ensure_open(&self) -> Result<()> {
        match self.state {
            TransactionState::Open => Ok(()),
            state => Err(TriadError::Execution(format!(
                "transaction is {:?}, no further writes are accepted",
                state
            ))),
        }
    }

    // ------------- Reads -------------
    pub fn fetch(&self, query: &QueryDescriptor) -> Result<FetchResult> {
        self.read(|source| query::fetch(source, query))
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
    fn collection_schema(&self, collection: &str) -> Result<Option<CollectionSchema>> {
        Ok(self
            .read(|source| source.schema())?
            .and_then(|schema| schema.collection(collection).cloned()))
    }

    // ------------- Writes -------------
    /// Inserts a document, taking its id from its `id` attribute or generating one.
    pub fn insert(&mut self, collection: &str, document: Json) -> Result<String> {
        let id = match document.get(ID_ATTRIBUTE) {
            Some(Json::String(id)) => id.clone(),
            Some(Json::Number(n)) => n.to_string(),
            _ => self.generate_id(),
        };
        self.insert_with_id(collection, &id, document)
    }

    /// Inserts a document under an explicit id, replacing any live entity with that id.
    pub fn insert_with_id(&mut self, collection: &str, id: &str, document: Json) -> Result<String> {
        self.ensure_open()?;
        let entity = EntityId::new(collection, id)?;
        let Json::Object(mut fields) = document else {
            return Err(TriadError::Validation(format!(
                "documents must be objects, found {}",
                document
            )));
        };
        let schema = self.collection_schema(collection)?;
        if let Some(id) = fields.get(ID_ATTRIBUTE) {
            if !(id.is_string() || id.is_number()) {
                return Err(TriadError::Validation(format!("id must be a string or number, found {}", id)));
            }
        } else {
            let declared_number = schema
                .as_ref()
                .and_then(|s| s.attributes.get(ID_ATTRIBUTE))
                .is_some_and(|d| d.kind == AttributeType::Number);
            let id_value = match entity.id().parse::<f64>() {
                Ok(n) if declared_number => Value::from(n).to_json(),
                _ => Json::String(entity.id().to_owned()),
            };
            fields.insert(ID_ATTRIBUTE.to_owned(), id_value);
        }
        let mut leaves: Vec<Leaf> = vec![(
            AttributePath::new([COLLECTION_ATTRIBUTE]),
            TripleValue::Value(Value::from(collection)),
        )];
        match &schema {
            Some(schema) => {
                for (name, definition) in &schema.attributes {
                    if let (false, Some(default)) = (fields.contains_key(name), &definition.default) {
                        fields.insert(name.clone(), default.to_json());
                    }
                }
                for (name, value) in &fields {
                    let path = AttributePath::new([name.as_str()]);
                    match schema.attribute_type(&path)? {
                        Some(kind) => kind.serialize(&path, value, &mut leaves)?,
                        None => serialize_untyped(&path, value, &mut leaves)?,
                    }
                }
            }
            None => {
                for (name, value) in &fields {
                    serialize_untyped(&AttributePath::new([name.as_str()]), value, &mut leaves)?;
                }
            }
        }
        self.replace(&entity, &AttributePath::root(), leaves)?;
        Ok(entity.id().to_owned())
    }

    /// Applies the changes an updater records against the current entity.
    pub fn update<F>(&mut self, collection: &str, id: &str, updater: F) -> Result<()>
    where
        F: FnOnce(&mut EntityUpdate) -> Result<()>,
    {
        self.ensure_open()?;
        let current = self
            .fetch_by_id(collection, id)?
            .ok_or_else(|| TriadError::EntityNotFound {
                collection: collection.to_owned(),
                id: id.to_owned(),
            })?;
        let mut update = EntityUpdate::new(&current);
        updater(&mut update)?;
        let patches = update.into_patches();
        self.apply(collection, id, &patches)
    }

    /// Applies a write batch to one entity, in order.
    pub fn apply(&mut self, collection: &str, id: &str, patches: &[Patch]) -> Result<()> {
        self.ensure_open()?;
        let entity = EntityId::new(collection, id)?;
        let schema = self.collection_schema(collection)?;
        for patch in patches {
            match patch {
                Patch::Set(path, value) => {
                    let mut leaves = Vec::new();
                    match schema.as_ref().map(|s| s.attribute_type(path)).transpose()?.flatten() {
                        Some(kind) => kind.serialize(path, value, &mut leaves)?,
                        None => serialize_untyped(path, value, &mut leaves)?,
                    }
                    self.replace(&entity, path, leaves)?;
                }
                Patch::Delete(path) => self.delete_attributes(&[(entity.clone(), path.clone())])?,
                Patch::Add(path, element) | Patch::Remove(path, element) => {
                    if let Some(schema) = &schema {
                        match schema.attribute_type(path)? {
                            Some(AttributeType::Set { items }) if items.accepts(element) => (),
                            _ => {
                                return Err(TriadError::Validation(format!(
                                    "attribute '{}' is not a set of {}",
                                    path,
                                    element.data_type()
                                )));
                            }
                        }
                    }
                    let present = matches!(patch, Patch::Add(..));
                    let triple = Triple::new(
                        entity.clone(),
                        path.clone(),
                        TripleValue::Element {
                            element: element.clone(),
                            present,
                        },
                        self.timestamp.clone(),
                    );
                    self.stage(&entity, vec![triple])?;
                }
            }
        }
        Ok(())
    }

    /// Retracts every live fact of an entity.
    pub fn delete(&mut self, collection: &str, id: &str) -> Result<()> {
        self.apply(collection, id, &[Patch::Delete(AttributePath::root())])
    }

    /// Retracts the live facts at or below each path of each entity.
    pub fn delete_attributes(&mut self, pairs: &[(EntityId, AttributePath)]) -> Result<()> {
        self.ensure_open()?;
        let timestamp = self.timestamp.clone();
        for (entity, path) in pairs {
            let retractions = self.read(|source| Ok(tombstones(source.triples(entity), path, &timestamp)))?;
            self.stage(entity, retractions)?;
        }
        Ok(())
    }

    pub fn cancel(&mut self) {
        if self.state == TransactionState::Open {
            self.state = TransactionState::Cancelled;
        }
    }

    /// Always fails: a transaction commits when its callback returns.
    pub fn commit(&mut self) -> Result<()> {
        self.state = TransactionState::Failed;
        Err(TriadError::IllegalCommit)
    }

    /// Writes `leaves` at or below `path`, retracting whatever else lives there.
    /// Facts that already hold the written value are left alone.
    pub(crate) fn replace(&mut self, entity: &EntityId, path: &AttributePath, leaves: Vec<Leaf>) -> Result<()> {
        let timestamp = self.timestamp.clone();
        let writes = self.read(|source| {
            let current = winners(source.triples(entity));
            let incoming: BTreeMap<FactKey, Triple> = leaves
                .into_iter()
                .map(|(attribute, value)| {
                    let triple = Triple::new(entity.clone(), attribute, value, timestamp.clone());
                    (triple.fact_key(), triple)
                })
                .collect();
            let mut writes: Vec<Triple> = current
                .iter()
                .filter(|(key, fact)| {
                    fact.value.is_live() && path.covers(&fact.attribute) && !incoming.contains_key(*key)
                })
                .map(|(_, fact)| retraction(fact, &timestamp))
                .collect();
            writes.extend(
                incoming
                    .into_iter()
                    .filter(|(key, triple)| current.get(key).is_none_or(|fact| fact.value != triple.value))
                    .map(|(_, triple)| triple),
            );
            Ok(writes)
        })?;
        self.stage(entity, writes)
    }

    pub(crate) fn stage(&mut self, entity: &EntityId, triples: Vec<Triple>) -> Result<()> {
        self.ensure_open()?;
        if triples.is_empty() {
            return Ok(());
        }
        self.read(|source| validate_entity(source.triples(entity), &triples))?;
        let staged = self.staged.entry(entity.clone()).or_default();
        for triple in triples {
            staged.insert(triple.fact_key(), triple);
        }
        Ok(())
    }

    fn generate_id(&mut self) -> String {
        self.generated += 1;
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.timestamp.client.as_bytes());
        hasher.update(&self.timestamp.counter.to_le_bytes());
        hasher.update(&self.generated.to_le_bytes());
        hasher.finalize().to_hex().as_str()[..16].to_owned()
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.state != TransactionState::Committed && !self.staged.is_empty() {
            debug!(
                timestamp = %self.timestamp,
                state = ?self.state,
                entities = self.staged.len(),
                "Discarded staged writes"
            );
        }
    }
}
