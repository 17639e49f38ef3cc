// other keepers use HashSet or HashMap
use core::hash::BuildHasherDefault;
use seahash::SeaHasher;
use std::collections::BTreeMap;

// used to print out readable forms of a construct
use std::fmt;

use serde::{Deserialize, Serialize};

// our own stuff that we need
use crate::datatype::Value;
use crate::error::{Result, TriadError};

// ------------- Reserved names -------------
/// Separates the collection from the id in a qualified entity id.
pub const SEPARATOR: char = '#';
/// Every entity carries a fact under this attribute naming its collection.
pub const COLLECTION_ATTRIBUTE: &str = "_collection";
/// Internal collection holding schema metadata.
pub const METADATA_COLLECTION: &str = "_metadata";
pub const SCHEMA_ENTITY: &str = "_schema";
pub const ID_ATTRIBUTE: &str = "id";

// ------------- EntityKey -------------
// Entities get numeric keys so filter results can live in bitmaps.
pub type EntityKey = u64;

pub type KeyHasher = BuildHasherDefault<SeaHasher>;
pub type OtherHasher = BuildHasherDefault<SeaHasher>;

pub const GENESIS: EntityKey = 0;

#[derive(Debug, Default)]
pub struct KeyGenerator {
    lower_bound: EntityKey,
}

impl KeyGenerator {
    pub fn new() -> Self {
        Self {
            lower_bound: GENESIS,
        }
    }
    pub fn generate(&mut self) -> EntityKey {
        self.lower_bound += 1;
        self.lower_bound
    }
}

// ------------- Timestamp -------------
/// Logical clock reading, ordered by counter and then by client id.
/// The client component makes two timestamps from different writers unequal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub counter: u64,
    pub client: String,
}

impl Timestamp {
    pub fn new(counter: u64, client: impl Into<String>) -> Self {
        Self {
            counter,
            client: client.into(),
        }
    }
}
impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}", self.counter, self.client)
    }
}

#[derive(Debug)]
pub struct Clock {
    client: String,
    counter: u64,
}

impl Clock {
    pub fn new(client: impl Into<String>) -> Self {
        Self {
            client: client.into(),
            counter: 0,
        }
    }
    pub fn client(&self) -> &str {
        &self.client
    }
    pub fn tick(&mut self) -> Timestamp {
        self.counter += 1;
        Timestamp::new(self.counter, self.client.clone())
    }
    /// Moves the clock past a timestamp seen elsewhere, e.g. on restore.
    pub fn observe(&mut self, seen: &Timestamp) {
        if seen.counter > self.counter {
            self.counter = seen.counter;
        }
    }
}

// ------------- EntityId -------------
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityId {
    collection: String,
    id: String,
}

impl EntityId {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Result<Self> {
        let collection = collection.into();
        let id = id.into();
        if id.contains(SEPARATOR) {
            return Err(TriadError::InvalidEntityId { id });
        }
        if collection.contains(SEPARATOR) {
            return Err(TriadError::InvalidEntityId { id: collection });
        }
        Ok(Self { collection, id })
    }
    // only for the reserved internal names, which never contain the separator
    pub(crate) fn reserved(collection: &str, id: &str) -> Self {
        Self {
            collection: collection.to_owned(),
            id: id.to_owned(),
        }
    }
    pub fn parse(qualified: &str) -> Result<Self> {
        match qualified.split_once(SEPARATOR) {
            Some((collection, id)) => Self::new(collection, id),
            None => Err(TriadError::InvalidEntityId {
                id: qualified.to_owned(),
            }),
        }
    }
    pub fn collection(&self) -> &str {
        &self.collection
    }
    pub fn id(&self) -> &str {
        &self.id
    }
    pub fn qualified(&self) -> String {
        format!("{}{}{}", self.collection, SEPARATOR, self.id)
    }
}
impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}{}{}", self.collection, SEPARATOR, self.id)
    }
}
impl Serialize for EntityId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.qualified())
    }
}

// ------------- AttributePath -------------
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributePath(Vec<String>);

impl AttributePath {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }
    pub fn root() -> Self {
        Self(Vec::new())
    }
    /// Splits a dot-separated path such as `address.city`.
    pub fn parse(dotted: &str) -> Self {
        Self(dotted.split('.').map(str::to_owned).collect())
    }
    pub fn child(&self, segment: &str) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.to_owned());
        Self(segments)
    }
    pub fn segments(&self) -> &[String] {
        &self.0
    }
    pub fn first(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }
    pub fn len(&self) -> usize {
        self.0.len()
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
    /// True for `self` itself and every path nested below it.
    pub fn covers(&self, other: &AttributePath) -> bool {
        other.0.starts_with(&self.0)
    }
    pub fn is_strict_prefix_of(&self, other: &AttributePath) -> bool {
        self.0.len() < other.0.len() && other.0.starts_with(&self.0)
    }
    /// Replaces the leading `from` segments with `to`.
    pub fn rebase(&self, from: &AttributePath, to: &AttributePath) -> Option<Self> {
        let rest = self.0.strip_prefix(from.0.as_slice())?;
        let mut segments = to.0.clone();
        segments.extend(rest.iter().cloned());
        Some(Self(segments))
    }
    pub fn dotted(&self) -> String {
        self.0.join(".")
    }
}
impl fmt::Display for AttributePath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}
impl From<&str> for AttributePath {
    fn from(dotted: &str) -> Self {
        Self::parse(dotted)
    }
}

// ------------- Triple -------------
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TripleValue {
    Value(Value),
    /// One member of a set; each element is its own fact.
    Element {
        element: Value,
        present: bool,
    },
    Tombstone,
}

impl TripleValue {
    pub fn is_live(&self) -> bool {
        match self {
            TripleValue::Value(_) => true,
            TripleValue::Element { present, .. } => *present,
            TripleValue::Tombstone => false,
        }
    }
    pub fn is_element(&self) -> bool {
        matches!(self, TripleValue::Element { .. })
    }
}

/// A leaf write before it is stamped into a triple.
pub type Leaf = (AttributePath, TripleValue);

/// Conflicts are resolved per attribute path, and per element for sets.
pub type FactKey = (AttributePath, Option<Value>);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Triple {
    pub entity: EntityId,
    pub attribute: AttributePath,
    pub value: TripleValue,
    pub timestamp: Timestamp,
}

impl Triple {
    pub fn new(entity: EntityId, attribute: AttributePath, value: TripleValue, timestamp: Timestamp) -> Self {
        Self {
            entity,
            attribute,
            value,
            timestamp,
        }
    }
    pub fn fact_key(&self) -> FactKey {
        match &self.value {
            TripleValue::Element { element, .. } => (self.attribute.clone(), Some(element.clone())),
            _ => (self.attribute.clone(), None),
        }
    }
    pub fn is_marker(&self) -> bool {
        self.attribute.len() == 1 && self.attribute.first() == Some(COLLECTION_ATTRIBUTE)
    }
}
impl fmt::Display for Triple {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let value = match &self.value {
            TripleValue::Value(v) => v.to_string(),
            TripleValue::Element { element, present } => {
                format!("{}{}", if *present { "+" } else { "-" }, element)
            }
            TripleValue::Tombstone => "(deleted)".to_owned(),
        };
        write!(f, "[{}, {}, {}, {}]", self.entity, self.attribute, value, self.timestamp)
    }
}

// ------------- Last writer wins -------------
/// Picks the authoritative of two facts for the same key: the greater timestamp.
pub fn resolve<'a>(a: &'a Triple, b: &'a Triple) -> &'a Triple {
    if b.timestamp > a.timestamp { b } else { a }
}

/// Folds triples into their winning fact per key, in any input order.
pub fn winners<'a, I>(triples: I) -> BTreeMap<FactKey, &'a Triple>
where
    I: IntoIterator<Item = &'a Triple>,
{
    let mut won: BTreeMap<FactKey, &'a Triple> = BTreeMap::new();
    for triple in triples {
        let key = triple.fact_key();
        match won.get(&key) {
            Some(current) => {
                let winner = resolve(current, triple);
                won.insert(key, winner);
            }
            None => {
                won.insert(key, triple);
            }
        }
    }
    won
}
