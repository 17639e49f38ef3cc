use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use serde_json::{Map, Value as Json};

use crate::construct::{AttributePath, EntityId, ID_ATTRIBUTE, Triple, TripleValue, winners};
use crate::datatype::{DataType, RecordType, Value};
use crate::error::Result;
use crate::schema::CollectionSchema;

/// A materialized attribute value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EntityValue {
    Scalar(Value),
    Set(BTreeSet<Value>),
    Record(BTreeMap<String, EntityValue>),
}

impl EntityValue {
    pub fn kind(&self) -> &'static str {
        match self {
            EntityValue::Scalar(v) => v.data_type(),
            EntityValue::Set(_) => "set",
            EntityValue::Record(_) => "record",
        }
    }
    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            EntityValue::Scalar(v) => Some(v),
            _ => None,
        }
    }
    pub fn as_set(&self) -> Option<&BTreeSet<Value>> {
        match self {
            EntityValue::Set(s) => Some(s),
            _ => None,
        }
    }
    pub fn as_record(&self) -> Option<&BTreeMap<String, EntityValue>> {
        match self {
            EntityValue::Record(r) => Some(r),
            _ => None,
        }
    }
    pub fn to_json(&self) -> Json {
        match self {
            EntityValue::Scalar(v) => v.to_json(),
            EntityValue::Set(s) => Json::Array(s.iter().map(Value::to_json).collect()),
            EntityValue::Record(r) => Json::Object(
                r.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect::<Map<_, _>>(),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entity {
    #[serde(skip)]
    id: String,
    #[serde(flatten)]
    attributes: BTreeMap<String, EntityValue>,
}

impl Entity {
    pub fn new(id: impl Into<String>, attributes: BTreeMap<String, EntityValue>) -> Self {
        Self {
            id: id.into(),
            attributes,
        }
    }
    pub fn id(&self) -> &str {
        &self.id
    }
    pub fn attributes(&self) -> &BTreeMap<String, EntityValue> {
        &self.attributes
    }
    /// Looks up a dot-separated path such as `address.city`.
    pub fn get(&self, path: &str) -> Option<&EntityValue> {
        self.get_path(&AttributePath::parse(path))
    }
    pub fn get_path(&self, path: &AttributePath) -> Option<&EntityValue> {
        let (head, rest) = path.segments().split_first()?;
        let mut current = self.attributes.get(head)?;
        for segment in rest {
            current = current.as_record()?.get(segment)?;
        }
        Some(current)
    }
    pub fn value(&self, path: &str) -> Option<&Value> {
        self.get(path)?.as_scalar()
    }
    pub fn set(&self, path: &str) -> Option<&BTreeSet<Value>> {
        self.get(path)?.as_set()
    }
    /// Keeps `id` and the named paths only.
    pub fn select(&self, paths: &[AttributePath]) -> Entity {
        let mut selected = Entity::new(self.id.clone(), BTreeMap::new());
        if let Some(id) = self.attributes.get(ID_ATTRIBUTE) {
            selected.attributes.insert(ID_ATTRIBUTE.to_owned(), id.clone());
        }
        for path in paths {
            if let Some(value) = self.get_path(path) {
                place(&mut selected.attributes, path.segments(), value.clone());
            }
        }
        selected
    }
    pub fn to_json(&self) -> Json {
        Json::Object(
            self.attributes
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}

fn place(tree: &mut BTreeMap<String, EntityValue>, segments: &[String], value: EntityValue) {
    let Some((head, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        match (tree.get_mut(head), value) {
            (Some(EntityValue::Set(existing)), EntityValue::Set(more)) => existing.extend(more),
            (_, value) => {
                tree.insert(head.clone(), value);
            }
        }
        return;
    }
    let child = tree
        .entry(head.clone())
        .or_insert_with(|| EntityValue::Record(BTreeMap::new()));
    if let EntityValue::Record(children) = child {
        place(children, rest, value);
    }
}

/// Folds the triples of one entity into its current value.
///
/// Returns `None` when no live fact remains. The collection marker is hidden,
/// `id` is filled in from the entity id when no fact provides one, and with a
/// schema the value is shaped to the declared attributes.
pub fn materialize<'a, I>(
    entity: &EntityId,
    triples: I,
    schema: Option<&CollectionSchema>,
) -> Result<Option<Entity>>
where
    I: IntoIterator<Item = &'a Triple>,
{
    let won = winners(triples);
    if !won.values().any(|t| t.value.is_live()) {
        return Ok(None);
    }
    let mut attributes = BTreeMap::new();
    for triple in won.values() {
        if triple.is_marker() {
            continue;
        }
        match &triple.value {
            TripleValue::Value(v) => {
                place(&mut attributes, triple.attribute.segments(), EntityValue::Scalar(v.clone()))
            }
            TripleValue::Element { element, present: true } => place(
                &mut attributes,
                triple.attribute.segments(),
                EntityValue::Set(BTreeSet::from([element.clone()])),
            ),
            _ => (),
        }
    }
    let id = attributes
        .remove(ID_ATTRIBUTE)
        .unwrap_or_else(|| EntityValue::Scalar(Value::from(entity.id())));
    if let Some(schema) = schema {
        let shaped = RecordType {
            properties: &schema.attributes,
        }
        .deserialize(&AttributePath::root(), EntityValue::Record(attributes))?;
        attributes = match shaped {
            EntityValue::Record(shaped) => shaped,
            _ => BTreeMap::new(),
        };
    }
    attributes.insert(ID_ATTRIBUTE.to_owned(), id);
    Ok(Some(Entity::new(entity.id(), attributes)))
}
