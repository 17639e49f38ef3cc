// used for persistence
use rusqlite::types::{ToSql, ToSqlOutput, ValueRef};

// values travel as JSON across the public boundary
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

// used to print out readable forms of a data type
use std::fmt;
// used to indicate that values need to be hashable and ordered for the indexes
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};

use crate::construct::{AttributePath, Leaf, TripleValue};
use crate::error::{Result, TriadError};
use crate::materialize::EntityValue;

// ------------- Value -------------
/// A scalar stored in a triple.
///
/// Values are totally ordered so they can key the attribute index: values of
/// different types order by type (`null < boolean < number < string`), values
/// of the same type by their natural order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Boolean(bool),
    Number(f64),
    String(String),
}

impl Value {
    pub fn uid(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Boolean(_) => BooleanType::UID,
            Value::Number(_) => NumberType::UID,
            Value::String(_) => StringType::UID,
        }
    }
    pub fn data_type(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Boolean(_) => BooleanType::DATA_TYPE,
            Value::Number(_) => NumberType::DATA_TYPE,
            Value::String(_) => StringType::DATA_TYPE,
        }
    }
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }
    /// Typed comparison: only values of the same type are comparable.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        if self.uid() == other.uid() {
            Some(self.cmp(other))
        } else {
            None
        }
    }
    /// Converts a JSON scalar, `None` for arrays and objects.
    pub fn from_json(json: &Json) -> Option<Value> {
        match json {
            Json::Null => Some(Value::Null),
            Json::Bool(b) => Some(Value::Boolean(*b)),
            Json::Number(n) => n.as_f64().map(Value::from),
            Json::String(s) => Some(Value::String(s.clone())),
            Json::Array(_) | Json::Object(_) => None,
        }
    }
    pub fn to_json(&self) -> Json {
        match self {
            Value::Null => Json::Null,
            Value::Boolean(b) => Json::Bool(*b),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
                    Json::from(*n as i64)
                } else {
                    serde_json::Number::from_f64(*n)
                        .map(Json::Number)
                        .unwrap_or(Json::Null)
                }
            }
            Value::String(s) => Json::String(s.clone()),
        }
    }
    /// Restores a value persisted together with its type identifier.
    pub fn convert(uid: u8, value: &ValueRef) -> Result<Value> {
        let corrupt = |e: rusqlite::types::FromSqlError| TriadError::Persistence(e.to_string());
        match (uid, value) {
            (_, ValueRef::Null) => Ok(Value::Null),
            (BooleanType::UID, v) => Ok(Value::Boolean(v.as_i64().map_err(corrupt)? != 0)),
            (NumberType::UID, ValueRef::Integer(i)) => Ok(Value::Number(*i as f64)),
            (NumberType::UID, v) => Ok(Value::Number(v.as_f64().map_err(corrupt)?)),
            (StringType::UID, v) => Ok(Value::String(v.as_str().map_err(corrupt)?.to_owned())),
            (other, _) => Err(TriadError::Persistence(format!(
                "unknown value type identifier {other}"
            ))),
        }
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Number(a), Value::Number(b)) => a.total_cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            _ => self.uid().cmp(&other.uid()),
        }
    }
}
impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for Value {}
impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uid().hash(state);
        match self {
            Value::Null => (),
            Value::Boolean(b) => b.hash(state),
            Value::Number(n) => n.to_bits().hash(state),
            Value::String(s) => s.hash(state),
        }
    }
}
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Number(_) => write!(f, "{}", self.to_json()),
            Value::String(s) => write!(f, "{}", s),
        }
    }
}
impl From<f64> for Value {
    fn from(n: f64) -> Self {
        // -0.0 and 0.0 must key the same index entry
        Value::Number(if n == 0.0 { 0.0 } else { n })
    }
}
impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::from(n as f64)
    }
}
impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::from(n as f64)
    }
}
impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}
impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}
impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}
impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::from(rusqlite::types::Null),
            Value::Boolean(b) => ToSqlOutput::from(*b),
            Value::Number(n) => ToSqlOutput::from(*n),
            Value::String(s) => ToSqlOutput::from(s.as_str()),
        })
    }
}

// ------------- Attribute declarations -------------
/// The declared type of an attribute, a closed set of tags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AttributeType {
    Number,
    String,
    Boolean,
    Set {
        items: Box<AttributeType>,
    },
    Record {
        #[serde(default)]
        properties: BTreeMap<String, AttributeDefinition>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeDefinition {
    #[serde(flatten)]
    pub kind: AttributeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl AttributeDefinition {
    pub fn new(kind: AttributeType) -> Self {
        Self {
            kind,
            default: None,
        }
    }
    pub fn number() -> Self {
        Self::new(AttributeType::Number)
    }
    pub fn string() -> Self {
        Self::new(AttributeType::String)
    }
    pub fn boolean() -> Self {
        Self::new(AttributeType::Boolean)
    }
    pub fn set(items: AttributeType) -> Self {
        Self::new(AttributeType::Set {
            items: Box::new(items),
        })
    }
    pub fn record<I, K>(properties: I) -> Self
    where
        I: IntoIterator<Item = (K, AttributeDefinition)>,
        K: Into<String>,
    {
        Self::new(AttributeType::Record {
            properties: properties.into_iter().map(|(k, d)| (k.into(), d)).collect(),
        })
    }
    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }
}

// Every tag carries its own validate/serialize/deserialize behaviour.
pub trait DataType {
    // static stuff which needs to be implemented downstream
    const UID: u8;
    const DATA_TYPE: &'static str;
    /// Checks a document value against the declaration.
    fn validate(&self, path: &AttributePath, input: &Json) -> Result<()>;
    /// Flattens a document value into the leaf writes stored under `path`.
    fn serialize(&self, path: &AttributePath, input: &Json, leaves: &mut Vec<Leaf>) -> Result<()>;
    /// Shapes a materialized value into its in-memory form.
    fn deserialize(&self, path: &AttributePath, stored: EntityValue) -> Result<EntityValue>;
    // instance callable with pre-made implementation
    fn data_type(&self) -> &'static str {
        Self::DATA_TYPE
    }
}

fn mismatch(path: &AttributePath, expected: &str, found: impl fmt::Display) -> TriadError {
    TriadError::Validation(format!(
        "attribute '{}' expects {}, found {}",
        path, expected, found
    ))
}

macro_rules! scalar_type {
    ($name:ident, $uid:expr, $data_type:expr, $variant:ident, $check:ident) => {
        #[derive(Debug, Clone, Copy)]
        pub struct $name;

        impl DataType for $name {
            const UID: u8 = $uid;
            const DATA_TYPE: &'static str = $data_type;
            fn validate(&self, path: &AttributePath, input: &Json) -> Result<()> {
                if input.$check() {
                    Ok(())
                } else {
                    Err(mismatch(path, Self::DATA_TYPE, input))
                }
            }
            fn serialize(
                &self,
                path: &AttributePath,
                input: &Json,
                leaves: &mut Vec<Leaf>,
            ) -> Result<()> {
                self.validate(path, input)?;
                let value = Value::from_json(input).ok_or_else(|| mismatch(path, Self::DATA_TYPE, input))?;
                leaves.push((path.clone(), TripleValue::Value(value)));
                Ok(())
            }
            fn deserialize(&self, path: &AttributePath, stored: EntityValue) -> Result<EntityValue> {
                match stored {
                    EntityValue::Scalar(Value::$variant(v)) => Ok(EntityValue::Scalar(Value::$variant(v))),
                    other => Err(mismatch(path, Self::DATA_TYPE, other.kind())),
                }
            }
        }
    };
}

scalar_type!(BooleanType, 1, "boolean", Boolean, is_boolean);
scalar_type!(NumberType, 2, "number", Number, is_number);
scalar_type!(StringType, 3, "string", String, is_string);

#[derive(Debug, Clone, Copy)]
pub struct SetType<'a> {
    pub items: &'a AttributeType,
}

impl DataType for SetType<'_> {
    const UID: u8 = 4;
    const DATA_TYPE: &'static str = "set";
    fn validate(&self, path: &AttributePath, input: &Json) -> Result<()> {
        let elements = input
            .as_array()
            .ok_or_else(|| mismatch(path, Self::DATA_TYPE, input))?;
        if !self.items.is_scalar() {
            return Err(TriadError::Validation(format!(
                "set '{}' must hold scalar elements",
                path
            )));
        }
        for element in elements {
            self.items.validate(path, element)?;
        }
        Ok(())
    }
    fn serialize(&self, path: &AttributePath, input: &Json, leaves: &mut Vec<Leaf>) -> Result<()> {
        self.validate(path, input)?;
        for element in input.as_array().into_iter().flatten() {
            let element = Value::from_json(element).ok_or_else(|| mismatch(path, "scalar", element))?;
            leaves.push((
                path.clone(),
                TripleValue::Element {
                    element,
                    present: true,
                },
            ));
        }
        Ok(())
    }
    fn deserialize(&self, path: &AttributePath, stored: EntityValue) -> Result<EntityValue> {
        match stored {
            EntityValue::Set(elements) => {
                for element in &elements {
                    if !self.items.accepts(element) {
                        return Err(mismatch(path, self.items.data_type(), element));
                    }
                }
                Ok(EntityValue::Set(elements))
            }
            other => Err(mismatch(path, Self::DATA_TYPE, other.kind())),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RecordType<'a> {
    pub properties: &'a BTreeMap<String, AttributeDefinition>,
}

impl DataType for RecordType<'_> {
    const UID: u8 = 5;
    const DATA_TYPE: &'static str = "record";
    fn validate(&self, path: &AttributePath, input: &Json) -> Result<()> {
        let fields = input
            .as_object()
            .ok_or_else(|| mismatch(path, Self::DATA_TYPE, input))?;
        for (name, value) in fields {
            let definition = self.properties.get(name).ok_or_else(|| {
                TriadError::Validation(format!("unknown attribute '{}'", path.child(name)))
            })?;
            definition.kind.validate(&path.child(name), value)?;
        }
        Ok(())
    }
    fn serialize(&self, path: &AttributePath, input: &Json, leaves: &mut Vec<Leaf>) -> Result<()> {
        self.validate(path, input)?;
        for (name, value) in input.as_object().into_iter().flatten() {
            if let Some(definition) = self.properties.get(name) {
                definition.kind.serialize(&path.child(name), value, leaves)?;
            }
        }
        Ok(())
    }
    fn deserialize(&self, path: &AttributePath, stored: EntityValue) -> Result<EntityValue> {
        let mut fields = match stored {
            EntityValue::Record(fields) => fields,
            other => return Err(mismatch(path, Self::DATA_TYPE, other.kind())),
        };
        let mut shaped = BTreeMap::new();
        for (name, definition) in self.properties {
            let child = path.child(name);
            match fields.remove(name) {
                Some(value) => {
                    shaped.insert(name.clone(), definition.kind.deserialize(&child, value)?);
                }
                // an untouched set is an empty set
                None if matches!(definition.kind, AttributeType::Set { .. }) => {
                    shaped.insert(name.clone(), EntityValue::Set(BTreeSet::new()));
                }
                None => (),
            }
        }
        Ok(EntityValue::Record(shaped))
    }
}

macro_rules! dispatch {
    ($kind:expr, $t:ident => $body:expr) => {
        match $kind {
            AttributeType::Number => {
                let $t = NumberType;
                $body
            }
            AttributeType::String => {
                let $t = StringType;
                $body
            }
            AttributeType::Boolean => {
                let $t = BooleanType;
                $body
            }
            AttributeType::Set { items } => {
                let $t = SetType { items };
                $body
            }
            AttributeType::Record { properties } => {
                let $t = RecordType { properties };
                $body
            }
        }
    };
}

impl AttributeType {
    pub fn validate(&self, path: &AttributePath, input: &Json) -> Result<()> {
        dispatch!(self, t => t.validate(path, input))
    }
    pub fn serialize(&self, path: &AttributePath, input: &Json, leaves: &mut Vec<Leaf>) -> Result<()> {
        dispatch!(self, t => t.serialize(path, input, leaves))
    }
    pub fn deserialize(&self, path: &AttributePath, stored: EntityValue) -> Result<EntityValue> {
        dispatch!(self, t => t.deserialize(path, stored))
    }
    pub fn data_type(&self) -> &'static str {
        dispatch!(self, t => t.data_type())
    }
    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            AttributeType::Number | AttributeType::String | AttributeType::Boolean
        )
    }
    /// Whether a query value can be compared against this attribute;
    /// sets compare against their element type.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (AttributeType::Number, Value::Number(_)) => true,
            (AttributeType::String, Value::String(_)) => true,
            (AttributeType::Boolean, Value::Boolean(_)) => true,
            (AttributeType::Set { items }, v) => items.accepts(v),
            _ => false,
        }
    }
    /// Follows nested record properties down `segments`.
    pub fn resolve(&self, segments: &[String]) -> Option<&AttributeType> {
        match segments.split_first() {
            None => Some(self),
            Some((head, rest)) => match self {
                AttributeType::Record { properties } => properties.get(head)?.kind.resolve(rest),
                _ => None,
            },
        }
    }
}

/// Flattens a document value for a collection without a schema: objects
/// nest, arrays become sets of scalars, everything else is a leaf value.
pub fn serialize_untyped(path: &AttributePath, input: &Json, leaves: &mut Vec<Leaf>) -> Result<()> {
    match input {
        Json::Object(fields) => {
            for (name, value) in fields {
                serialize_untyped(&path.child(name), value, leaves)?;
            }
        }
        Json::Array(elements) => {
            for element in elements {
                let element = Value::from_json(element).ok_or_else(|| {
                    TriadError::Validation(format!("set '{}' must hold scalar elements", path))
                })?;
                leaves.push((
                    path.clone(),
                    TripleValue::Element {
                        element,
                        present: true,
                    },
                ));
            }
        }
        scalar => {
            let value = Value::from_json(scalar)
                .ok_or_else(|| TriadError::Invariant("scalar conversion".into()))?;
            leaves.push((path.clone(), TripleValue::Value(value)));
        }
    }
    Ok(())
}
