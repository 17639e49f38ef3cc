//! Versioned schema metadata and migrations.
//!
//! The schema is stored as ordinary triples on a reserved entity of the
//! `_metadata` collection, so schema changes commit through the same
//! transactions as data and become visible atomically.

use std::collections::{BTreeMap, BTreeSet};

use serde::ser::SerializeTuple;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value as Json;
use tracing::{info, warn};

use crate::construct::{AttributePath, ID_ATTRIBUTE, Leaf, Triple, winners};
use crate::database::Database;
use crate::datatype::{AttributeDefinition, AttributeType, serialize_untyped};
use crate::error::{Result, TriadError};
use crate::materialize::Entity;
use crate::store::{TripleSource, retraction, schema_entity};
use crate::transaction::Transaction;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub collections: BTreeMap<String, CollectionSchema>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub name: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeDefinition>,
}

impl CollectionSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: BTreeMap::new(),
        }
    }
    pub fn attribute(mut self, name: &str, definition: AttributeDefinition) -> Self {
        self.attributes.insert(name.to_owned(), definition);
        self
    }
    /// The declared type at `path`. `id` may be left undeclared, in which
    /// case it is `None`; any other undeclared path is an error.
    pub fn attribute_type(&self, path: &AttributePath) -> Result<Option<&AttributeType>> {
        let unknown = || {
            TriadError::Validation(format!(
                "unknown attribute '{}' in collection '{}'",
                path, self.name
            ))
        };
        let Some((head, rest)) = path.segments().split_first() else {
            return Err(unknown());
        };
        match self.attributes.get(head) {
            Some(definition) => definition.kind.resolve(rest).map(Some).ok_or_else(unknown),
            None if head == ID_ATTRIBUTE && rest.is_empty() => Ok(None),
            None => Err(unknown()),
        }
    }
}

impl Schema {
    pub fn new(version: u64) -> Self {
        Self {
            version,
            collections: BTreeMap::new(),
        }
    }
    pub fn with_collection(mut self, collection: CollectionSchema) -> Self {
        self.collections.insert(collection.name.clone(), collection);
        self
    }
    pub fn collection(&self, name: &str) -> Option<&CollectionSchema> {
        self.collections.get(name)
    }
    /// Flattens the schema into leaf writes for the metadata entity.
    pub fn encode(&self) -> Result<Vec<Leaf>> {
        let mut leaves = Vec::new();
        serialize_untyped(&AttributePath::root(), &serde_json::to_value(self)?, &mut leaves)?;
        Ok(leaves)
    }
    pub fn decode(metadata: &Entity) -> Result<Schema> {
        let mut json = metadata.to_json();
        if let Json::Object(fields) = &mut json {
            fields.remove(ID_ATTRIBUTE);
        }
        Ok(serde_json::from_value(json)?)
    }
}

fn properties_mut<'s>(
    attributes: &'s mut BTreeMap<String, AttributeDefinition>,
    parent: &[String],
) -> Result<&'s mut BTreeMap<String, AttributeDefinition>> {
    match parent.split_first() {
        None => Ok(attributes),
        Some((head, rest)) => match attributes.get_mut(head).map(|d| &mut d.kind) {
            Some(AttributeType::Record { properties }) => properties_mut(properties, rest),
            _ => Err(TriadError::Validation(format!(
                "attribute '{}' is not a record",
                head
            ))),
        },
    }
}

fn split_leaf(path: &AttributePath) -> Result<(&[String], &String)> {
    match path.segments().split_last() {
        Some((name, parent)) => Ok((parent, name)),
        None => Err(TriadError::Validation("empty attribute path".into())),
    }
}

fn collection_mut<'s>(schema: &'s mut Schema, name: &str) -> Result<&'s mut CollectionSchema> {
    schema
        .collections
        .get_mut(name)
        .ok_or_else(|| TriadError::Validation(format!("unknown collection '{}'", name)))
}

// ------------- Schema operations -------------
impl Transaction<'_> {
    /// The schema as seen by this transaction, empty at version 0 when none was written.
    pub fn schema(&self) -> Result<Schema> {
        Ok(self.read(|source| source.schema())?.unwrap_or_default())
    }
    pub(crate) fn write_schema(&mut self, schema: &Schema) -> Result<()> {
        let leaves = schema.encode()?;
        self.replace(&schema_entity(), &AttributePath::root(), leaves)
    }
    pub fn create_collection(&mut self, collection: CollectionSchema) -> Result<()> {
        let mut schema = self.schema()?;
        if schema.collections.contains_key(&collection.name) {
            return Err(TriadError::Validation(format!(
                "collection '{}' already exists",
                collection.name
            )));
        }
        schema.collections.insert(collection.name.clone(), collection);
        self.write_schema(&schema)
    }
    /// Removes the definition only; stored data is kept.
    pub fn drop_collection(&mut self, name: &str) -> Result<()> {
        let mut schema = self.schema()?;
        if schema.collections.remove(name).is_none() {
            return Err(TriadError::Validation(format!("unknown collection '{}'", name)));
        }
        self.write_schema(&schema)
    }
    pub fn add_attribute(&mut self, collection: &str, path: &AttributePath, definition: AttributeDefinition) -> Result<()> {
        let mut schema = self.schema()?;
        let (parent, name) = split_leaf(path)?;
        let properties = properties_mut(&mut collection_mut(&mut schema, collection)?.attributes, parent)?;
        if properties.contains_key(name) {
            return Err(TriadError::Validation(format!(
                "attribute '{}' already exists in '{}'",
                path, collection
            )));
        }
        properties.insert(name.clone(), definition);
        self.write_schema(&schema)
    }
    /// Removes the definition only; typed entities stop exposing the attribute.
    pub fn drop_attribute(&mut self, collection: &str, path: &AttributePath) -> Result<()> {
        let mut schema = self.schema()?;
        let (parent, name) = split_leaf(path)?;
        let properties = properties_mut(&mut collection_mut(&mut schema, collection)?.attributes, parent)?;
        if properties.remove(name).is_none() {
            return Err(TriadError::Validation(format!(
                "unknown attribute '{}' in '{}'",
                path, collection
            )));
        }
        self.write_schema(&schema)
    }
    /// Renames the definition and moves existing values to the new path.
    pub fn rename_attribute(&mut self, collection: &str, path: &AttributePath, new_path: &AttributePath) -> Result<()> {
        let mut schema = self.schema()?;
        let (parent, name) = split_leaf(path)?;
        let (new_parent, new_name) = split_leaf(new_path)?;
        let attributes = &mut collection_mut(&mut schema, collection)?.attributes;
        let definition = properties_mut(attributes, parent)?.remove(name).ok_or_else(|| {
            TriadError::Validation(format!("unknown attribute '{}' in '{}'", path, collection))
        })?;
        let target = properties_mut(attributes, new_parent)?;
        if target.contains_key(new_name) {
            return Err(TriadError::Validation(format!(
                "attribute '{}' already exists in '{}'",
                new_path, collection
            )));
        }
        target.insert(new_name.clone(), definition);
        self.write_schema(&schema)?;

        let timestamp = self.timestamp().clone();
        let moves: Vec<(_, Vec<Triple>)> = self.read(|source| {
            Ok(source
                .entities(collection)
                .into_iter()
                .map(|entity| {
                    let mut writes = Vec::new();
                    for fact in winners(source.triples(&entity)).into_values() {
                        if !fact.value.is_live() || !path.covers(&fact.attribute) {
                            continue;
                        }
                        if let Some(moved) = fact.attribute.rebase(path, new_path) {
                            writes.push(retraction(fact, &timestamp));
                            writes.push(Triple::new(entity.clone(), moved, fact.value.clone(), timestamp.clone()));
                        }
                    }
                    (entity, writes)
                })
                .collect())
        })?;
        for (entity, writes) in moves {
            self.stage(&entity, writes)?;
        }
        Ok(())
    }
    pub fn set_version(&mut self, version: u64) -> Result<()> {
        let mut schema = self.schema()?;
        schema.version = version;
        self.write_schema(&schema)
    }
    pub fn apply_operation(&mut self, operation: &MigrationOperation) -> Result<()> {
        match operation {
            MigrationOperation::CreateCollection(op) => {
                self.create_collection(CollectionSchema {
                    name: op.name.clone(),
                    attributes: op.attributes.clone(),
                })
            }
            MigrationOperation::DropCollection(op) => self.drop_collection(&op.name),
            MigrationOperation::AddAttribute(op) => {
                self.add_attribute(&op.collection, &AttributePath::parse(&op.path), op.attribute.clone())
            }
            MigrationOperation::DropAttribute(op) => {
                self.drop_attribute(&op.collection, &AttributePath::parse(&op.path))
            }
            MigrationOperation::RenameAttribute(op) => self.rename_attribute(
                &op.collection,
                &AttributePath::parse(&op.path),
                &AttributePath::parse(&op.new_path),
            ),
            MigrationOperation::Unrecognized { name, .. } => Err(TriadError::Validation(format!(
                "unrecognized migration operation '{}'",
                name
            ))),
        }
    }
}

// ------------- Migrations -------------
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateCollection {
    pub name: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropCollection {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddAttribute {
    pub collection: String,
    pub path: String,
    pub attribute: AttributeDefinition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropAttribute {
    pub collection: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameAttribute {
    pub collection: String,
    pub path: String,
    pub new_path: String,
}

/// One schema change, written as `[name, arguments]`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "(String, Json)")]
pub enum MigrationOperation {
    CreateCollection(CreateCollection),
    DropCollection(DropCollection),
    AddAttribute(AddAttribute),
    DropAttribute(DropAttribute),
    RenameAttribute(RenameAttribute),
    /// Kept so that a migration naming it fails when applied, not when read.
    Unrecognized { name: String, arguments: Json },
}

impl MigrationOperation {
    pub fn name(&self) -> &str {
        match self {
            MigrationOperation::CreateCollection(_) => "create_collection",
            MigrationOperation::DropCollection(_) => "drop_collection",
            MigrationOperation::AddAttribute(_) => "add_attribute",
            MigrationOperation::DropAttribute(_) => "drop_attribute",
            MigrationOperation::RenameAttribute(_) => "rename_attribute",
            MigrationOperation::Unrecognized { name, .. } => name,
        }
    }
}

impl TryFrom<(String, Json)> for MigrationOperation {
    type Error = serde_json::Error;
    fn try_from((name, arguments): (String, Json)) -> std::result::Result<Self, Self::Error> {
        Ok(match name.as_str() {
            "create_collection" => MigrationOperation::CreateCollection(serde_json::from_value(arguments)?),
            "drop_collection" => MigrationOperation::DropCollection(serde_json::from_value(arguments)?),
            "add_attribute" => MigrationOperation::AddAttribute(serde_json::from_value(arguments)?),
            "drop_attribute" => MigrationOperation::DropAttribute(serde_json::from_value(arguments)?),
            "rename_attribute" => MigrationOperation::RenameAttribute(serde_json::from_value(arguments)?),
            _ => MigrationOperation::Unrecognized { name, arguments },
        })
    }
}

impl Serialize for MigrationOperation {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(2)?;
        tuple.serialize_element(self.name())?;
        match self {
            MigrationOperation::CreateCollection(op) => tuple.serialize_element(op)?,
            MigrationOperation::DropCollection(op) => tuple.serialize_element(op)?,
            MigrationOperation::AddAttribute(op) => tuple.serialize_element(op)?,
            MigrationOperation::DropAttribute(op) => tuple.serialize_element(op)?,
            MigrationOperation::RenameAttribute(op) => tuple.serialize_element(op)?,
            MigrationOperation::Unrecognized { arguments, .. } => tuple.serialize_element(arguments)?,
        }
        tuple.end()
    }
}

/// An edge `parent -> version` of the migration graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Migration {
    pub parent: u64,
    pub version: u64,
    #[serde(default)]
    pub up: Vec<MigrationOperation>,
    #[serde(default)]
    pub down: Vec<MigrationOperation>,
}

impl Migration {
    pub fn new(parent: u64, version: u64) -> Self {
        Self {
            parent,
            version,
            up: Vec::new(),
            down: Vec::new(),
        }
    }
    pub fn up(mut self, operation: MigrationOperation) -> Self {
        self.up.push(operation);
        self
    }
    pub fn down(mut self, operation: MigrationOperation) -> Self {
        self.down.push(operation);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationDirection {
    Up,
    Down,
}

/// Outcome of a migration run. A failed migration is reported here rather
/// than returned as an error, since the migrations before it stay applied.
#[derive(Debug)]
pub struct MigrationReport {
    pub from: u64,
    pub to: u64,
    pub applied: Vec<u64>,
    pub failure: Option<TriadError>,
}

fn apply_migration(db: &Database, migration: &Migration, operations: &[MigrationOperation], target: u64) -> Result<()> {
    db.transact(|tx| {
        for operation in operations {
            tx.apply_operation(operation).map_err(|e| TriadError::MigrationApply {
                version: migration.version,
                operation: operation.name().to_owned(),
                message: e.to_string(),
            })?;
        }
        tx.set_version(target)
    })?;
    Ok(())
}

/// Walks the migration graph from the current version. `Up` follows edges
/// whose parent is the current version until none is left; `Down` undoes the
/// single edge that produced the current version.
pub fn migrate(db: &Database, migrations: &[Migration], direction: MigrationDirection) -> Result<MigrationReport> {
    let from = db.schema_version()?;
    let mut report = MigrationReport {
        from,
        to: from,
        applied: Vec::new(),
        failure: None,
    };
    match direction {
        MigrationDirection::Up => {
            let mut visited = BTreeSet::from([from]);
            while let Some(migration) = migrations
                .iter()
                .find(|m| m.parent == report.to && !visited.contains(&m.version))
            {
                match apply_migration(db, migration, &migration.up, migration.version) {
                    Ok(()) => {
                        info!(parent = migration.parent, version = migration.version, "Applied migration");
                        visited.insert(migration.version);
                        report.applied.push(migration.version);
                        report.to = migration.version;
                    }
                    Err(e) => {
                        warn!(version = migration.version, error = %e, "Migration rolled back");
                        report.failure = Some(e);
                        break;
                    }
                }
            }
        }
        MigrationDirection::Down => {
            if let Some(migration) = migrations.iter().find(|m| m.version == from) {
                match apply_migration(db, migration, &migration.down, migration.parent) {
                    Ok(()) => {
                        info!(from = migration.version, to = migration.parent, "Reverted migration");
                        report.applied.push(migration.version);
                        report.to = migration.parent;
                    }
                    Err(e) => {
                        warn!(version = migration.version, error = %e, "Migration rolled back");
                        report.failure = Some(e);
                    }
                }
            }
        }
    }
    Ok(report)
}
