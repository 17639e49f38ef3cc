//! Query descriptors, planning and execution.
//!
//! A [`QueryDescriptor`] is the serializable form of a query. [`plan`] checks it
//! against the schema and compiles the `where` tree into a [`Filter`], and
//! [`execute`] narrows candidates through the store indexes before evaluating
//! the filter on materialized entities, ordering and paginating the survivors.

use std::cmp::Ordering;
use std::collections::HashMap;

// the "standard" regular expression package, used by the like operator
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::debug;

use crate::construct::{AttributePath, EntityId, Triple};
use crate::datatype::{AttributeType, Value};
use crate::error::{Result, TriadError};
use crate::materialize::{Entity, EntityValue, materialize};
use crate::schema::{CollectionSchema, Schema};
use crate::store::TripleSource;

// ------------- Descriptor -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modifier {
    And,
    Or,
}

/// A leaf `[path, operator, value]` or a boolean group `{ mod, filters }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WhereClause {
    Filter(String, String, Value),
    Group {
        #[serde(rename = "mod")]
        modifier: Modifier,
        filters: Vec<WhereClause>,
    },
}

pub fn filter(path: &str, operator: &str, value: impl Into<Value>) -> WhereClause {
    WhereClause::Filter(path.to_owned(), operator.to_owned(), value.into())
}
pub fn and(filters: Vec<WhereClause>) -> WhereClause {
    WhereClause::Group {
        modifier: Modifier::And,
        filters,
    }
}
pub fn or(filters: Vec<WhereClause>) -> WhereClause {
    WhereClause::Group {
        modifier: Modifier::Or,
        filters,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderClause(pub String, pub Direction);

/// Resume point of a paginated query: the ordered value and the entity id of
/// the last entity already seen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor(pub Value, pub String);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDescriptor {
    pub collection_name: String,
    #[serde(default, rename = "where", skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<WhereClause>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<OrderClause>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Cursor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub select: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
}

impl QueryDescriptor {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection_name: collection.into(),
            filters: Vec::new(),
            order: None,
            limit: None,
            after: None,
            select: None,
            entity_id: None,
        }
    }
}

pub fn query(collection: impl Into<String>) -> CollectionQueryBuilder {
    CollectionQueryBuilder::new(collection)
}

#[derive(Debug, Clone)]
pub struct CollectionQueryBuilder {
    query: QueryDescriptor,
}

impl CollectionQueryBuilder {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            query: QueryDescriptor::new(collection),
        }
    }
    pub fn filter(mut self, path: &str, operator: &str, value: impl Into<Value>) -> Self {
        self.query.filters.push(filter(path, operator, value));
        self
    }
    pub fn where_clause(mut self, clause: WhereClause) -> Self {
        self.query.filters.push(clause);
        self
    }
    pub fn order(mut self, path: &str, direction: Direction) -> Self {
        self.query.order = Some(OrderClause(path.to_owned(), direction));
        self
    }
    pub fn limit(mut self, limit: usize) -> Self {
        self.query.limit = Some(limit);
        self
    }
    pub fn after(mut self, value: impl Into<Value>, id: impl Into<String>) -> Self {
        self.query.after = Some(Cursor(value.into(), id.into()));
        self
    }
    pub fn select(mut self, paths: &[&str]) -> Self {
        self.query.select = Some(paths.iter().map(|p| (*p).to_owned()).collect());
        self
    }
    pub fn entity_id(mut self, id: impl Into<String>) -> Self {
        self.query.entity_id = Some(id.into());
        self
    }
    pub fn build(self) -> QueryDescriptor {
        self.query
    }
}

// ------------- Filters -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Like,
}

impl Operator {
    pub fn parse(operator: &str) -> Result<Self> {
        match operator {
            "=" => Ok(Operator::Eq),
            "!=" => Ok(Operator::Ne),
            ">" => Ok(Operator::Gt),
            ">=" => Ok(Operator::Ge),
            "<" => Ok(Operator::Lt),
            "<=" => Ok(Operator::Le),
            "like" => Ok(Operator::Like),
            other => Err(TriadError::UnimplementedOperator {
                operator: other.to_owned(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Predicate {
    pub path: AttributePath,
    pub operator: Operator,
    pub value: Value,
    pattern: Option<Regex>,
}

impl Predicate {
    pub fn new(path: AttributePath, operator: Operator, value: Value) -> Result<Self> {
        let pattern = match (operator, &value) {
            (Operator::Like, Value::String(pattern)) => Some(like_pattern(pattern)?),
            (Operator::Like, other) => {
                return Err(TriadError::Validation(format!(
                    "like expects a string pattern, found {}",
                    other.data_type()
                )));
            }
            _ => None,
        };
        Ok(Self {
            path,
            operator,
            value,
            pattern,
        })
    }
    /// Typed test of one stored scalar; values of other types never compare.
    pub fn test(&self, stored: &Value) -> bool {
        let ordering = stored.compare(&self.value);
        match self.operator {
            Operator::Eq => *stored == self.value,
            Operator::Ne => *stored != self.value,
            Operator::Gt => ordering == Some(Ordering::Greater),
            Operator::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
            Operator::Lt => ordering == Some(Ordering::Less),
            Operator::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
            Operator::Like => match (stored, &self.pattern) {
                (Value::String(s), Some(pattern)) => pattern.is_match(s),
                _ => false,
            },
        }
    }
    /// A missing attribute reads as null; `=` on a set tests membership.
    pub fn matches(&self, entity: &Entity) -> bool {
        match entity.get_path(&self.path) {
            None => self.test(&Value::Null),
            Some(EntityValue::Scalar(stored)) => self.test(stored),
            Some(EntityValue::Set(elements)) => match self.operator {
                Operator::Eq => elements.contains(&self.value),
                Operator::Ne => !elements.contains(&self.value),
                _ => elements.iter().any(|element| self.test(element)),
            },
            Some(EntityValue::Record(_)) => false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Filter {
    Predicate(Predicate),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn matches(&self, entity: &Entity) -> bool {
        match self {
            Filter::Predicate(predicate) => predicate.matches(entity),
            Filter::And(children) => children.iter().all(|child| child.matches(entity)),
            Filter::Or(children) => children.iter().any(|child| child.matches(entity)),
        }
    }
    pub fn predicates(&self) -> Vec<&Predicate> {
        match self {
            Filter::Predicate(predicate) => vec![predicate],
            Filter::And(children) | Filter::Or(children) => {
                children.iter().flat_map(Filter::predicates).collect()
            }
        }
    }
}

/// Compiles an SQL `like` pattern: `%` is any run of characters, `_` exactly
/// one character, everything else matches literally. Compiled once per
/// [`Predicate`], which keeps the regex for the lifetime of its plan.
pub fn like_pattern(pattern: &str) -> Result<Regex> {
    let mut expression = String::from("(?s)^");
    for c in pattern.chars() {
        match c {
            '%' => expression.push_str(".*"),
            '_' => expression.push('.'),
            c => expression.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
        }
    }
    expression.push('$');
    Regex::new(&expression)
        .map_err(|e| TriadError::Validation(format!("invalid like pattern '{}': {}", pattern, e)))
}

// ------------- Planning -------------
#[derive(Debug, Clone)]
pub struct Plan {
    pub collection: String,
    pub schema: Option<CollectionSchema>,
    pub filter: Option<Filter>,
    pub order: Option<(AttributePath, Direction)>,
    pub limit: Option<usize>,
    pub after: Option<Cursor>,
    pub select: Option<Vec<AttributePath>>,
    pub entity_id: Option<String>,
}

fn check_operators(clauses: &[WhereClause]) -> Result<()> {
    for clause in clauses {
        match clause {
            WhereClause::Filter(_, operator, _) => {
                Operator::parse(operator)?;
            }
            WhereClause::Group { filters, .. } => check_operators(filters)?,
        }
    }
    Ok(())
}

fn compile(clause: &WhereClause, schema: Option<&CollectionSchema>) -> Result<Filter> {
    match clause {
        WhereClause::Filter(path, operator, value) => {
            let operator = Operator::parse(operator)?;
            let path = AttributePath::parse(path);
            if let Some(schema) = schema {
                if let Some(kind) = schema.attribute_type(&path)? {
                    if let AttributeType::Record { .. } = kind {
                        return Err(TriadError::NonTerminalPath { path: path.dotted() });
                    }
                    if !kind.accepts(value) {
                        return Err(TriadError::Validation(format!(
                            "attribute '{}' is {}, cannot compare with {}",
                            path,
                            kind.data_type(),
                            value.data_type()
                        )));
                    }
                }
            }
            Ok(Filter::Predicate(Predicate::new(path, operator, value.clone())?))
        }
        WhereClause::Group { modifier, filters } => {
            let children = filters
                .iter()
                .map(|child| compile(child, schema))
                .collect::<Result<Vec<_>>>()?;
            Ok(match modifier {
                Modifier::And => Filter::And(children),
                Modifier::Or => Filter::Or(children),
            })
        }
    }
}

/// Checks a descriptor against the schema and compiles it. Nothing here reads the store.
pub fn plan(query: &QueryDescriptor, schema: Option<&Schema>) -> Result<Plan> {
    check_operators(&query.filters)?;
    let schema = schema.and_then(|s| s.collection(&query.collection_name)).cloned();
    let filter = if query.filters.is_empty() {
        None
    } else {
        let mut children = query
            .filters
            .iter()
            .map(|clause| compile(clause, schema.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Some(if children.len() == 1 {
            children.remove(0)
        } else {
            Filter::And(children)
        })
    };
    let order = match &query.order {
        Some(OrderClause(path, direction)) => {
            let path = AttributePath::parse(path);
            if let Some(schema) = &schema {
                if let Some(AttributeType::Record { .. }) = schema.attribute_type(&path)? {
                    return Err(TriadError::NonTerminalPath { path: path.dotted() });
                }
            }
            Some((path, *direction))
        }
        None => None,
    };
    Ok(Plan {
        collection: query.collection_name.clone(),
        schema,
        filter,
        order,
        limit: query.limit,
        after: query.after.clone(),
        select: query
            .select
            .as_ref()
            .map(|paths| paths.iter().map(|p| AttributePath::parse(p)).collect()),
        entity_id: query.entity_id.clone(),
    })
}

// ------------- Execution -------------
/// Entities in result order, addressable by entity id.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct FetchResult {
    entities: Vec<Entity>,
    #[serde(skip)]
    positions: HashMap<String, usize>,
}

impl FetchResult {
    pub fn new(entities: Vec<Entity>) -> Self {
        let positions = entities
            .iter()
            .enumerate()
            .map(|(position, entity)| (entity.id().to_owned(), position))
            .collect();
        Self {
            entities,
            positions,
        }
    }
    pub fn get(&self, id: &str) -> Option<&Entity> {
        self.positions.get(id).map(|position| &self.entities[*position])
    }
    pub fn contains(&self, id: &str) -> bool {
        self.positions.contains_key(id)
    }
    pub fn len(&self) -> usize {
        self.entities.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
    pub fn ids(&self) -> Vec<&str> {
        self.entities.iter().map(Entity::id).collect()
    }
    pub fn iter(&self) -> std::slice::Iter<'_, Entity> {
        self.entities.iter()
    }
    pub fn first(&self) -> Option<&Entity> {
        self.entities.first()
    }
    pub fn last(&self) -> Option<&Entity> {
        self.entities.last()
    }
    pub fn into_entities(self) -> Vec<Entity> {
        self.entities
    }
    pub fn to_json(&self) -> Json {
        Json::Array(self.entities.iter().map(Entity::to_json).collect())
    }
}

impl<'a> IntoIterator for &'a FetchResult {
    type Item = &'a Entity;
    type IntoIter = std::slice::Iter<'a, Entity>;
    fn into_iter(self) -> Self::IntoIter {
        self.entities.iter()
    }
}

fn sort_value<'e>(entity: &'e Entity, path: &AttributePath) -> Option<&'e Value> {
    entity
        .get_path(path)
        .and_then(EntityValue::as_scalar)
        .filter(|v| !v.is_null())
}

// Missing values sort last in either direction, ties break on the entity id.
fn compare_keys(a: (Option<&Value>, &str), b: (Option<&Value>, &str), direction: Direction) -> Ordering {
    let by_value = match (a.0, b.0) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(x), Some(y)) => match direction {
            Direction::Asc => x.cmp(y),
            Direction::Desc => y.cmp(x),
        },
    };
    by_value.then_with(|| a.1.cmp(b.1))
}

fn sort_key<'e>(entity: &'e Entity, order: &Option<(AttributePath, Direction)>) -> (Option<&'e Value>, &'e str) {
    match order {
        Some((path, _)) => (sort_value(entity, path), entity.id()),
        None => (None, entity.id()),
    }
}

fn matching<S: TripleSource + ?Sized>(plan: &Plan, source: &S) -> Result<Vec<(EntityId, Entity)>> {
    if let Some(filter) = &plan.filter {
        for predicate in filter.predicates() {
            if source.non_terminal(&plan.collection, &predicate.path) {
                return Err(TriadError::NonTerminalPath {
                    path: predicate.path.dotted(),
                });
            }
        }
    }
    let ids: Vec<EntityId> = match &plan.entity_id {
        Some(id) => vec![EntityId::new(plan.collection.as_str(), id.as_str())?],
        None => match plan
            .filter
            .as_ref()
            .and_then(|f| source.candidates(&plan.collection, f))
        {
            Some(candidates) => candidates.into_iter().collect(),
            None => source.entities(&plan.collection),
        },
    };
    let considered = ids.len();
    let mut found = Vec::new();
    for id in ids {
        let Some(entity) = materialize(&id, source.triples(&id), plan.schema.as_ref())? else {
            continue;
        };
        if plan.filter.as_ref().is_none_or(|f| f.matches(&entity)) {
            found.push((id, entity));
        }
    }
    debug!(
        collection = %plan.collection,
        considered,
        matched = found.len(),
        "Evaluated filter"
    );
    Ok(found)
}

pub fn execute<S: TripleSource + ?Sized>(plan: &Plan, source: &S) -> Result<FetchResult> {
    Ok(FetchResult::new(
        window(plan, source)?.into_iter().map(|(_, e)| e).collect(),
    ))
}

/// The matching entities after ordering and pagination, before projection.
fn ordered<S: TripleSource + ?Sized>(plan: &Plan, source: &S) -> Result<Vec<(EntityId, Entity)>> {
    let mut found = matching(plan, source)?;
    let direction = plan.order.as_ref().map(|(_, d)| *d).unwrap_or(Direction::Asc);
    found.sort_by(|(_, a), (_, b)| compare_keys(sort_key(a, &plan.order), sort_key(b, &plan.order), direction));
    if let Some(Cursor(value, id)) = &plan.after {
        let cursor = match (&plan.order, value.is_null()) {
            (Some(_), false) => (Some(value), id.as_str()),
            _ => (None, id.as_str()),
        };
        found.retain(|(_, e)| compare_keys(sort_key(e, &plan.order), cursor, direction) == Ordering::Greater);
    }
    if let Some(limit) = plan.limit {
        found.truncate(limit);
    }
    Ok(found)
}

fn window<S: TripleSource + ?Sized>(plan: &Plan, source: &S) -> Result<Vec<(EntityId, Entity)>> {
    let mut found = ordered(plan, source)?;
    if let Some(paths) = &plan.select {
        for (_, entity) in found.iter_mut() {
            *entity = entity.select(paths);
        }
    }
    Ok(found)
}

/// Plans and executes a query against a source, using the source's schema.
pub fn fetch<S: TripleSource + ?Sized>(source: &S, query: &QueryDescriptor) -> Result<FetchResult> {
    let schema = source.schema()?;
    let plan = plan(query, schema.as_ref())?;
    execute(&plan, source)
}

/// Entity ids in the query window, in result order.
pub fn window_ids<S: TripleSource + ?Sized>(plan: &Plan, source: &S) -> Result<Vec<EntityId>> {
    Ok(ordered(plan, source)?.into_iter().map(|(id, _)| id).collect())
}

/// Every triple of the entities matching a query.
pub fn fetch_triples<S: TripleSource + ?Sized>(source: &S, query: &QueryDescriptor) -> Result<Vec<Triple>> {
    let schema = source.schema()?;
    let plan = plan(query, schema.as_ref())?;
    let mut triples = Vec::new();
    for id in window_ids(&plan, source)? {
        triples.extend(source.triples(&id).into_iter().cloned());
    }
    Ok(triples)
}
