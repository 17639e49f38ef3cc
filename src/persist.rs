// used for persistence
use rusqlite::{Connection, params};

use crate::construct::{AttributePath, EntityId, Timestamp, Triple, TripleValue};
use crate::datatype::{BooleanType, DataType, NumberType, StringType, Value};
use crate::error::{Result, TriadError};

/// Where the triple log lives.
#[derive(Debug, Clone)]
pub enum PersistenceMode {
    InMemory,
    File(String),
}

impl PersistenceMode {
    pub fn open(&self) -> Result<Box<dyn Storage>> {
        match self {
            PersistenceMode::InMemory => Ok(Box::new(MemoryStorage::default())),
            PersistenceMode::File(path) => Ok(Box::new(SqliteStorage::open(path)?)),
        }
    }
}

/// Durable backend behind the triple store. Batches are appended whole or not at all.
pub trait Storage: Send {
    fn load(&mut self) -> Result<Vec<Triple>>;
    fn append(&mut self, triples: &[Triple]) -> Result<()>;
    fn clear(&mut self) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    triples: Vec<Triple>,
}

impl Storage for MemoryStorage {
    fn load(&mut self) -> Result<Vec<Triple>> {
        Ok(self.triples.clone())
    }
    fn append(&mut self, triples: &[Triple]) -> Result<()> {
        self.triples.extend_from_slice(triples);
        Ok(())
    }
    fn clear(&mut self) -> Result<()> {
        self.triples.clear();
        Ok(())
    }
}

// ------------- SQLite -------------
const KIND_VALUE: u8 = 0;
const KIND_ELEMENT: u8 = 1;
const KIND_TOMBSTONE: u8 = 2;

pub struct SqliteStorage {
    connection: Connection,
    sequence: i64,
}

impl SqliteStorage {
    pub fn open(path: &str) -> Result<Self> {
        Self::with_connection(Connection::open(path)?)
    }
    pub fn with_connection(connection: Connection) -> Result<Self> {
        // The "STRICT" keyword breaks JDBC connections, which makes
        // debugging using an external tool like DBeaver impossible
        connection.execute_batch(
            "
            create table if not exists DataType (
                DataType_Identity integer not null,
                DataType text not null,
                constraint referenceable_DataType_Identity primary key (
                    DataType_Identity
                ),
                constraint unique_DataType unique (
                    DataType
                )
            );-- STRICT;
            create table if not exists Triple (
                Sequence integer not null,
                Collection text not null,
                Entity text not null,
                Attribute text not null,
                Kind integer not null,
                -- untyped, so text such as '01234' is never coerced to a number
                Value null,
                ValueType_Identity integer not null,
                Present integer not null,
                Counter integer not null,
                Client text not null,
                constraint referenceable_Sequence primary key (
                    Sequence
                ),
                constraint ValueType_is_DataType foreign key (
                    ValueType_Identity
                ) references DataType(DataType_Identity)
            );-- STRICT;
            create index if not exists Triple_by_Entity on Triple (
                Collection,
                Entity
            );
            ",
        )?;
        {
            let mut add_data_type = connection.prepare_cached(
                "
                insert or ignore into DataType (
                    DataType_Identity,
                    DataType
                ) values (?, ?)
            ",
            )?;
            add_data_type.execute(params![0u8, "null"])?;
            add_data_type.execute(params![BooleanType::UID, BooleanType::DATA_TYPE])?;
            add_data_type.execute(params![NumberType::UID, NumberType::DATA_TYPE])?;
            add_data_type.execute(params![StringType::UID, StringType::DATA_TYPE])?;
        }
        let sequence = connection.query_row("select coalesce(max(Sequence), 0) from Triple", [], |r| {
            r.get::<_, i64>(0)
        })?;
        Ok(Self {
            connection,
            sequence,
        })
    }
}

impl Storage for SqliteStorage {
    fn load(&mut self) -> Result<Vec<Triple>> {
        let mut all_triples = self.connection.prepare_cached(
            "
            select Collection,
                    Entity,
                    Attribute,
                    Kind,
                    Value,
                    ValueType_Identity,
                    Present,
                    Counter,
                    Client
                from Triple
                order by Sequence
        ",
        )?;
        let mut rows = all_triples.query([])?;
        let mut triples = Vec::new();
        while let Some(row) = rows.next()? {
            let collection: String = row.get(0)?;
            let entity: String = row.get(1)?;
            let attribute: String = row.get(2)?;
            let kind: u8 = row.get(3)?;
            let value_type: u8 = row.get(5)?;
            let value = Value::convert(value_type, &row.get_ref(4)?)?;
            let present: bool = row.get(6)?;
            let counter: i64 = row.get(7)?;
            let client: String = row.get(8)?;
            let value = match kind {
                KIND_VALUE => TripleValue::Value(value),
                KIND_ELEMENT => TripleValue::Element {
                    element: value,
                    present,
                },
                KIND_TOMBSTONE => TripleValue::Tombstone,
                other => {
                    return Err(TriadError::Persistence(format!(
                        "unknown triple kind {other}"
                    )));
                }
            };
            triples.push(Triple::new(
                EntityId::new(collection, entity)?,
                serde_json::from_str::<AttributePath>(&attribute)?,
                value,
                Timestamp::new(counter as u64, client),
            ));
        }
        Ok(triples)
    }
    fn append(&mut self, triples: &[Triple]) -> Result<()> {
        let transaction = self.connection.transaction()?;
        let mut sequence = self.sequence;
        {
            let mut add_triple = transaction.prepare_cached(
                "
                insert into Triple (
                    Sequence,
                    Collection,
                    Entity,
                    Attribute,
                    Kind,
                    Value,
                    ValueType_Identity,
                    Present,
                    Counter,
                    Client
                ) values (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
            )?;
            for triple in triples {
                sequence += 1;
                let (kind, value, present) = match &triple.value {
                    TripleValue::Value(v) => (KIND_VALUE, v.clone(), true),
                    TripleValue::Element { element, present } => (KIND_ELEMENT, element.clone(), *present),
                    TripleValue::Tombstone => (KIND_TOMBSTONE, Value::Null, false),
                };
                add_triple.execute(params![
                    sequence,
                    triple.entity.collection(),
                    triple.entity.id(),
                    serde_json::to_string(&triple.attribute)?,
                    kind,
                    &value,
                    value.uid(),
                    present,
                    triple.timestamp.counter as i64,
                    &triple.timestamp.client,
                ])?;
            }
        }
        transaction.commit()?;
        self.sequence = sequence;
        Ok(())
    }
    fn clear(&mut self) -> Result<()> {
        self.connection.execute("delete from Triple", [])?;
        self.sequence = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triple(attribute: &str, value: TripleValue, counter: u64) -> Triple {
        Triple::new(
            EntityId::new("people", "1").unwrap(),
            AttributePath::parse(attribute),
            value,
            Timestamp::new(counter, "client"),
        )
    }

    #[test]
    fn sqlite_restores_every_kind_of_triple() {
        let mut storage = SqliteStorage::with_connection(Connection::open_in_memory().unwrap()).unwrap();
        let written = vec![
            triple("name", TripleValue::Value(Value::from("Alice")), 1),
            triple("age", TripleValue::Value(Value::from(31)), 1),
            triple("active", TripleValue::Value(Value::from(true)), 1),
            triple("nickname", TripleValue::Value(Value::Null), 1),
            triple("zip", TripleValue::Value(Value::from("01234")), 1),
            triple("price", TripleValue::Value(Value::from("1.50")), 1),
            triple(
                "tags",
                TripleValue::Element {
                    element: Value::from("x"),
                    present: false,
                },
                2,
            ),
            triple("address.city", TripleValue::Tombstone, 3),
        ];
        storage.append(&written[..4]).unwrap();
        storage.append(&written[4..]).unwrap();
        assert_eq!(storage.load().unwrap(), written);

        storage.clear().unwrap();
        assert!(storage.load().unwrap().is_empty());
    }
}
