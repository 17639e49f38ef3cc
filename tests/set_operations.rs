use std::collections::BTreeSet;

use serde_json::json;
use triad::TriadError;
use triad::database::{Database, DatabaseOptions};
use triad::datatype::{AttributeDefinition, AttributeType, Value};
use triad::materialize::EntityValue;
use triad::query::query;
use triad::schema::{CollectionSchema, Schema};

fn setup() -> Database {
    let schema = Schema::new(1).with_collection(
        CollectionSchema::new("companies")
            .attribute("id", AttributeDefinition::number())
            .attribute("name", AttributeDefinition::string())
            .attribute("employees", AttributeDefinition::set(AttributeType::Number)),
    );
    let db = Database::with_options(DatabaseOptions {
        schema: Some(schema),
        ..DatabaseOptions::default()
    })
    .expect("db");
    db.insert("companies", json!({"id": 1, "name": "Planet Express", "employees": [1, 2, 3]}))
        .expect("insert");
    db.insert("companies", json!({"id": 2, "name": "MomCorp", "employees": [4, 5, 6]}))
        .expect("insert");
    db
}

fn employing(db: &Database, employee: i64) -> Vec<String> {
    db.fetch(
        &query("companies")
            .select(&["id"])
            .filter("employees", "=", employee)
            .build(),
    )
    .expect("query ok")
    .ids()
    .into_iter()
    .map(str::to_owned)
    .collect()
}

fn employees(db: &Database, company: &str) -> BTreeSet<Value> {
    match db
        .fetch_by_id("companies", company)
        .expect("fetch")
        .expect("company")
        .get("employees")
    {
        Some(EntityValue::Set(elements)) => elements.clone(),
        other => panic!("expected a set, got {:?}", other),
    }
}

#[test]
fn add_to_set() {
    let db = setup();
    assert!(employing(&db, 7).is_empty());
    db.update("companies", "1", |company| {
        company.add("employees", 7);
        Ok(())
    })
    .expect("update");
    assert_eq!(employing(&db, 7), vec!["1"]);
    assert_eq!(employees(&db, "1").len(), 4);
}

#[test]
fn remove_from_set() {
    let db = setup();
    assert_eq!(employing(&db, 2), vec!["1"]);
    db.update("companies", "1", |company| {
        company.remove("employees", 2);
        Ok(())
    })
    .expect("update");
    assert!(employing(&db, 2).is_empty());
    let expected: BTreeSet<Value> = [1, 3].into_iter().map(Value::from).collect();
    assert_eq!(employees(&db, "1"), expected);
}

#[test]
fn element_writes_from_separate_transactions_merge() {
    let db = setup();
    db.update("companies", "2", |company| {
        company.add("employees", 7);
        Ok(())
    })
    .expect("update");
    db.update("companies", "2", |company| {
        company.add("employees", 8).remove("employees", 4);
        Ok(())
    })
    .expect("update");
    let expected: BTreeSet<Value> = [5, 6, 7, 8].into_iter().map(Value::from).collect();
    assert_eq!(employees(&db, "2"), expected);
}

#[test]
fn removed_elements_can_be_added_back() {
    let db = setup();
    db.update("companies", "1", |company| {
        company.remove("employees", 2);
        Ok(())
    })
    .expect("update");
    db.update("companies", "1", |company| {
        company.add("employees", 2);
        Ok(())
    })
    .expect("update");
    assert_eq!(employing(&db, 2), vec!["1"]);
}

#[test]
fn elements_must_match_the_declared_item_type() {
    let db = setup();
    let err = db
        .update("companies", "1", |company| {
            company.add("employees", "Fry");
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(err, TriadError::Validation(_)));

    let err = db
        .update("companies", "1", |company| {
            company.add("name", 7);
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(err, TriadError::Validation(_)));

    let err = db
        .insert("companies", json!({"id": 3, "name": "Slurm", "employees": ["Slurms"]}))
        .unwrap_err();
    assert!(matches!(err, TriadError::Validation(_)));
    assert_eq!(employees(&db, "1").len(), 3);
}

#[test]
fn untouched_sets_read_as_empty() {
    let db = setup();
    db.insert("companies", json!({"id": 3, "name": "Slurm"}))
        .expect("insert");
    assert!(employees(&db, "3").is_empty());
}

#[test]
fn sets_in_untyped_collections() {
    let db = Database::in_memory().expect("db");
    db.insert("crews", json!({"id": "1", "members": ["Leela", "Bender"]}))
        .expect("insert");
    db.update("crews", "1", |crew| {
        crew.add("members", "Fry");
        Ok(())
    })
    .expect("update");
    let found = db
        .fetch(&query("crews").filter("members", "=", "Fry").build())
        .expect("query ok");
    assert_eq!(found.ids(), vec!["1"]);
}

fn tagged(db: &Database, filter: (&str, &str)) -> Vec<String> {
    db.fetch(&query("things").filter("tag", filter.0, filter.1).build())
        .expect("query ok")
        .ids()
        .into_iter()
        .map(str::to_owned)
        .collect()
}

#[test]
fn rewriting_a_set_as_a_scalar_keeps_the_value_findable() {
    let db = Database::in_memory().expect("db");
    db.insert("things", json!({"id": "1", "tag": ["a"]}))
        .expect("insert");
    db.update("things", "1", |thing| {
        thing.set("tag", "a");
        Ok(())
    })
    .expect("update");
    let thing = db.fetch_by_id("things", "1").expect("fetch").expect("thing");
    assert_eq!(thing.value("tag"), Some(&Value::from("a")));
    assert_eq!(tagged(&db, ("=", "a")), vec!["1"]);
    assert_eq!(tagged(&db, (">=", "a")), vec!["1"]);
    assert_eq!(tagged(&db, ("like", "a%")), vec!["1"]);
}

#[test]
fn rewriting_a_scalar_as_a_set_keeps_the_value_findable() {
    let db = Database::in_memory().expect("db");
    db.insert("things", json!({"id": "1", "tag": "b"}))
        .expect("insert");
    db.update("things", "1", |thing| {
        thing.set("tag", json!(["b", "c"]));
        Ok(())
    })
    .expect("update");
    assert_eq!(tagged(&db, ("=", "b")), vec!["1"]);
    assert_eq!(tagged(&db, ("=", "c")), vec!["1"]);

    db.update("things", "1", |thing| {
        thing.set("tag", "c");
        Ok(())
    })
    .expect("update");
    assert!(tagged(&db, ("=", "b")).is_empty());
    assert_eq!(tagged(&db, ("=", "c")), vec!["1"]);
}
