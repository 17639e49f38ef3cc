use serde_json::json;
use triad::TriadError;
use triad::database::{Database, DatabaseOptions};
use triad::datatype::{AttributeDefinition, Value};
use triad::query::query;
use triad::schema::{CollectionSchema, Schema};

fn students_schema() -> Schema {
    Schema::new(1).with_collection(
        CollectionSchema::new("students")
            .attribute("id", AttributeDefinition::number())
            .attribute("name", AttributeDefinition::string()),
    )
}

fn setup() -> Database {
    let db = Database::with_options(DatabaseOptions {
        schema: Some(students_schema()),
        ..DatabaseOptions::default()
    })
    .expect("db");
    db.insert("students", json!({"id": 1, "name": "Alice"}))
        .expect("insert");
    db
}

#[test]
fn add_a_collection_definition() {
    let db = Database::in_memory().expect("db");
    db.create_collection(
        CollectionSchema::new("students")
            .attribute("id", AttributeDefinition::number())
            .attribute("name", AttributeDefinition::string()),
    )
    .expect("create");
    let schema = db.get_schema().expect("schema");
    let students = schema.collection("students").expect("students");
    assert!(students.attributes.contains_key("id"));
    assert!(students.attributes.contains_key("name"));

    let err = db
        .create_collection(CollectionSchema::new("students"))
        .unwrap_err();
    assert!(matches!(err, TriadError::Validation(_)));
}

#[test]
fn drop_a_collection_definition_keeps_the_data() {
    let db = setup();
    db.drop_collection("students").expect("drop");
    assert!(db.get_schema().expect("schema").collection("students").is_none());
    let alice = db.fetch_by_id("students", "1").expect("fetch").expect("Alice");
    assert_eq!(alice.value("name"), Some(&Value::from("Alice")));
    // untyped from now on
    db.insert("students", json!({"id": 2, "name": "Bob", "nickname": "B"}))
        .expect("insert");
}

#[test]
fn rename_an_attribute_moves_its_values() {
    let db = setup();
    db.rename_attribute("students", "id", "studentId").expect("rename");
    let schema = db.get_schema().expect("schema");
    let students = schema.collection("students").expect("students");
    assert!(students.attributes.contains_key("studentId"));
    assert!(students.attributes.contains_key("name"));
    assert!(!students.attributes.contains_key("id"));

    let found = db
        .fetch(&query("students").filter("studentId", "=", 1).build())
        .expect("query ok");
    assert_eq!(found.len(), 1);
    let alice = found.get("1").expect("Alice");
    assert_eq!(alice.value("studentId"), Some(&Value::from(1)));
}

#[test]
fn rename_to_an_existing_attribute_fails() {
    let db = setup();
    let err = db.rename_attribute("students", "id", "name").unwrap_err();
    assert!(matches!(err, TriadError::Validation(_)));
    // nothing moved
    let alice = db.fetch_by_id("students", "1").expect("fetch").expect("Alice");
    assert_eq!(alice.value("name"), Some(&Value::from("Alice")));
}

#[test]
fn add_an_attribute() {
    let db = setup();
    let err = db
        .insert("students", json!({"id": 2, "name": "Bob", "age": 21}))
        .unwrap_err();
    assert!(matches!(err, TriadError::Validation(_)));

    db.add_attribute("students", "age", AttributeDefinition::number())
        .expect("add");
    let schema = db.get_schema().expect("schema");
    let students = schema.collection("students").expect("students");
    assert!(students.attributes.contains_key("age"));
    assert!(students.attributes.contains_key("name"));

    db.insert("students", json!({"id": 2, "name": "Bob", "age": 21}))
        .expect("insert");
    let found = db
        .fetch(&query("students").filter("age", ">", 20).build())
        .expect("query ok");
    assert_eq!(found.ids(), vec!["2"]);
}

#[test]
fn add_a_nested_attribute() {
    let db = Database::in_memory().expect("db");
    db.create_collection(
        CollectionSchema::new("people").attribute(
            "address",
            AttributeDefinition::record([("city", AttributeDefinition::string())]),
        ),
    )
    .expect("create");
    db.add_attribute("people", "address.zip", AttributeDefinition::string())
        .expect("add");
    db.insert("people", json!({"id": "1", "address": {"city": "Oslo", "zip": "0150"}}))
        .expect("insert");
    let person = db.fetch_by_id("people", "1").expect("fetch").expect("person");
    assert_eq!(person.value("address.zip"), Some(&Value::from("0150")));

    let err = db
        .add_attribute("people", "address.city.block", AttributeDefinition::string())
        .unwrap_err();
    assert!(matches!(err, TriadError::Validation(_)));
}

#[test]
fn drop_an_attribute_hides_it_from_typed_reads() {
    let db = setup();
    let before = db.triple_count().expect("count");
    db.drop_attribute("students", "name").expect("drop");
    let schema = db.get_schema().expect("schema");
    let students = schema.collection("students").expect("students");
    assert!(!students.attributes.contains_key("name"));
    assert!(students.attributes.contains_key("id"));

    let alice = db.fetch_by_id("students", "1").expect("fetch").expect("Alice");
    assert!(alice.get("name").is_none());
    // the facts themselves stay; only schema metadata was rewritten
    assert!(db.triple_count().expect("count") >= before);

    let err = db.drop_attribute("students", "name").unwrap_err();
    assert!(matches!(err, TriadError::Validation(_)));
}

#[test]
fn schema_changes_bump_nothing_but_the_definition() {
    let db = setup();
    db.add_attribute("students", "age", AttributeDefinition::number())
        .expect("add");
    assert_eq!(db.schema_version().expect("version"), 1);
}
