use serde_json::json;
use triad::TriadError;
use triad::database::{Database, DatabaseOptions};
use triad::datatype::AttributeDefinition;
use triad::schema::{CollectionSchema, Migration, MigrationDirection, Schema};

fn school_migrations() -> Vec<Migration> {
    serde_json::from_value(json!([
        {
            "parent": 0,
            "version": 1,
            "up": [["create_collection", {
                "name": "students",
                "attributes": {"id": {"type": "number"}, "name": {"type": "string"}}
            }]],
            "down": [["drop_collection", {"name": "students"}]]
        },
        {
            "parent": 1,
            "version": 2,
            "up": [["create_collection", {
                "name": "classes",
                "attributes": {"id": {"type": "number"}, "department": {"type": "string"}}
            }]],
            "down": [["drop_collection", {"name": "classes"}]]
        }
    ]))
    .expect("migrations")
}

fn open_with(migrations: Vec<Migration>) -> Database {
    Database::with_options(DatabaseOptions {
        migrations,
        ..DatabaseOptions::default()
    })
    .expect("db")
}

fn edges(pairs: &[(u64, u64)]) -> Vec<Migration> {
    pairs
        .iter()
        .map(|&(parent, version)| Migration::new(parent, version))
        .collect()
}

#[test]
fn initializing_with_migrations_sets_the_schema() {
    let db = open_with(school_migrations());
    let schema = db.get_schema().expect("schema");
    assert!(schema.collection("students").is_some());
    assert!(schema.collection("classes").is_some());
    assert_eq!(schema.version, 2);
}

#[test]
fn a_failing_migration_stops_and_rolls_back() {
    let mut migrations = school_migrations();
    migrations[1].up.push(serde_json::from_value(json!(["bad_op", {"arg": "foo"}])).expect("operation"));
    let db = open_with(migrations.clone());
    let schema = db.get_schema().expect("schema");
    assert!(schema.collection("students").is_some());
    assert!(schema.collection("classes").is_none());
    assert_eq!(schema.version, 1);

    let report = db.migrate(&migrations, MigrationDirection::Up).expect("report");
    assert_eq!((report.from, report.to), (1, 1));
    assert!(report.applied.is_empty());
    assert!(matches!(
        report.failure,
        Some(TriadError::MigrationApply { version: 2, ref operation, .. }) if operation == "bad_op"
    ));
}

#[test]
fn migrations_follow_parent_pointers() {
    let linked = open_with(edges(&[(0, 1), (1, 2), (2, 3), (3, 4)]));
    let unlinked = open_with(edges(&[(0, 1), (1, 2), (1, 3), (3, 4)]));
    let all = open_with(edges(&[(0, 1), (1, 2), (1, 3), (2, 3), (3, 4)]));
    assert_eq!(linked.schema_version().expect("version"), 4);
    assert_eq!(unlinked.schema_version().expect("version"), 2);
    assert_eq!(all.schema_version().expect("version"), 4);

    let to_five = edges(&[(4, 5)]);
    let from_three = edges(&[(3, 5)]);

    all.migrate(&from_three, MigrationDirection::Up).expect("up");
    assert_eq!(all.schema_version().expect("version"), 4);
    let report = all.migrate(&to_five, MigrationDirection::Up).expect("up");
    assert_eq!(report.applied, vec![5]);
    assert_eq!(all.schema_version().expect("version"), 5);

    all.migrate(&to_five, MigrationDirection::Down).expect("down");
    assert_eq!(all.schema_version().expect("version"), 4);
    let report = all.migrate(&from_three, MigrationDirection::Down).expect("down");
    assert!(report.applied.is_empty());
    assert_eq!(all.schema_version().expect("version"), 4);
}

#[test]
fn down_runs_the_reverse_operations() {
    let db = open_with(school_migrations());
    db.migrate(&school_migrations(), MigrationDirection::Down).expect("down");
    let schema = db.get_schema().expect("schema");
    assert_eq!(schema.version, 1);
    assert!(schema.collection("classes").is_none());
    assert!(schema.collection("students").is_some());
}

#[test]
fn migrated_collections_validate_writes() {
    let db = open_with(school_migrations());
    db.insert("students", json!({"id": 1, "name": "Alice"}))
        .expect("insert");
    let err = db
        .insert("students", json!({"id": 2, "name": 42}))
        .unwrap_err();
    assert!(matches!(err, TriadError::Validation(_)));
}

#[test]
fn clear_removes_all_data() {
    let schema = Schema::new(1).with_collection(
        CollectionSchema::new("students")
            .attribute("id", AttributeDefinition::number())
            .attribute("name", AttributeDefinition::string()),
    );
    let db = Database::with_options(DatabaseOptions {
        schema: Some(schema),
        ..DatabaseOptions::default()
    })
    .expect("db");
    db.insert("students", json!({"id": 1, "name": "Alice"}))
        .expect("insert");
    assert_ne!(db.triple_count().expect("count"), 0);

    db.clear().expect("clear");
    assert_eq!(db.triple_count().expect("count"), 0);
    assert_eq!(db.schema_version().expect("version"), 0);
    assert!(db.fetch_by_id("students", "1").expect("fetch").is_none());
}
