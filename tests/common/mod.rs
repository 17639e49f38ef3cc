#![allow(dead_code)]

use serde_json::{Value as Json, json};
use triad::Database;

pub fn students() -> Vec<Json> {
    vec![
        json!({"id": "1", "name": "John Doe", "major": "Mathematics", "dorm": "Allen"}),
        json!({"id": "2", "name": "Johnny Appleseed", "major": "Biology", "dorm": "Baker"}),
        json!({"id": "3", "name": "Jane Smith", "major": "Physics", "dorm": "Allen"}),
        json!({"id": "4", "name": "Annie Hall", "major": "History", "dorm": "Carter"}),
        json!({"id": "5", "name": "Charlie Brown", "major": "Mathematics", "dorm": "Baker"}),
        json!({"id": "6", "name": "Emily Stone", "major": "Art", "dorm": "Carter"}),
        json!({"id": "7", "name": "Bob Marley", "major": "Biology", "dorm": "Allen"}),
    ]
}

pub fn classes() -> Vec<Json> {
    vec![
        json!({"id": "1", "name": "Calculus I", "level": 100, "department": "Mathematics", "enrolled": ["1", "5"]}),
        json!({"id": "2", "name": "Calculus II", "level": 200, "department": "Mathematics", "enrolled": ["1"]}),
        json!({"id": "3", "name": "Mechanics", "level": 100, "department": "Physics", "enrolled": ["3"]}),
        json!({"id": "4", "name": "Quantum Mechanics", "level": 300, "department": "Physics", "enrolled": ["3", "7"]}),
        json!({"id": "5", "name": "World History", "level": 200, "department": "History", "enrolled": ["4"]}),
        json!({"id": "6", "name": "Genetics", "level": 300, "department": "Biology", "enrolled": ["2", "7"]}),
        json!({"id": "7", "name": "Ceramics", "level": 400, "department": "Art", "enrolled": ["6"]}),
    ]
}

pub fn departments() -> Vec<Json> {
    vec![
        json!({"id": "1", "name": "Mathematics"}),
        json!({"id": "2", "name": "Physics"}),
        json!({"id": "3", "name": "History"}),
        json!({"id": "4", "name": "Art"}),
        json!({"id": "5", "name": "Biology"}),
    ]
}

pub fn rappers() -> Vec<Json> {
    vec![
        json!({"id": 1, "name": "Ty Dolla $ign"}),
        json!({"id": 2, "name": "Boi-1da"}),
        json!({"id": 3, "name": "Mike Will Made-It"}),
        json!({"id": 4, "name": "Noah '40' Shebib"}),
        json!({"id": 5, "name": "The Notorious B.I.G."}),
        json!({"id": 6, "name": "Travis 'LaFlame' Scott"}),
    ]
}

pub fn insert_all(db: &Database, collection: &str, documents: Vec<Json>) {
    for document in documents {
        db.insert(collection, document).expect("insert");
    }
}

/// A schemaless database holding the school and rapper fixtures.
pub fn school() -> Database {
    let db = Database::in_memory().expect("db");
    insert_all(&db, "Student", students());
    insert_all(&db, "Class", classes());
    insert_all(&db, "Department", departments());
    insert_all(&db, "Rapper", rappers());
    db
}

/// Evaluates a predicate over the raw fixture documents, for comparison with query results.
pub fn reference_ids(documents: &[Json], keep: impl Fn(&Json) -> bool) -> Vec<String> {
    let mut ids: Vec<String> = documents
        .iter()
        .filter(|d| keep(d))
        .map(|d| match &d["id"] {
            Json::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect();
    ids.sort();
    ids
}
