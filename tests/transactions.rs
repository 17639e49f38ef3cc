mod common;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde_json::json;
use triad::TriadError;
use triad::database::Database;
use triad::datatype::Value;
use triad::query::query;
use triad::transaction::{Patch, TransactionState};

fn setup() -> Database {
    let db = Database::in_memory().expect("db");
    common::insert_all(&db, "Student", common::students());
    db
}

#[test]
fn commits_implicitly_when_the_callback_returns() {
    let db = setup();
    let outside = db.clone();
    let result = db
        .transact(|tx| {
            tx.insert("Student", json!({"id": "8", "name": "Frank", "major": "Astronomy"}))?;
            // read-your-writes inside, committed state outside
            assert!(tx.fetch_by_id("Student", "8")?.is_some());
            assert!(outside.fetch_by_id("Student", "8")?.is_none());
            Ok("done")
        })
        .expect("transaction");
    assert_eq!(result.output, "done");
    assert_eq!(result.state, TransactionState::Committed);
    assert!(db.fetch_by_id("Student", "8").expect("fetch").is_some());
}

#[test]
fn cancel_leaves_the_store_unchanged() {
    let db = setup();
    let before = db.triple_count().expect("count");
    let result = db
        .transact(|tx| {
            tx.insert("Student", json!({"id": "8", "name": "Frank"}))?;
            tx.cancel();
            assert!(tx.insert("Student", json!({"id": "9", "name": "Grace"})).is_err());
            Ok(())
        })
        .expect("transaction");
    assert_eq!(result.state, TransactionState::Cancelled);
    assert_eq!(db.triple_count().expect("count"), before);
    assert!(db.fetch_by_id("Student", "8").expect("fetch").is_none());
}

#[test]
fn commit_inside_the_callback_is_illegal() {
    let db = setup();
    let err = db
        .transact(|tx| {
            tx.insert("Student", json!({"id": "8", "name": "Frank"}))?;
            tx.commit()
        })
        .unwrap_err();
    assert!(matches!(err, TriadError::IllegalCommit));

    // swallowing the error does not help either
    let err = db
        .transact(|tx| {
            tx.insert("Student", json!({"id": "8", "name": "Frank"}))?;
            let _ = tx.commit();
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(err, TriadError::IllegalCommit));
    assert!(db.fetch_by_id("Student", "8").expect("fetch").is_none());
}

#[test]
fn errors_roll_back_and_propagate() {
    let db = setup();
    let before = db.triple_count().expect("count");
    let err = db
        .transact(|tx| -> triad::Result<()> {
            tx.insert("Student", json!({"id": "8", "name": "Frank"}))?;
            tx.delete("Student", "1")?;
            Err(TriadError::Validation("changed my mind".into()))
        })
        .unwrap_err();
    assert!(matches!(err, TriadError::Validation(_)));
    assert_eq!(db.triple_count().expect("count"), before);
    assert!(db.fetch_by_id("Student", "1").expect("fetch").is_some());
}

#[test]
fn fetch_by_id_inside_a_transaction() {
    let db = setup();
    db.transact(|tx| {
        let john = tx.fetch_by_id("Student", "1")?.expect("John");
        assert_eq!(john.value("name"), Some(&Value::from("John Doe")));
        tx.delete("Student", "1")?;
        assert!(tx.fetch_by_id("Student", "1")?.is_none());
        Ok(())
    })
    .expect("transaction");
    assert!(db.fetch_by_id("Student", "1").expect("fetch").is_none());
}

#[test]
fn update_inside_a_transaction() {
    let db = setup();
    db.transact(|tx| {
        tx.update("Student", "1", |student| {
            assert_eq!(student.current().value("dorm"), Some(&Value::from("Allen")));
            student.set("name", "Johnathan Doe").delete("dorm");
            Ok(())
        })?;
        let john = tx.fetch_by_id("Student", "1")?.expect("John");
        assert_eq!(john.value("name"), Some(&Value::from("Johnathan Doe")));
        assert!(john.get("dorm").is_none());
        Ok(())
    })
    .expect("transaction");
    let found = db
        .fetch(&query("Student").filter("name", "=", "Johnathan Doe").build())
        .expect("query ok");
    assert_eq!(found.ids(), vec!["1"]);
    assert!(
        db.fetch(&query("Student").filter("name", "=", "John Doe").build())
            .expect("query ok")
            .is_empty()
    );
}

#[test]
fn updating_a_missing_entity_fails() {
    let db = setup();
    let err = db
        .update("Student", "42", |student| {
            student.set("name", "Nobody");
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(err, TriadError::EntityNotFound { .. }));
}

#[test]
fn write_batches_apply_in_order() {
    let db = setup();
    let patches: Vec<Patch> = serde_json::from_value(json!([
        ["set", "name", "J. Doe"],
        ["set", "address", {"city": "Oslo", "zip": "0150"}],
        ["delete", "dorm"],
        ["set", "address.city", "Bergen"]
    ]))
    .expect("patches");
    db.apply("Student", "1", &patches).expect("apply");
    let john = db.fetch_by_id("Student", "1").expect("fetch").expect("John");
    assert_eq!(john.value("name"), Some(&Value::from("J. Doe")));
    assert_eq!(john.value("address.city"), Some(&Value::from("Bergen")));
    assert_eq!(john.value("address.zip"), Some(&Value::from("0150")));
    assert!(john.get("dorm").is_none());
}

#[test]
fn inserting_again_replaces_the_entity() {
    let db = setup();
    db.insert("Student", json!({"id": "1", "name": "John Doe"}))
        .expect("insert");
    let john = db.fetch_by_id("Student", "1").expect("fetch").expect("John");
    assert!(john.get("dorm").is_none());
    assert!(john.get("major").is_none());
}

#[test]
fn unchanged_writes_are_not_recorded() {
    let db = setup();
    let before = db.triple_count().expect("count");
    let commits = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&commits);
    db.on_commit(move |_| *counter.lock().expect("counter") += 1)
        .expect("listener");
    db.insert("Student", common::students()[0].clone())
        .expect("insert");
    assert_eq!(db.triple_count().expect("count"), before);
    assert_eq!(*commits.lock().expect("counter"), 0);
}

#[test]
fn generated_ids_are_returned() {
    let db = setup();
    let id = db.insert("Student", json!({"name": "Anonymous"})).expect("insert");
    assert!(!id.is_empty());
    let student = db.fetch_by_id("Student", &id).expect("fetch").expect("student");
    assert_eq!(student.value("id"), Some(&Value::from(id.as_str())));
}

#[test]
fn bulk_insert_commits_once() {
    let db = Database::in_memory().expect("db");
    let commits = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&commits);
    db.on_commit(move |commit| seen.lock().expect("commits").push(commit.collections.clone()))
        .expect("listener");
    let mut documents = BTreeMap::new();
    documents.insert("Student".to_owned(), common::students());
    documents.insert("Department".to_owned(), common::departments());
    let ids = db.bulk_insert(documents).expect("bulk insert");
    assert_eq!(ids["Student"].len(), common::students().len());
    assert_eq!(ids["Department"].len(), common::departments().len());
    let commits = commits.lock().expect("commits");
    assert_eq!(commits.len(), 1);
    assert!(commits[0].contains("Student") && commits[0].contains("Department"));
}

#[test]
fn insert_listeners_see_committed_triples() {
    let db = setup();
    let inserted = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&inserted);
    db.on_insert(move |triples| sink.lock().expect("sink").extend(triples.iter().cloned()))
        .expect("listener");
    db.transact(|tx| {
        tx.insert("Student", json!({"id": "8", "name": "Frank"}))?;
        tx.cancel();
        Ok(())
    })
    .expect("cancelled");
    assert!(inserted.lock().expect("sink").is_empty());
    db.insert("Student", json!({"id": "8", "name": "Frank"}))
        .expect("insert");
    // marker, id and name
    assert_eq!(inserted.lock().expect("sink").len(), 3);
}
