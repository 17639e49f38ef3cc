use serde_json::json;
use triad::construct::EntityId;
use triad::database::{Database, DatabaseOptions};
use triad::datatype::{AttributeDefinition, Value};
use triad::query::{Direction, FetchResult, query};
use triad::schema::{CollectionSchema, Schema};

const SCORES: [(i64, &str); 20] = [
    (80, "2023-04-16"),
    (76, "2023-03-06"),
    (95, "2023-04-20"),
    (87, "2023-04-21"),
    (75, "2023-04-09"),
    (70, "2023-05-28"),
    (80, "2023-03-16"),
    (78, "2023-05-01"),
    (70, "2023-04-23"),
    (76, "2023-04-06"),
    (99, "2023-03-24"),
    (73, "2023-03-13"),
    (87, "2023-04-12"),
    (99, "2023-03-17"),
    (87, "2023-04-24"),
    (96, "2023-03-26"),
    (91, "2023-05-07"),
    (75, "2023-04-17"),
    (98, "2023-05-28"),
    (96, "2023-05-24"),
];

fn setup() -> Database {
    let schema = Schema::new(1).with_collection(
        CollectionSchema::new("TestScores")
            .attribute("score", AttributeDefinition::number())
            .attribute("date", AttributeDefinition::string()),
    );
    let db = Database::with_options(DatabaseOptions {
        schema: Some(schema),
        ..DatabaseOptions::default()
    })
    .expect("db");
    for (score, date) in SCORES {
        db.insert("TestScores", json!({"score": score, "date": date}))
            .expect("insert");
    }
    db
}

fn scores(result: &FetchResult) -> Vec<f64> {
    result
        .iter()
        .map(|e| e.value("score").and_then(Value::as_f64).expect("score"))
        .collect()
}

fn page(db: &Database, direction: Direction, limit: usize, after: Option<&FetchResult>) -> FetchResult {
    let mut builder = query("TestScores").order("score", direction).limit(limit);
    if let Some(last) = after.and_then(FetchResult::last) {
        builder = builder.after(last.value("score").cloned().expect("score"), last.id());
    }
    db.fetch(&builder.build()).expect("query ok")
}

#[test]
fn order_by_desc() {
    let db = setup();
    let found = db
        .fetch(&query("TestScores").order("score", Direction::Desc).build())
        .expect("query ok");
    let scores = scores(&found);
    assert_eq!(scores.len(), SCORES.len());
    assert!(scores.windows(2).all(|w| w[0] >= w[1]));
}

#[test]
fn order_by_asc() {
    let db = setup();
    let found = db
        .fetch(&query("TestScores").order("score", Direction::Asc).build())
        .expect("query ok");
    let scores = scores(&found);
    assert_eq!(scores.len(), SCORES.len());
    assert!(scores.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn limit_truncates_the_ordered_result() {
    let db = setup();
    let found = page(&db, Direction::Desc, 5, None);
    assert_eq!(scores(&found), vec![99.0, 99.0, 98.0, 96.0, 96.0]);
}

#[test]
fn second_page_continues_the_first() {
    let db = setup();
    for direction in [Direction::Asc, Direction::Desc] {
        let first = page(&db, direction, 5, None);
        let second = page(&db, direction, 5, Some(&first));
        let both = page(&db, direction, 10, None);
        let mut concatenated: Vec<&str> = first.ids();
        concatenated.extend(second.ids());
        assert_eq!(concatenated, both.ids(), "{direction:?}");
    }
}

#[test]
fn paging_to_the_end_visits_every_entity_once() {
    let db = setup();
    let everything = db
        .fetch(&query("TestScores").order("score", Direction::Asc).build())
        .expect("query ok");
    let mut visited: Vec<String> = Vec::new();
    let mut previous: Option<FetchResult> = None;
    loop {
        let next = page(&db, Direction::Asc, 3, previous.as_ref());
        if next.is_empty() {
            break;
        }
        visited.extend(next.ids().into_iter().map(str::to_owned));
        previous = Some(next);
    }
    assert_eq!(visited, everything.ids());
}

#[test]
fn missing_values_sort_last_in_both_directions() {
    let db = setup();
    db.insert_with_id("TestScores", "unscored", json!({"date": "2023-06-01"}))
        .expect("insert");
    for direction in [Direction::Asc, Direction::Desc] {
        let found = db
            .fetch(&query("TestScores").order("score", direction).build())
            .expect("query ok");
        assert_eq!(found.last().map(|e| e.id()), Some("unscored"));
    }
}

#[test]
fn query_triples_returns_raw_facts_of_the_window() {
    let db = setup();
    let descriptor = query("TestScores").order("score", Direction::Desc).limit(2).build();
    let window = db.fetch(&descriptor).expect("query ok");
    let triples = db.query_triples(&descriptor).expect("triples");
    // marker, id, score and date per entity
    assert_eq!(triples.len(), 8);
    for triple in &triples {
        let entity: &EntityId = &triple.entity;
        assert!(window.contains(entity.id()));
    }
}
