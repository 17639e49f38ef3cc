//! Triad – an embeddable, timestamped triple store.
//!
//! Every fact is a [`construct::Triple`]: an entity, an attribute path, a value
//! and a logical [`construct::Timestamp`]. Entities are never stored as such;
//! they are materialized on demand from the live triples sharing an entity id,
//! and shaped by their collection's schema when one is declared.
//!
//! * A [`construct::Timestamp`] is a `(counter, client)` pair, totally ordered,
//!   so for every attribute path the triple with the greatest timestamp wins.
//! * Sets are stored one fact per element, which lets additions and removals of
//!   different elements resolve independently.
//! * Deletes are tombstone triples; nothing is ever mutated in place.
//!
//! ## Modules
//! * [`construct`] – timestamps, entity ids, attribute paths, triples and last-writer-wins resolution.
//! * [`datatype`] – scalar values and the closed set of attribute declarations.
//! * [`persist`] – the pluggable storage backend (memory or SQLite).
//! * [`store`] – the triple store and its indexes.
//! * [`materialize`] – folding triples into entities.
//! * [`query`] – query descriptors, planning and execution.
//! * [`transaction`] – isolated staged writes with implicit commit.
//! * [`schema`] – schema metadata and migrations.
//! * [`subscription`] – live queries recomputed on commit.
//! * [`database`] – the facade wiring everything together.
//! * [`interface`] – an async facade for tokio applications.
//! * [`config`] – settings files, environment overrides and tracing setup.
//!
//! ## Quick Start
//! ```
//! use serde_json::json;
//! use triad::{database::Database, query::query};
//! let db = Database::in_memory().unwrap();
//! db.insert("students", json!({"id": "1", "name": "John Doe"})).unwrap();
//! let found = db.fetch(&query("students").filter("name", "like", "John%").build()).unwrap();
//! assert_eq!(found.ids(), vec!["1"]);
//! ```

pub mod config;
pub mod construct;
pub mod database;
pub mod datatype;
pub mod error;
pub mod interface;
pub mod materialize;
pub mod persist;
pub mod query;
pub mod schema;
pub mod store;
pub mod subscription;
pub mod transaction;

pub use database::{Database, DatabaseOptions};
pub use error::{Result, TriadError};
