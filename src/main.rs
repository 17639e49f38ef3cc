//! Maintenance binary: opens the configured database, applies pending
//! migrations, reports collection statistics and then answers JSON query
//! descriptors read from stdin, one per line.

use std::io::{self, BufRead, Write};

use tracing::{error, info};

use triad::config::{DatabaseConfig, init_tracing};
use triad::query::QueryDescriptor;
use triad::{Database, Result, TriadError};

fn answer(database: &Database, line: &str) -> Result<String> {
    let query: QueryDescriptor = serde_json::from_str(line)?;
    Ok(database.fetch(&query)?.to_json().to_string())
}

fn main() -> Result<()> {
    let config = DatabaseConfig::load()?;
    init_tracing(&config.log_filter)?;
    let database = Database::with_options(config.options()?)?;
    info!(
        version = database.schema_version()?,
        triples = database.triple_count()?,
        "Database ready"
    );
    for (collection, entities) in database.collection_stats()? {
        info!(%collection, entities, "Collection");
    }

    let io_error = |e: io::Error| TriadError::Execution(e.to_string());
    let mut stdout = io::stdout().lock();
    for line in io::stdin().lock().lines() {
        let line = line.map_err(io_error)?;
        if line.trim().is_empty() {
            continue;
        }
        match answer(&database, &line) {
            Ok(json) => writeln!(stdout, "{}", json).map_err(io_error)?,
            Err(e) => error!(error = %e, "Query failed"),
        }
    }
    Ok(())
}
