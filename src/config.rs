// config lets you read a separate config file
use ::config::{Config, Environment, File};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use crate::database::DatabaseOptions;
use crate::error::{Result, TriadError};
use crate::persist::PersistenceMode;
use crate::schema::Migration;

fn default_log_filter() -> String {
    "info".to_owned()
}

/// Settings read from `triad.{toml,json,yaml}` and `TRIAD_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file; the database is kept in memory when absent.
    #[serde(default)]
    pub database_path: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    /// JSON array of migrations applied on open.
    #[serde(default)]
    pub migrations_path: Option<String>,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            client_id: None,
            migrations_path: None,
            log_filter: default_log_filter(),
        }
    }
}

impl DatabaseConfig {
    pub fn load() -> Result<Self> {
        Self::load_from("triad")
    }
    /// Reads the named file if it exists, then lets the environment override it.
    pub fn load_from(name: &str) -> Result<Self> {
        let settings = Config::builder()
            .set_default("log_filter", default_log_filter())?
            .add_source(File::with_name(name).required(false))
            .add_source(Environment::with_prefix("TRIAD"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }
    pub fn persistence_mode(&self) -> PersistenceMode {
        match &self.database_path {
            Some(path) => PersistenceMode::File(path.clone()),
            None => PersistenceMode::InMemory,
        }
    }
    pub fn load_migrations(&self) -> Result<Vec<Migration>> {
        let Some(path) = &self.migrations_path else {
            return Ok(Vec::new());
        };
        let text = std::fs::read_to_string(path)
            .map_err(|e| TriadError::Config(format!("cannot read migrations from '{}': {}", path, e)))?;
        Ok(serde_json::from_str(&text)?)
    }
    pub fn options(&self) -> Result<DatabaseOptions> {
        Ok(DatabaseOptions {
            persistence: self.persistence_mode(),
            client_id: self.client_id.clone(),
            schema: None,
            migrations: self.load_migrations()?,
        })
    }
}

/// Installs the fmt subscriber. `RUST_LOG` takes precedence over `default_filter`.
pub fn init_tracing(default_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| TriadError::Config(e.to_string()))
}
