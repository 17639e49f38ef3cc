use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TriadError {
    #[error("Invalid entity id '{id}': ids may not contain the '#' separator")]
    InvalidEntityId { id: String },
    #[error("Non-terminal path '{path}': the path is both a value and a prefix of another attribute")]
    NonTerminalPath { path: String },
    #[error("Unimplemented operator: {operator}")]
    UnimplementedOperator { operator: String },
    #[error("Entity not found: {collection}#{id}")]
    EntityNotFound { collection: String, id: String },
    #[error("Transactions commit when their callback returns; commit() may not be called inside it")]
    IllegalCommit,
    #[error("Migration to version {version} failed on '{operation}': {message}")]
    MigrationApply {
        version: u64,
        operation: String,
        message: String,
    },
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Execution error: {0}")]
    Execution(String),
    #[error("Internal invariant violated: {0}")]
    Invariant(String),
    #[error("Lock poisoned: {0}")]
    Lock(String),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

pub type Result<T> = std::result::Result<T, TriadError>;

// Helper conversions
impl From<rusqlite::Error> for TriadError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}
impl From<serde_json::Error> for TriadError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
impl From<::config::ConfigError> for TriadError {
    fn from(e: ::config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}
impl<T> From<std::sync::PoisonError<T>> for TriadError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Self::Lock(e.to_string())
    }
}
