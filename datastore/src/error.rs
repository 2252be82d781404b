//! Unified error handling for the data store.

use crate::config::ConfigError;

/// Data store error type.
///
/// Local operations return these directly. Failures that happen while a
/// mutation is being reconciled in the background are reported as
/// [`crate::events::DataStoreEvent::MutationFailed`] instead.
#[derive(Debug, thiserror::Error)]
pub enum DataStoreError {
    /// Unknown schema or field, bad predicate, invalid record and similar
    #[error("Configuration error: {0}")]
    Configuration(#[from] harbor_engine::Error),

    #[error("Database error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Invalid stored payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Sync is already running")]
    AlreadyStarted,
}

/// Result type alias for data store operations.
pub type Result<T> = std::result::Result<T, DataStoreError>;
