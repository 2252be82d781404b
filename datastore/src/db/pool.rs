//! Database connection pool management.

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;

/// Type alias for the database pool.
pub type Pool = SqlitePool;

/// Create the connection pool.
///
/// The pool holds exactly one connection, so every statement is serialized.
/// Without a path the database lives in memory for as long as the pool.
pub async fn create_pool(path: Option<&Path>) -> Result<Pool, sqlx::Error> {
    let options = SqlitePoolOptions::new().max_connections(1);

    match path {
        Some(path) => {
            let connect = SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal);
            options.connect_with(connect).await
        }
        None => {
            let connect = SqliteConnectOptions::new().in_memory(true);
            options
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(connect)
                .await
        }
    }
}

/// Run database migrations.
pub async fn run_migrations(pool: &Pool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
