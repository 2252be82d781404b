//! SQLite persistence.
//!
//! Every function takes the connection it runs on, so callers decide
//! whether a group of statements shares one transaction.

pub mod metadata;
pub mod outbox;
mod pool;
pub mod records;

pub use outbox::Outbox;
pub use pool::*;

use harbor_engine::{statement::Statement, SqlValue};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnection};
use sqlx::Sqlite;

/// Bind dynamically typed values to a statement in order.
pub(crate) fn bind_values<'q>(
    sql: &'q str,
    values: &[SqlValue],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    let mut query = sqlx::query(sql);
    for value in values {
        query = match value {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Integer(i) => query.bind(*i),
            SqlValue::Real(f) => query.bind(*f),
            SqlValue::Text(s) => query.bind(s.clone()),
        };
    }
    query
}

/// Execute a generated statement, returning the affected row count.
pub(crate) async fn execute(
    conn: &mut SqliteConnection,
    statement: &Statement,
) -> Result<u64, sqlx::Error> {
    let result = bind_values(&statement.sql, &statement.values)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}
