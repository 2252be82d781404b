//! Sync metadata and registry version persistence.

use crate::error::Result;
use harbor_engine::{SchemaVersion, SyncMetadata, Timestamp, Version};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;

fn from_row(row: &SqliteRow) -> std::result::Result<SyncMetadata, sqlx::Error> {
    Ok(SyncMetadata {
        schema_name: row.try_get("schema_name")?,
        record_id: row.try_get("record_id")?,
        version: row.try_get::<i64, _>("version")? as Version,
        deleted: row.try_get("deleted")?,
        last_changed_at: row.try_get("last_changed_at")?,
    })
}

/// Sync metadata of one record.
pub async fn get(
    conn: &mut SqliteConnection,
    schema_name: &str,
    record_id: &str,
) -> Result<Option<SyncMetadata>> {
    let row = sqlx::query(
        r#"
        SELECT schema_name, record_id, version, deleted, last_changed_at
        FROM sync_metadata
        WHERE schema_name = ? AND record_id = ?
        "#,
    )
    .bind(schema_name)
    .bind(record_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.as_ref().map(from_row).transpose()?)
}

/// Write metadata unless the stored version is already newer.
///
/// Returns whether the row was written.
pub async fn upsert(conn: &mut SqliteConnection, metadata: &SyncMetadata) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO sync_metadata (schema_name, record_id, version, deleted, last_changed_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT (schema_name, record_id) DO UPDATE SET
            version = excluded.version,
            deleted = excluded.deleted,
            last_changed_at = excluded.last_changed_at
        WHERE excluded.version >= sync_metadata.version
        "#,
    )
    .bind(&metadata.schema_name)
    .bind(&metadata.record_id)
    .bind(metadata.version as i64)
    .bind(metadata.deleted)
    .bind(metadata.last_changed_at)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Tombstone a locally deleted record, keeping its last confirmed version.
pub async fn mark_deleted(
    conn: &mut SqliteConnection,
    schema_name: &str,
    record_id: &str,
    at: Timestamp,
) -> Result<()> {
    sqlx::query(
        "UPDATE sync_metadata SET deleted = 1, last_changed_at = ? \
         WHERE schema_name = ? AND record_id = ?",
    )
    .bind(at)
    .bind(schema_name)
    .bind(record_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Forget a record entirely.
pub async fn purge(conn: &mut SqliteConnection, schema_name: &str, record_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM sync_metadata WHERE schema_name = ? AND record_id = ?")
        .bind(schema_name)
        .bind(record_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn clear(conn: &mut SqliteConnection) -> Result<()> {
    sqlx::query("DELETE FROM sync_metadata")
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Registry version the schema tables were created for.
pub async fn registry_version(conn: &mut SqliteConnection) -> Result<Option<SchemaVersion>> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT version FROM registry_meta WHERE id = 1")
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.map(|(version,)| version as SchemaVersion))
}

pub async fn set_registry_version(conn: &mut SqliteConnection, version: SchemaVersion) -> Result<()> {
    sqlx::query(
        "INSERT INTO registry_meta (id, version) VALUES (1, ?) \
         ON CONFLICT (id) DO UPDATE SET version = excluded.version",
    )
    .bind(version as i64)
    .execute(&mut *conn)
    .await?;
    Ok(())
}
