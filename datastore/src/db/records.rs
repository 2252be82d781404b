//! Storage adapter for schema tables.
//!
//! Records are stored one table per schema, using statements generated by
//! `harbor_engine::statement`. Reads decode rows back into records through
//! the schema and sort them in memory.

use super::{bind_values, execute};
use crate::error::{DataStoreError, Result};
use harbor_engine::{
    field, sort_records, statement, LazyRef, MutationKind, Predicate, Record, RecordId, Schema,
    SchemaRegistry, Select, SortDescriptor, SqlValue, StorageClass, Timestamp,
};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;

/// Create every schema table that does not exist yet.
pub async fn create_tables(conn: &mut SqliteConnection, registry: &SchemaRegistry) -> Result<()> {
    for schema in registry.iter() {
        for ddl in statement::create_table(schema) {
            sqlx::query(&ddl).execute(&mut *conn).await?;
        }
        tracing::debug!(schema = %schema.name, "Schema table ready");
    }
    Ok(())
}

/// Drop every schema table, including tables of schemas no longer
/// registered. System tables are kept.
pub async fn drop_tables(conn: &mut SqliteConnection) -> Result<()> {
    let tables: Vec<(String,)> = sqlx::query_as(
        r#"
        SELECT name FROM sqlite_master
        WHERE type = 'table'
          AND name NOT LIKE 'sqlite%'
          AND name NOT IN ('_sqlx_migrations', 'outbox', 'sync_metadata', 'registry_meta')
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    for (table,) in tables {
        let ddl = format!("DROP TABLE IF EXISTS \"{}\"", table.replace('"', "\"\""));
        sqlx::query(&ddl).execute(&mut *conn).await?;
        tracing::debug!(table = %table, "Dropped schema table");
    }
    Ok(())
}

/// Whether a record with `id` is stored.
pub async fn exists(conn: &mut SqliteConnection, schema: &Schema, id: &str) -> Result<bool> {
    let count = statement::count_by_key(schema, id)?;
    let row = bind_values(&count.sql, &count.values)
        .fetch_one(&mut *conn)
        .await?;
    Ok(row.try_get::<i64, _>(0)? > 0)
}

/// Records of `schema` matching `predicate`, sorted in memory.
///
/// With `eager`, belongs-to and has-one relationships are loaded as nested
/// records; otherwise they hold [`LazyRef`] placeholders.
pub async fn query(
    conn: &mut SqliteConnection,
    registry: &SchemaRegistry,
    schema: &Schema,
    predicate: &Predicate,
    sort: &[SortDescriptor],
    eager: bool,
) -> Result<Vec<Record>> {
    let select = Select::build(registry, schema, predicate, eager)?;
    let rows = bind_values(&select.sql, &select.values)
        .fetch_all(&mut *conn)
        .await?;

    let mut records = Vec::with_capacity(rows.len());
    for row in &rows {
        let values = select
            .columns
            .iter()
            .enumerate()
            .map(|(index, column)| read_column(row, index, column.storage))
            .collect::<std::result::Result<Vec<_>, sqlx::Error>>()?;
        records.push(select.decode(registry, values)?);
    }

    sort_records(&mut records, sort);
    Ok(records)
}

/// The record stored under `id`, if any.
pub async fn fetch(
    conn: &mut SqliteConnection,
    registry: &SchemaRegistry,
    schema: &Schema,
    id: &str,
    eager: bool,
) -> Result<Option<Record>> {
    let predicate = schema.key_predicate(id)?;
    let mut records = query(conn, registry, schema, &predicate, &[], eager).await?;
    Ok(records.pop())
}

/// Load the record(s) a lazy relationship points at.
pub async fn resolve(
    conn: &mut SqliteConnection,
    registry: &SchemaRegistry,
    lazy: &LazyRef,
) -> Result<Vec<Record>> {
    match lazy {
        LazyRef::One { schema, id } => {
            let target = registry.get(schema)?;
            Ok(fetch(conn, registry, target, id, false)
                .await?
                .into_iter()
                .collect())
        }
        LazyRef::Many {
            schema,
            foreign_key,
            parent_id,
        } => {
            let target = registry.get(schema)?;
            let predicate = field(foreign_key.clone()).eq(parent_id.clone());
            query(conn, registry, target, &predicate, &[], false).await
        }
    }
}

/// Validate and write a local record, returning the stored row.
///
/// Inserts when the primary key is new and updates otherwise. Generated
/// timestamps are stamped with `now`.
pub async fn save(
    conn: &mut SqliteConnection,
    registry: &SchemaRegistry,
    schema: &Schema,
    mut record: Record,
    now: Timestamp,
) -> Result<(Record, MutationKind)> {
    schema.validate_record(&record)?;
    let id = schema.identifier(&record)?;
    let inserting = !exists(conn, schema, &id).await?;

    statement::stamp_generated(schema, &mut record, now, inserting);
    let (write, kind) = if inserting {
        (statement::insert(registry, schema, &record)?, MutationKind::Create)
    } else {
        (statement::update(registry, schema, &record)?, MutationKind::Update)
    };
    execute(conn, &write).await?;

    let stored = fetch(conn, registry, schema, &id, false)
        .await?
        .ok_or_else(|| DataStoreError::NotFound(format!("{} {}", schema.name, id)))?;

    tracing::debug!(schema = %schema.name, record_id = %id, kind = %kind, "Saved record");
    Ok((stored, kind))
}

/// Write a record received from the remote as is.
pub async fn upsert(
    conn: &mut SqliteConnection,
    registry: &SchemaRegistry,
    schema: &Schema,
    record: &Record,
) -> Result<()> {
    let id = schema.identifier(record)?;
    let write = if exists(conn, schema, &id).await? {
        statement::update(registry, schema, record)?
    } else {
        statement::insert(registry, schema, record)?
    };
    execute(conn, &write).await?;
    Ok(())
}

/// Delete one record. Returns whether it existed.
pub async fn delete_by_id(conn: &mut SqliteConnection, schema: &Schema, id: &str) -> Result<bool> {
    let delete = statement::delete_by_key(schema, id)?;
    Ok(execute(conn, &delete).await? > 0)
}

/// Delete every record matching `predicate`, returning their ids.
pub async fn delete(
    conn: &mut SqliteConnection,
    registry: &SchemaRegistry,
    schema: &Schema,
    predicate: &Predicate,
) -> Result<Vec<RecordId>> {
    let matching = query(conn, registry, schema, predicate, &[], false).await?;
    let mut deleted = Vec::with_capacity(matching.len());
    for record in &matching {
        let id = schema.identifier(record)?;
        if delete_by_id(conn, schema, &id).await? {
            deleted.push(id);
        }
    }
    Ok(deleted)
}

pub async fn delete_all(conn: &mut SqliteConnection, schema: &Schema) -> Result<u64> {
    let result = sqlx::query(&statement::delete_all(schema))
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

fn read_column(
    row: &SqliteRow,
    index: usize,
    storage: StorageClass,
) -> std::result::Result<SqlValue, sqlx::Error> {
    let value = match storage {
        StorageClass::Text => row.try_get::<Option<String>, _>(index)?.map(SqlValue::Text),
        StorageClass::Integer => row.try_get::<Option<i64>, _>(index)?.map(SqlValue::Integer),
        StorageClass::Real => row.try_get::<Option<f64>, _>(index)?.map(SqlValue::Real),
    };
    Ok(value.unwrap_or(SqlValue::Null))
}
