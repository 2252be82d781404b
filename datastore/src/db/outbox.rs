//! Durable mutation outbox.
//!
//! Entries are rows of the `outbox` table ordered by `seq`. State changes go
//! through [`OutboxEntry`]'s transitions before they are written back, so an
//! illegal transition never reaches the database.

use super::Pool;
use crate::error::{DataStoreError, Result};
use harbor_engine::{
    ingest, DeliveryState, Error, Ingest, MutationEvent, MutationKind, Origin, OutboxEntry,
    Version,
};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;

const COLUMNS: &str = "seq, entry_id, schema_name, record_id, kind, version, payload, \
                       timestamp, origin, state, attempts, remote_version";

/// A stored outbox row.
#[derive(Debug)]
pub struct OutboxRow {
    pub seq: i64,
    pub entry_id: String,
    pub schema_name: String,
    pub record_id: String,
    pub kind: String,
    pub version: Option<i64>,
    pub payload: String,
    pub timestamp: i64,
    pub origin: String,
    pub state: String,
    pub attempts: i64,
    pub remote_version: Option<i64>,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for OutboxRow {
    fn from_row(row: &'r SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(OutboxRow {
            seq: row.try_get("seq")?,
            entry_id: row.try_get("entry_id")?,
            schema_name: row.try_get("schema_name")?,
            record_id: row.try_get("record_id")?,
            kind: row.try_get("kind")?,
            version: row.try_get("version")?,
            payload: row.try_get("payload")?,
            timestamp: row.try_get("timestamp")?,
            origin: row.try_get("origin")?,
            state: row.try_get("state")?,
            attempts: row.try_get("attempts")?,
            remote_version: row.try_get("remote_version")?,
        })
    }
}

impl OutboxRow {
    /// Convert the row to an engine outbox entry.
    pub fn to_entry(&self) -> Result<OutboxEntry> {
        let event = MutationEvent {
            id: self.entry_id.clone(),
            record_id: self.record_id.clone(),
            schema_name: self.schema_name.clone(),
            kind: MutationKind::parse(&self.kind)?,
            version: self.version.map(|v| v as Version),
            timestamp: self.timestamp,
            payload: serde_json::from_str(&self.payload)?,
            origin: parse_origin(&self.origin)?,
        };
        Ok(OutboxEntry {
            seq: self.seq,
            event,
            state: DeliveryState::parse(&self.state)?,
            attempts: self.attempts as u32,
            remote_version: self.remote_version.map(|v| v as Version),
        })
    }
}

fn origin_str(origin: Origin) -> &'static str {
    match origin {
        Origin::Local => "local",
        Origin::Remote => "remote",
    }
}

fn parse_origin(s: &str) -> std::result::Result<Origin, Error> {
    match s {
        "local" => Ok(Origin::Local),
        "remote" => Ok(Origin::Remote),
        other => Err(Error::InvalidPayload(format!("unknown origin: {}", other))),
    }
}

async fn fetch_entries(
    conn: &mut SqliteConnection,
    sql: &str,
    binds: &[&str],
) -> Result<Vec<OutboxEntry>> {
    let mut query = sqlx::query_as::<_, OutboxRow>(sql);
    for bind in binds {
        query = query.bind(*bind);
    }
    query
        .fetch_all(&mut *conn)
        .await?
        .iter()
        .map(OutboxRow::to_entry)
        .collect()
}

/// Queue a local mutation.
///
/// The event is coalesced with the latest pending entry for the same record
/// when possible. Returns the entry that now represents the mutation, or
/// `None` when it cancelled out a create that never reached the remote.
pub async fn enqueue(
    conn: &mut SqliteConnection,
    event: &MutationEvent,
) -> Result<Option<OutboxEntry>> {
    let latest = pending_for(conn, &event.schema_name, &event.record_id)
        .await?
        .pop();

    match ingest(latest.as_ref(), event)? {
        Ingest::Append => {
            let payload = serde_json::to_string(&event.payload)?;
            let result = sqlx::query(
                r#"
                INSERT INTO outbox (
                    entry_id, schema_name, record_id, kind, version,
                    payload, timestamp, origin
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&event.id)
            .bind(&event.schema_name)
            .bind(&event.record_id)
            .bind(event.kind.as_str())
            .bind(event.version.map(|v| v as i64))
            .bind(payload)
            .bind(event.timestamp)
            .bind(origin_str(event.origin))
            .execute(&mut *conn)
            .await?;

            tracing::debug!(
                schema = %event.schema_name,
                record_id = %event.record_id,
                kind = %event.kind,
                "Enqueued mutation"
            );
            Ok(Some(OutboxEntry::new(
                result.last_insert_rowid(),
                event.clone(),
            )))
        }
        Ingest::Replace(merged) => {
            let mut entry = latest.ok_or_else(|| Error::InvalidMutation {
                record_id: event.record_id.clone(),
                reason: "no entry to merge into".into(),
            })?;
            entry.event = merged;
            write_back(conn, &entry).await?;

            tracing::debug!(
                schema = %event.schema_name,
                record_id = %event.record_id,
                kind = %entry.event.kind,
                "Coalesced mutation"
            );
            Ok(Some(entry))
        }
        Ingest::DropBoth => {
            if let Some(entry) = latest {
                remove(conn, entry.id()).await?;
            }
            tracing::debug!(
                schema = %event.schema_name,
                record_id = %event.record_id,
                "Dropped create that never reached the remote"
            );
            Ok(None)
        }
    }
}

/// The entry with `entry_id`, if still queued.
pub async fn get(conn: &mut SqliteConnection, entry_id: &str) -> Result<Option<OutboxEntry>> {
    let sql = format!("SELECT {} FROM outbox WHERE entry_id = ?", COLUMNS);
    Ok(fetch_entries(conn, &sql, &[entry_id]).await?.pop())
}

/// Every queued entry in enqueue order.
pub async fn entries(conn: &mut SqliteConnection) -> Result<Vec<OutboxEntry>> {
    let sql = format!("SELECT {} FROM outbox ORDER BY seq", COLUMNS);
    fetch_entries(conn, &sql, &[]).await
}

/// Up to `limit` pending entries that head their record's queue.
pub async fn next_ready(conn: &mut SqliteConnection, limit: usize) -> Result<Vec<OutboxEntry>> {
    let sql = format!(
        r#"
        SELECT {} FROM outbox o
        WHERE o.state = 'pending'
          AND NOT EXISTS (
              SELECT 1 FROM outbox e
              WHERE e.schema_name = o.schema_name
                AND e.record_id = o.record_id
                AND e.seq < o.seq
          )
        ORDER BY o.seq
        LIMIT {}
        "#,
        COLUMNS,
        limit.max(1)
    );
    fetch_entries(conn, &sql, &[]).await
}

/// The earliest pending entry with no earlier entry for the same record.
pub async fn peek_next(conn: &mut SqliteConnection) -> Result<Option<OutboxEntry>> {
    Ok(next_ready(conn, 1).await?.pop())
}

/// Every queued entry for one record, oldest first.
pub async fn pending_for(
    conn: &mut SqliteConnection,
    schema_name: &str,
    record_id: &str,
) -> Result<Vec<OutboxEntry>> {
    let sql = format!(
        "SELECT {} FROM outbox WHERE schema_name = ? AND record_id = ? ORDER BY seq",
        COLUMNS
    );
    fetch_entries(conn, &sql, &[schema_name, record_id]).await
}

async fn load(conn: &mut SqliteConnection, entry_id: &str) -> Result<OutboxEntry> {
    get(conn, entry_id)
        .await?
        .ok_or_else(|| DataStoreError::NotFound(format!("outbox entry {}", entry_id)))
}

async fn write_back(conn: &mut SqliteConnection, entry: &OutboxEntry) -> Result<()> {
    let payload = serde_json::to_string(&entry.event.payload)?;
    sqlx::query(
        r#"
        UPDATE outbox
        SET kind = ?, version = ?, payload = ?, timestamp = ?,
            state = ?, attempts = ?, remote_version = ?
        WHERE entry_id = ?
        "#,
    )
    .bind(entry.event.kind.as_str())
    .bind(entry.event.version.map(|v| v as i64))
    .bind(payload)
    .bind(entry.event.timestamp)
    .bind(entry.state.as_str())
    .bind(entry.attempts as i64)
    .bind(entry.remote_version.map(|v| v as i64))
    .bind(entry.id())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn remove(conn: &mut SqliteConnection, entry_id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM outbox WHERE entry_id = ?")
        .bind(entry_id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

async fn transition<F>(conn: &mut SqliteConnection, entry_id: &str, f: F) -> Result<OutboxEntry>
where
    F: FnOnce(&mut OutboxEntry) -> harbor_engine::error::Result<()>,
{
    let mut entry = load(conn, entry_id).await?;
    f(&mut entry)?;
    write_back(conn, &entry).await?;
    Ok(entry)
}

/// `pending → in-flight`, counting the attempt.
pub async fn begin_delivery(conn: &mut SqliteConnection, entry_id: &str) -> Result<OutboxEntry> {
    transition(conn, entry_id, OutboxEntry::begin_delivery).await
}

/// `in-flight → pending`.
pub async fn release(conn: &mut SqliteConnection, entry_id: &str) -> Result<OutboxEntry> {
    transition(conn, entry_id, OutboxEntry::release).await
}

pub async fn mark_conflict(
    conn: &mut SqliteConnection,
    entry_id: &str,
    remote_version: Version,
) -> Result<OutboxEntry> {
    transition(conn, entry_id, |entry| entry.mark_conflict(remote_version)).await
}

/// `conflict → pending` against `version`, optionally replacing the payload.
pub async fn retry(
    conn: &mut SqliteConnection,
    entry_id: &str,
    payload: Option<serde_json::Value>,
    version: Version,
) -> Result<OutboxEntry> {
    transition(conn, entry_id, |entry| entry.retry_with(payload, version)).await
}

/// Acknowledge and remove an in-flight entry.
///
/// Rejected while an earlier entry for the same record is still queued.
pub async fn ack(conn: &mut SqliteConnection, entry_id: &str) -> Result<OutboxEntry> {
    let mut entry = load(conn, entry_id).await?;

    let (earlier,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM outbox WHERE schema_name = ? AND record_id = ? AND seq < ?",
    )
    .bind(&entry.event.schema_name)
    .bind(&entry.event.record_id)
    .bind(entry.seq)
    .fetch_one(&mut *conn)
    .await?;
    if earlier > 0 {
        return Err(Error::OutOfOrderAck {
            entry_id: entry.event.id.clone(),
            record_id: entry.event.record_id.clone(),
        }
        .into());
    }

    entry.acknowledge()?;
    remove(conn, entry_id).await?;
    Ok(entry)
}

/// Remove an entry that will never be delivered.
pub async fn fail(conn: &mut SqliteConnection, entry_id: &str) -> Result<Option<OutboxEntry>> {
    let entry = match get(conn, entry_id).await? {
        Some(entry) if entry.can_fail() => entry,
        _ => return Ok(None),
    };
    remove(conn, entry_id).await?;
    Ok(Some(entry))
}

/// Point every pending entry of a record at a newly confirmed version.
pub async fn rewrite_pending_version(
    conn: &mut SqliteConnection,
    schema_name: &str,
    record_id: &str,
    version: Version,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE outbox SET version = ? \
         WHERE schema_name = ? AND record_id = ? AND state = 'pending'",
    )
    .bind(version as i64)
    .bind(schema_name)
    .bind(record_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

/// Return in-flight and conflicted entries to pending.
pub async fn reset_in_flight(conn: &mut SqliteConnection) -> Result<u64> {
    let result =
        sqlx::query("UPDATE outbox SET state = 'pending' WHERE state IN ('in_flight', 'conflict')")
            .execute(&mut *conn)
            .await?;
    Ok(result.rows_affected())
}

pub async fn len(conn: &mut SqliteConnection) -> Result<usize> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM outbox")
        .fetch_one(&mut *conn)
        .await?;
    Ok(count as usize)
}

pub async fn is_empty(conn: &mut SqliteConnection) -> Result<bool> {
    Ok(len(conn).await? == 0)
}

pub async fn clear(conn: &mut SqliteConnection) -> Result<u64> {
    let result = sqlx::query("DELETE FROM outbox").execute(&mut *conn).await?;
    Ok(result.rows_affected())
}

/// Handle on the outbox that acquires its own connection per call.
#[derive(Debug, Clone)]
pub struct Outbox {
    pool: Pool,
}

impl Outbox {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub async fn enqueue(&self, event: &MutationEvent) -> Result<Option<OutboxEntry>> {
        let mut tx = self.pool.begin().await?;
        let entry = enqueue(&mut tx, event).await?;
        tx.commit().await?;
        Ok(entry)
    }

    pub async fn get(&self, entry_id: &str) -> Result<Option<OutboxEntry>> {
        let mut conn = self.pool.acquire().await?;
        get(&mut conn, entry_id).await
    }

    pub async fn entries(&self) -> Result<Vec<OutboxEntry>> {
        let mut conn = self.pool.acquire().await?;
        entries(&mut conn).await
    }

    pub async fn peek_next(&self) -> Result<Option<OutboxEntry>> {
        let mut conn = self.pool.acquire().await?;
        peek_next(&mut conn).await
    }

    pub async fn next_ready(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        let mut conn = self.pool.acquire().await?;
        next_ready(&mut conn, limit).await
    }

    pub async fn pending_for(&self, schema_name: &str, record_id: &str) -> Result<Vec<OutboxEntry>> {
        let mut conn = self.pool.acquire().await?;
        pending_for(&mut conn, schema_name, record_id).await
    }

    pub async fn begin_delivery(&self, entry_id: &str) -> Result<OutboxEntry> {
        let mut conn = self.pool.acquire().await?;
        begin_delivery(&mut conn, entry_id).await
    }

    pub async fn release(&self, entry_id: &str) -> Result<OutboxEntry> {
        let mut conn = self.pool.acquire().await?;
        release(&mut conn, entry_id).await
    }

    pub async fn mark_conflict(&self, entry_id: &str, remote_version: Version) -> Result<OutboxEntry> {
        let mut conn = self.pool.acquire().await?;
        mark_conflict(&mut conn, entry_id, remote_version).await
    }

    pub async fn retry(
        &self,
        entry_id: &str,
        payload: Option<serde_json::Value>,
        version: Version,
    ) -> Result<OutboxEntry> {
        let mut conn = self.pool.acquire().await?;
        retry(&mut conn, entry_id, payload, version).await
    }

    pub async fn ack(&self, entry_id: &str) -> Result<OutboxEntry> {
        let mut tx = self.pool.begin().await?;
        let entry = ack(&mut tx, entry_id).await?;
        tx.commit().await?;
        Ok(entry)
    }

    pub async fn fail(&self, entry_id: &str) -> Result<Option<OutboxEntry>> {
        let mut conn = self.pool.acquire().await?;
        fail(&mut conn, entry_id).await
    }

    pub async fn reset_in_flight(&self) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        reset_in_flight(&mut conn).await
    }

    pub async fn len(&self) -> Result<usize> {
        let mut conn = self.pool.acquire().await?;
        len(&mut conn).await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        is_empty(&mut conn).await
    }

    pub async fn clear(&self) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        clear(&mut conn).await
    }
}
