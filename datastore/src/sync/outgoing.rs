//! Outbox drain.

use super::{remote_event, write_remote, SyncContext};
use crate::db::{metadata, outbox, records};
use crate::error::{DataStoreError, Result};
use crate::events::{DataStoreEvent, SyncFailure};
use crate::remote::{MutationRequest, RemoteError};
use harbor_engine::{
    ConflictOutcome, DeliveryState, MutationEvent, MutationKind, Origin, OutboxEntry, Record,
    RemoteRecord, Schema,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinSet;
use tokio::time::Instant;

const MIN_WAKE: Duration = Duration::from_millis(10);

/// Driver loop: hand ready entries to delivery tasks until aborted.
pub(super) async fn drive(ctx: Arc<SyncContext>) {
    let mut deliveries = JoinSet::new();

    match pending(&ctx).await {
        Ok(pending) => tracing::info!(pending, "Draining outbox"),
        Err(err) => tracing::error!(error = %err, "Failed to read outbox"),
    }

    loop {
        if let Err(err) = dispatch(&ctx, &mut deliveries).await {
            tracing::error!(error = %err, "Failed to dispatch outbox entries");
        }

        let wait = if ctx.permits.available_permits() == 0 {
            ctx.shared.config.poll_interval
        } else {
            ctx.next_wake().max(MIN_WAKE)
        };

        tokio::select! {
            _ = ctx.shared.outbox_signal.notified() => {}
            Some(joined) = deliveries.join_next(), if !deliveries.is_empty() => {
                if let Err(err) = joined {
                    if err.is_panic() {
                        tracing::error!(error = %err, "Delivery task panicked");
                    }
                }
            }
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

async fn pending(ctx: &SyncContext) -> Result<usize> {
    let mut conn = ctx.shared.pool.acquire().await?;
    outbox::len(&mut conn).await
}

async fn dispatch(ctx: &Arc<SyncContext>, deliveries: &mut JoinSet<()>) -> Result<()> {
    let available = ctx.permits.available_permits();
    if available == 0 {
        return Ok(());
    }

    let limit = available + ctx.not_before.len();
    let candidates = {
        let mut conn = ctx.shared.pool.acquire().await?;
        outbox::next_ready(&mut conn, limit).await?
    };
    if candidates.len() < limit {
        // Every ready entry was seen; delays for entries gone from the
        // queue can be forgotten.
        ctx.not_before
            .retain(|id, _| candidates.iter().any(|entry| entry.id() == id));
    }

    let now = Instant::now();
    for candidate in candidates {
        if ctx
            .not_before
            .get(candidate.id())
            .is_some_and(|due| *due > now)
        {
            continue;
        }
        let key = candidate.event.record_key();
        if ctx.in_flight.contains_key(&key) {
            continue;
        }
        let permit = match ctx.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => break,
        };

        let entry = {
            let mut conn = ctx.shared.pool.acquire().await?;
            outbox::begin_delivery(&mut conn, candidate.id()).await
        };
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::debug!(entry_id = %candidate.id(), error = %err, "Entry no longer ready");
                continue;
            }
        };

        ctx.not_before.remove(entry.id());
        ctx.in_flight.insert(key, entry.id().clone());
        tracing::debug!(
            schema = %entry.event.schema_name,
            record_id = %entry.event.record_id,
            kind = %entry.event.kind,
            attempt = entry.attempts,
            "Delivering mutation"
        );
        deliveries.spawn(deliver(ctx.clone(), entry, permit));
    }
    Ok(())
}

async fn deliver(ctx: Arc<SyncContext>, entry: OutboxEntry, _permit: OwnedSemaphorePermit) {
    if let Err(err) = process(&ctx, &entry).await {
        match err {
            DataStoreError::Storage(_) => {
                tracing::error!(entry_id = %entry.id(), error = %err, "Delivery interrupted");
                if let Err(err) = retry_later(&ctx, &entry).await {
                    tracing::error!(entry_id = %entry.id(), error = %err, "Failed to release entry");
                }
            }
            other => {
                let failure = SyncFailure::Local(other.to_string());
                if let Err(err) = fail(&ctx, &entry, failure).await {
                    tracing::error!(entry_id = %entry.id(), error = %err, "Failed to drop entry");
                }
            }
        }
    }

    ctx.in_flight.remove(&entry.event.record_key());
    ctx.shared.outbox_signal.notify_one();
}

async fn process(ctx: &SyncContext, entry: &OutboxEntry) -> Result<()> {
    let registry = &ctx.shared.registry;
    let schema = registry.get(&entry.event.schema_name)?;
    let record = entry.event.decode(registry)?;

    let token = match ctx.credentials.current_token().await {
        Ok(token) => token,
        Err(err) if err.terminal => {
            return fail(ctx, entry, SyncFailure::Unauthorized(err.message)).await;
        }
        Err(err) => {
            tracing::warn!(error = %err, "Token unavailable");
            ctx.mark_offline();
            return retry_later(ctx, entry).await;
        }
    };

    let request = MutationRequest {
        schema: schema.name.clone(),
        record: record.clone(),
        kind: entry.event.kind,
        expected_version: entry.event.version,
        token,
    };

    match ctx.remote.mutate(request).await {
        Ok(remote) => {
            ctx.mark_online();
            acknowledged(ctx, entry, schema, remote).await
        }
        Err(RemoteError::Conflict { remote }) => {
            ctx.mark_online();
            conflicted(ctx, entry, schema, record, remote).await
        }
        Err(RemoteError::Validation(message)) => {
            ctx.mark_online();
            fail(ctx, entry, SyncFailure::Validation(message)).await
        }
        Err(RemoteError::ConditionalCheck(message)) => {
            ctx.mark_online();
            tracing::warn!(
                schema = %schema.name,
                record_id = %entry.event.record_id,
                %message,
                "Conditional save rejected by remote"
            );
            if remove(ctx, entry).await? {
                ctx.publish(DataStoreEvent::ConditionalSaveFailed(entry.event.clone()));
            }
            Ok(())
        }
        Err(RemoteError::Unauthorized {
            message,
            terminal: true,
        }) => fail(ctx, entry, SyncFailure::Unauthorized(message)).await,
        Err(RemoteError::Unauthorized { message, .. }) => {
            tracing::warn!(%message, "Remote refused token");
            retry_later(ctx, entry).await
        }
        Err(RemoteError::Network(message)) => {
            tracing::warn!(%message, "Network error");
            ctx.mark_offline();
            retry_later(ctx, entry).await
        }
        Err(RemoteError::Service(message)) => {
            ctx.mark_online();
            if entry.attempts >= ctx.shared.config.sync_max_retries {
                let failure = SyncFailure::RetriesExhausted {
                    attempts: entry.attempts,
                    message,
                };
                fail(ctx, entry, failure).await
            } else {
                tracing::warn!(%message, attempts = entry.attempts, "Service error");
                retry_later(ctx, entry).await
            }
        }
    }
}

async fn acknowledged(
    ctx: &SyncContext,
    entry: &OutboxEntry,
    schema: &Schema,
    remote: RemoteRecord,
) -> Result<()> {
    let record_id = &entry.event.record_id;
    let version = remote.version;

    let mut tx = ctx.shared.pool.begin().await?;
    let advances = metadata::get(&mut tx, &schema.name, record_id)
        .await?
        .map_or(true, |current| current.advances_to(version));

    outbox::ack(&mut tx, entry.id()).await?;
    // An acknowledged delete leaves no tombstone, whatever version it carries.
    if entry.event.kind == MutationKind::Delete || remote.deleted {
        metadata::purge(&mut tx, &schema.name, record_id).await?;
    } else if advances {
        metadata::upsert(&mut tx, &remote.metadata(schema)?).await?;
    }
    if advances {
        outbox::rewrite_pending_version(&mut tx, &schema.name, record_id, version).await?;
    }
    let is_empty = outbox::is_empty(&mut tx).await?;
    tx.commit().await?;

    if advances {
        tracing::debug!(schema = %schema.name, record_id = %record_id, version, "Mutation acknowledged");
        ctx.publish(DataStoreEvent::OutboxMutationProcessed {
            event: entry.event.clone(),
            version,
        });
    } else {
        tracing::debug!(
            schema = %schema.name,
            record_id = %record_id,
            version,
            "Acknowledgement already applied"
        );
    }
    ctx.publish(DataStoreEvent::OutboxStatus { is_empty });
    Ok(())
}

async fn conflicted(
    ctx: &SyncContext,
    entry: &OutboxEntry,
    schema: &Schema,
    local: Record,
    remote: Option<RemoteRecord>,
) -> Result<()> {
    let record_id = &entry.event.record_id;
    let remote = match remote {
        Some(remote) => Some(remote),
        None => {
            let key = schema.key_predicate(record_id)?;
            let fetched = match ctx.credentials.current_token().await {
                Ok(token) => ctx
                    .remote
                    .query(schema, &key, &token)
                    .await
                    .map_err(|err| err.to_string()),
                Err(err) => Err(err.to_string()),
            };
            match fetched {
                Ok(mut found) => found.pop(),
                Err(message) => {
                    tracing::warn!(%message, "Failed to fetch conflicting record");
                    return retry_later(ctx, entry).await;
                }
            }
        }
    };

    let remote = match remote {
        Some(remote) => remote,
        None => {
            let remote_version = entry.event.version.unwrap_or_default();
            return fail(ctx, entry, SyncFailure::Conflict { remote_version }).await;
        }
    };

    {
        let mut conn = ctx.shared.pool.acquire().await?;
        outbox::mark_conflict(&mut conn, entry.id(), remote.version).await?;
    }
    tracing::warn!(
        schema = %schema.name,
        record_id = %record_id,
        local_version = ?entry.event.version,
        remote_version = remote.version,
        "Version conflict"
    );

    match ctx
        .reconciler
        .resolve_conflict(entry.event.kind, &local, &remote)
    {
        ConflictOutcome::ApplyRemote | ConflictOutcome::DeleteLocal => {
            adopt_remote(ctx, entry, schema, &remote).await
        }
        ConflictOutcome::Converged => {
            let mut tx = ctx.shared.pool.begin().await?;
            outbox::fail(&mut tx, entry.id()).await?;
            metadata::purge(&mut tx, &schema.name, record_id).await?;
            let is_empty = outbox::is_empty(&mut tx).await?;
            tx.commit().await?;

            tracing::debug!(schema = %schema.name, record_id = %record_id, "Both sides deleted");
            ctx.publish(DataStoreEvent::OutboxStatus { is_empty });
            Ok(())
        }
        ConflictOutcome::Retry { record, version } => {
            retry_merged(ctx, entry, schema, &remote, record, version).await
        }
        ConflictOutcome::Unresolved => {
            let failure = SyncFailure::Conflict {
                remote_version: remote.version,
            };
            fail(ctx, entry, failure).await
        }
    }
}

/// Drop the entry and make the remote state the local state.
async fn adopt_remote(
    ctx: &SyncContext,
    entry: &OutboxEntry,
    schema: &Schema,
    remote: &RemoteRecord,
) -> Result<()> {
    let record_id = &entry.event.record_id;

    let mut tx = ctx.shared.pool.begin().await?;
    outbox::fail(&mut tx, entry.id()).await?;
    let applied = write_remote(&mut tx, &ctx.shared, schema, remote, true).await?;
    outbox::rewrite_pending_version(&mut tx, &schema.name, record_id, remote.version).await?;
    let is_empty = outbox::is_empty(&mut tx).await?;
    tx.commit().await?;

    tracing::info!(
        schema = %schema.name,
        record_id = %record_id,
        version = remote.version,
        "Conflict resolved with remote state"
    );
    if let Some(kind) = applied {
        ctx.publish(DataStoreEvent::Mutation(remote_event(schema, remote, kind)?));
    }
    ctx.publish(DataStoreEvent::OutboxStatus { is_empty });
    Ok(())
}

/// Queue the entry again against the remote version, saving a merged record
/// locally first when the policy produced one.
async fn retry_merged(
    ctx: &SyncContext,
    entry: &OutboxEntry,
    schema: &Schema,
    remote: &RemoteRecord,
    merged: Option<Record>,
    version: harbor_engine::Version,
) -> Result<()> {
    let registry = &ctx.shared.registry;
    let now = crate::datastore::now_millis();

    let mut tx = ctx.shared.pool.begin().await?;
    let saved = match merged {
        Some(record) => Some(records::save(&mut tx, registry, schema, record, now).await?.0),
        None => None,
    };
    let payload = saved.as_ref().map(|record| record.flattened().to_json());
    outbox::retry(&mut tx, entry.id(), payload, version).await?;
    metadata::upsert(&mut tx, &remote.metadata(schema)?).await?;
    tx.commit().await?;

    tracing::info!(
        schema = %schema.name,
        record_id = %entry.event.record_id,
        version,
        "Retrying mutation against remote version"
    );
    if let Some(record) = saved {
        let event = MutationEvent::new(
            uuid::Uuid::new_v4().to_string(),
            schema,
            &record,
            MutationKind::Update,
            Some(version),
            now,
            Origin::Local,
        )?;
        ctx.publish(DataStoreEvent::Mutation(event));
    }
    Ok(())
}

/// Return an entry to pending after a backoff delay.
async fn retry_later(ctx: &SyncContext, entry: &OutboxEntry) -> Result<()> {
    let delay = ctx.shared.config.backoff(entry.attempts);
    {
        let mut conn = ctx.shared.pool.acquire().await?;
        match outbox::get(&mut conn, entry.id()).await? {
            Some(current) if current.state == DeliveryState::InFlight => {
                outbox::release(&mut conn, entry.id()).await?;
            }
            Some(current) if current.state == DeliveryState::Conflict => {
                let version = current.remote_version.or(current.event.version).unwrap_or_default();
                outbox::retry(&mut conn, entry.id(), None, version).await?;
            }
            _ => return Ok(()),
        }
    }
    ctx.not_before
        .insert(entry.id().clone(), Instant::now() + delay);

    tracing::debug!(entry_id = %entry.id(), attempts = entry.attempts, ?delay, "Delivery deferred");
    Ok(())
}

/// Remove the entry without reporting a failure. Returns whether it was
/// still queued.
async fn remove(ctx: &SyncContext, entry: &OutboxEntry) -> Result<bool> {
    let mut tx = ctx.shared.pool.begin().await?;
    let removed = outbox::fail(&mut tx, entry.id()).await?.is_some();
    let is_empty = outbox::is_empty(&mut tx).await?;
    tx.commit().await?;

    ctx.not_before.remove(entry.id());
    ctx.publish(DataStoreEvent::OutboxStatus { is_empty });
    Ok(removed)
}

/// Give up on an entry and report why.
async fn fail(ctx: &SyncContext, entry: &OutboxEntry, failure: SyncFailure) -> Result<()> {
    tracing::error!(
        schema = %entry.event.schema_name,
        record_id = %entry.event.record_id,
        error = %failure,
        "Mutation failed"
    );
    if remove(ctx, entry).await? {
        ctx.publish(DataStoreEvent::MutationFailed {
            event: entry.event.clone(),
            error: failure,
        });
    }
    Ok(())
}
