//! Initial sync and live remote subscriptions.

use super::{remote_event, write_remote, SyncContext};
use crate::db::{metadata, outbox};
use crate::error::Result;
use crate::events::DataStoreEvent;
use crate::remote::{RemoteError, RemoteStream};
use futures::StreamExt;
use harbor_engine::{Predicate, RemoteDisposition, RemoteRecord, Schema, SchemaName};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::task::JoinSet;

pub(super) async fn run(ctx: Arc<SyncContext>) {
    if ctx.token().await.is_none() {
        return;
    }

    // Subscribe first so nothing changed during the initial sync is missed.
    let mut streams = Vec::new();
    for schema in ctx.shared.registry.syncable() {
        match subscribe(&ctx, schema).await {
            Some(stream) => streams.push((schema.name.clone(), stream)),
            None => tracing::warn!(schema = %schema.name, "Live updates unavailable"),
        }
    }

    for schema in ctx.shared.registry.syncable() {
        if !initial_sync(&ctx, schema).await {
            return;
        }
        ctx.publish(DataStoreEvent::ModelSynced {
            schema: schema.name.clone(),
        });
    }
    ctx.shared.ready.store(true, Ordering::SeqCst);
    ctx.publish(DataStoreEvent::Ready);
    tracing::info!("Initial sync complete");

    // Dropped with this task when sync stops, which aborts every follower.
    let mut followers = JoinSet::new();
    for (schema_name, stream) in streams {
        followers.spawn(follow(ctx.clone(), schema_name, stream));
    }
    while let Some(joined) = followers.join_next().await {
        if let Err(err) = joined {
            if err.is_panic() {
                tracing::error!(error = %err, "Subscription task panicked");
            }
        }
    }
    tracing::info!("Remote subscriptions ended");
}

/// Apply records pushed for one schema, subscribing again whenever the
/// stream fails or ends.
async fn follow(ctx: Arc<SyncContext>, schema_name: SchemaName, stream: RemoteStream) {
    let schema = match ctx.shared.registry.get(&schema_name) {
        Ok(schema) => schema,
        Err(err) => {
            tracing::error!(error = %err, "Cannot follow remote changes");
            return;
        }
    };

    let mut updates = stream;
    let mut attempts = 0;
    loop {
        while let Some(update) = updates.next().await {
            match update {
                Ok(remote) => {
                    attempts = 0;
                    if let Err(err) = apply_remote(&ctx, schema, remote).await {
                        tracing::error!(schema = %schema.name, error = %err, "Failed to apply remote record");
                    }
                }
                Err(err) => {
                    tracing::warn!(schema = %schema.name, error = %err, "Subscription failed");
                    break;
                }
            }
        }

        ctx.mark_offline();
        attempts += 1;
        let delay = ctx.shared.config.backoff(attempts);
        tracing::warn!(schema = %schema.name, ?delay, "Subscription lost, resubscribing");
        tokio::time::sleep(delay).await;

        updates = match subscribe(&ctx, schema).await {
            Some(stream) => stream,
            None => {
                tracing::error!(schema = %schema.name, "Live updates stopped");
                return;
            }
        };
        // Catch up on changes made while unsubscribed
        if !initial_sync(&ctx, schema).await {
            return;
        }
    }
}

/// Whether a remote call failing this way is worth repeating.
fn is_transient(err: &RemoteError) -> bool {
    matches!(
        err,
        RemoteError::Network(_)
            | RemoteError::Service(_)
            | RemoteError::Unauthorized {
                terminal: false,
                ..
            }
    )
}

async fn subscribe(ctx: &SyncContext, schema: &Schema) -> Option<RemoteStream> {
    let mut attempts = 0;
    loop {
        let token = ctx.token().await?;
        match ctx.remote.subscribe(schema, &token).await {
            Ok(stream) => {
                ctx.mark_online();
                return Some(stream);
            }
            Err(err) if is_transient(&err) => {
                attempts += 1;
                if matches!(err, RemoteError::Network(_)) {
                    ctx.mark_offline();
                }
                let delay = ctx.shared.config.backoff(attempts);
                tracing::warn!(schema = %schema.name, error = %err, ?delay, "Subscribe failed, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                tracing::error!(schema = %schema.name, error = %err, "Subscribe failed");
                return None;
            }
        }
    }
}

/// Fetch and apply every remote record of `schema`.
///
/// Returns `false` only when the credentials were rejected for good.
async fn initial_sync(ctx: &SyncContext, schema: &Schema) -> bool {
    let mut attempts = 0;
    let found = loop {
        let token = match ctx.token().await {
            Some(token) => token,
            None => return false,
        };
        match ctx.remote.query(schema, &Predicate::All, &token).await {
            Ok(found) => {
                ctx.mark_online();
                break found;
            }
            Err(err) if is_transient(&err) => {
                attempts += 1;
                if matches!(err, RemoteError::Network(_)) {
                    ctx.mark_offline();
                }
                let delay = ctx.shared.config.backoff(attempts);
                tracing::warn!(schema = %schema.name, error = %err, ?delay, "Initial sync failed, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                tracing::error!(schema = %schema.name, error = %err, "Initial sync failed");
                return true;
            }
        }
    };

    let total = found.len();
    let mut applied = 0;
    for remote in found {
        match apply_remote(ctx, schema, remote).await {
            Ok(true) => applied += 1,
            Ok(false) => {}
            Err(err) => {
                tracing::error!(schema = %schema.name, error = %err, "Failed to apply remote record")
            }
        }
    }
    tracing::info!(schema = %schema.name, total, applied, "Schema synced");
    true
}

/// Apply one remote record unless local state takes precedence.
///
/// Returns whether local state changed.
async fn apply_remote(ctx: &SyncContext, schema: &Schema, remote: RemoteRecord) -> Result<bool> {
    let record_id = schema.identifier(&remote.record)?;

    let mut tx = ctx.shared.pool.begin().await?;
    let local = metadata::get(&mut tx, &schema.name, &record_id).await?;
    let has_pending = !outbox::pending_for(&mut tx, &schema.name, &record_id)
        .await?
        .is_empty();

    match ctx
        .reconciler
        .remote_disposition(&remote, local.as_ref(), has_pending)
    {
        RemoteDisposition::Drop(reason) => {
            tracing::debug!(
                schema = %schema.name,
                record_id = %record_id,
                version = remote.version,
                ?reason,
                "Remote record dropped"
            );
            Ok(false)
        }
        RemoteDisposition::Apply(_) => {
            let applied =
                write_remote(&mut tx, &ctx.shared, schema, &remote, local.is_some()).await?;
            tx.commit().await?;

            let kind = match applied {
                Some(kind) => kind,
                None => return Ok(false),
            };
            tracing::debug!(
                schema = %schema.name,
                record_id = %record_id,
                version = remote.version,
                kind = %kind,
                "Remote record applied"
            );
            let event = remote_event(schema, &remote, kind)?;
            ctx.publish(DataStoreEvent::Mutation(event.clone()));
            ctx.publish(DataStoreEvent::SyncReceived(event));
            Ok(true)
        }
    }
}
