//! Background reconciliation with the remote.
//!
//! Two tasks run while sync is started:
//!
//! - the outgoing driver drains the outbox in order, one in-flight entry per
//!   record, bounded by `sync_concurrency`
//! - the incoming task runs the initial sync of every syncable schema and
//!   then applies records pushed by the remote subscriptions, subscribing
//!   again and catching up whenever a subscription is lost
//!
//! Both write through the same single-connection pool as the application, so
//! every transaction they commit is observed atomically.

mod incoming;
mod outgoing;

use crate::datastore::{now_millis, Shared};
use crate::db::{metadata, records};
use crate::error::Result;
use crate::events::DataStoreEvent;
use crate::remote::{CredentialProvider, RemoteApi, Token};
use dashmap::DashMap;
use harbor_engine::{
    EventId, MutationEvent, MutationKind, Origin, Reconciler, RecordId, RemoteRecord, Schema,
    SchemaName,
};
use sqlx::sqlite::SqliteConnection;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// State shared by the sync tasks.
pub(crate) struct SyncContext {
    shared: Arc<Shared>,
    remote: Arc<dyn RemoteApi>,
    credentials: Arc<dyn CredentialProvider>,
    reconciler: Reconciler,
    /// Records with an entry handed to the remote
    in_flight: DashMap<(SchemaName, RecordId), EventId>,
    /// Entries waiting out a retry delay
    not_before: DashMap<EventId, Instant>,
    permits: Arc<Semaphore>,
    online: AtomicBool,
}

impl SyncContext {
    fn publish(&self, event: DataStoreEvent) {
        self.shared.hub.publish(event);
    }

    fn mark_online(&self) {
        if !self.online.swap(true, Ordering::SeqCst) {
            tracing::info!("Remote reachable again");
            self.publish(DataStoreEvent::NetworkStatus { online: true });
        }
    }

    fn mark_offline(&self) {
        if self.online.swap(false, Ordering::SeqCst) {
            tracing::warn!("Remote unreachable");
            self.publish(DataStoreEvent::NetworkStatus { online: false });
        }
    }

    /// Obtain a token, waiting out retryable failures.
    ///
    /// Returns `None` when the provider reports a terminal failure.
    async fn token(&self) -> Option<Token> {
        let mut attempts = 0;
        loop {
            match self.credentials.current_token().await {
                Ok(token) => return Some(token),
                Err(err) if err.terminal => {
                    tracing::error!(error = %err, "Credentials rejected");
                    return None;
                }
                Err(err) => {
                    attempts += 1;
                    self.mark_offline();
                    let delay = self.shared.config.backoff(attempts);
                    tracing::warn!(error = %err, attempts, ?delay, "Token unavailable, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Time until the next retry delay runs out, bounded by the poll
    /// interval.
    fn next_wake(&self) -> Duration {
        let now = Instant::now();
        self.not_before
            .iter()
            .map(|due| due.value().saturating_duration_since(now))
            .min()
            .unwrap_or(self.shared.config.poll_interval)
            .min(self.shared.config.poll_interval)
    }
}

/// Write a remote record over local state.
///
/// Returns the mutation kind applied, or `None` when a delete found nothing
/// to remove and the record was never known locally.
async fn write_remote(
    conn: &mut SqliteConnection,
    shared: &Shared,
    schema: &Schema,
    remote: &RemoteRecord,
    known: bool,
) -> Result<Option<MutationKind>> {
    let id = schema.identifier(&remote.record)?;
    let kind = remote.mutation_kind();

    if kind == MutationKind::Delete {
        let existed = records::delete_by_id(conn, schema, &id).await?;
        if !existed && !known {
            return Ok(None);
        }
    } else {
        records::upsert(conn, &shared.registry, schema, &remote.record).await?;
    }
    metadata::upsert(conn, &remote.metadata(schema)?).await?;
    Ok(Some(kind))
}

/// Describe a remote write as a hub event.
fn remote_event(
    schema: &Schema,
    remote: &RemoteRecord,
    kind: MutationKind,
) -> Result<MutationEvent> {
    let timestamp = if remote.last_changed_at > 0 {
        remote.last_changed_at
    } else {
        now_millis()
    };
    Ok(MutationEvent::new(
        uuid::Uuid::new_v4().to_string(),
        schema,
        &remote.record,
        kind,
        Some(remote.version),
        timestamp,
        Origin::Remote,
    )?)
}

/// Running sync tasks.
pub(crate) struct SyncHandle {
    context: Arc<SyncContext>,
    tasks: Vec<JoinHandle<()>>,
}

/// Start the outgoing and incoming tasks.
pub(crate) fn spawn(
    shared: Arc<Shared>,
    remote: Arc<dyn RemoteApi>,
    credentials: Arc<dyn CredentialProvider>,
    reconciler: Reconciler,
) -> SyncHandle {
    let permits = Arc::new(Semaphore::new(shared.config.sync_concurrency));
    let context = Arc::new(SyncContext {
        shared,
        remote,
        credentials,
        reconciler,
        in_flight: DashMap::new(),
        not_before: DashMap::new(),
        permits,
        online: AtomicBool::new(true),
    });

    let tasks = vec![
        tokio::spawn(outgoing::drive(context.clone())),
        tokio::spawn(incoming::run(context.clone())),
    ];
    tracing::info!("Sync started");

    SyncHandle { context, tasks }
}

impl SyncHandle {
    /// Abort every sync task and return in-flight entries to pending.
    pub(crate) async fn stop(mut self) -> Result<()> {
        let tasks = std::mem::take(&mut self.tasks);
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            // Cancelled tasks report a JoinError; either way they are gone.
            let _ = task.await;
        }

        let shared = &self.context.shared;
        let mut conn = shared.pool.acquire().await?;
        let released = crate::db::outbox::reset_in_flight(&mut conn).await?;
        shared.ready.store(false, Ordering::SeqCst);

        tracing::info!(released, "Sync stopped");
        Ok(())
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
