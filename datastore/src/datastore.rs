//! The application-facing data store.

use crate::config::DataStoreConfig;
use crate::db::{self, metadata, outbox, records, Outbox, Pool};
use crate::error::{DataStoreError, Result};
use crate::events::{DataStoreEvent, EventHub, EventReceiver};
use crate::observe::QuerySubscription;
use crate::remote::{CredentialProvider, RemoteApi};
use crate::sync::{self, SyncHandle};
use harbor_engine::{
    field, ConflictPolicy, Error, LazyRef, MutationEvent, MutationKind, Origin, Predicate,
    Reconciler, Record, RecordId, RelationshipKind, Schema, SchemaRegistry, SortDescriptor,
    SyncMetadata, Timestamp,
};
use sqlx::sqlite::SqliteConnection;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

/// Current time in milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

fn event_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// State shared by the store, its sync tasks and its observers.
pub(crate) struct Shared {
    pub(crate) pool: Pool,
    pub(crate) registry: Arc<SchemaRegistry>,
    pub(crate) config: DataStoreConfig,
    pub(crate) hub: EventHub,
    /// Set once every syncable schema finished its initial sync
    pub(crate) ready: AtomicBool,
    /// Wakes the outbox driver
    pub(crate) outbox_signal: Notify,
}

/// Events to publish once a transaction committed.
#[derive(Default)]
struct Committed {
    mutations: Vec<MutationEvent>,
    enqueued: Vec<MutationEvent>,
    outbox_empty: Option<bool>,
}

impl Committed {
    fn publish(self, shared: &Shared) {
        for event in self.mutations {
            shared.hub.publish(DataStoreEvent::Mutation(event));
        }
        let queued = !self.enqueued.is_empty();
        for event in self.enqueued {
            shared.hub.publish(DataStoreEvent::OutboxMutationEnqueued(event));
        }
        if let Some(is_empty) = self.outbox_empty {
            shared.hub.publish(DataStoreEvent::OutboxStatus { is_empty });
        }
        if queued {
            shared.outbox_signal.notify_one();
        }
    }
}

/// An offline-first local data store.
///
/// Every read and write goes to the local SQLite database. Writes to
/// syncable schemas are queued in the outbox in the same transaction and
/// delivered to the remote once sync is [started](DataStore::start).
pub struct DataStore {
    shared: Arc<Shared>,
    sync: Mutex<Option<SyncHandle>>,
}

impl DataStore {
    /// Open the store described by `config`.
    ///
    /// Schema tables are created when missing. When the registry version
    /// differs from the one the database was created with, every schema
    /// table and all sync state are dropped first.
    pub async fn open(config: DataStoreConfig, registry: SchemaRegistry) -> Result<Self> {
        let config = config.validated()?;
        registry.validate()?;

        let pool = db::create_pool(config.database_path.as_deref()).await?;
        db::run_migrations(&pool).await?;

        let mut tx = pool.begin().await?;
        if let Some(stored) = metadata::registry_version(&mut tx).await? {
            if stored != registry.version {
                tracing::warn!(
                    stored,
                    current = registry.version,
                    "Schema registry version changed, resetting local data"
                );
                records::drop_tables(&mut tx).await?;
                outbox::clear(&mut tx).await?;
                metadata::clear(&mut tx).await?;
            }
        }
        records::create_tables(&mut tx, &registry).await?;
        metadata::set_registry_version(&mut tx, registry.version).await?;
        tx.commit().await?;

        tracing::info!(
            path = ?config.database_path,
            schemas = registry.schemas.len(),
            version = registry.version,
            "Data store opened"
        );

        let hub = EventHub::new(config.event_capacity);
        Ok(Self {
            shared: Arc::new(Shared {
                pool,
                registry: Arc::new(registry),
                config,
                hub,
                ready: AtomicBool::new(false),
                outbox_signal: Notify::new(),
            }),
            sync: Mutex::new(None),
        })
    }

    /// Open a store that lives in memory with default settings.
    pub async fn open_in_memory(registry: SchemaRegistry) -> Result<Self> {
        Self::open(DataStoreConfig::default(), registry).await
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.shared.registry
    }

    pub fn config(&self) -> &DataStoreConfig {
        &self.shared.config
    }

    /// Whether the initial sync finished since sync was last started.
    pub fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::SeqCst)
    }

    /// Insert or update a record and queue it for the remote.
    ///
    /// Returns the stored record, including generated fields.
    pub async fn save(&self, record: Record) -> Result<Record> {
        self.save_inner(record, None).await
    }

    /// Save only if the stored record matches `condition`.
    ///
    /// The condition is checked against the existing row; a record that
    /// does not exist yet is always saved. Fails with
    /// [`Error::ConditionFailed`] otherwise.
    pub async fn save_with(&self, record: Record, condition: &Predicate) -> Result<Record> {
        self.save_inner(record, Some(condition)).await
    }

    async fn save_inner(&self, record: Record, condition: Option<&Predicate>) -> Result<Record> {
        let registry = &self.shared.registry;
        let schema = registry.get(record.schema())?;
        let now = now_millis();

        let mut tx = self.shared.pool.begin().await?;
        if let Some(condition) = condition {
            let id = schema.identifier(&record)?;
            if let Some(existing) = records::fetch(&mut tx, registry, schema, &id, true).await? {
                if !condition.evaluate(&existing) {
                    return Err(Error::ConditionFailed(id).into());
                }
            }
        }

        let (stored, kind) = records::save(&mut tx, registry, schema, record, now).await?;
        let mut committed = Committed::default();
        self.record_mutation(&mut tx, schema, &stored, kind, now, &mut committed)
            .await?;
        tx.commit().await?;

        committed.publish(&self.shared);
        Ok(stored)
    }

    /// Describe a committed local write and queue it when syncable.
    async fn record_mutation(
        &self,
        conn: &mut SqliteConnection,
        schema: &Schema,
        record: &Record,
        kind: MutationKind,
        now: Timestamp,
        committed: &mut Committed,
    ) -> Result<()> {
        let record_id = schema.identifier(record)?;
        let version = metadata::get(conn, &schema.name, &record_id)
            .await?
            .map(|current| current.version);
        let event = MutationEvent::new(
            event_id(),
            schema,
            record,
            kind,
            version,
            now,
            Origin::Local,
        )?;

        if schema.syncable {
            if let Some(entry) = outbox::enqueue(conn, &event).await? {
                committed.enqueued.push(entry.event);
            }
            committed.outbox_empty = Some(outbox::is_empty(conn).await?);
        }
        committed.mutations.push(event);
        Ok(())
    }

    /// Delete one record and, first, every record that refers to it through
    /// a has-many relationship.
    pub async fn delete(&self, schema_name: &str, id: &str) -> Result<()> {
        let registry = &self.shared.registry;
        let schema = registry.get(schema_name)?;

        let mut tx = self.shared.pool.begin().await?;
        let root = records::fetch(&mut tx, registry, schema, id, false)
            .await?
            .ok_or_else(|| DataStoreError::NotFound(format!("{} {}", schema_name, id)))?;

        let mut committed = Committed::default();
        self.delete_records(&mut tx, vec![(schema, root)], &mut committed)
            .await?;
        tx.commit().await?;

        committed.publish(&self.shared);
        Ok(())
    }

    /// Delete every record of `schema_name` matching `predicate`, with the
    /// same cascade as [`delete`](Self::delete). Returns the deleted ids of
    /// matching records.
    pub async fn delete_where(
        &self,
        schema_name: &str,
        predicate: &Predicate,
    ) -> Result<Vec<RecordId>> {
        let registry = &self.shared.registry;
        let schema = registry.get(schema_name)?;

        let mut tx = self.shared.pool.begin().await?;
        let matching = records::query(&mut tx, registry, schema, predicate, &[], false).await?;
        let ids = matching
            .iter()
            .map(|record| schema.identifier(record))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut committed = Committed::default();
        let roots = matching.into_iter().map(|record| (schema, record)).collect();
        self.delete_records(&mut tx, roots, &mut committed).await?;
        tx.commit().await?;

        committed.publish(&self.shared);
        Ok(ids)
    }

    async fn delete_records<'a>(
        &'a self,
        conn: &mut SqliteConnection,
        roots: Vec<(&'a Schema, Record)>,
        committed: &mut Committed,
    ) -> Result<()> {
        let now = now_millis();
        for (schema, record) in self.cascade(conn, roots).await? {
            let record_id = schema.identifier(&record)?;
            if !records::delete_by_id(conn, schema, &record_id).await? {
                continue;
            }
            metadata::mark_deleted(conn, &schema.name, &record_id, now).await?;
            self.record_mutation(conn, schema, &record, MutationKind::Delete, now, committed)
                .await?;
            tracing::debug!(schema = %schema.name, record_id = %record_id, "Deleted record");
        }
        Ok(())
    }

    /// Expand roots to every record reachable through has-many
    /// relationships, children before their parents.
    async fn cascade<'a>(
        &'a self,
        conn: &mut SqliteConnection,
        roots: Vec<(&'a Schema, Record)>,
    ) -> Result<Vec<(&'a Schema, Record)>> {
        let registry: &'a SchemaRegistry = &self.shared.registry;
        let mut ordered = Vec::new();
        let mut visited = HashSet::new();
        let mut stack: Vec<(&'a Schema, Record, bool)> = roots
            .into_iter()
            .rev()
            .map(|(schema, record)| (schema, record, false))
            .collect();

        while let Some((schema, record, expanded)) = stack.pop() {
            if expanded {
                ordered.push((schema, record));
                continue;
            }
            let record_id = schema.identifier(&record)?;
            if !visited.insert((schema.name.clone(), record_id.clone())) {
                continue;
            }

            let mut children = Vec::new();
            for relationship in &schema.relationships {
                if relationship.kind != RelationshipKind::HasMany {
                    continue;
                }
                let target = registry.get(&relationship.target)?;
                let refers = field(relationship.foreign_key.clone()).eq(record_id.clone());
                for child in records::query(conn, registry, target, &refers, &[], false).await? {
                    children.push((target, child, false));
                }
            }

            stack.push((schema, record, true));
            stack.extend(children);
        }
        Ok(ordered)
    }

    /// Records of `schema_name` matching `predicate`, sorted by `sort`.
    ///
    /// With `eager`, belongs-to and has-one relationships are loaded inline;
    /// otherwise they are [`LazyRef`]s for [`resolve`](Self::resolve).
    pub async fn query(
        &self,
        schema_name: &str,
        predicate: &Predicate,
        sort: &[SortDescriptor],
        eager: bool,
    ) -> Result<Vec<Record>> {
        let schema = self.shared.registry.get(schema_name)?;
        let mut conn = self.shared.pool.acquire().await?;
        records::query(&mut conn, &self.shared.registry, schema, predicate, sort, eager).await
    }

    pub async fn query_by_id(
        &self,
        schema_name: &str,
        id: &str,
        eager: bool,
    ) -> Result<Option<Record>> {
        let schema = self.shared.registry.get(schema_name)?;
        let mut conn = self.shared.pool.acquire().await?;
        records::fetch(&mut conn, &self.shared.registry, schema, id, eager).await
    }

    /// Load the record(s) behind a lazy relationship.
    pub async fn resolve(&self, lazy: &LazyRef) -> Result<Vec<Record>> {
        let mut conn = self.shared.pool.acquire().await?;
        records::resolve(&mut conn, &self.shared.registry, lazy).await
    }

    /// Observe the records of `schema_name` matching `predicate`.
    ///
    /// The subscription is started: its first snapshot is the current
    /// result, followed by one snapshot per batch of changes.
    pub fn observe_query(
        &self,
        schema_name: &str,
        predicate: Predicate,
        sort: Vec<SortDescriptor>,
    ) -> Result<QuerySubscription> {
        let schema = self.shared.registry.get(schema_name)?.clone();
        let subscription = QuerySubscription::new(self.shared.clone(), schema, predicate, sort);
        subscription.start();
        Ok(subscription)
    }

    /// Subscribe to every event published by the store.
    pub fn events(&self) -> EventReceiver {
        self.shared.hub.subscribe()
    }

    pub fn outbox(&self) -> Outbox {
        Outbox::new(self.shared.pool.clone())
    }

    /// Sync state of one record; `None` for records the remote never
    /// acknowledged.
    pub async fn sync_metadata(&self, schema_name: &str, id: &str) -> Result<Option<SyncMetadata>> {
        let schema = self.shared.registry.get(schema_name)?;
        let mut conn = self.shared.pool.acquire().await?;
        metadata::get(&mut conn, &schema.name, id).await
    }

    /// Start syncing with the remote, resolving conflicts remote-wins.
    pub async fn start(
        &self,
        remote: Arc<dyn RemoteApi>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<()> {
        self.start_with_policy(remote, credentials, ConflictPolicy::default())
            .await
    }

    /// Start syncing with the remote using `policy` for version conflicts.
    pub async fn start_with_policy(
        &self,
        remote: Arc<dyn RemoteApi>,
        credentials: Arc<dyn CredentialProvider>,
        policy: ConflictPolicy,
    ) -> Result<()> {
        let mut running = self.sync.lock().await;
        if running.is_some() {
            return Err(DataStoreError::AlreadyStarted);
        }

        {
            let mut conn = self.shared.pool.acquire().await?;
            let released = outbox::reset_in_flight(&mut conn).await?;
            if released > 0 {
                tracing::info!(released, "Released interrupted deliveries");
            }
        }

        let reconciler =
            Reconciler::new(policy).with_auto_resolve(self.shared.config.auto_resolve_conflicts);
        *running = Some(sync::spawn(
            self.shared.clone(),
            remote,
            credentials,
            reconciler,
        ));
        Ok(())
    }

    /// Stop syncing. Queued mutations stay in the outbox.
    pub async fn stop(&self) -> Result<()> {
        let handle = self.sync.lock().await.take();
        match handle {
            Some(handle) => handle.stop().await,
            None => Ok(()),
        }
    }

    pub async fn is_started(&self) -> bool {
        self.sync.lock().await.is_some()
    }

    /// Stop syncing and delete all local data, queued mutations and sync
    /// state. Schema tables are kept.
    pub async fn clear(&self) -> Result<()> {
        self.stop().await?;

        let mut tx = self.shared.pool.begin().await?;
        for schema in self.shared.registry.iter() {
            records::delete_all(&mut tx, schema).await?;
        }
        outbox::clear(&mut tx).await?;
        metadata::clear(&mut tx).await?;
        tx.commit().await?;

        tracing::info!("Local data cleared");
        self.shared.hub.publish(DataStoreEvent::Cleared);
        self.shared
            .hub
            .publish(DataStoreEvent::OutboxStatus { is_empty: true });
        Ok(())
    }

    /// Stop syncing and close the database.
    pub async fn close(self) -> Result<()> {
        self.stop().await?;
        self.shared.pool.close().await;
        Ok(())
    }
}

impl std::fmt::Debug for DataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStore")
            .field("database_path", &self.shared.config.database_path)
            .field("registry_version", &self.shared.registry.version)
            .finish()
    }
}
