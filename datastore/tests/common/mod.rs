#![allow(dead_code)]

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use harbor_datastore::harbor_engine::{
    DeliveryState, FieldDef, FieldType, Generated, MutationKind, Predicate, Record, Relationship,
    RemoteRecord, Schema, SchemaRegistry,
};
use harbor_datastore::{
    DataStore, DataStoreConfig, DataStoreEvent, EventReceiver, MutationRequest, RemoteApi,
    RemoteError, RemoteStream, Token,
};
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// Initialize tracing for tests
#[ctor::ctor]
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Post, Comment (children of Post) and a local-only Draft.
pub fn registry() -> SchemaRegistry {
    SchemaRegistry::new(1)
        .with_schema(
            Schema::new(
                "Post",
                vec![
                    FieldDef::required("id", FieldType::String),
                    FieldDef::required("title", FieldType::String),
                    FieldDef::optional("rating", FieldType::Int),
                    FieldDef::optional("status", FieldType::Enum),
                    FieldDef::generated("createdAt", Generated::CreatedAt),
                    FieldDef::generated("updatedAt", Generated::UpdatedAt),
                ],
            )
            .with_relationship(Relationship::has_many("comments", "Comment", "postId")),
        )
        .unwrap()
        .with_schema(
            Schema::new(
                "Comment",
                vec![
                    FieldDef::required("id", FieldType::String),
                    FieldDef::required("body", FieldType::String),
                    FieldDef::optional("postId", FieldType::String),
                ],
            )
            .with_relationship(Relationship::belongs_to("post", "Post", "postId")),
        )
        .unwrap()
        .with_schema(
            Schema::new(
                "Draft",
                vec![
                    FieldDef::required("id", FieldType::String),
                    FieldDef::required("text", FieldType::String),
                ],
            )
            .local_only(),
        )
        .unwrap()
}

/// Short delays so retries and batches settle quickly.
pub fn test_config() -> DataStoreConfig {
    DataStoreConfig::default()
        .with_backoff(Duration::from_millis(10), Duration::from_millis(100))
        .with_poll_interval(Duration::from_millis(20))
        .with_observe_batching(Duration::from_millis(50), 1000)
}

pub async fn open_store() -> DataStore {
    DataStore::open(test_config(), registry()).await.unwrap()
}

pub fn post(id: &str, title: &str) -> Record {
    Record::new("Post").with("id", id).with("title", title)
}

pub fn comment(id: &str, post_id: &str, body: &str) -> Record {
    Record::new("Comment")
        .with("id", id)
        .with("postId", post_id)
        .with("body", body)
}

pub fn token() -> Arc<Token> {
    Arc::new(Token::new("test-token"))
}

/// Wait for the first event matching `matches`, skipping others.
pub async fn wait_for<F>(events: &mut EventReceiver, mut matches: F) -> DataStoreEvent
where
    F: FnMut(&DataStoreEvent) -> bool,
{
    tokio::time::timeout(TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(err) => panic!("event hub closed: {}", err),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Poll `condition` until it holds.
pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(TIMEOUT, async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for condition")
}

/// Wait until every queued mutation was delivered or dropped.
pub async fn wait_until_drained(store: &DataStore) {
    let outbox = store.outbox();
    wait_until(move || {
        let outbox = outbox.clone();
        async move { outbox.is_empty().await.unwrap() }
    })
    .await
}

/// Wait until the head of the outbox was handed to the remote.
pub async fn wait_until_in_flight(store: &DataStore) {
    let outbox = store.outbox();
    wait_until(move || {
        let outbox = outbox.clone();
        async move {
            let entries = outbox.entries().await.unwrap();
            entries
                .first()
                .is_some_and(|entry| entry.state == DeliveryState::InFlight)
        }
    })
    .await
}

#[derive(Default)]
struct RemoteState {
    /// Server-side records by (schema, id)
    records: BTreeMap<(String, String), RemoteRecord>,
    /// Failures returned by the next mutate calls, in order
    failures: VecDeque<RemoteError>,
    requests: Vec<MutationRequest>,
    /// Leave the current state out of conflict errors
    bare_conflicts: bool,
    subscribers: Vec<mpsc::UnboundedSender<Result<RemoteRecord, RemoteError>>>,
    echo: bool,
}

/// In-memory remote with optimistic versioning.
///
/// A mutation is accepted when its expected version equals the stored
/// version (`None` for records the remote has never seen) and bumps the
/// version by one.
pub struct MockRemote {
    registry: SchemaRegistry,
    state: Mutex<RemoteState>,
}

impl MockRemote {
    pub fn new(registry: SchemaRegistry) -> Arc<Self> {
        Arc::new(Self {
            registry,
            state: Mutex::new(RemoteState::default()),
        })
    }

    fn key(&self, record: &Record) -> (String, String) {
        let schema = self.registry.get(record.schema()).unwrap();
        (
            schema.name.clone(),
            schema.identifier(record).unwrap(),
        )
    }

    /// Store a record remotely without notifying subscribers.
    pub fn seed(&self, record: Record, version: u64) {
        let key = self.key(&record);
        let remote = RemoteRecord::new(record, version).with_last_changed_at(1_000);
        self.state.lock().unwrap().records.insert(key, remote);
    }

    /// Store a record remotely and push it to subscribers, as if another
    /// client changed it.
    pub fn push(&self, remote: RemoteRecord) {
        let key = self.key(&remote.record);
        let mut state = self.state.lock().unwrap();
        state.records.insert(key, remote.clone());
        state
            .subscribers
            .retain(|subscriber| subscriber.unbounded_send(Ok(remote.clone())).is_ok());
    }

    /// Push a record to subscribers without storing it.
    pub fn deliver(&self, remote: RemoteRecord) {
        let mut state = self.state.lock().unwrap();
        state
            .subscribers
            .retain(|subscriber| subscriber.unbounded_send(Ok(remote.clone())).is_ok());
    }

    /// End every open subscription, as a dropped connection would.
    pub fn close_subscriptions(&self) {
        self.state.lock().unwrap().subscribers.clear();
    }

    /// Send an error to every open subscription.
    pub fn break_subscriptions(&self, error: RemoteError) {
        let mut state = self.state.lock().unwrap();
        for subscriber in &state.subscribers {
            let _ = subscriber.unbounded_send(Err(error.clone()));
        }
        state.subscribers.clear();
    }

    pub fn fail_next(&self, error: RemoteError) {
        self.state.lock().unwrap().failures.push_back(error);
    }

    pub fn set_bare_conflicts(&self, bare: bool) {
        self.state.lock().unwrap().bare_conflicts = bare;
    }

    /// Push accepted mutations back to subscribers.
    pub fn set_echo(&self, echo: bool) {
        self.state.lock().unwrap().echo = echo;
    }

    pub fn requests(&self) -> Vec<MutationRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn record(&self, schema: &str, id: &str) -> Option<RemoteRecord> {
        self.state
            .lock()
            .unwrap()
            .records
            .get(&(schema.to_string(), id.to_string()))
            .cloned()
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().unwrap().subscribers.len()
    }
}

#[async_trait]
impl RemoteApi for MockRemote {
    async fn mutate(&self, request: MutationRequest) -> Result<RemoteRecord, RemoteError> {
        let key = self.key(&request.record);
        let mut state = self.state.lock().unwrap();
        state.requests.push(request.clone());

        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }

        let current = state.records.get(&key).cloned();
        let current_version = current.as_ref().map(|r| r.version);
        if current_version != request.expected_version {
            let remote = if state.bare_conflicts { None } else { current };
            return Err(RemoteError::Conflict { remote });
        }

        let accepted = RemoteRecord::new(request.record, current_version.unwrap_or(0) + 1)
            .with_deleted(request.kind == MutationKind::Delete)
            .with_last_changed_at(chrono::Utc::now().timestamp_millis());
        state.records.insert(key, accepted.clone());
        if state.echo {
            let echoed = accepted.clone();
            state
                .subscribers
                .retain(|subscriber| subscriber.unbounded_send(Ok(echoed.clone())).is_ok());
        }
        Ok(accepted)
    }

    async fn query(
        &self,
        schema: &Schema,
        predicate: &Predicate,
        _token: &Token,
    ) -> Result<Vec<RemoteRecord>, RemoteError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .records
            .iter()
            .filter(|((name, _), remote)| {
                name == &schema.name && predicate.evaluate(&remote.record)
            })
            .map(|(_, remote)| remote.clone())
            .collect())
    }

    async fn subscribe(&self, schema: &Schema, _token: &Token) -> Result<RemoteStream, RemoteError> {
        let (sender, receiver) = mpsc::unbounded();
        self.state.lock().unwrap().subscribers.push(sender);

        let name = schema.name.clone();
        Ok(receiver
            .filter(move |item| {
                let keep = match item {
                    Ok(remote) => remote.record.schema() == name,
                    Err(_) => true,
                };
                futures::future::ready(keep)
            })
            .boxed())
    }
}
