//! Observed queries.
//!
//! An observed query emits a [`QuerySnapshot`] with the matching records
//! once the initial query completes and again whenever a batch of mutations
//! changes the result. Each subscription owns its state behind one mutex and
//! its own hub receiver. A subscriber that falls behind only ever holds the
//! latest snapshot: unread snapshots are replaced, never queued.
//!
//! ```text
//! initializing ──start──▶ querying ──initial result──▶ live
//!      ▲                     │                           │
//!      └───────reset─────────┴───────────────────────────┤
//!                                                        ▼
//!                                 cancel (any phase) ▶ cancelled
//! ```

use crate::datastore::Shared;
use crate::db::records;
use crate::error::Result;
use crate::events::DataStoreEvent;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use harbor_engine::{
    dedup_latest, MutationEvent, Predicate, QuerySnapshot, Record, ResultSet, Schema,
    SortDescriptor,
};
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Lifecycle phase of an observed query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservePhase {
    Initializing,
    Querying,
    Live,
    Cancelled,
}

struct State {
    phase: ObservePhase,
    /// Incremented per start; tasks of earlier runs never emit
    run_id: u64,
    result: ResultSet,
    generation: u64,
    sender: Option<watch::Sender<Option<QuerySnapshot>>>,
    task: Option<JoinHandle<()>>,
    is_synced: bool,
}

impl State {
    fn accepts(&self, run_id: u64, phase: ObservePhase) -> bool {
        self.run_id == run_id && self.phase == phase
    }

    fn emit(&mut self, items_changed: Vec<MutationEvent>) {
        let snapshot = self
            .result
            .snapshot(self.generation, self.is_synced, items_changed);
        if let Some(sender) = &self.sender {
            sender.send_replace(Some(snapshot));
        }
    }
}

struct Observer {
    shared: Arc<Shared>,
    schema: Schema,
    predicate: Predicate,
    sort: Vec<SortDescriptor>,
    requery: bool,
    state: Mutex<State>,
}

impl Observer {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn load(&self) -> Result<Vec<Record>> {
        let mut conn = self.shared.pool.acquire().await?;
        records::query(
            &mut conn,
            &self.shared.registry,
            &self.schema,
            &self.predicate,
            &self.sort,
            self.requery,
        )
        .await
    }

    fn start(self: &Arc<Self>) {
        let mut state = self.state();
        if state.phase != ObservePhase::Initializing {
            return;
        }
        state.run_id += 1;
        state.phase = ObservePhase::Querying;
        state.task = Some(tokio::spawn(run(self.clone(), state.run_id)));
    }

    fn reset(&self) {
        let mut state = self.state();
        if state.phase == ObservePhase::Cancelled {
            return;
        }
        if let Some(task) = state.task.take() {
            task.abort();
        }
        state.result.clear();
        state.generation = 0;
        state.phase = ObservePhase::Initializing;
    }

    fn cancel(&self) {
        let mut state = self.state();
        if state.phase == ObservePhase::Cancelled {
            return;
        }
        state.phase = ObservePhase::Cancelled;
        if let Some(task) = state.task.take() {
            task.abort();
        }
        state.sender = None;
        tracing::debug!(schema = %self.schema.name, "Observed query cancelled");
    }

    /// Install the initial result as generation 0 and go live.
    fn go_live(&self, run_id: u64, records: Vec<Record>) -> Result<bool> {
        let mut state = self.state();
        if !state.accepts(run_id, ObservePhase::Querying) {
            return Ok(false);
        }
        state.result.replace_all(records)?;
        state.generation = 0;
        state.is_synced = self.shared.ready.load(Ordering::SeqCst);
        state.emit(Vec::new());
        state.phase = ObservePhase::Live;
        Ok(true)
    }

    /// Fold a batch into the result and emit if anything visible changed.
    async fn flush(&self, run_id: u64, batch: &[MutationEvent], pending: Pending) -> Result<()> {
        let fresh = if pending.rescan || (self.requery && !batch.is_empty()) {
            Some(self.load().await?)
        } else {
            None
        };

        let mut state = self.state();
        if !state.accepts(run_id, ObservePhase::Live) {
            return Ok(());
        }

        let changed = match fresh {
            Some(records) => {
                let before = state.result.items();
                state.result.replace_all(records)?;
                pending.rescan || before != state.result.items()
            }
            None => {
                let mut changed = false;
                for event in batch {
                    changed |= state.result.apply(&self.shared.registry, event)?;
                }
                changed
            }
        };

        let is_synced = if pending.rescan {
            self.shared.ready.load(Ordering::SeqCst)
        } else {
            state.is_synced || pending.synced
        };
        let synced_changed = is_synced != state.is_synced;
        state.is_synced = is_synced;

        if changed || synced_changed {
            state.generation += 1;
            state.emit(dedup_latest(batch));
        }
        Ok(())
    }

    fn finish(&self, run_id: u64) {
        let cancel = self.state().run_id == run_id;
        if cancel {
            self.cancel();
        }
    }
}

/// What besides mutations is waiting to be flushed.
#[derive(Debug, Default, Clone, Copy)]
struct Pending {
    /// The receiver lagged or local data was wiped
    rescan: bool,
    /// A sync-complete event arrived
    synced: bool,
}

async fn run(observer: Arc<Observer>, run_id: u64) {
    // Subscribe before querying so nothing committed in between is missed.
    let mut events = observer.shared.hub.subscribe();

    let initial = observer.load().await;
    let live = initial.and_then(|records| observer.go_live(run_id, records));
    match live {
        Ok(true) => {}
        Ok(false) => return,
        Err(err) => {
            tracing::error!(schema = %observer.schema.name, error = %err, "Observed query failed");
            observer.finish(run_id);
            return;
        }
    }

    let config = &observer.shared.config;
    let mut batch: Vec<MutationEvent> = Vec::new();
    let mut pending = Pending::default();
    let mut deadline: Option<Instant> = None;

    loop {
        let flush_now = tokio::select! {
            received = events.recv() => match received {
                Ok(DataStoreEvent::Mutation(event)) if event.schema_name == observer.schema.name => {
                    batch.push(event);
                    deadline.get_or_insert_with(|| Instant::now() + config.observe_batch_window);
                    batch.len() >= config.observe_max_batch
                }
                Ok(DataStoreEvent::ModelSynced { schema }) if schema == observer.schema.name => {
                    pending.synced = true;
                    true
                }
                Ok(DataStoreEvent::Ready) => {
                    pending.synced = true;
                    true
                }
                Ok(DataStoreEvent::Cleared) => {
                    pending.rescan = true;
                    true
                }
                Ok(_) => false,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(schema = %observer.schema.name, skipped, "Observer lagged, re-querying");
                    pending.rescan = true;
                    true
                }
                Err(RecvError::Closed) => return,
            },
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => true,
        };

        if flush_now {
            if let Err(err) = observer.flush(run_id, &batch, pending).await {
                tracing::error!(schema = %observer.schema.name, error = %err, "Failed to refresh observed query");
            }
            batch.clear();
            pending = Pending::default();
            deadline = None;
        }
    }
}

/// A live query subscription.
///
/// Snapshots are read with [`QuerySubscription::next`] or as a [`Stream`].
/// The stream ends once the subscription is cancelled; dropping the
/// subscription cancels it.
pub struct QuerySubscription {
    observer: Arc<Observer>,
    snapshots: BoxStream<'static, QuerySnapshot>,
}

impl QuerySubscription {
    pub(crate) fn new(
        shared: Arc<Shared>,
        schema: Schema,
        predicate: Predicate,
        sort: Vec<SortDescriptor>,
    ) -> Self {
        let (sender, receiver) = watch::channel(None);
        let result = ResultSet::new(schema.clone(), predicate.clone(), sort.clone());
        let requery = result.requires_requery();
        let observer = Arc::new(Observer {
            shared,
            schema,
            predicate,
            sort,
            requery,
            state: Mutex::new(State {
                phase: ObservePhase::Initializing,
                run_id: 0,
                result,
                generation: 0,
                sender: Some(sender),
                task: None,
                is_synced: false,
            }),
        });
        Self {
            observer,
            snapshots: latest_snapshots(receiver),
        }
    }

    /// Wait for the next snapshot. `None` once cancelled.
    pub async fn next(&mut self) -> Option<QuerySnapshot> {
        self.snapshots.next().await
    }

    /// Run the initial query and go live. Does nothing unless initializing.
    pub fn start(&self) {
        self.observer.start();
    }

    /// Stop the current run and return to initializing.
    ///
    /// The generation starts again at 0 on the next [`start`](Self::start).
    pub fn reset(&self) {
        self.observer.reset();
    }

    /// End the subscription. The snapshot stream completes after any
    /// snapshots already delivered.
    pub fn cancel(&self) {
        self.observer.cancel();
    }

    pub fn phase(&self) -> ObservePhase {
        self.observer.state().phase
    }

    /// A handle for controlling this subscription from other tasks.
    pub fn handle(&self) -> QueryHandle {
        QueryHandle {
            observer: self.observer.clone(),
        }
    }
}

/// Controls a [`QuerySubscription`] without reading its snapshots.
///
/// Handles are cheap to clone and may be used from any thread. They do not
/// keep the subscription alive: once it is dropped, it is cancelled.
#[derive(Clone)]
pub struct QueryHandle {
    observer: Arc<Observer>,
}

impl QueryHandle {
    pub fn start(&self) {
        self.observer.start();
    }

    pub fn reset(&self) {
        self.observer.reset();
    }

    pub fn cancel(&self) {
        self.observer.cancel();
    }

    pub fn phase(&self) -> ObservePhase {
        self.observer.state().phase
    }
}

impl std::fmt::Debug for QueryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryHandle")
            .field("schema", &self.observer.schema.name)
            .field("phase", &self.phase())
            .finish()
    }
}

impl Stream for QuerySubscription {
    type Item = QuerySnapshot;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.snapshots.poll_next_unpin(cx)
    }
}

/// Each snapshot not yet read, skipping any replaced before it was read.
/// Ends once the sender is dropped and the last snapshot was read.
fn latest_snapshots(
    receiver: watch::Receiver<Option<QuerySnapshot>>,
) -> BoxStream<'static, QuerySnapshot> {
    futures::stream::unfold(receiver, |mut receiver| async move {
        loop {
            receiver.changed().await.ok()?;
            let latest = receiver.borrow_and_update().clone();
            if let Some(snapshot) = latest {
                return Some((snapshot, receiver));
            }
        }
    })
    .fuse()
    .boxed()
}

impl Drop for QuerySubscription {
    fn drop(&mut self) {
        self.observer.cancel();
    }
}

impl std::fmt::Debug for QuerySubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuerySubscription")
            .field("schema", &self.observer.schema.name)
            .field("phase", &self.phase())
            .finish()
    }
}
