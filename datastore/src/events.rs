//! Event hub.
//!
//! Every committed mutation, local or remote, and every sync lifecycle change
//! is published here. Observers and the application each hold their own
//! receiver; a receiver that falls behind the hub's capacity sees
//! [`broadcast::error::RecvError::Lagged`] and must recover by re-reading
//! storage.

use harbor_engine::{MutationEvent, SchemaName, Version};
use tokio::sync::broadcast;

/// Receiver for hub events.
pub type EventReceiver = broadcast::Receiver<DataStoreEvent>;

/// Something that happened in the data store.
#[derive(Debug, Clone, PartialEq)]
pub enum DataStoreEvent {
    /// A record changed locally or was received from the remote
    Mutation(MutationEvent),
    /// The outbox became empty or non-empty
    OutboxStatus { is_empty: bool },
    /// A local mutation was queued for the remote
    OutboxMutationEnqueued(MutationEvent),
    /// The remote accepted a queued mutation at `version`
    OutboxMutationProcessed {
        event: MutationEvent,
        version: Version,
    },
    /// The remote became reachable or unreachable
    NetworkStatus { online: bool },
    /// A remote record was applied locally
    SyncReceived(MutationEvent),
    /// Initial sync of one schema finished
    ModelSynced { schema: SchemaName },
    /// Initial sync of every syncable schema finished
    Ready,
    /// A queued mutation was given up on
    MutationFailed {
        event: MutationEvent,
        error: SyncFailure,
    },
    /// The remote rejected a mutation's condition
    ConditionalSaveFailed(MutationEvent),
    /// Local data was wiped
    Cleared,
}

/// Why a queued mutation was dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncFailure {
    #[error("Rejected by remote: {0}")]
    Validation(String),

    #[error("Unresolved conflict at remote version {remote_version}")]
    Conflict { remote_version: Version },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Gave up after {attempts} attempts: {message}")]
    RetriesExhausted { attempts: u32, message: String },

    #[error("Cannot deliver: {0}")]
    Local(String),
}

/// Broadcast hub shared by every component.
#[derive(Debug, Clone)]
pub struct EventHub {
    sender: broadcast::Sender<DataStoreEvent>,
}

impl EventHub {
    /// Create a hub holding at most `capacity` unread events per receiver.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Publish an event.
    ///
    /// Returns the number of receivers it reached; publishing with no
    /// receivers is not an error.
    pub fn publish(&self, event: DataStoreEvent) -> usize {
        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(_) => 0,
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
