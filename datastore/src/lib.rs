//! # Harbor Data Store
//!
//! An offline-first local data store on SQLite.
//!
//! Applications read and write records locally through a [`DataStore`].
//! Writes to syncable schemas are queued in a durable outbox inside the same
//! transaction, and background sync delivers them to a [`RemoteApi`] in
//! per-record order once started. Records changed on the remote flow back in
//! through subscriptions and are applied unless local changes are still
//! queued.
//!
//! ## Overview
//!
//! - [`DataStore`]: open, save, delete, query, observe, start/stop sync
//! - [`QuerySubscription`]: live query snapshots, batched
//! - [`DataStoreEvent`]: everything that happens, on one broadcast hub
//! - [`RemoteApi`] / [`CredentialProvider`]: the collaborators sync talks to
//! - [`db`]: the SQLite storage adapter and outbox
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use harbor_datastore::harbor_engine::{
//!     field, FieldDef, FieldType, Record, Schema, SchemaRegistry, SortDescriptor,
//! };
//! use harbor_datastore::DataStore;
//!
//! # async fn example() -> harbor_datastore::Result<()> {
//! let registry = SchemaRegistry::new(1).with_schema(Schema::new(
//!     "Post",
//!     vec![
//!         FieldDef::required("id", FieldType::String),
//!         FieldDef::required("title", FieldType::String),
//!     ],
//! ))?;
//! let store = DataStore::open_in_memory(registry).await?;
//!
//! store
//!     .save(Record::new("Post").with("id", "1").with("title", "Apple"))
//!     .await?;
//!
//! let mut posts = store.observe_query(
//!     "Post",
//!     field("title").begins_with("A"),
//!     vec![SortDescriptor::ascending("title")],
//! )?;
//! let snapshot = posts.next().await;
//! assert_eq!(snapshot.map(|s| s.items.len()), Some(1));
//! # Ok(())
//! # }
//! ```

pub mod config;
mod datastore;
pub mod db;
pub mod error;
pub mod events;
pub mod observe;
pub mod remote;
mod sync;

pub use harbor_engine;

pub use config::{ConfigError, DataStoreConfig};
pub use datastore::DataStore;
pub use error::{DataStoreError, Result};
pub use events::{DataStoreEvent, EventHub, EventReceiver, SyncFailure};
pub use observe::{ObservePhase, QueryHandle, QuerySubscription};
pub use remote::{
    AuthError, CredentialProvider, MutationRequest, RemoteApi, RemoteError, RemoteStream, Token,
};
