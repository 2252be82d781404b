//! # Harbor Engine
//!
//! The pure core of the Harbor offline-first data store.
//!
//! This crate holds everything that can be decided without touching a disk or
//! a network: schema descriptions, record values, query predicates and their
//! translation to SQL, in-memory sorting, the outbox state machine, and the
//! conflict and disposition rules used during reconciliation. The
//! `harbor-datastore` crate drives these pieces against SQLite and a remote
//! collaborator.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine never opens files, sockets or tasks
//! - **Deterministic**: the same inputs always produce the same outputs
//! - **Explicit registry**: schemas are registered on a [`SchemaRegistry`]
//!   value that is passed around, never on global state
//!
//! ## Core Concepts
//!
//! ### Records
//!
//! A [`Record`] is a schema-tagged map of field name to [`Value`]. Values are a
//! tagged enum; field access goes through the owning [`Schema`] so that an
//! unknown field is an error rather than a silent `Null`.
//!
//! ### Predicates
//!
//! A [`Predicate`] is an immutable tree of comparisons and `and`/`or`/`not`
//! groups. It can be evaluated against a record in memory
//! ([`Predicate::evaluate`]) or translated to a parameterized SQL clause
//! ([`translate()`]). Both paths agree on every record.
//!
//! ### Mutations and the outbox
//!
//! Every committed change is described by a [`MutationEvent`]. Local events
//! are queued as [`OutboxEntry`] values whose [`DeliveryState`] moves through
//! `pending → in-flight → acknowledged | conflict`.
//!
//! ### Reconciliation
//!
//! The [`Reconciler`] decides what to do when the remote rejects a stale
//! mutation, and whether a remote-origin record should be applied locally.
//! The default [`ConflictPolicy`] is remote-wins.
//!
//! ## Quick Start
//!
//! ```rust
//! use harbor_engine::{
//!     field, translate, FieldDef, FieldType, Record, Schema, SchemaRegistry,
//! };
//!
//! // 1. Register a schema
//! let registry = SchemaRegistry::new(1)
//!     .with_schema(Schema::new(
//!         "Post",
//!         vec![
//!             FieldDef::required("id", FieldType::String),
//!             FieldDef::required("title", FieldType::String),
//!         ],
//!     ))
//!     .unwrap();
//! let posts = registry.get("Post").unwrap();
//!
//! // 2. Build a record
//! let post = Record::new("Post").with("id", "1").with("title", "Apple");
//!
//! // 3. Evaluate and translate a predicate
//! let predicate = field("title").begins_with("A");
//! assert!(predicate.evaluate(&post));
//!
//! let clause = translate(&registry, posts, &predicate).unwrap();
//! assert_eq!(clause.sql, "instr(\"root\".\"title\", ?) = 1");
//! assert_eq!(clause.values.len(), 1);
//! ```

pub mod error;
pub mod mutation;
pub mod outbox;
pub mod predicate;
pub mod reconcile;
pub mod record;
pub mod schema;
pub mod snapshot;
pub mod sort;
pub mod statement;
pub mod translate;
pub mod value;

// Re-export main types at crate root
pub use error::Error;
pub use mutation::{MutationEvent, MutationKind, SyncMetadata};
pub use outbox::{ingest, DeliveryState, Ingest, OutboxEntry};
pub use predicate::{field, Comparison, FieldRef, GroupKind, Operator, Predicate};
pub use reconcile::{
    Conflict, ConflictHandler, ConflictOutcome, ConflictPolicy, ConflictResolution, DropReason,
    Reconciler, RemoteDisposition, RemoteRecord,
};
pub use record::{Origin, Record};
pub use schema::{
    FieldDef, FieldType, Generated, Relationship, RelationshipKind, Schema, SchemaRegistry,
};
pub use snapshot::{dedup_latest, QuerySnapshot, ResultSet};
pub use sort::{compare_records, sort_records, SortDescriptor, SortOrder};
pub use statement::{Select, SelectColumn, StorageClass};
pub use translate::{translate, Translated};
pub use value::{LazyRef, SqlValue, Value};

/// Type aliases for clarity
pub type RecordId = String;
pub type SchemaName = String;
pub type EventId = String;
pub type Version = u64;
/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;
pub type SchemaVersion = u32;
