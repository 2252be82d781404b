//! Mutation events and per-record sync metadata.
//!
//! Changes are recorded as events, never as edits of earlier events. A local
//! save produces one [`MutationEvent`] that is both queued for the remote and
//! broadcast to observers; a change received from the remote produces one
//! that is only broadcast.

use crate::{
    error::Result, Error, EventId, Origin, Record, RecordId, Schema, SchemaName, SchemaRegistry,
    Timestamp, Version,
};
use serde::{Deserialize, Serialize};

/// Kind of change a mutation makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::Create => "create",
            MutationKind::Update => "update",
            MutationKind::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(MutationKind::Create),
            "update" => Ok(MutationKind::Update),
            "delete" => Ok(MutationKind::Delete),
            other => Err(Error::InvalidPayload(format!(
                "unknown mutation kind: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A committed change to one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationEvent {
    /// Event ID
    pub id: EventId,
    /// Record the change applies to
    pub record_id: RecordId,
    /// Schema of the record
    pub schema_name: SchemaName,
    pub kind: MutationKind,
    /// Version the change is based on; `None` until the record has synced
    pub version: Option<Version>,
    /// When the change was made (milliseconds since epoch)
    pub timestamp: Timestamp,
    /// Record contents after the change (before it, for deletes)
    pub payload: serde_json::Value,
    pub origin: Origin,
}

impl MutationEvent {
    /// Create a new event describing `record`.
    ///
    /// Nested related records are left out of the payload; their foreign key
    /// stays.
    pub fn new(
        id: impl Into<EventId>,
        schema: &Schema,
        record: &Record,
        kind: MutationKind,
        version: Option<Version>,
        timestamp: Timestamp,
        origin: Origin,
    ) -> Result<Self> {
        Ok(Self {
            id: id.into(),
            record_id: schema.identifier(record)?,
            schema_name: schema.name.clone(),
            kind,
            version,
            timestamp,
            payload: record.flattened().to_json(),
            origin,
        })
    }

    /// Decode the payload back into a record.
    pub fn decode(&self, registry: &SchemaRegistry) -> Result<Record> {
        Record::from_json(registry, &self.schema_name, &self.payload)
    }

    /// Key identifying the record across schemas.
    pub fn record_key(&self) -> (SchemaName, RecordId) {
        (self.schema_name.clone(), self.record_id.clone())
    }
}

/// Sync state of one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetadata {
    pub schema_name: SchemaName,
    pub record_id: RecordId,
    /// Last version confirmed by the remote
    pub version: Version,
    /// Tombstone flag
    pub deleted: bool,
    pub last_changed_at: Timestamp,
}

impl SyncMetadata {
    pub fn new(
        schema_name: impl Into<SchemaName>,
        record_id: impl Into<RecordId>,
        version: Version,
        deleted: bool,
        last_changed_at: Timestamp,
    ) -> Self {
        Self {
            schema_name: schema_name.into(),
            record_id: record_id.into(),
            version,
            deleted,
            last_changed_at,
        }
    }

    /// Whether writing `version` would move this record forward.
    ///
    /// Versions never decrease, and an equal version has already been
    /// applied.
    pub fn advances_to(&self, version: Version) -> bool {
        version > self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FieldDef, FieldType};
    use serde_json::json;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::new(1)
            .with_schema(Schema::new(
                "Post",
                vec![
                    FieldDef::required("id", FieldType::String),
                    FieldDef::required("title", FieldType::String),
                ],
            ))
            .unwrap()
    }

    #[test]
    fn event_from_record() {
        let registry = registry();
        let schema = registry.get("Post").unwrap();
        let post = Record::new("Post").with("id", "1").with("title", "Foo");

        let event = MutationEvent::new(
            "e1",
            schema,
            &post,
            MutationKind::Create,
            None,
            1000,
            Origin::Local,
        )
        .unwrap();

        assert_eq!(event.record_id, "1");
        assert_eq!(event.schema_name, "Post");
        assert_eq!(event.payload, json!({"id": "1", "title": "Foo"}));
        assert_eq!(event.decode(&registry).unwrap(), post);
    }

    #[test]
    fn event_requires_primary_key() {
        let registry = registry();
        let schema = registry.get("Post").unwrap();
        let post = Record::new("Post").with("title", "Foo");
        assert!(MutationEvent::new(
            "e1",
            schema,
            &post,
            MutationKind::Create,
            None,
            0,
            Origin::Local
        )
        .is_err());
    }

    #[test]
    fn serialization() {
        let event = MutationEvent {
            id: "e1".into(),
            record_id: "1".into(),
            schema_name: "Post".into(),
            kind: MutationKind::Delete,
            version: Some(3),
            timestamp: 1000,
            payload: json!({"id": "1"}),
            origin: Origin::Remote,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "delete");
        assert_eq!(json["schemaName"], "Post");
        assert_eq!(json["origin"], "remote");

        let parsed: MutationEvent = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn kind_parsing() {
        assert_eq!(MutationKind::parse("update").unwrap(), MutationKind::Update);
        assert!(MutationKind::parse("upsert").is_err());
    }

    #[test]
    fn metadata_versions_only_advance() {
        let meta = SyncMetadata::new("Post", "1", 2, false, 0);
        assert!(meta.advances_to(3));
        assert!(!meta.advances_to(2));
        assert!(!meta.advances_to(1));
    }
}
