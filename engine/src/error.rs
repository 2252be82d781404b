//! Error types for the Harbor engine.

use crate::{EventId, RecordId, SchemaName};
use thiserror::Error;

/// All possible errors from the Harbor engine.
///
/// Every variant is a local, synchronous failure: a misconfigured schema or
/// predicate, a record that does not satisfy its schema, or an outbox
/// transition that would break delivery order.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Configuration errors
    #[error("unknown schema: {0}")]
    UnknownSchema(SchemaName),

    #[error("schema already registered: {0}")]
    DuplicateSchema(SchemaName),

    #[error("unknown field '{field}' on schema {schema}")]
    UnknownField { schema: SchemaName, field: String },

    #[error("invalid relationship '{relationship}' on schema {schema}: {reason}")]
    InvalidRelationship {
        schema: SchemaName,
        relationship: String,
        reason: String,
    },

    #[error("invalid predicate: {0}")]
    InvalidPredicate(String),

    // Validation errors
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    #[error("missing primary key field '{field}' on schema {schema}")]
    MissingPrimaryKey { schema: SchemaName, field: String },

    #[error("condition not satisfied for record {0}")]
    ConditionFailed(RecordId),

    // Outbox errors
    #[error("invalid mutation for record {record_id}: {reason}")]
    InvalidMutation { record_id: RecordId, reason: String },

    #[error("invalid transition for entry {entry_id}: {from} -> {to}")]
    InvalidTransition {
        entry_id: EventId,
        from: String,
        to: String,
    },

    #[error("entry {entry_id} acknowledged before an earlier mutation of record {record_id}")]
    OutOfOrderAck {
        entry_id: EventId,
        record_id: RecordId,
    },
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::UnknownSchema("Post".into());
        assert_eq!(err.to_string(), "unknown schema: Post");

        let err = Error::UnknownField {
            schema: "Post".into(),
            field: "subtitle".into(),
        };
        assert_eq!(err.to_string(), "unknown field 'subtitle' on schema Post");

        let err = Error::TypeMismatch {
            field: "rating".into(),
            expected: "Int".into(),
            got: "String".into(),
        };
        assert_eq!(
            err.to_string(),
            "type mismatch for field 'rating': expected Int, got String"
        );

        let err = Error::InvalidTransition {
            entry_id: "e1".into(),
            from: "pending".into(),
            to: "acknowledged".into(),
        };
        assert_eq!(
            err.to_string(),
            "invalid transition for entry e1: pending -> acknowledged"
        );
    }
}
