//! Record types for storing data.

use crate::{
    error::Result, Error, RecordId, RelationshipKind, Schema, SchemaName, SchemaRegistry, Value,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

static NULL: Value = Value::Null;

/// Origin of a record or mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Created or modified locally
    Local,
    /// Received from remote
    Remote,
}

/// A data record: a schema-tagged map of field name to value.
///
/// Records are plain values. Readers always receive their own copy, so a
/// record held by an observer never changes underneath it.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    schema: SchemaName,
    fields: BTreeMap<String, Value>,
}

impl Record {
    /// Create an empty record of the given schema.
    pub fn new(schema: impl Into<SchemaName>) -> Self {
        Self {
            schema: schema.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style method to set a field.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.fields.remove(name)
    }

    /// Name of the schema this record belongs to.
    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Raw field access without schema checking.
    pub fn get_raw(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Schema-checked field access.
    ///
    /// An unset field that the schema declares reads as `Null`; a field the
    /// schema does not declare is an error.
    pub fn get(&self, schema: &Schema, name: &str) -> Result<&Value> {
        if schema.name != self.schema {
            return Err(Error::UnknownSchema(schema.name.clone()));
        }
        if !schema.has_field(name) {
            return Err(Error::UnknownField {
                schema: schema.name.clone(),
                field: name.to_string(),
            });
        }
        Ok(self.fields.get(name).unwrap_or(&NULL))
    }

    /// Follow a dotted path through nested records.
    ///
    /// Missing fields and unloaded relationships read as `None`.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let mut current = self.fields.get(segments.next()?)?;
        for segment in segments {
            current = current.as_record()?.fields.get(segment)?;
        }
        Some(current)
    }

    /// Derive the record id from the schema's primary key.
    pub fn id(&self, schema: &Schema) -> Result<RecordId> {
        schema.identifier(self)
    }

    /// Copy of this record with nested records replaced by their keys only.
    ///
    /// Used to keep mutation payloads flat: a related record is reachable
    /// through its foreign key, never embedded.
    pub fn flattened(&self) -> Self {
        let fields = self
            .fields
            .iter()
            .filter(|(_, v)| !matches!(v, Value::Record(_) | Value::Lazy(_)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Self {
            schema: self.schema.clone(),
            fields,
        }
    }

    /// JSON object form used in mutation payloads.
    pub fn to_json(&self) -> serde_json::Value {
        let object = self
            .fields
            .iter()
            .filter(|(_, v)| !matches!(v, Value::Lazy(_)))
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        serde_json::Value::Object(object)
    }

    /// Decode a JSON payload using the registered schema.
    ///
    /// Nested objects under belongs-to and has-one relationships decode as
    /// records of the target schema; has-many relationships are ignored.
    pub fn from_json(
        registry: &SchemaRegistry,
        schema_name: &str,
        json: &serde_json::Value,
    ) -> Result<Self> {
        let schema = registry.get(schema_name)?;
        let object = json
            .as_object()
            .ok_or_else(|| Error::InvalidPayload("payload must be an object".into()))?;

        let mut record = Record::new(schema_name);
        for (name, value) in object {
            if let Some(column) = schema.column(name) {
                record.set(name.clone(), column.decode_json(value)?);
            } else if let Some(relationship) = schema.relationship(name) {
                match (relationship.kind, value) {
                    (RelationshipKind::HasMany, _) | (_, serde_json::Value::Null) => {}
                    (_, nested) => {
                        let nested = Record::from_json(registry, &relationship.target, nested)?;
                        record.set(name.clone(), nested);
                    }
                }
            } else {
                return Err(Error::UnknownField {
                    schema: schema_name.to_string(),
                    field: name.clone(),
                });
            }
        }
        Ok(record)
    }
}
