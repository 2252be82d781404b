//! Schema definition and validation.
//!
//! Schemas describe the record types the store can hold: their fields, their
//! primary key, and how they relate to each other. A [`SchemaRegistry`] owns
//! every schema for the lifetime of the store and is the only way other
//! components look one up.

use crate::{
    error::Result, predicate::field, Error, Predicate, Record, RecordId, SchemaName,
    SchemaVersion, SqlValue, Value,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Separator between the parts of a composite primary key.
pub const KEY_SEPARATOR: char = '#';

/// Field types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    Timestamp,
    /// A case of an enumerated type, stored by name
    Enum,
    /// Arbitrary nested JSON
    Json,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::String => write!(f, "String"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Float => write!(f, "Float"),
            FieldType::Bool => write!(f, "Bool"),
            FieldType::Timestamp => write!(f, "Timestamp"),
            FieldType::Enum => write!(f, "Enum"),
            FieldType::Json => write!(f, "Json"),
        }
    }
}

/// Fields the storage layer fills in on every write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Generated {
    /// Set when the row is inserted, never changed afterwards
    CreatedAt,
    /// Set on every insert and update
    UpdatedAt,
}

/// Definition of a field in a schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Field type
    pub field_type: FieldType,
    /// Whether this field is required
    pub required: bool,
    /// Whether the field holds a list of `field_type` values
    pub is_array: bool,
    /// Read-only timestamp maintained by storage
    pub generated: Option<Generated>,
}

impl FieldDef {
    /// Create a new required field definition.
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
            is_array: false,
            generated: None,
        }
    }

    /// Create a new optional field definition.
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            required: false,
            ..Self::required(name, field_type)
        }
    }

    /// Create an optional list field.
    pub fn list(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            is_array: true,
            ..Self::optional(name, field_type)
        }
    }

    /// Create a read-only timestamp field maintained by storage.
    pub fn generated(name: impl Into<String>, generated: Generated) -> Self {
        Self {
            generated: Some(generated),
            ..Self::optional(name, FieldType::Timestamp)
        }
    }

    /// Validate a value against this field definition.
    pub fn validate(&self, value: Option<&Value>) -> Result<()> {
        match value {
            None | Some(Value::Null) if self.required && self.generated.is_none() => {
                Err(Error::MissingRequiredField(self.name.clone()))
            }
            None | Some(Value::Null) => Ok(()),
            Some(Value::List(items)) if self.is_array => {
                items.iter().try_for_each(|item| self.validate_type(item))
            }
            Some(v) if self.is_array => Err(self.mismatch(v.type_name())),
            Some(v) => self.validate_type(v),
        }
    }

    fn validate_type(&self, value: &Value) -> Result<()> {
        let valid = match self.field_type {
            FieldType::String => matches!(value, Value::String(_)),
            FieldType::Int => matches!(value, Value::Int(_)),
            FieldType::Float => matches!(value, Value::Float(_) | Value::Int(_)),
            FieldType::Bool => matches!(value, Value::Bool(_)),
            FieldType::Timestamp => matches!(value, Value::Timestamp(_) | Value::Int(_)),
            FieldType::Enum => matches!(value, Value::Enum(_) | Value::String(_)),
            FieldType::Json => !matches!(value, Value::Record(_) | Value::Lazy(_)),
        };

        if valid {
            Ok(())
        } else {
            Err(self.mismatch(value.type_name()))
        }
    }

    fn mismatch(&self, got: &str) -> Error {
        let expected = if self.is_array {
            format!("[{}]", self.field_type)
        } else {
            self.field_type.to_string()
        };
        Error::TypeMismatch {
            field: self.name.clone(),
            expected,
            got: got.to_string(),
        }
    }

    /// Decode a JSON payload value into this field's semantic type.
    pub fn decode_json(&self, json: &serde_json::Value) -> Result<Value> {
        match json {
            serde_json::Value::Null => Ok(Value::Null),
            serde_json::Value::Array(items) if self.is_array => items
                .iter()
                .map(|item| self.decode_scalar(item))
                .collect::<Result<Vec<_>>>()
                .map(Value::List),
            _ if self.is_array => Err(self.mismatch(json_type_name(json))),
            _ => self.decode_scalar(json),
        }
    }

    fn decode_scalar(&self, json: &serde_json::Value) -> Result<Value> {
        let value = match (self.field_type, json) {
            (FieldType::Json, v) => Some(Value::Json(v.clone())),
            (FieldType::String, serde_json::Value::String(s)) => Some(Value::String(s.clone())),
            (FieldType::Enum, serde_json::Value::String(s)) => Some(Value::Enum(s.clone())),
            (FieldType::Int, v) => v.as_i64().map(Value::Int),
            (FieldType::Timestamp, v) => v.as_i64().map(Value::Timestamp),
            (FieldType::Float, v) => v.as_f64().map(Value::Float),
            (FieldType::Bool, serde_json::Value::Bool(b)) => Some(Value::Bool(*b)),
            _ => None,
        };
        value.ok_or_else(|| self.mismatch(json_type_name(json)))
    }

    /// Decode a column read back from SQLite.
    pub fn decode_sql(&self, sql: SqlValue) -> Result<Value> {
        if self.is_array || self.field_type == FieldType::Json {
            return match sql {
                SqlValue::Null => Ok(Value::Null),
                SqlValue::Text(text) => {
                    let json: serde_json::Value = serde_json::from_str(&text)
                        .map_err(|e| Error::InvalidPayload(format!("{}: {}", self.name, e)))?;
                    self.decode_json(&json)
                }
                other => Err(self.mismatch(sql_type_name(&other))),
            };
        }

        let value = match (self.field_type, sql) {
            (_, SqlValue::Null) => Value::Null,
            (FieldType::String, SqlValue::Text(s)) => Value::String(s),
            (FieldType::Enum, SqlValue::Text(s)) => Value::Enum(s),
            (FieldType::Int, SqlValue::Integer(i)) => Value::Int(i),
            (FieldType::Timestamp, SqlValue::Integer(i)) => Value::Timestamp(i),
            (FieldType::Bool, SqlValue::Integer(i)) => Value::Bool(i != 0),
            (FieldType::Float, SqlValue::Real(f)) => Value::Float(f),
            (FieldType::Float, SqlValue::Integer(i)) => Value::Float(i as f64),
            (_, other) => return Err(self.mismatch(sql_type_name(&other))),
        };
        Ok(value)
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "Null",
        serde_json::Value::Bool(_) => "Bool",
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        serde_json::Value::Number(_) => "Float",
        serde_json::Value::String(_) => "String",
        serde_json::Value::Array(_) => "Array",
        serde_json::Value::Object(_) => "Object",
    }
}

fn sql_type_name(value: &SqlValue) -> &'static str {
    match value {
        SqlValue::Null => "Null",
        SqlValue::Integer(_) => "Integer",
        SqlValue::Real(_) => "Real",
        SqlValue::Text(_) => "Text",
    }
}

/// How two schemas are related.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RelationshipKind {
    /// This record holds the foreign key of its parent
    BelongsTo,
    /// This record holds the foreign key of a single child
    HasOne,
    /// Children hold this record's key in `foreign_key`
    HasMany,
}

/// A relationship from one schema to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relationship {
    /// Field name the related record(s) appear under
    pub name: String,
    pub kind: RelationshipKind,
    /// Target schema name
    pub target: SchemaName,
    /// Foreign-key column: on this schema for belongs-to and has-one, on the
    /// target schema for has-many
    pub foreign_key: String,
}

impl Relationship {
    pub fn belongs_to(
        name: impl Into<String>,
        target: impl Into<SchemaName>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: RelationshipKind::BelongsTo,
            target: target.into(),
            foreign_key: foreign_key.into(),
        }
    }

    pub fn has_one(
        name: impl Into<String>,
        target: impl Into<SchemaName>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self {
            kind: RelationshipKind::HasOne,
            ..Self::belongs_to(name, target, foreign_key)
        }
    }

    pub fn has_many(
        name: impl Into<String>,
        target: impl Into<SchemaName>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self {
            kind: RelationshipKind::HasMany,
            ..Self::belongs_to(name, target, foreign_key)
        }
    }

    /// Whether the foreign key lives on the owning schema's table.
    pub fn holds_foreign_key(&self) -> bool {
        matches!(
            self.kind,
            RelationshipKind::BelongsTo | RelationshipKind::HasOne
        )
    }
}

/// Schema for a record type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    /// Schema name, also the table name
    pub name: SchemaName,
    /// Field definitions, in column order
    pub fields: Vec<FieldDef>,
    /// Fields forming the primary key, in order
    pub primary_key: Vec<String>,
    pub relationships: Vec<Relationship>,
    /// Whether local mutations are sent to the remote
    pub syncable: bool,
}

impl Schema {
    /// Create a new syncable schema keyed by `id`.
    pub fn new(name: impl Into<SchemaName>, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.into(),
            fields,
            primary_key: vec!["id".to_string()],
            relationships: Vec::new(),
            syncable: true,
        }
    }

    /// Builder-style method to set a (possibly composite) primary key.
    pub fn with_primary_key<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Builder-style method to add a relationship.
    pub fn with_relationship(mut self, relationship: Relationship) -> Self {
        self.relationships.push(relationship);
        self
    }

    /// Mark the schema as local-only: stored, never synced.
    pub fn local_only(mut self) -> Self {
        self.syncable = false;
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn relationship(&self, name: &str) -> Option<&Relationship> {
        self.relationships.iter().find(|r| r.name == name)
    }

    /// Every stored column: declared fields followed by foreign keys that
    /// were not declared as fields.
    pub fn columns(&self) -> Vec<FieldDef> {
        let mut columns = self.fields.clone();
        for relationship in self.relationships.iter().filter(|r| r.holds_foreign_key()) {
            if !columns.iter().any(|c| c.name == relationship.foreign_key) {
                columns.push(FieldDef::optional(
                    relationship.foreign_key.clone(),
                    FieldType::String,
                ));
            }
        }
        columns
    }

    /// Look up a stored column by name.
    pub fn column(&self, name: &str) -> Option<FieldDef> {
        self.columns().into_iter().find(|c| c.name == name)
    }

    /// Whether `name` is a column or a relationship of this schema.
    pub fn has_field(&self, name: &str) -> bool {
        self.column(name).is_some() || self.relationship(name).is_some()
    }

    /// Validate a record against this schema.
    pub fn validate_record(&self, record: &Record) -> Result<()> {
        if record.schema() != self.name {
            return Err(Error::InvalidPayload(format!(
                "record of schema {} validated against {}",
                record.schema(),
                self.name
            )));
        }

        if let Some(unknown) = record.field_names().find(|name| !self.has_field(name)) {
            return Err(Error::UnknownField {
                schema: self.name.clone(),
                field: unknown.to_string(),
            });
        }

        for column in self.columns() {
            column.validate(record.get_raw(&column.name))?;
        }

        self.identifier(record).map(|_| ())
    }

    /// Derive the record id from its primary key fields.
    pub fn identifier(&self, record: &Record) -> Result<RecordId> {
        let mut parts = Vec::with_capacity(self.primary_key.len());
        for key in &self.primary_key {
            let part = match record.get_raw(key) {
                Some(Value::String(s)) | Some(Value::Enum(s)) => s.clone(),
                Some(Value::Int(i)) | Some(Value::Timestamp(i)) => i.to_string(),
                _ => {
                    return Err(Error::MissingPrimaryKey {
                        schema: self.name.clone(),
                        field: key.clone(),
                    })
                }
            };
            parts.push(part);
        }
        Ok(parts.join(&KEY_SEPARATOR.to_string()))
    }

    /// Split a record id back into typed primary key values.
    pub fn key_values(&self, id: &str) -> Result<Vec<(String, Value)>> {
        let parts: Vec<&str> = if self.primary_key.len() == 1 {
            vec![id]
        } else {
            id.split(KEY_SEPARATOR).collect()
        };

        if parts.len() != self.primary_key.len() {
            return Err(Error::InvalidPayload(format!(
                "id '{}' does not match the {}-part key of {}",
                id,
                self.primary_key.len(),
                self.name
            )));
        }

        self.primary_key
            .iter()
            .zip(parts)
            .map(|(key, part)| {
                let def = self.field(key).ok_or_else(|| Error::UnknownField {
                    schema: self.name.clone(),
                    field: key.clone(),
                })?;
                let value = match def.field_type {
                    FieldType::Int | FieldType::Timestamp => part
                        .parse::<i64>()
                        .map(Value::Int)
                        .map_err(|_| Error::InvalidPayload(format!("{}: not an integer", key)))?,
                    _ => Value::String(part.to_string()),
                };
                Ok((key.clone(), value))
            })
            .collect()
    }

    /// Predicate selecting the record with the given id.
    pub fn key_predicate(&self, id: &str) -> Result<Predicate> {
        let mut comparisons: Vec<Predicate> = self
            .key_values(id)?
            .into_iter()
            .map(|(key, value)| field(key).eq(value))
            .collect();
        if comparisons.len() == 1 {
            Ok(comparisons.remove(0))
        } else {
            Ok(Predicate::and(comparisons))
        }
    }
}

/// Every schema known to the store.
///
/// Built once at startup and shared immutably afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaRegistry {
    /// Registry version; a change resets local state
    pub version: SchemaVersion,
    /// Schemas by name
    pub schemas: BTreeMap<SchemaName, Schema>,
}

impl SchemaRegistry {
    /// Create an empty registry.
    pub fn new(version: SchemaVersion) -> Self {
        Self {
            version,
            schemas: BTreeMap::new(),
        }
    }

    /// Register a schema. Names are unique and schemas are never replaced.
    pub fn register(&mut self, schema: Schema) -> Result<&mut Self> {
        if self.schemas.contains_key(&schema.name) {
            return Err(Error::DuplicateSchema(schema.name));
        }
        self.schemas.insert(schema.name.clone(), schema);
        Ok(self)
    }

    /// Builder-style method to register a schema.
    pub fn with_schema(mut self, schema: Schema) -> Result<Self> {
        self.register(schema)?;
        Ok(self)
    }

    /// Get a schema by name.
    pub fn get(&self, name: &str) -> Result<&Schema> {
        self.schemas
            .get(name)
            .ok_or_else(|| Error::UnknownSchema(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.schemas.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Schema> {
        self.schemas.values()
    }

    /// Schemas whose local mutations are sent to the remote.
    pub fn syncable(&self) -> impl Iterator<Item = &Schema> {
        self.schemas.values().filter(|s| s.syncable)
    }

    /// Check that keys and relationships refer to things that exist.
    pub fn validate(&self) -> Result<()> {
        for schema in self.schemas.values() {
            if schema.primary_key.is_empty() {
                return Err(Error::MissingPrimaryKey {
                    schema: schema.name.clone(),
                    field: String::new(),
                });
            }
            for key in &schema.primary_key {
                if schema.field(key).is_none() {
                    return Err(Error::UnknownField {
                        schema: schema.name.clone(),
                        field: key.clone(),
                    });
                }
            }

            for relationship in &schema.relationships {
                let invalid = |reason: &str| Error::InvalidRelationship {
                    schema: schema.name.clone(),
                    relationship: relationship.name.clone(),
                    reason: reason.to_string(),
                };
                if schema.field(&relationship.name).is_some() {
                    return Err(invalid("name collides with a field"));
                }
                let target = self
                    .schemas
                    .get(&relationship.target)
                    .ok_or_else(|| invalid("unknown target schema"))?;
                if relationship.kind == RelationshipKind::HasMany
                    && target.column(&relationship.foreign_key).is_none()
                {
                    return Err(invalid("target has no such foreign key column"));
                }
            }
        }
        Ok(())
    }
}
