//! Semantic values held by record fields.
//!
//! [`Value`] is the tagged union every record field is stored as. Comparison
//! is semantic rather than byte-wise: integers, floats and timestamps compare
//! numerically, strings and enum cases compare by their UTF-8 bytes, and
//! values of unrelated types are incomparable.

use crate::{Record, RecordId, SchemaName, Timestamp};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// An unresolved relationship.
///
/// Lazy loading leaves one of these in the relationship field instead of the
/// related record(s). It holds only foreign-key data, so records never own
/// each other and cyclic relationships cannot form ownership cycles.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum LazyRef {
    /// The single record a belongs-to or has-one relationship points at.
    One { schema: SchemaName, id: RecordId },
    /// The records of `schema` whose `foreign_key` column equals `parent_id`.
    #[serde(rename_all = "camelCase")]
    Many {
        schema: SchemaName,
        foreign_key: String,
        parent_id: RecordId,
    },
}

/// A field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    /// Milliseconds since the Unix epoch
    Timestamp(Timestamp),
    /// A case of an enumerated type, stored by name
    Enum(String),
    /// Arbitrary embedded JSON
    Json(serde_json::Value),
    /// A related record loaded eagerly
    Record(Box<Record>),
    List(Vec<Value>),
    Lazy(LazyRef),
}

/// A value as bound to, or read from, a SQLite statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Name used in type mismatch errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::String(_) => "String",
            Value::Int(_) => "Int",
            Value::Float(_) => "Float",
            Value::Bool(_) => "Bool",
            Value::Timestamp(_) => "Timestamp",
            Value::Enum(_) => "Enum",
            Value::Json(_) => "Json",
            Value::Record(_) => "Record",
            Value::List(_) => "List",
            Value::Lazy(_) => "Lazy",
        }
    }

    /// Text of a string or enum value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::Enum(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) | Value::Timestamp(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) | Value::Timestamp(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Value::Record(r) => Some(r),
            _ => None,
        }
    }

    /// Semantic ordering between two values.
    ///
    /// Returns `None` when the values have unrelated types. `Null` only
    /// compares equal to `Null`; callers decide where nulls sort.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        use Value::*;
        match (self, other) {
            (Null, Null) => Some(Ordering::Equal),
            (String(a) | Enum(a), String(b) | Enum(b)) => Some(a.as_bytes().cmp(b.as_bytes())),
            (Bool(a), Bool(b)) => Some(a.cmp(b)),
            (Int(a) | Timestamp(a), Int(b) | Timestamp(b)) => Some(a.cmp(b)),
            (Float(_), Int(_) | Timestamp(_) | Float(_)) | (Int(_) | Timestamp(_), Float(_)) => {
                self.as_f64()?.partial_cmp(&other.as_f64()?)
            }
            _ => None,
        }
    }

    /// Equality as used by predicates: numeric types compare by value, and
    /// structured values compare structurally.
    pub fn semantic_eq(&self, other: &Value) -> bool {
        match self.compare(other) {
            Some(ordering) => ordering == Ordering::Equal,
            None => self == other,
        }
    }

    /// The value bound for this field in a SQL statement.
    ///
    /// Nested records and lazy references have no column representation and
    /// return `None`.
    pub fn to_sql(&self) -> Option<SqlValue> {
        let value = match self {
            Value::Null => SqlValue::Null,
            Value::String(s) | Value::Enum(s) => SqlValue::Text(s.clone()),
            Value::Int(i) | Value::Timestamp(i) => SqlValue::Integer(*i),
            Value::Float(f) => SqlValue::Real(*f),
            Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
            Value::Json(json) => SqlValue::Text(json.to_string()),
            Value::List(_) => SqlValue::Text(self.to_json().to_string()),
            Value::Record(_) | Value::Lazy(_) => return None,
        };
        Some(value)
    }

    /// JSON form used in mutation payloads.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null | Value::Lazy(_) => serde_json::Value::Null,
            Value::String(s) | Value::Enum(s) => serde_json::Value::String(s.clone()),
            Value::Int(i) | Value::Timestamp(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Json(json) => json.clone(),
            Value::Record(record) => record.to_json(),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Record> for Value {
    fn from(record: Record) -> Self {
        Value::Record(Box::new(record))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_values_compare_across_types() {
        assert_eq!(
            Value::Int(2).compare(&Value::Float(2.5)),
            Some(Ordering::Less)
        );
        assert_eq!(
            Value::Timestamp(1000).compare(&Value::Int(1000)),
            Some(Ordering::Equal)
        );
        assert!(Value::Float(3.0).semantic_eq(&Value::Int(3)));
    }

    #[test]
    fn unrelated_types_are_incomparable() {
        assert_eq!(Value::from("1").compare(&Value::Int(1)), None);
        assert_eq!(Value::Bool(true).compare(&Value::Int(1)), None);
        assert!(!Value::from("1").semantic_eq(&Value::Int(1)));
    }

    #[test]
    fn strings_compare_by_bytes() {
        assert_eq!(
            Value::from("Zebra").compare(&Value::from("apple")),
            Some(Ordering::Less)
        );
        assert_eq!(
            Value::Enum("DRAFT".into()).compare(&Value::from("DRAFT")),
            Some(Ordering::Equal)
        );
    }

    #[test]
    fn sql_binding() {
        assert_eq!(Value::Bool(true).to_sql(), Some(SqlValue::Integer(1)));
        assert_eq!(Value::Timestamp(42).to_sql(), Some(SqlValue::Integer(42)));
        assert_eq!(
            Value::Enum("PUBLISHED".into()).to_sql(),
            Some(SqlValue::Text("PUBLISHED".into()))
        );
        assert_eq!(
            Value::List(vec![Value::from("a"), Value::from("b")]).to_sql(),
            Some(SqlValue::Text("[\"a\",\"b\"]".into()))
        );
        assert_eq!(
            Value::Lazy(LazyRef::One {
                schema: "Blog".into(),
                id: "b1".into()
            })
            .to_sql(),
            None
        );
    }

    #[test]
    fn json_form() {
        assert_eq!(Value::Float(1.5).to_json(), json!(1.5));
        assert_eq!(Value::Float(f64::NAN).to_json(), json!(null));
        assert_eq!(Value::from(Some("x")).to_json(), json!("x"));
        assert_eq!(Value::from(None::<i64>), Value::Null);
    }
}
