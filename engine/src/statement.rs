//! SQL statement generation for schema tables.
//!
//! Each schema is stored in its own table named after the schema, one column
//! per field plus any foreign-key column a belongs-to or has-one relationship
//! needs. Statements are plain strings with `?` placeholders and a matching
//! list of [`SqlValue`]s; executing them is the datastore's job.

use crate::{
    error::Result,
    predicate::Predicate,
    translate::{quote, resolve_column, translate, ROOT_ALIAS},
    Error, FieldDef, FieldType, Generated, LazyRef, Record, Relationship, RelationshipKind,
    Schema, SchemaRegistry, SqlValue, Timestamp, Value,
};
use std::collections::HashMap;

/// SQLite storage class of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageClass {
    Text,
    Integer,
    Real,
}

impl StorageClass {
    pub fn of(column: &FieldDef) -> Self {
        if column.is_array {
            return StorageClass::Text;
        }
        match column.field_type {
            FieldType::String | FieldType::Enum | FieldType::Json => StorageClass::Text,
            FieldType::Int | FieldType::Bool | FieldType::Timestamp => StorageClass::Integer,
            FieldType::Float => StorageClass::Real,
        }
    }

    pub fn sql_type(&self) -> &'static str {
        match self {
            StorageClass::Text => "text",
            StorageClass::Integer => "integer",
            StorageClass::Real => "real",
        }
    }
}

/// A statement ready to execute.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub values: Vec<SqlValue>,
}

/// `create table` and index statements for a schema.
pub fn create_table(schema: &Schema) -> Vec<String> {
    let mut lines: Vec<String> = schema
        .columns()
        .iter()
        .map(|column| {
            let not_null = if schema.primary_key.contains(&column.name) {
                " not null"
            } else {
                ""
            };
            format!(
                "  {} {}{}",
                quote(&column.name),
                StorageClass::of(column).sql_type(),
                not_null
            )
        })
        .collect();
    lines.push(format!("  primary key ({})", quoted_list(&schema.primary_key)));

    let mut statements = vec![format!(
        "create table if not exists {} (\n{}\n)",
        quote(&schema.name),
        lines.join(",\n")
    )];

    for relationship in schema.relationships.iter().filter(|r| r.holds_foreign_key()) {
        statements.push(format!(
            "create index if not exists {} on {} ({})",
            quote(&format!("{}_{}_idx", schema.name, relationship.foreign_key)),
            quote(&schema.name),
            quote(&relationship.foreign_key)
        ));
    }
    statements
}

/// Fill generated timestamp fields before a write.
///
/// `updatedAt` fields always take `now`. `createdAt` fields take `now` on
/// insert and are removed on update so the stored value is kept.
pub fn stamp_generated(schema: &Schema, record: &mut Record, now: Timestamp, inserting: bool) {
    for column in &schema.fields {
        match column.generated {
            Some(Generated::UpdatedAt) => record.set(column.name.clone(), Value::Timestamp(now)),
            Some(Generated::CreatedAt) if inserting => {
                record.set(column.name.clone(), Value::Timestamp(now))
            }
            Some(Generated::CreatedAt) => {
                record.remove(&column.name);
            }
            None => {}
        }
    }
}

pub fn insert(registry: &SchemaRegistry, schema: &Schema, record: &Record) -> Result<Statement> {
    let columns = schema.columns();
    let values = columns
        .iter()
        .map(|column| column_value(registry, schema, record, column))
        .collect::<Result<Vec<_>>>()?;
    let names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();

    Ok(Statement {
        sql: format!(
            "insert into {} ({}) values ({})",
            quote(&schema.name),
            quoted_list(&names),
            vec!["?"; names.len()].join(", ")
        ),
        values,
    })
}

/// Update every non-key column except `createdAt`, matched by primary key.
pub fn update(registry: &SchemaRegistry, schema: &Schema, record: &Record) -> Result<Statement> {
    let id = schema.identifier(record)?;
    let mut columns: Vec<FieldDef> = schema
        .columns()
        .into_iter()
        .filter(|c| !schema.primary_key.contains(&c.name))
        .filter(|c| c.generated != Some(Generated::CreatedAt))
        .collect();
    if columns.is_empty() {
        columns = schema
            .primary_key
            .iter()
            .filter_map(|k| schema.column(k))
            .collect();
    }

    let assignments: Vec<String> = columns
        .iter()
        .map(|c| format!("{} = ?", quote(&c.name)))
        .collect();
    let mut values = columns
        .iter()
        .map(|column| column_value(registry, schema, record, column))
        .collect::<Result<Vec<_>>>()?;

    let key = key_clause(schema, &id)?;
    values.extend(key.values);

    Ok(Statement {
        sql: format!(
            "update {} set {} where {}",
            quote(&schema.name),
            assignments.join(", "),
            key.sql
        ),
        values,
    })
}

pub fn delete_by_key(schema: &Schema, id: &str) -> Result<Statement> {
    let key = key_clause(schema, id)?;
    Ok(Statement {
        sql: format!("delete from {} where {}", quote(&schema.name), key.sql),
        values: key.values,
    })
}

pub fn count_by_key(schema: &Schema, id: &str) -> Result<Statement> {
    let key = key_clause(schema, id)?;
    Ok(Statement {
        sql: format!("select count(*) from {} where {}", quote(&schema.name), key.sql),
        values: key.values,
    })
}

pub fn delete_all(schema: &Schema) -> String {
    format!("delete from {}", quote(&schema.name))
}

fn key_clause(schema: &Schema, id: &str) -> Result<Statement> {
    let mut parts = Vec::new();
    let mut values = Vec::new();
    for (key, value) in schema.key_values(id)? {
        parts.push(format!("{} = ?", quote(&key)));
        values.push(value.to_sql().unwrap_or(SqlValue::Null));
    }
    Ok(Statement {
        sql: parts.join(" and "),
        values,
    })
}

fn quoted_list(names: &[String]) -> String {
    names
        .iter()
        .map(|n| quote(n))
        .collect::<Vec<_>>()
        .join(", ")
}

/// The stored value of one column.
///
/// A foreign key column the record leaves unset is taken from the related
/// record or lazy reference under the relationship name.
fn column_value(
    registry: &SchemaRegistry,
    schema: &Schema,
    record: &Record,
    column: &FieldDef,
) -> Result<SqlValue> {
    if let Some(value) = record.get_raw(&column.name).filter(|v| !v.is_null()) {
        return value.to_sql().ok_or_else(|| Error::TypeMismatch {
            field: column.name.clone(),
            expected: column.field_type.to_string(),
            got: value.type_name().to_string(),
        });
    }

    let related = schema
        .relationships
        .iter()
        .filter(|r| r.holds_foreign_key() && r.foreign_key == column.name)
        .find_map(|r| record.get_raw(&r.name).map(|v| (r, v)));

    match related {
        Some((_, Value::Lazy(LazyRef::One { id, .. }))) => Ok(SqlValue::Text(id.clone())),
        Some((relationship, Value::Record(related))) => {
            let target = registry.get(&relationship.target)?;
            Ok(SqlValue::Text(target.identifier(related)?))
        }
        _ => Ok(SqlValue::Null),
    }
}

/// One selected column, in result order.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectColumn {
    pub alias: String,
    pub storage: StorageClass,
}

#[derive(Debug, Clone)]
struct Join {
    /// Relationship path, also the table alias
    path: String,
    /// Path of the parent table, empty for the root
    parent: String,
    relationship: Relationship,
    /// Whether the joined row is decoded into a nested record
    decoded: bool,
}

/// A `select` over one schema with its joins.
#[derive(Debug, Clone)]
pub struct Select {
    pub sql: String,
    pub values: Vec<SqlValue>,
    pub columns: Vec<SelectColumn>,
    schema: String,
    joins: Vec<Join>,
}

impl Select {
    /// Build a select of `schema` rows matching `predicate`.
    ///
    /// With `eager`, belongs-to and has-one relationships are joined
    /// recursively and decoded as nested records; a schema already on the
    /// current path is not joined again. Relationships referenced only by the
    /// predicate are joined for filtering but left lazy.
    pub fn build(
        registry: &SchemaRegistry,
        schema: &Schema,
        predicate: &Predicate,
        eager: bool,
    ) -> Result<Self> {
        let mut joins: Vec<Join> = Vec::new();

        if eager {
            let mut ancestors = vec![schema.name.clone()];
            eager_joins(registry, schema, "", &mut ancestors, &mut joins)?;
        }

        for path in predicate.field_paths() {
            let resolved = resolve_column(registry, schema, path)?;
            let mut current = schema;
            let mut parent = String::new();
            for segment in &resolved.relations {
                let relationship = current.relationship(segment).ok_or_else(|| {
                    Error::UnknownField {
                        schema: current.name.clone(),
                        field: segment.clone(),
                    }
                })?;
                let join_path = if parent.is_empty() {
                    segment.clone()
                } else {
                    format!("{}.{}", parent, segment)
                };
                if !joins.iter().any(|j| j.path == join_path) {
                    joins.push(Join {
                        path: join_path.clone(),
                        parent: parent.clone(),
                        relationship: relationship.clone(),
                        decoded: false,
                    });
                }
                current = registry.get(&relationship.target)?;
                parent = join_path;
            }
        }

        let mut columns = Vec::new();
        let mut projections = Vec::new();
        for column in schema.columns() {
            projections.push(format!(
                "{}.{} as {}",
                quote(ROOT_ALIAS),
                quote(&column.name),
                quote(&column.name)
            ));
            columns.push(SelectColumn {
                alias: column.name.clone(),
                storage: StorageClass::of(&column),
            });
        }

        let mut from = format!("from {} as {}", quote(&schema.name), quote(ROOT_ALIAS));
        for join in &joins {
            let target = registry.get(&join.relationship.target)?;
            let target_key = target.primary_key.first().ok_or_else(|| {
                Error::MissingPrimaryKey {
                    schema: target.name.clone(),
                    field: String::new(),
                }
            })?;
            let parent_alias = if join.parent.is_empty() {
                ROOT_ALIAS
            } else {
                join.parent.as_str()
            };
            from.push_str(&format!(
                "\n  left outer join {} as {}\n    on {}.{} = {}.{}",
                quote(&target.name),
                quote(&join.path),
                quote(&join.path),
                quote(target_key),
                quote(parent_alias),
                quote(&join.relationship.foreign_key)
            ));

            if join.decoded {
                for column in target.columns() {
                    let alias = format!("{}.{}", join.path, column.name);
                    projections.push(format!(
                        "{}.{} as {}",
                        quote(&join.path),
                        quote(&column.name),
                        quote(&alias)
                    ));
                    columns.push(SelectColumn {
                        alias,
                        storage: StorageClass::of(&column),
                    });
                }
            }
        }

        let clause = translate(registry, schema, predicate)?;
        let sql = format!(
            "select {}\n{}\nwhere {}",
            projections.join(", "),
            from,
            clause.sql
        );

        Ok(Self {
            sql,
            values: clause.values,
            columns,
            schema: schema.name.clone(),
            joins,
        })
    }

    /// Build a record from one result row, given in `columns` order.
    ///
    /// A joined row whose key is null leaves the relationship `Null` rather
    /// than a partially filled record. Relationships that were not decoded
    /// become [`LazyRef`] placeholders.
    pub fn decode(&self, registry: &SchemaRegistry, row: Vec<SqlValue>) -> Result<Record> {
        let mut row = row.into_iter();
        let mut next = || {
            row.next()
                .ok_or_else(|| Error::InvalidPayload("row has fewer columns than selected".into()))
        };

        let schema = registry.get(&self.schema)?;
        let mut root = decode_columns(schema, &mut next)?;

        let mut nested: HashMap<&str, Option<Record>> = HashMap::new();
        for join in self.joins.iter().filter(|j| j.decoded) {
            let target = registry.get(&join.relationship.target)?;
            let record = decode_columns(target, &mut next)?;
            let present = target.identifier(&record).is_ok();
            nested.insert(join.path.as_str(), present.then_some(record));
        }

        // Children are listed after their parents; attach deepest first.
        for join in self.joins.iter().filter(|j| j.decoded).rev() {
            let child = nested.remove(join.path.as_str()).flatten();
            let value = match child {
                Some(mut child) => {
                    let target = registry.get(&join.relationship.target)?;
                    fill_lazy(target, &mut child)?;
                    Value::from(child)
                }
                None => Value::Null,
            };
            if join.parent.is_empty() {
                root.set(join.relationship.name.clone(), value);
            } else if let Some(Some(parent)) = nested.get_mut(join.parent.as_str()) {
                parent.set(join.relationship.name.clone(), value);
            }
        }

        fill_lazy(schema, &mut root)?;
        Ok(root)
    }
}

fn eager_joins(
    registry: &SchemaRegistry,
    schema: &Schema,
    parent: &str,
    ancestors: &mut Vec<String>,
    joins: &mut Vec<Join>,
) -> Result<()> {
    for relationship in schema.relationships.iter().filter(|r| r.holds_foreign_key()) {
        if ancestors.contains(&relationship.target) {
            continue;
        }
        let target = registry.get(&relationship.target)?;
        if target.primary_key.len() != 1 {
            continue;
        }
        let path = if parent.is_empty() {
            relationship.name.clone()
        } else {
            format!("{}.{}", parent, relationship.name)
        };
        joins.push(Join {
            path: path.clone(),
            parent: parent.to_string(),
            relationship: relationship.clone(),
            decoded: true,
        });
        ancestors.push(target.name.clone());
        eager_joins(registry, target, &path, ancestors, joins)?;
        ancestors.pop();
    }
    Ok(())
}

fn decode_columns<F>(schema: &Schema, next: &mut F) -> Result<Record>
where
    F: FnMut() -> Result<SqlValue>,
{
    let mut record = Record::new(schema.name.clone());
    for column in schema.columns() {
        let value = column.decode_sql(next()?)?;
        if !value.is_null() {
            record.set(column.name.clone(), value);
        }
    }
    Ok(record)
}

/// Put placeholders on relationships the record does not carry.
pub(crate) fn fill_lazy(schema: &Schema, record: &mut Record) -> Result<()> {
    for relationship in &schema.relationships {
        if record.get_raw(&relationship.name).is_some() {
            continue;
        }
        let placeholder = match relationship.kind {
            RelationshipKind::BelongsTo | RelationshipKind::HasOne => record
                .get_raw(&relationship.foreign_key)
                .and_then(Value::as_text)
                .map(|id| LazyRef::One {
                    schema: relationship.target.clone(),
                    id: id.to_string(),
                }),
            RelationshipKind::HasMany => Some(LazyRef::Many {
                schema: relationship.target.clone(),
                foreign_key: relationship.foreign_key.clone(),
                parent_id: schema.identifier(record)?,
            }),
        };
        if let Some(placeholder) = placeholder {
            record.set(relationship.name.clone(), Value::Lazy(placeholder));
        }
    }
    Ok(())
}
