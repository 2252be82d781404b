//! Predicate to SQL translation.
//!
//! [`translate`] walks a [`Predicate`] and produces a parameterized SQLite
//! `where` clause plus the values to bind, in placeholder order. Columns are
//! qualified by table alias: the queried schema is `"root"`, and a table
//! joined through a relationship path is aliased by that path, so
//! `blog.name` becomes `"blog"."name"`.
//!
//! The generated SQL agrees with [`Predicate::evaluate`] on every record,
//! including records whose compared field is null.

use crate::{
    error::Result, Comparison, Error, FieldDef, FieldType, GroupKind, Operator, Predicate,
    Schema, SchemaRegistry, SqlValue, Value,
};

/// Alias of the queried table.
pub const ROOT_ALIAS: &str = "root";

/// A translated clause and its bound values.
#[derive(Debug, Clone, PartialEq)]
pub struct Translated {
    pub sql: String,
    pub values: Vec<SqlValue>,
}

impl Translated {
    fn new(sql: impl Into<String>, values: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            values,
        }
    }
}

/// Translate `predicate` over `schema` into a `where` clause body.
pub fn translate(
    registry: &SchemaRegistry,
    schema: &Schema,
    predicate: &Predicate,
) -> Result<Translated> {
    Translator { registry, schema }.fragment(predicate)
}

/// Quote an SQL identifier.
pub fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// A field path resolved to a table alias and stored column.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedColumn {
    pub alias: String,
    pub column: FieldDef,
    /// Relationship segments traversed to reach the column
    pub relations: Vec<String>,
}

impl ResolvedColumn {
    pub fn qualified(&self) -> String {
        format!("{}.{}", quote(&self.alias), quote(&self.column.name))
    }
}

/// Resolve a dotted field path against `schema`.
///
/// Every segment but the last must be a belongs-to or has-one relationship
/// whose target has a single-field key. The last segment is a column, or a
/// relationship name standing for its foreign key column.
pub(crate) fn resolve_column(
    registry: &SchemaRegistry,
    schema: &Schema,
    path: &str,
) -> Result<ResolvedColumn> {
    let segments: Vec<&str> = path.split('.').collect();
    let (last, relations) = segments
        .split_last()
        .ok_or_else(|| Error::InvalidPredicate("empty field path".into()))?;

    let mut current = schema;
    for segment in relations {
        let relationship = current
            .relationship(segment)
            .ok_or_else(|| Error::UnknownField {
                schema: current.name.clone(),
                field: segment.to_string(),
            })?;
        if !relationship.holds_foreign_key() {
            return Err(Error::InvalidPredicate(format!(
                "cannot traverse has-many relationship '{}' in '{}'",
                segment, path
            )));
        }
        let target = registry.get(&relationship.target)?;
        if target.primary_key.len() != 1 {
            return Err(Error::InvalidPredicate(format!(
                "cannot join {} on a composite key in '{}'",
                target.name, path
            )));
        }
        current = target;
    }

    let column = current
        .column(last)
        .or_else(|| {
            current
                .relationship(last)
                .filter(|r| r.holds_foreign_key())
                .and_then(|r| current.column(&r.foreign_key))
        })
        .ok_or_else(|| Error::UnknownField {
            schema: current.name.clone(),
            field: last.to_string(),
        })?;

    let alias = if relations.is_empty() {
        ROOT_ALIAS.to_string()
    } else {
        relations.join(".")
    };

    Ok(ResolvedColumn {
        alias,
        column,
        relations: relations.iter().map(|s| s.to_string()).collect(),
    })
}

struct Translator<'a> {
    registry: &'a SchemaRegistry,
    schema: &'a Schema,
}

impl Translator<'_> {
    fn fragment(&self, predicate: &Predicate) -> Result<Translated> {
        match predicate {
            Predicate::All => Ok(Translated::new("1 = 1", Vec::new())),
            Predicate::Comparison(comparison) => self.comparison(comparison),
            Predicate::Group(kind, children) => self.group(*kind, children),
        }
    }

    fn group(&self, kind: GroupKind, children: &[Predicate]) -> Result<Translated> {
        if children.is_empty() {
            let sql = match kind {
                GroupKind::And => "1 = 1",
                GroupKind::Or | GroupKind::Not => "1 = 0",
            };
            return Ok(Translated::new(sql, Vec::new()));
        }

        // Identical fragments bind identical values; emit each once.
        let mut fragments: Vec<Translated> = Vec::with_capacity(children.len());
        for child in children {
            let fragment = self.fragment(child)?;
            if !fragments.contains(&fragment) {
                fragments.push(fragment);
            }
        }

        let joiner = match kind {
            GroupKind::Or => "or",
            GroupKind::And | GroupKind::Not => "and",
        };

        let mut sql = String::from("(");
        let mut values = Vec::new();
        for (i, fragment) in fragments.into_iter().enumerate() {
            sql.push_str("\n  ");
            if i > 0 {
                sql.push_str(joiner);
                sql.push(' ');
            }
            sql.push_str(&fragment.sql.replace('\n', "\n  "));
            values.extend(fragment.values);
        }
        sql.push_str("\n)");

        // A comparison on a null column is unknown in SQL but false in
        // memory; collapse unknown to false before negating.
        if kind == GroupKind::Not {
            sql = format!("not coalesce({}, 0)", sql);
        }
        Ok(Translated::new(sql, values))
    }

    fn comparison(&self, comparison: &Comparison) -> Result<Translated> {
        let resolved = resolve_column(self.registry, self.schema, &comparison.field)?;
        let column = &resolved.column;
        let col = resolved.qualified();

        let translated = match &comparison.operator {
            Operator::Exists(true) | Operator::Ne(Value::Null) => {
                Translated::new(format!("{} is not null", col), Vec::new())
            }
            Operator::Exists(false) | Operator::Eq(Value::Null) => {
                Translated::new(format!("{} is null", col), Vec::new())
            }
            Operator::Eq(v) => Translated::new(format!("{} = ?", col), vec![bind(column, v)?]),
            Operator::Ne(v) => Translated::new(
                format!("({} <> ? or {} is null)", col, col),
                vec![bind(column, v)?],
            ),
            Operator::Lt(v) => Translated::new(format!("{} < ?", col), vec![bind(column, v)?]),
            Operator::Le(v) => Translated::new(format!("{} <= ?", col), vec![bind(column, v)?]),
            Operator::Gt(v) => Translated::new(format!("{} > ?", col), vec![bind(column, v)?]),
            Operator::Ge(v) => Translated::new(format!("{} >= ?", col), vec![bind(column, v)?]),
            Operator::Between(low, high) => Translated::new(
                format!("{} between ? and ?", col),
                vec![bind(column, low)?, bind(column, high)?],
            ),
            Operator::BeginsWith(s) => text_match(column, &col, s, "= 1")?,
            Operator::Contains(s) => text_match(column, &col, s, "> 0")?,
            Operator::NotContains(s) => text_match(column, &col, s, "= 0")?,
        };
        Ok(translated)
    }
}

fn text_match(column: &FieldDef, col: &str, needle: &str, test: &str) -> Result<Translated> {
    if column.is_array || !matches!(column.field_type, FieldType::String | FieldType::Enum) {
        return Err(Error::InvalidPredicate(format!(
            "text match on non-text field '{}'",
            column.name
        )));
    }
    Ok(Translated::new(
        format!("instr({}, ?) {}", col, test),
        vec![SqlValue::Text(needle.to_string())],
    ))
}

/// Check an operand against the column type and convert it for binding.
fn bind(column: &FieldDef, operand: &Value) -> Result<SqlValue> {
    let compatible = !column.is_array
        && match (column.field_type, operand) {
            (_, Value::Null) => false,
            (FieldType::String | FieldType::Enum, Value::String(_) | Value::Enum(_)) => true,
            (FieldType::Int | FieldType::Float, Value::Int(_) | Value::Float(_)) => true,
            (FieldType::Timestamp, Value::Timestamp(_) | Value::Int(_)) => true,
            (FieldType::Bool, Value::Bool(_)) => true,
            _ => false,
        };

    let bound = if compatible { operand.to_sql() } else { None };
    bound.ok_or_else(|| {
        Error::InvalidPredicate(format!(
            "cannot compare field '{}' of type {} with {}",
            column.name,
            column.field_type,
            operand.type_name()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{field, Relationship};

    fn registry() -> SchemaRegistry {
        SchemaRegistry::new(1)
            .with_schema(
                Schema::new(
                    "Blog",
                    vec![
                        FieldDef::required("id", FieldType::String),
                        FieldDef::required("name", FieldType::String),
                    ],
                )
                .with_relationship(Relationship::has_many("posts", "Post", "blogId")),
            )
            .unwrap()
            .with_schema(
                Schema::new(
                    "Post",
                    vec![
                        FieldDef::required("id", FieldType::String),
                        FieldDef::required("title", FieldType::String),
                        FieldDef::optional("rating", FieldType::Int),
                        FieldDef::optional("draft", FieldType::Bool),
                        FieldDef::list("tags", FieldType::String),
                    ],
                )
                .with_relationship(Relationship::belongs_to("blog", "Blog", "blogId")),
            )
            .unwrap()
    }

    fn translate_post(predicate: &Predicate) -> Result<Translated> {
        let registry = registry();
        translate(&registry, registry.get("Post").unwrap(), predicate)
    }

    #[test]
    fn leaf_operators() {
        let t = translate_post(&field("title").eq("Foo")).unwrap();
        assert_eq!(t.sql, "\"root\".\"title\" = ?");
        assert_eq!(t.values, vec![SqlValue::Text("Foo".into())]);

        let t = translate_post(&field("rating").between(1, 5)).unwrap();
        assert_eq!(t.sql, "\"root\".\"rating\" between ? and ?");
        assert_eq!(t.values, vec![SqlValue::Integer(1), SqlValue::Integer(5)]);

        let t = translate_post(&field("rating").ne(3)).unwrap();
        assert_eq!(
            t.sql,
            "(\"root\".\"rating\" <> ? or \"root\".\"rating\" is null)"
        );

        let t = translate_post(&field("draft").eq(true)).unwrap();
        assert_eq!(t.values, vec![SqlValue::Integer(1)]);

        let t = translate_post(&field("title").contains("oo")).unwrap();
        assert_eq!(t.sql, "instr(\"root\".\"title\", ?) > 0");
    }

    #[test]
    fn existence_desugars_to_null_checks() {
        let t = translate_post(&field("rating").exists(true)).unwrap();
        assert_eq!(t.sql, "\"root\".\"rating\" is not null");
        assert!(t.values.is_empty());

        let t = translate_post(&field("rating").exists(false)).unwrap();
        assert_eq!(t.sql, "\"root\".\"rating\" is null");

        let t = translate_post(&field("blog").exists(false)).unwrap();
        assert_eq!(t.sql, "\"root\".\"blogId\" is null");
    }

    #[test]
    fn match_all_is_a_tautology() {
        let t = translate_post(&Predicate::All).unwrap();
        assert_eq!(t.sql, "1 = 1");
        assert!(t.values.is_empty());
    }

    #[test]
    fn groups_are_parenthesized_and_indented() {
        let p = field("title").eq("A") | (field("rating").gt(1) & field("rating").lt(5));
        let t = translate_post(&p).unwrap();
        assert_eq!(
            t.sql,
            "(\n  \"root\".\"title\" = ?\n  or (\n    \"root\".\"rating\" > ?\n    and \"root\".\"rating\" < ?\n  )\n)"
        );
        assert_eq!(t.values.len(), 3);

        let t = translate_post(&!field("title").eq("A")).unwrap();
        assert_eq!(t.sql, "not coalesce((\n  \"root\".\"title\" = ?\n), 0)");
    }

    #[test]
    fn duplicate_fragments_are_emitted_once() {
        let p = field("rating").exists(true) & field("rating").ne(Value::Null) & field("title").eq("A");
        let t = translate_post(&p).unwrap();
        assert_eq!(
            t.sql,
            "(\n  \"root\".\"rating\" is not null\n  and \"root\".\"title\" = ?\n)"
        );
        assert_eq!(t.values, vec![SqlValue::Text("A".into())]);
    }

    #[test]
    fn relationship_paths_use_join_aliases() {
        let t = translate_post(&field("blog.name").begins_with("R")).unwrap();
        assert_eq!(t.sql, "instr(\"blog\".\"name\", ?) = 1");
    }

    #[test]
    fn configuration_errors() {
        assert!(matches!(
            translate_post(&field("subtitle").eq("x")),
            Err(Error::UnknownField { .. })
        ));
        assert!(matches!(
            translate_post(&field("blog.missing").eq("x")),
            Err(Error::UnknownField { .. })
        ));
        assert!(matches!(
            translate_post(&field("rating").eq("x")),
            Err(Error::InvalidPredicate(_))
        ));
        assert!(matches!(
            translate_post(&field("rating").begins_with("1")),
            Err(Error::InvalidPredicate(_))
        ));
        assert!(matches!(
            translate_post(&field("tags").eq("x")),
            Err(Error::InvalidPredicate(_))
        ));

        let registry = registry();
        let blog = registry.get("Blog").unwrap();
        assert!(matches!(
            translate(&registry, blog, &field("posts.title").eq("x")),
            Err(Error::InvalidPredicate(_))
        ));
    }

    #[test]
    fn quoting_escapes_quotes() {
        assert_eq!(quote("we\"ird"), "\"we\"\"ird\"");
    }
}
