//! Composable query predicates.
//!
//! A [`Predicate`] is an immutable tree of field comparisons joined by
//! `and`, `or` and `not` groups. Predicates are built with [`field`] and the
//! `&`, `|` and `!` operators:
//!
//! ```rust
//! use harbor_engine::{field, Predicate, Record};
//!
//! let p = field("title").begins_with("A") & !field("rating").lt(3);
//! let post = Record::new("Post").with("title", "Apple").with("rating", 4);
//! assert!(p.evaluate(&post));
//! ```
//!
//! Evaluation only looks at the record under test.

use crate::{Record, Value};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Comparison operator with its operand(s).
#[derive(Debug, Clone, PartialEq)]
pub enum Operator {
    Eq(Value),
    Ne(Value),
    Lt(Value),
    Le(Value),
    Gt(Value),
    Ge(Value),
    /// Inclusive range
    Between(Value, Value),
    BeginsWith(String),
    Contains(String),
    NotContains(String),
    /// `true` matches non-null values, `false` matches null or absent ones
    Exists(bool),
}

/// A leaf comparison against one field.
///
/// `field` may be a dotted path through belongs-to and has-one relationships,
/// e.g. `blog.name`.
#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub field: String,
    pub operator: Operator,
}

/// Boolean combinator of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupKind {
    And,
    Or,
    /// Negation of the conjunction of its children
    Not,
}

impl GroupKind {
    pub fn keyword(&self) -> &'static str {
        match self {
            GroupKind::And => "and",
            GroupKind::Or => "or",
            GroupKind::Not => "not",
        }
    }
}

/// A query predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Matches every record
    All,
    Comparison(Comparison),
    Group(GroupKind, Vec<Predicate>),
}

/// Start a comparison on `name`.
pub fn field(name: impl Into<String>) -> FieldRef {
    FieldRef { name: name.into() }
}

/// A field name waiting for its operator.
#[derive(Debug, Clone)]
pub struct FieldRef {
    name: String,
}

impl FieldRef {
    fn compare(self, operator: Operator) -> Predicate {
        Predicate::Comparison(Comparison {
            field: self.name,
            operator,
        })
    }

    pub fn eq(self, value: impl Into<Value>) -> Predicate {
        self.compare(Operator::Eq(value.into()))
    }

    pub fn ne(self, value: impl Into<Value>) -> Predicate {
        self.compare(Operator::Ne(value.into()))
    }

    pub fn lt(self, value: impl Into<Value>) -> Predicate {
        self.compare(Operator::Lt(value.into()))
    }

    pub fn le(self, value: impl Into<Value>) -> Predicate {
        self.compare(Operator::Le(value.into()))
    }

    pub fn gt(self, value: impl Into<Value>) -> Predicate {
        self.compare(Operator::Gt(value.into()))
    }

    pub fn ge(self, value: impl Into<Value>) -> Predicate {
        self.compare(Operator::Ge(value.into()))
    }

    pub fn between(self, low: impl Into<Value>, high: impl Into<Value>) -> Predicate {
        self.compare(Operator::Between(low.into(), high.into()))
    }

    pub fn begins_with(self, prefix: impl Into<String>) -> Predicate {
        self.compare(Operator::BeginsWith(prefix.into()))
    }

    pub fn contains(self, needle: impl Into<String>) -> Predicate {
        self.compare(Operator::Contains(needle.into()))
    }

    pub fn not_contains(self, needle: impl Into<String>) -> Predicate {
        self.compare(Operator::NotContains(needle.into()))
    }

    pub fn exists(self, exists: bool) -> Predicate {
        self.compare(Operator::Exists(exists))
    }
}

impl Predicate {
    pub fn and(predicates: Vec<Predicate>) -> Self {
        Predicate::Group(GroupKind::And, predicates)
    }

    pub fn or(predicates: Vec<Predicate>) -> Self {
        Predicate::Group(GroupKind::Or, predicates)
    }

    pub fn not(predicate: Predicate) -> Self {
        Predicate::Group(GroupKind::Not, vec![predicate])
    }

    /// Evaluate the predicate against a record.
    pub fn evaluate(&self, record: &Record) -> bool {
        match self {
            Predicate::All => true,
            Predicate::Comparison(comparison) => comparison.evaluate(record),
            Predicate::Group(GroupKind::And, children) => {
                children.iter().all(|p| p.evaluate(record))
            }
            Predicate::Group(GroupKind::Or, children) => {
                children.iter().any(|p| p.evaluate(record))
            }
            Predicate::Group(GroupKind::Not, children) => {
                !children.iter().all(|p| p.evaluate(record))
            }
        }
    }

    /// Every field path referenced by the tree, in first-seen order.
    pub fn field_paths(&self) -> Vec<&str> {
        let mut paths = Vec::new();
        self.collect_paths(&mut paths);
        paths
    }

    fn collect_paths<'a>(&'a self, paths: &mut Vec<&'a str>) {
        match self {
            Predicate::All => {}
            Predicate::Comparison(c) => {
                if !paths.contains(&c.field.as_str()) {
                    paths.push(&c.field);
                }
            }
            Predicate::Group(_, children) => {
                for child in children {
                    child.collect_paths(paths);
                }
            }
        }
    }
}

impl Comparison {
    pub fn evaluate(&self, record: &Record) -> bool {
        let value = record.get_path(&self.field).unwrap_or(&Value::Null);
        let ordered = |operand: &Value, accept: fn(Ordering) -> bool| {
            !value.is_null() && value.compare(operand).is_some_and(accept)
        };

        match &self.operator {
            Operator::Eq(Value::Null) => value.is_null(),
            Operator::Ne(Value::Null) => !value.is_null(),
            Operator::Eq(operand) => value.semantic_eq(operand),
            Operator::Ne(operand) => !value.semantic_eq(operand),
            Operator::Lt(operand) => ordered(operand, Ordering::is_lt),
            Operator::Le(operand) => ordered(operand, Ordering::is_le),
            Operator::Gt(operand) => ordered(operand, Ordering::is_gt),
            Operator::Ge(operand) => ordered(operand, Ordering::is_ge),
            Operator::Between(low, high) => {
                ordered(low, Ordering::is_ge) && ordered(high, Ordering::is_le)
            }
            Operator::BeginsWith(prefix) => value.as_text().is_some_and(|s| s.starts_with(prefix.as_str())),
            Operator::Contains(needle) => value.as_text().is_some_and(|s| s.contains(needle.as_str())),
            Operator::NotContains(needle) => {
                value.as_text().is_some_and(|s| !s.contains(needle.as_str()))
            }
            Operator::Exists(exists) => value.is_null() != *exists,
        }
    }
}

impl std::ops::BitAnd for Predicate {
    type Output = Predicate;

    fn bitand(self, rhs: Predicate) -> Predicate {
        match self {
            Predicate::Group(GroupKind::And, mut children) => {
                children.push(rhs);
                Predicate::Group(GroupKind::And, children)
            }
            lhs => Predicate::and(vec![lhs, rhs]),
        }
    }
}

impl std::ops::BitOr for Predicate {
    type Output = Predicate;

    fn bitor(self, rhs: Predicate) -> Predicate {
        match self {
            Predicate::Group(GroupKind::Or, mut children) => {
                children.push(rhs);
                Predicate::Group(GroupKind::Or, children)
            }
            lhs => Predicate::or(vec![lhs, rhs]),
        }
    }
}

impl std::ops::Not for Predicate {
    type Output = Predicate;

    fn not(self) -> Predicate {
        Predicate::not(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post(title: &str, rating: Option<i64>) -> Record {
        Record::new("Post")
            .with("id", "1")
            .with("title", title)
            .with("rating", rating)
    }

    #[test]
    fn comparisons() {
        let p = post("Apple", Some(4));
        assert!(field("title").eq("Apple").evaluate(&p));
        assert!(field("title").ne("Zebra").evaluate(&p));
        assert!(field("rating").gt(3).evaluate(&p));
        assert!(field("rating").le(4).evaluate(&p));
        assert!(!field("rating").lt(4).evaluate(&p));
        assert!(field("rating").between(4, 5).evaluate(&p));
        assert!(field("rating").ge(3.5).evaluate(&p));
    }

    #[test]
    fn text_operators() {
        let p = post("Apple pie", None);
        assert!(field("title").begins_with("App").evaluate(&p));
        assert!(!field("title").begins_with("pie").evaluate(&p));
        assert!(field("title").contains("le p").evaluate(&p));
        assert!(field("title").not_contains("cake").evaluate(&p));
        assert!(!field("rating").not_contains("x").evaluate(&p));
    }

    #[test]
    fn null_semantics() {
        let p = post("Apple", None);
        assert!(field("rating").exists(false).evaluate(&p));
        assert!(!field("rating").exists(true).evaluate(&p));
        assert!(field("rating").eq(Value::Null).evaluate(&p));
        assert!(field("rating").ne(3).evaluate(&p));
        assert!(!field("rating").lt(3).evaluate(&p));
        assert!(!field("rating").ge(3).evaluate(&p));
        assert!(field("missing").exists(false).evaluate(&p));
    }

    #[test]
    fn groups() {
        let p = post("Apple", Some(2));
        assert!((field("title").eq("Apple") & field("rating").lt(3)).evaluate(&p));
        assert!((field("title").eq("Pear") | field("rating").lt(3)).evaluate(&p));
        assert!((!field("title").eq("Pear")).evaluate(&p));
        assert!(Predicate::and(vec![]).evaluate(&p));
        assert!(!Predicate::or(vec![]).evaluate(&p));
        assert!(Predicate::All.evaluate(&p));
    }

    #[test]
    fn operators_flatten_same_kind_groups() {
        let p = field("a").eq(1) & field("b").eq(2) & field("c").eq(3);
        match p {
            Predicate::Group(GroupKind::And, children) => assert_eq!(children.len(), 3),
            other => panic!("unexpected predicate: {:?}", other),
        }
    }

    #[test]
    fn field_paths_are_unique() {
        let p = field("blog.name").eq("x") | field("title").eq("y") | field("blog.name").ne("z");
        assert_eq!(p.field_paths(), vec!["blog.name", "title"]);
    }
}
