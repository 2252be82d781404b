//! In-memory record sorting.
//!
//! Sorting happens after records are read, over semantic values rather than
//! stored bytes. The sort is stable, descriptors compose lexicographically,
//! and null (or absent) values sort first ascending and last descending.

use crate::{Record, Value};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Sort by one field path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortDescriptor {
    pub field: String,
    pub order: SortOrder,
}

impl SortDescriptor {
    pub fn ascending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Ascending,
        }
    }

    pub fn descending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Descending,
        }
    }

    fn compare(&self, a: &Record, b: &Record) -> Ordering {
        let a = a.get_path(&self.field).unwrap_or(&Value::Null);
        let b = b.get_path(&self.field).unwrap_or(&Value::Null);

        let ascending = match (a.is_null(), b.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            // Values of unrelated types keep their relative order.
            (false, false) => a.compare(b).unwrap_or(Ordering::Equal),
        };

        match self.order {
            SortOrder::Ascending => ascending,
            SortOrder::Descending => ascending.reverse(),
        }
    }
}

/// Compare two records by a list of descriptors, first descriptor first.
pub fn compare_records(a: &Record, b: &Record, sort: &[SortDescriptor]) -> Ordering {
    sort.iter()
        .map(|descriptor| descriptor.compare(a, b))
        .find(|ordering| ordering.is_ne())
        .unwrap_or(Ordering::Equal)
}

/// Stable sort of `records` by `sort`. An empty list leaves the order as is.
pub fn sort_records(records: &mut [Record], sort: &[SortDescriptor]) {
    if sort.is_empty() {
        return;
    }
    records.sort_by(|a, b| compare_records(a, b, sort));
}
