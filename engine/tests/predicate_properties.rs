//! Property tests for predicate evaluation, translation and sorting.

use harbor_engine::{
    compare_records, field, sort_records, translate, FieldDef, FieldType, Predicate, Record,
    Schema, SchemaRegistry, SortDescriptor, Value,
};
use proptest::prelude::*;
use std::cmp::Ordering;

fn registry() -> SchemaRegistry {
    SchemaRegistry::new(1)
        .with_schema(Schema::new(
            "Post",
            vec![
                FieldDef::required("id", FieldType::String),
                FieldDef::optional("title", FieldType::String),
                FieldDef::optional("rating", FieldType::Int),
                FieldDef::optional("score", FieldType::Float),
                FieldDef::optional("draft", FieldType::Bool),
            ],
        ))
        .unwrap()
}

fn arb_record() -> impl Strategy<Value = Record> {
    (
        0u32..1000,
        proptest::option::of("[A-Za-z]{0,4}"),
        proptest::option::of(-5i64..5),
        proptest::option::of(-5.0f64..5.0),
        proptest::option::of(any::<bool>()),
    )
        .prop_map(|(id, title, rating, score, draft)| {
            let mut record = Record::new("Post").with("id", id.to_string());
            if let Some(title) = title {
                record.set("title", title);
            }
            if let Some(rating) = rating {
                record.set("rating", rating);
            }
            if let Some(score) = score {
                record.set("score", score);
            }
            if let Some(draft) = draft {
                record.set("draft", draft);
            }
            record
        })
}

fn arb_leaf() -> impl Strategy<Value = Predicate> {
    prop_oneof![
        "[A-Za-z]{0,2}".prop_map(|s| field("title").eq(s)),
        "[A-Za-z]{0,2}".prop_map(|s| field("title").ne(s)),
        "[A-Za-z]{0,2}".prop_map(|s| field("title").begins_with(s)),
        "[A-Za-z]{0,2}".prop_map(|s| field("title").contains(s)),
        "[A-Za-z]{0,2}".prop_map(|s| field("title").not_contains(s)),
        (-5i64..5).prop_map(|v| field("rating").lt(v)),
        (-5i64..5).prop_map(|v| field("rating").ge(v)),
        (-5i64..5, -5i64..5).prop_map(|(a, b)| field("rating").between(a.min(b), a.max(b))),
        (-5.0f64..5.0).prop_map(|v| field("score").gt(v)),
        any::<bool>().prop_map(|b| field("draft").eq(b)),
        any::<bool>().prop_map(|b| field("rating").exists(b)),
        Just(field("score").eq(Value::Null)),
        Just(Predicate::All),
    ]
}

fn arb_predicate() -> impl Strategy<Value = Predicate> {
    arb_leaf().prop_recursive(4, 32, 4, |inner| {
        prop_oneof![
            proptest::collection::vec(inner.clone(), 0..4).prop_map(Predicate::and),
            proptest::collection::vec(inner.clone(), 0..4).prop_map(Predicate::or),
            inner.prop_map(Predicate::not),
        ]
    })
}

proptest! {
    #[test]
    fn well_typed_predicates_always_translate(predicate in arb_predicate()) {
        let registry = registry();
        let schema = registry.get("Post").unwrap();
        let clause = translate(&registry, schema, &predicate).unwrap();
        prop_assert_eq!(clause.sql.matches('?').count(), clause.values.len());
    }

    #[test]
    fn negation_inverts(predicate in arb_predicate(), record in arb_record()) {
        prop_assert_eq!(
            Predicate::not(predicate.clone()).evaluate(&record),
            !predicate.evaluate(&record)
        );
    }

    #[test]
    fn groups_follow_boolean_algebra(
        a in arb_predicate(),
        b in arb_predicate(),
        record in arb_record(),
    ) {
        let (ea, eb) = (a.evaluate(&record), b.evaluate(&record));
        prop_assert_eq!((a.clone() & b.clone()).evaluate(&record), ea && eb);
        prop_assert_eq!((a.clone() | b.clone()).evaluate(&record), ea || eb);
        prop_assert_eq!(Predicate::or(vec![a.clone(), a.clone()]).evaluate(&record), ea);
        prop_assert_eq!(Predicate::and(vec![a, Predicate::All]).evaluate(&record), ea);
    }

    #[test]
    fn sort_orders_and_keeps_every_record(
        records in proptest::collection::vec(arb_record(), 0..30),
        descending in any::<bool>(),
    ) {
        let descriptors = if descending {
            vec![SortDescriptor::descending("rating"), SortDescriptor::ascending("title")]
        } else {
            vec![SortDescriptor::ascending("rating"), SortDescriptor::descending("title")]
        };

        let mut sorted = records.clone();
        sort_records(&mut sorted, &descriptors);

        prop_assert_eq!(sorted.len(), records.len());
        for pair in sorted.windows(2) {
            prop_assert_ne!(compare_records(&pair[0], &pair[1], &descriptors), Ordering::Greater);
        }
        for record in &records {
            prop_assert!(sorted.contains(record));
        }
    }

    #[test]
    fn sort_is_stable(records in proptest::collection::vec(arb_record(), 0..30)) {
        let descriptors = vec![SortDescriptor::ascending("draft")];
        let mut sorted = records.clone();
        sort_records(&mut sorted, &descriptors);

        for pair in sorted.windows(2) {
            if compare_records(&pair[0], &pair[1], &descriptors) == Ordering::Equal {
                let first = records.iter().position(|r| r == &pair[0]).unwrap();
                let second = records.iter().rposition(|r| r == &pair[1]).unwrap();
                prop_assert!(first <= second);
            }
        }
    }
}
