//! Live query snapshots.
//!
//! A [`ResultSet`] tracks the records matching one observed query and folds
//! mutation events into it without going back to storage. Every time the set
//! changes, the observer is handed a [`QuerySnapshot`]: an owned, sorted copy
//! of the matching records.

use crate::{
    error::Result, sort::sort_records, statement::fill_lazy, MutationEvent, MutationKind,
    Predicate, Record, RecordId, Schema, SchemaRegistry, SortDescriptor, Value,
};
use std::collections::{BTreeMap, HashMap};

/// A point-in-time result of an observed query.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySnapshot {
    /// Matching records, sorted
    pub items: Vec<Record>,
    /// 0 for the initial result, then incremented per emission
    pub generation: u64,
    /// Whether every syncable schema finished its initial sync
    pub is_synced: bool,
    /// Events folded in since the previous snapshot, latest per record
    pub items_changed: Vec<MutationEvent>,
}

/// The records currently matching an observed query.
#[derive(Debug, Clone)]
pub struct ResultSet {
    schema: Schema,
    predicate: Predicate,
    sort: Vec<SortDescriptor>,
    items: BTreeMap<RecordId, Record>,
}

impl ResultSet {
    pub fn new(schema: Schema, predicate: Predicate, sort: Vec<SortDescriptor>) -> Self {
        Self {
            schema,
            predicate,
            sort,
            items: BTreeMap::new(),
        }
    }

    pub fn schema_name(&self) -> &str {
        &self.schema.name
    }

    pub fn predicate(&self) -> &Predicate {
        &self.predicate
    }

    pub fn sort(&self) -> &[SortDescriptor] {
        &self.sort
    }

    /// Whether events cannot be folded in directly.
    ///
    /// Event payloads carry only the record's own fields, so a predicate
    /// reaching through a relationship needs a fresh query to evaluate.
    pub fn requires_requery(&self) -> bool {
        self.predicate
            .field_paths()
            .iter()
            .any(|path| path.contains('.'))
    }

    /// Replace the tracked records with a fresh query result.
    pub fn replace_all(&mut self, records: Vec<Record>) -> Result<()> {
        let mut items = BTreeMap::new();
        for record in records {
            items.insert(self.schema.identifier(&record)?, record);
        }
        self.items = items;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Fold one event into the set. Returns whether the set changed.
    ///
    /// Deletes always remove. Other events add or replace the record when
    /// its new payload matches the predicate and remove it otherwise. Events
    /// for other schemas are ignored.
    pub fn apply(&mut self, registry: &SchemaRegistry, event: &MutationEvent) -> Result<bool> {
        if event.schema_name != self.schema.name {
            return Ok(false);
        }
        if event.kind == MutationKind::Delete {
            return Ok(self.items.remove(&event.record_id).is_some());
        }

        let mut record = event.decode(registry)?;
        if let Some(existing) = self.items.get(&event.record_id) {
            self.carry_related(existing, &mut record);
        }
        fill_lazy(&self.schema, &mut record)?;

        if self.predicate.evaluate(&record) {
            let changed = self
                .items
                .get(&event.record_id)
                .map_or(true, |existing| existing != &record);
            self.items.insert(event.record_id.clone(), record);
            Ok(changed)
        } else {
            Ok(self.items.remove(&event.record_id).is_some())
        }
    }

    /// Keep eagerly loaded related records whose foreign key did not change.
    fn carry_related(&self, existing: &Record, record: &mut Record) {
        for relationship in &self.schema.relationships {
            if record.get_raw(&relationship.name).is_some() {
                continue;
            }
            let unchanged = !relationship.holds_foreign_key()
                || existing.get_raw(&relationship.foreign_key)
                    == record.get_raw(&relationship.foreign_key);
            if let (true, Some(related @ Value::Record(_))) =
                (unchanged, existing.get_raw(&relationship.name))
            {
                record.set(relationship.name.clone(), related.clone());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.contains_key(id)
    }

    /// Sorted copy of the tracked records.
    pub fn items(&self) -> Vec<Record> {
        let mut items: Vec<Record> = self.items.values().cloned().collect();
        sort_records(&mut items, &self.sort);
        items
    }

    pub fn snapshot(
        &self,
        generation: u64,
        is_synced: bool,
        items_changed: Vec<MutationEvent>,
    ) -> QuerySnapshot {
        QuerySnapshot {
            items: self.items(),
            generation,
            is_synced,
            items_changed,
        }
    }
}

/// Keep only the latest event per record, in order of those latest events.
pub fn dedup_latest(events: &[MutationEvent]) -> Vec<MutationEvent> {
    let mut last_index: HashMap<(&str, &str), usize> = HashMap::new();
    for (i, event) in events.iter().enumerate() {
        last_index.insert((&event.schema_name, &event.record_id), i);
    }
    events
        .iter()
        .enumerate()
        .filter(|(i, event)| last_index.get(&(&*event.schema_name, &*event.record_id)) == Some(i))
        .map(|(_, event)| event.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{field, FieldDef, FieldType, Origin, Relationship, Value};
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

    fn event(id: &str, kind: MutationKind, title: &str) -> MutationEvent {
        MutationEvent {
            id: format!("e-{}-{}", id, title),
            record_id: id.into(),
            schema_name: "Post".into(),
            kind,
            version: None,
            timestamp: 0,
            payload: json!({"id": id, "title": title}),
            origin: Origin::Local,
        }
    }

    fn result_set(registry: &SchemaRegistry) -> ResultSet {
        ResultSet::new(
            registry.get("Post").unwrap().clone(),
            field("title").begins_with("A"),
            vec![SortDescriptor::ascending("title")],
        )
    }

    #[test]
    fn membership_follows_predicate() {
        let registry = registry();
        let mut set = result_set(&registry);

        assert!(set.apply(&registry, &event("2", MutationKind::Create, "Apple")).unwrap());
        assert!(set.contains("2"));

        // Same payload again does not count as a change.
        assert!(!set.apply(&registry, &event("2", MutationKind::Update, "Apple")).unwrap());

        assert!(set.apply(&registry, &event("2", MutationKind::Update, "Zebra")).unwrap());
        assert!(!set.contains("2"));

        assert!(!set.apply(&registry, &event("3", MutationKind::Create, "Zebra")).unwrap());
        assert!(set.is_empty());
    }

    #[test]
    fn delete_always_removes() {
        let registry = registry();
        let mut set = result_set(&registry);
        set.apply(&registry, &event("1", MutationKind::Create, "Avocado"))
            .unwrap();

        assert!(set.apply(&registry, &event("1", MutationKind::Delete, "Zzz")).unwrap());
        assert!(set.is_empty());
        assert!(!set.apply(&registry, &event("1", MutationKind::Delete, "Zzz")).unwrap());
    }

    #[test]
    fn other_schemas_are_ignored() {
        let registry = registry();
        let mut set = result_set(&registry);
        let mut foreign = event("1", MutationKind::Create, "Apple");
        foreign.schema_name = "Comment".into();
        assert!(!set.apply(&registry, &foreign).unwrap());
    }

    #[test]
    fn snapshot_is_sorted() {
        let registry = registry();
        let mut set = result_set(&registry);
        set.replace_all(vec![
            Record::new("Post").with("id", "1").with("title", "Avocado"),
            Record::new("Post").with("id", "2").with("title", "Apple"),
        ])
        .unwrap();

        let snapshot = set.snapshot(3, true, Vec::new());
        assert_eq!(snapshot.generation, 3);
        assert!(snapshot.is_synced);
        let titles: Vec<&Value> = snapshot
            .items
            .iter()
            .filter_map(|r| r.get_raw("title"))
            .collect();
        assert_eq!(titles, vec![&Value::from("Apple"), &Value::from("Avocado")]);
    }

    #[test]
    fn relationship_predicates_require_requery() {
        let registry = registry();
        let schema = registry
            .get("Post")
            .unwrap()
            .clone()
            .with_relationship(Relationship::belongs_to("blog", "Blog", "blogId"));
        let set = ResultSet::new(schema.clone(), field("blog.name").eq("x"), Vec::new());
        assert!(set.requires_requery());
        let set = ResultSet::new(schema, field("title").eq("x"), Vec::new());
        assert!(!set.requires_requery());
    }

    #[test]
    fn related_records_survive_updates() {
        let registry = SchemaRegistry::new(1)
            .with_schema(Schema::new(
                "Blog",
                vec![
                    FieldDef::required("id", FieldType::String),
                    FieldDef::required("name", FieldType::String),
                ],
            ))
            .unwrap()
            .with_schema(
                Schema::new(
                    "Post",
                    vec![
                        FieldDef::required("id", FieldType::String),
                        FieldDef::required("title", FieldType::String),
                    ],
                )
                .with_relationship(Relationship::belongs_to("blog", "Blog", "blogId")),
            )
            .unwrap();
        let mut set = ResultSet::new(
            registry.get("Post").unwrap().clone(),
            Predicate::All,
            Vec::new(),
        );
        let blog = Record::new("Blog").with("id", "b1").with("name", "Rust");
        set.replace_all(vec![Record::new("Post")
            .with("id", "1")
            .with("title", "Foo")
            .with("blogId", "b1")
            .with("blog", blog.clone())])
        .unwrap();

        let mut update = event("1", MutationKind::Update, "Bar");
        update.payload = json!({"id": "1", "title": "Bar", "blogId": "b1"});
        assert!(set.apply(&registry, &update).unwrap());
        assert_eq!(set.items()[0].get_raw("blog"), Some(&Value::from(blog)));

        update.payload = json!({"id": "1", "title": "Bar", "blogId": "b2"});
        set.apply(&registry, &update).unwrap();
        assert!(matches!(
            set.items()[0].get_raw("blog"),
            Some(Value::Lazy(crate::LazyRef::One { id, .. })) if id == "b2"
        ));
    }

    #[test]
    fn dedup_keeps_latest_per_record() {
        let events = vec![
            event("1", MutationKind::Create, "a"),
            event("2", MutationKind::Create, "b"),
            event("1", MutationKind::Update, "c"),
        ];
        let deduped = dedup_latest(&events);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].record_id, "2");
        assert_eq!(deduped[1].payload["title"], "c");
    }
}
