//! Integration tests for the durable outbox.

mod common;

use common::*;
use harbor_datastore::harbor_engine::{DeliveryState, Error, MutationKind};
use harbor_datastore::{DataStore, DataStoreError};
use serde_json::json;

#[cfg(test)]
mod ordering_tests {
    use super::*;

    #[tokio::test]
    async fn test_entries_keep_enqueue_order() {
        let store = open_store().await;
        store.save(post("1", "Apple")).await.unwrap();
        store.save(post("2", "Banana")).await.unwrap();
        store.save(post("3", "Cherry")).await.unwrap();

        let outbox = store.outbox();
        let entries = outbox.entries().await.unwrap();
        let records: Vec<&str> = entries.iter().map(|e| e.event.record_id.as_str()).collect();
        assert_eq!(records, vec!["1", "2", "3"]);
        assert!(entries.windows(2).all(|w| w[0].seq < w[1].seq));

        let next = outbox.peek_next().await.unwrap().unwrap();
        assert_eq!(next.event.record_id, "1");
        assert_eq!(next.state, DeliveryState::Pending);
    }

    #[tokio::test]
    async fn test_in_flight_record_blocks_its_later_entries() {
        let store = open_store().await;
        let outbox = store.outbox();

        store.save(post("1", "Apple")).await.unwrap();
        store.save(post("2", "Banana")).await.unwrap();
        let first = outbox.peek_next().await.unwrap().unwrap();
        outbox.begin_delivery(first.id()).await.unwrap();

        // Not merged into the in-flight create
        store.save(post("1", "Apricot")).await.unwrap();
        assert_eq!(outbox.len().await.unwrap(), 3);

        let ready = outbox.next_ready(10).await.unwrap();
        let records: Vec<&str> = ready.iter().map(|e| e.event.record_id.as_str()).collect();
        assert_eq!(records, vec!["2"]);
    }

    #[tokio::test]
    async fn test_out_of_order_ack_is_rejected() {
        let store = open_store().await;
        let outbox = store.outbox();

        store.save(post("1", "Apple")).await.unwrap();
        let first = outbox.peek_next().await.unwrap().unwrap();
        outbox.begin_delivery(first.id()).await.unwrap();
        store.save(post("1", "Apricot")).await.unwrap();

        let later = outbox.pending_for("Post", "1").await.unwrap().pop().unwrap();
        assert_ne!(later.id(), first.id());
        outbox.begin_delivery(later.id()).await.unwrap();

        let result = outbox.ack(later.id()).await;
        assert!(matches!(
            result,
            Err(DataStoreError::Configuration(Error::OutOfOrderAck { .. }))
        ));

        let acked = outbox.ack(first.id()).await.unwrap();
        assert_eq!(acked.state, DeliveryState::Acknowledged);
        outbox.ack(later.id()).await.unwrap();
        assert!(outbox.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_ack_requires_in_flight() {
        let store = open_store().await;
        let outbox = store.outbox();
        store.save(post("1", "Apple")).await.unwrap();

        let entry = outbox.peek_next().await.unwrap().unwrap();
        let result = outbox.ack(entry.id()).await;
        assert!(matches!(
            result,
            Err(DataStoreError::Configuration(Error::InvalidTransition { .. }))
        ));
        assert_eq!(outbox.len().await.unwrap(), 1);
    }
}

#[cfg(test)]
mod coalescing_tests {
    use super::*;

    #[tokio::test]
    async fn test_create_then_update_is_one_create() {
        let store = open_store().await;
        store.save(post("1", "Apple")).await.unwrap();
        store.save(post("1", "Apricot")).await.unwrap();

        let entries = store.outbox().entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event.kind, MutationKind::Create);
        assert_eq!(entries[0].event.payload["title"], json!("Apricot"));
    }

    #[tokio::test]
    async fn test_create_then_delete_cancels_out() {
        let store = open_store().await;
        store.save(post("1", "Apple")).await.unwrap();
        store.delete("Post", "1").await.unwrap();

        assert!(store.outbox().is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_update_then_delete_is_one_delete() {
        let store = open_store().await;
        let outbox = store.outbox();

        store.save(post("1", "Apple")).await.unwrap();
        let create = outbox.peek_next().await.unwrap().unwrap();
        outbox.begin_delivery(create.id()).await.unwrap();
        outbox.ack(create.id()).await.unwrap();

        store.save(post("1", "Apricot")).await.unwrap();
        store.delete("Post", "1").await.unwrap();

        let entries = outbox.entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event.kind, MutationKind::Delete);
    }
}

#[cfg(test)]
mod state_tests {
    use super::*;

    #[tokio::test]
    async fn test_conflict_then_retry_with_merged_payload() {
        let store = open_store().await;
        let outbox = store.outbox();
        store.save(post("1", "Apple")).await.unwrap();
        let entry = outbox.peek_next().await.unwrap().unwrap();

        outbox.begin_delivery(entry.id()).await.unwrap();
        let conflicted = outbox.mark_conflict(entry.id(), 5).await.unwrap();
        assert_eq!(conflicted.state, DeliveryState::Conflict);
        assert_eq!(conflicted.remote_version, Some(5));

        let merged = json!({"id": "1", "title": "Merged"});
        outbox
            .retry(entry.id(), Some(merged.clone()), 5)
            .await
            .unwrap();

        let stored = outbox.get(entry.id()).await.unwrap().unwrap();
        assert_eq!(stored.state, DeliveryState::Pending);
        assert_eq!(stored.event.version, Some(5));
        assert_eq!(stored.event.payload, merged);
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn test_release_returns_to_pending() {
        let store = open_store().await;
        let outbox = store.outbox();
        store.save(post("1", "Apple")).await.unwrap();
        let entry = outbox.peek_next().await.unwrap().unwrap();

        outbox.begin_delivery(entry.id()).await.unwrap();
        assert!(outbox.next_ready(10).await.unwrap().is_empty());

        outbox.release(entry.id()).await.unwrap();
        let ready = outbox.next_ready(10).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].attempts, 1);
    }

    #[tokio::test]
    async fn test_fail_removes_entry() {
        let store = open_store().await;
        let outbox = store.outbox();
        store.save(post("1", "Apple")).await.unwrap();
        let entry = outbox.peek_next().await.unwrap().unwrap();

        let failed = outbox.fail(entry.id()).await.unwrap();
        assert_eq!(failed.map(|e| e.event.record_id), Some("1".to_string()));
        assert!(outbox.is_empty().await.unwrap());
        assert!(outbox.fail(entry.id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_entry_is_not_found() {
        let store = open_store().await;
        let result = store.outbox().begin_delivery("missing").await;
        assert!(matches!(result, Err(DataStoreError::NotFound(_))));
    }
}

#[cfg(test)]
mod durability_tests {
    use super::*;

    #[tokio::test]
    async fn test_entries_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config().with_database_path(dir.path().join("outbox.db"));

        let store = DataStore::open(config.clone(), registry()).await.unwrap();
        store.save(post("1", "Apple")).await.unwrap();
        store.save(post("2", "Banana")).await.unwrap();
        let first = store.outbox().peek_next().await.unwrap().unwrap();
        store.outbox().begin_delivery(first.id()).await.unwrap();
        store.close().await.unwrap();

        let store = DataStore::open(config, registry()).await.unwrap();
        let outbox = store.outbox();
        let entries = outbox.entries().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id(), first.id());
        assert_eq!(entries[0].state, DeliveryState::InFlight);
        assert_eq!(entries[0].event.payload["title"], json!("Apple"));

        // An interrupted delivery goes back to pending
        assert_eq!(outbox.reset_in_flight().await.unwrap(), 1);
        let reset = outbox.get(first.id()).await.unwrap().unwrap();
        assert_eq!(reset.state, DeliveryState::Pending);
        assert_eq!(reset.attempts, 1);
    }

    #[tokio::test]
    async fn test_clear_empties_the_outbox() {
        let store = open_store().await;
        store.save(post("1", "Apple")).await.unwrap();
        store.save(post("2", "Banana")).await.unwrap();

        assert_eq!(store.outbox().clear().await.unwrap(), 2);
        assert!(store.outbox().is_empty().await.unwrap());
    }
}
