use super::*;
use chrono::{Duration, Utc};
use shared::{domain::TodoItem, protocol::SortDirection};

fn fields(text: &str) -> DocumentFields {
    DocumentFields {
        text: text.to_string(),
        completed: false,
        created_at: None,
    }
}

async fn next_snapshot(sub: &mut Subscription) -> Vec<TodoItem> {
    match sub.next_event().await {
        Some(CollectionEvent::Snapshot { items, .. }) => items,
        other => panic!("expected snapshot, got {other:?}"),
    }
}

#[tokio::test]
async fn add_assigns_unique_id_and_server_timestamp() {
    let store = MemoryCollection::new();
    let before = Utc::now();
    let first = store.add_document("todos", fields("a")).await.expect("add");
    let second = store.add_document("todos", fields("b")).await.expect("add");

    assert_ne!(first.id, second.id);
    assert!(first.created_at >= before);
}

#[tokio::test]
async fn add_honors_client_supplied_timestamp() {
    let store = MemoryCollection::new();
    let stamp = Utc::now() - Duration::days(3);
    let created = store
        .add_document(
            "todos",
            DocumentFields {
                text: "old".to_string(),
                completed: false,
                created_at: Some(stamp),
            },
        )
        .await
        .expect("add");
    assert_eq!(created.created_at, stamp);
}

#[tokio::test]
async fn subscription_delivers_initial_then_updated_snapshots() {
    let store = MemoryCollection::new();
    let mut sub = store
        .subscribe(Query::created_at_desc("todos"))
        .await
        .expect("subscribe");

    assert!(next_snapshot(&mut sub).await.is_empty());

    store.add_document("todos", fields("a")).await.expect("add");
    let items = next_snapshot(&mut sub).await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].text, "a");

    store
        .update_document("todos", &items[0].id, DocumentPatch::completed(true))
        .await
        .expect("update");
    let items = next_snapshot(&mut sub).await;
    assert!(items[0].completed);

    store
        .delete_document("todos", &items[0].id)
        .await
        .expect("delete");
    assert!(next_snapshot(&mut sub).await.is_empty());
}

#[tokio::test]
async fn snapshots_are_newest_first_regardless_of_insertion_order() {
    let store = MemoryCollection::new();
    let base = Utc::now();
    for (text, offset) in [("middle", 1), ("oldest", 0), ("newest", 2)] {
        store
            .add_document(
                "todos",
                DocumentFields {
                    text: text.to_string(),
                    completed: false,
                    created_at: Some(base + Duration::seconds(offset)),
                },
            )
            .await
            .expect("add");
    }

    let mut sub = store
        .subscribe(Query::created_at_desc("todos"))
        .await
        .expect("subscribe");
    let items = next_snapshot(&mut sub).await;
    let texts: Vec<&str> = items.iter().map(|i| i.text.as_str()).collect();
    assert_eq!(texts, vec!["newest", "middle", "oldest"]);
}

#[tokio::test]
async fn ascending_direction_reverses_the_order() {
    let store = MemoryCollection::new();
    let base = Utc::now();
    for (text, offset) in [("first", 0), ("second", 1)] {
        store
            .add_document(
                "todos",
                DocumentFields {
                    text: text.to_string(),
                    completed: false,
                    created_at: Some(base + Duration::seconds(offset)),
                },
            )
            .await
            .expect("add");
    }

    let mut sub = store
        .subscribe(Query {
            collection: "todos".to_string(),
            order_by: shared::protocol::SortField::CreatedAt,
            direction: SortDirection::Asc,
        })
        .await
        .expect("subscribe");
    let items = next_snapshot(&mut sub).await;
    assert_eq!(items[0].text, "first");
}

#[tokio::test]
async fn cached_first_replays_the_initial_snapshot_twice() {
    let store = MemoryCollection::new().with_cached_first(true);
    store.add_document("todos", fields("a")).await.expect("add");

    assert!(store.cached_first_snapshot());
    let mut sub = store
        .subscribe(Query::created_at_desc("todos"))
        .await
        .expect("subscribe");
    let provisional = next_snapshot(&mut sub).await;
    let authoritative = next_snapshot(&mut sub).await;
    assert_eq!(provisional, authoritative);
}

#[tokio::test]
async fn update_unknown_document_is_not_found() {
    let store = MemoryCollection::new();
    let err = store
        .update_document(
            "todos",
            &TodoId("missing".to_string()),
            DocumentPatch::completed(true),
        )
        .await
        .expect_err("should fail");
    assert!(matches!(err, StoreError::NotFound(_)));
}

#[tokio::test]
async fn delete_unknown_document_is_a_noop_success() {
    let store = MemoryCollection::new();
    store
        .delete_document("todos", &TodoId("missing".to_string()))
        .await
        .expect("delete of unknown id succeeds");
}

#[tokio::test]
async fn changes_to_other_collections_are_not_delivered() {
    let store = MemoryCollection::new();
    let mut sub = store
        .subscribe(Query::created_at_desc("todos"))
        .await
        .expect("subscribe");
    assert!(next_snapshot(&mut sub).await.is_empty());

    store
        .add_document("groceries", fields("milk"))
        .await
        .expect("add");
    store.add_document("todos", fields("a")).await.expect("add");

    // The next delivered snapshot is for "todos" only.
    let items = next_snapshot(&mut sub).await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].text, "a");
}

#[tokio::test]
async fn lagged_subscriber_resyncs_with_the_final_state() {
    let store = MemoryCollection::new();
    let mut sub = store
        .subscribe(Query::created_at_desc("todos"))
        .await
        .expect("subscribe");
    assert!(next_snapshot(&mut sub).await.is_empty());

    // Nothing consumes while writing: the pump stalls on the full event
    // channel and its change receiver overflows its capacity.
    for i in 0..300 {
        store
            .add_document("todos", fields(&format!("item {i}")))
            .await
            .expect("add");
    }

    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        loop {
            if next_snapshot(&mut sub).await.len() == 300 {
                break;
            }
        }
    })
    .await
    .expect("subscriber never caught up to the final state");
}

#[tokio::test]
async fn empty_collection_path_is_rejected() {
    let store = MemoryCollection::new();
    let err = store
        .subscribe(Query::created_at_desc("  "))
        .await
        .err()
        .expect("should fail");
    assert!(matches!(err, StoreError::InvalidQuery(_)));
}
