use super::*;
use axum::{
    extract::{ws::Message as WsMessage, Path, Query as HttpQuery, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::{get, patch, post},
    Json, Router,
};
use collection::MemoryCollection;
use futures::SinkExt;
use serde::Deserialize;
use shared::domain::TodoItem;
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;

#[derive(Debug, Deserialize)]
struct WsParams {
    collection: String,
}

/// In-process stand-in for the hosted service, backed by a
/// `MemoryCollection`. The `forbidden` collection rejects all writes and
/// the `flaky` collection hangs up after its first snapshot.
async fn spawn_collection_server() -> (String, Arc<MemoryCollection>) {
    let store = Arc::new(MemoryCollection::new());
    let app = Router::new()
        .route("/collections/:collection/documents", post(http_add))
        .route(
            "/collections/:collection/documents/:id",
            patch(http_update).delete(http_delete),
        )
        .route("/ws", get(ws_handler))
        .with_state(Arc::clone(&store));

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (format!("http://{addr}"), store)
}

fn forbidden() -> (axum::http::StatusCode, Json<ApiError>) {
    (
        axum::http::StatusCode::FORBIDDEN,
        Json(ApiError::new(ErrorCode::Forbidden, "read-only collection")),
    )
}

async fn http_add(
    State(store): State<Arc<MemoryCollection>>,
    Path(collection): Path<String>,
    Json(fields): Json<DocumentFields>,
) -> Result<Json<CreatedDocument>, (axum::http::StatusCode, Json<ApiError>)> {
    if collection == "forbidden" {
        return Err(forbidden());
    }
    let created = store
        .add_document(&collection, fields)
        .await
        .map_err(|e| {
            (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::new(ErrorCode::Internal, e.to_string())),
            )
        })?;
    Ok(Json(created))
}

async fn http_update(
    State(store): State<Arc<MemoryCollection>>,
    Path((collection, id)): Path<(String, String)>,
    Json(patch): Json<DocumentPatch>,
) -> Result<axum::http::StatusCode, (axum::http::StatusCode, Json<ApiError>)> {
    if collection == "forbidden" {
        return Err(forbidden());
    }
    store
        .update_document(&collection, &TodoId(id), patch)
        .await
        .map_err(|e| match e {
            StoreError::NotFound(msg) => (
                axum::http::StatusCode::NOT_FOUND,
                Json(ApiError::new(ErrorCode::NotFound, msg)),
            ),
            other => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::new(ErrorCode::Internal, other.to_string())),
            ),
        })?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

async fn http_delete(
    State(store): State<Arc<MemoryCollection>>,
    Path((collection, id)): Path<(String, String)>,
) -> Result<axum::http::StatusCode, (axum::http::StatusCode, Json<ApiError>)> {
    if collection == "forbidden" {
        return Err(forbidden());
    }
    store
        .delete_document(&collection, &TodoId(id))
        .await
        .map_err(|e| {
            (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::new(ErrorCode::Internal, e.to_string())),
            )
        })?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(store): State<Arc<MemoryCollection>>,
    HttpQuery(params): HttpQuery<WsParams>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let flaky = params.collection == "flaky";
        let Ok(mut subscription) = store
            .subscribe(Query::created_at_desc(params.collection))
            .await
        else {
            return;
        };

        let (mut sender, _receiver) = socket.split();
        while let Some(event) = subscription.next_event().await {
            let Ok(text) = serde_json::to_string(&event) else {
                break;
            };
            if sender.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
            if flaky {
                break;
            }
        }
    })
}

fn fields(text: &str) -> DocumentFields {
    DocumentFields {
        text: text.to_string(),
        completed: false,
        created_at: None,
    }
}

async fn next_event(subscription: &mut Subscription) -> CollectionEvent {
    tokio::time::timeout(Duration::from_secs(5), subscription.next_event())
        .await
        .expect("timed out waiting for event")
        .expect("subscription ended without an event")
}

async fn next_snapshot(subscription: &mut Subscription) -> Vec<TodoItem> {
    match next_event(subscription).await {
        CollectionEvent::Snapshot { items, .. } => items,
        CollectionEvent::Error(e) => panic!("unexpected subscription error: {e:?}"),
    }
}

#[tokio::test]
async fn created_document_appears_in_the_initial_snapshot() {
    let (url, _store) = spawn_collection_server().await;
    let remote = RemoteCollection::new(url);

    let created = remote
        .add_document("todos", fields("buy milk"))
        .await
        .expect("add");

    let mut subscription = remote
        .subscribe(Query::created_at_desc("todos"))
        .await
        .expect("subscribe");
    let items = next_snapshot(&mut subscription).await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].id, created.id);
    assert_eq!(items[0].text, "buy milk");
}

#[tokio::test]
async fn writes_after_subscribing_push_fresh_snapshots() {
    let (url, _store) = spawn_collection_server().await;
    let remote = RemoteCollection::new(url);

    let mut subscription = remote
        .subscribe(Query::created_at_desc("todos"))
        .await
        .expect("subscribe");
    assert!(next_snapshot(&mut subscription).await.is_empty());

    let created = remote
        .add_document("todos", fields("task"))
        .await
        .expect("add");
    let items = next_snapshot(&mut subscription).await;
    assert_eq!(items.len(), 1);
    assert!(!items[0].completed);

    remote
        .update_document("todos", &created.id, DocumentPatch::completed(true))
        .await
        .expect("update");
    let items = next_snapshot(&mut subscription).await;
    assert!(items[0].completed);

    remote
        .delete_document("todos", &created.id)
        .await
        .expect("delete");
    assert!(next_snapshot(&mut subscription).await.is_empty());
}

#[tokio::test]
async fn forbidden_writes_map_to_permission_denied() {
    let (url, _store) = spawn_collection_server().await;
    let remote = RemoteCollection::new(url);

    let err = remote
        .add_document("forbidden", fields("nope"))
        .await
        .expect_err("should be rejected");
    assert!(matches!(err, StoreError::PermissionDenied(_)));
}

#[tokio::test]
async fn patching_an_unknown_id_maps_to_not_found() {
    let (url, _store) = spawn_collection_server().await;
    let remote = RemoteCollection::new(url);

    let err = remote
        .update_document(
            "todos",
            &TodoId("missing".to_string()),
            DocumentPatch::completed(true),
        )
        .await
        .expect_err("unknown id");
    assert!(matches!(err, StoreError::NotFound(_)));
}

#[tokio::test]
async fn deleting_an_unknown_id_succeeds() {
    let (url, _store) = spawn_collection_server().await;
    let remote = RemoteCollection::new(url);

    remote
        .delete_document("todos", &TodoId("missing".to_string()))
        .await
        .expect("idempotent delete");
}

#[tokio::test]
async fn server_hangup_delivers_one_terminal_error() {
    let (url, _store) = spawn_collection_server().await;
    let remote = RemoteCollection::new(url);

    let mut subscription = remote
        .subscribe(Query::created_at_desc("flaky"))
        .await
        .expect("subscribe");
    assert!(next_snapshot(&mut subscription).await.is_empty());

    match next_event(&mut subscription).await {
        CollectionEvent::Error(e) => assert_eq!(e.code, ErrorCode::Unavailable),
        other => panic!("expected terminal error, got {other:?}"),
    }
    assert!(subscription.next_event().await.is_none());
}

#[tokio::test]
async fn non_http_server_url_is_rejected() {
    let remote = RemoteCollection::new("ftp://example.com");
    let err = remote
        .subscribe(Query::created_at_desc("todos"))
        .await
        .expect_err("bad scheme");
    assert!(matches!(err, StoreError::InvalidQuery(_)));
}
