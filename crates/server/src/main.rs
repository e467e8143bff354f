use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query as HttpQuery, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, patch, post},
    Json, Router,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::Deserialize;
use shared::{
    domain::{TodoId, TodoItem},
    error::{ApiError, ErrorCode},
    protocol::{CollectionEvent, CreatedDocument, DocumentFields, DocumentPatch, Query},
};
use storage::Storage;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

mod api;
mod config;

use api::ApiContext;
use config::{load_settings, prepare_database_url};

/// Fan-out of collection names that changed; every websocket subscriber
/// reloads and pushes a fresh full snapshot when its collection comes up.
const CHANGE_FANOUT: usize = 256;

#[derive(Clone)]
struct AppState {
    api: ApiContext,
    changes: broadcast::Sender<String>,
}

#[derive(Debug, Deserialize)]
struct SnapshotQuery {
    order_by: Option<String>,
    direction: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    collection: String,
    order_by: Option<String>,
    direction: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let (changes, _) = broadcast::channel(CHANGE_FANOUT);

    let state = AppState {
        api: ApiContext { storage },
        changes,
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route(
            "/collections/:collection/documents",
            post(http_add_document).get(http_snapshot),
        )
        .route(
            "/collections/:collection/documents/:id",
            patch(http_update_document).delete(http_delete_document),
        )
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(e: ApiError) -> (StatusCode, Json<ApiError>) {
    (status_for(e.code), Json(e))
}

async fn http_add_document(
    State(state): State<Arc<AppState>>,
    Path(collection): Path<String>,
    Json(fields): Json<DocumentFields>,
) -> Result<Json<CreatedDocument>, (StatusCode, Json<ApiError>)> {
    let created = api::add_document(&state.api, &collection, fields)
        .await
        .map_err(reject)?;
    let _ = state.changes.send(collection);
    Ok(Json(created))
}

async fn http_update_document(
    State(state): State<Arc<AppState>>,
    Path((collection, id)): Path<(String, String)>,
    Json(patch): Json<DocumentPatch>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    api::update_document(&state.api, &collection, &TodoId(id), &patch)
        .await
        .map_err(reject)?;
    let _ = state.changes.send(collection);
    Ok(StatusCode::NO_CONTENT)
}

async fn http_delete_document(
    State(state): State<Arc<AppState>>,
    Path((collection, id)): Path<(String, String)>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    let removed = api::delete_document(&state.api, &collection, &TodoId(id))
        .await
        .map_err(reject)?;
    if removed {
        let _ = state.changes.send(collection);
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn http_snapshot(
    State(state): State<Arc<AppState>>,
    Path(collection): Path<String>,
    HttpQuery(q): HttpQuery<SnapshotQuery>,
) -> Result<Json<Vec<TodoItem>>, (StatusCode, Json<ApiError>)> {
    let query = api::parse_query(&collection, q.order_by.as_deref(), q.direction.as_deref())
        .map_err(reject)?;
    let items = api::snapshot(&state.api, &query).await.map_err(reject)?;
    Ok(Json(items))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    HttpQuery(q): HttpQuery<WsQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<ApiError>)> {
    let query = api::parse_query(&q.collection, q.order_by.as_deref(), q.direction.as_deref())
        .map_err(reject)?;
    Ok(ws.on_upgrade(move |socket| ws_connection(state, socket, query)))
}

async fn ws_connection(state: Arc<AppState>, socket: WebSocket, query: Query) {
    let (mut sender, mut receiver) = socket.split();
    // Subscribe before the initial snapshot so no change slips between them.
    let mut changes_rx = state.changes.subscribe();

    let send_task = tokio::spawn(async move {
        if push_snapshot(&state, &query, &mut sender).await.is_err() {
            return;
        }
        loop {
            match changes_rx.recv().await {
                Ok(collection) if collection == query.collection => {
                    if push_snapshot(&state, &query, &mut sender).await.is_err() {
                        break;
                    }
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Snapshots are full, so one resync covers everything missed.
                    warn!(skipped, collection = %query.collection, "subscriber lagged, resyncing");
                    if push_snapshot(&state, &query, &mut sender).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    while let Some(Ok(_msg)) = receiver.next().await {}

    send_task.abort();
}

/// Loads the current snapshot and pushes it to one subscriber. A storage
/// failure is forwarded as a terminal `Error` event, after which the
/// subscription is dead and the client has to resubscribe.
async fn push_snapshot(
    state: &Arc<AppState>,
    query: &Query,
    sender: &mut SplitSink<WebSocket, Message>,
) -> Result<(), ()> {
    let event = match api::snapshot(&state.api, query).await {
        Ok(items) => CollectionEvent::Snapshot {
            collection: query.collection.clone(),
            items,
        },
        Err(e) => {
            let text = serde_json::to_string(&CollectionEvent::Error(e)).map_err(|_| ())?;
            let _ = sender.send(Message::Text(text)).await;
            return Err(());
        }
    };
    let text = serde_json::to_string(&event).map_err(|_| ())?;
    sender.send(Message::Text(text)).await.map_err(|_| ())
}
