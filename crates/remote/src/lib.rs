use async_trait::async_trait;
use collection::{CollectionStore, StoreError, Subscription};
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use shared::{
    domain::TodoId,
    error::{ApiError, ErrorCode},
    protocol::{
        CollectionEvent, CreatedDocument, DocumentFields, DocumentPatch, Query, SortDirection,
    },
};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::warn;
use url::Url;

const EVENT_BUFFER: usize = 16;

/// [`CollectionStore`] backed by the hosted document service: writes go
/// over HTTP, live queries over a websocket that pushes full snapshots.
///
/// A broken listener delivers exactly one terminal error event and is
/// never retried here; reconnecting is the caller's decision.
pub struct RemoteCollection {
    http: Client,
    server_url: String,
}

impl RemoteCollection {
    /// `server_url` is the HTTP base of the service, e.g.
    /// `http://127.0.0.1:8080`.
    pub fn new(server_url: impl Into<String>) -> Self {
        let server_url = server_url.into().trim_end_matches('/').to_string();
        Self {
            http: Client::new(),
            server_url,
        }
    }

    fn documents_url(&self, collection: &str) -> String {
        format!("{}/collections/{collection}/documents", self.server_url)
    }

    fn document_url(&self, collection: &str, id: &TodoId) -> String {
        format!("{}/{id}", self.documents_url(collection))
    }

    fn ws_url(&self, query: &Query) -> Result<Url, StoreError> {
        let ws_base = if let Some(rest) = self.server_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.server_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(StoreError::InvalidQuery(format!(
                "server url '{}' must start with http:// or https://",
                self.server_url
            )));
        };

        let mut url = Url::parse(&format!("{ws_base}/ws"))
            .map_err(|e| StoreError::InvalidQuery(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("collection", &query.collection)
            .append_pair("order_by", "created_at")
            .append_pair(
                "direction",
                match query.direction {
                    SortDirection::Asc => "asc",
                    SortDirection::Desc => "desc",
                },
            );
        Ok(url)
    }
}

fn transport(err: reqwest::Error) -> StoreError {
    StoreError::Network(err.to_string())
}

/// Maps a non-success response to a [`StoreError`], preferring the
/// structured error body when the service sent one.
async fn fail_from(response: reqwest::Response) -> StoreError {
    let status = response.status();
    if let Ok(api_error) = response.json::<ApiError>().await {
        return StoreError::from(api_error);
    }
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            StoreError::PermissionDenied(format!("service returned {status}"))
        }
        StatusCode::NOT_FOUND => StoreError::NotFound(format!("service returned {status}")),
        StatusCode::BAD_REQUEST => StoreError::InvalidQuery(format!("service returned {status}")),
        _ => StoreError::Network(format!("service returned {status}")),
    }
}

#[async_trait]
impl CollectionStore for RemoteCollection {
    async fn add_document(
        &self,
        collection: &str,
        fields: DocumentFields,
    ) -> Result<CreatedDocument, StoreError> {
        let response = self
            .http
            .post(self.documents_url(collection))
            .json(&fields)
            .send()
            .await
            .map_err(transport)?;
        if !response.status().is_success() {
            return Err(fail_from(response).await);
        }
        response.json::<CreatedDocument>().await.map_err(transport)
    }

    async fn update_document(
        &self,
        collection: &str,
        id: &TodoId,
        patch: DocumentPatch,
    ) -> Result<(), StoreError> {
        let response = self
            .http
            .patch(self.document_url(collection, id))
            .json(&patch)
            .send()
            .await
            .map_err(transport)?;
        if !response.status().is_success() {
            return Err(fail_from(response).await);
        }
        Ok(())
    }

    async fn delete_document(&self, collection: &str, id: &TodoId) -> Result<(), StoreError> {
        let response = self
            .http
            .delete(self.document_url(collection, id))
            .send()
            .await
            .map_err(transport)?;
        if !response.status().is_success() {
            return Err(fail_from(response).await);
        }
        Ok(())
    }

    async fn subscribe(&self, query: Query) -> Result<Subscription, StoreError> {
        let ws_url = self.ws_url(&query)?;
        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| StoreError::Network(format!("failed to connect listener: {e}")))?;
        let (_, mut ws_reader) = ws_stream.split();

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let pump = tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        let event = match serde_json::from_str::<CollectionEvent>(&text) {
                            Ok(event) => event,
                            Err(err) => {
                                warn!(%err, "discarding undecodable listener frame");
                                let _ = tx
                                    .send(CollectionEvent::Error(ApiError::new(
                                        ErrorCode::Internal,
                                        format!("undecodable listener frame: {err}"),
                                    )))
                                    .await;
                                return;
                            }
                        };
                        let terminal = matches!(event, CollectionEvent::Error(_));
                        if tx.send(event).await.is_err() || terminal {
                            return;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        let _ = tx
                            .send(CollectionEvent::Error(ApiError::new(
                                ErrorCode::Unavailable,
                                format!("listener transport failed: {err}"),
                            )))
                            .await;
                        return;
                    }
                }
            }
            // Server went away without an error frame; the subscription
            // is still dead, so tell the consumer.
            let _ = tx
                .send(CollectionEvent::Error(ApiError::new(
                    ErrorCode::Unavailable,
                    "listener closed by server",
                )))
                .await;
        });

        Ok(Subscription::new(rx, pump))
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
