use async_trait::async_trait;
use shared::{
    domain::TodoId,
    error::{ApiError, ErrorCode},
    protocol::{CollectionEvent, CreatedDocument, DocumentFields, DocumentPatch, Query},
};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};

mod memory;

pub use memory::MemoryCollection;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("network failure: {0}")]
    Network(String),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<ApiError> for StoreError {
    fn from(err: ApiError) -> Self {
        match err.code {
            ErrorCode::Unauthorized | ErrorCode::Forbidden => {
                StoreError::PermissionDenied(err.message)
            }
            ErrorCode::NotFound => StoreError::NotFound(err.message),
            ErrorCode::Validation => StoreError::InvalidQuery(err.message),
            ErrorCode::Unavailable => StoreError::Network(err.message),
            ErrorCode::Internal => StoreError::Internal(anyhow::anyhow!(err.message)),
        }
    }
}

/// One open live query. Events arrive on a single-consumer channel:
/// each one is either the complete current snapshot or a terminal
/// subscription error. Dropping the handle aborts the pump task, so
/// the underlying listener is released exactly once.
#[derive(Debug)]
pub struct Subscription {
    events: mpsc::Receiver<CollectionEvent>,
    pump: JoinHandle<()>,
}

impl Subscription {
    pub fn new(events: mpsc::Receiver<CollectionEvent>, pump: JoinHandle<()>) -> Self {
        Self { events, pump }
    }

    /// Awaits the next snapshot or error. `None` means the producer
    /// side shut down without an error event.
    pub async fn next_event(&mut self) -> Option<CollectionEvent> {
        self.events.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// The hosted document-collection contract the screen is written
/// against. Implementations: [`MemoryCollection`] (in-process, also the
/// test fake) and `remote::RemoteCollection` (HTTP + WebSocket).
#[async_trait]
pub trait CollectionStore: Send + Sync {
    /// Creates a document and returns its service-assigned id.
    async fn add_document(
        &self,
        collection: &str,
        fields: DocumentFields,
    ) -> Result<CreatedDocument, StoreError>;

    /// Applies a partial update. Absent patch fields are untouched.
    async fn update_document(
        &self,
        collection: &str,
        id: &TodoId,
        patch: DocumentPatch,
    ) -> Result<(), StoreError>;

    /// Removes a document. Deleting an id that no longer exists is a
    /// no-op success.
    async fn delete_document(&self, collection: &str, id: &TodoId) -> Result<(), StoreError>;

    /// Opens a live query. Every change to the collection is delivered
    /// as a fresh full snapshot, in increasing freshness order.
    async fn subscribe(&self, query: Query) -> Result<Subscription, StoreError>;

    /// Whether the first event after subscribing may be a provisional
    /// cache replay, followed by an authoritative snapshot of the same
    /// logical state. Callers must tolerate the duplicate.
    fn cached_first_snapshot(&self) -> bool {
        false
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
