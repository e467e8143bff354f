use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::{TodoId, TodoItem},
    protocol::{
        CollectionEvent, CreatedDocument, DocumentFields, DocumentPatch, Query, SortDirection,
    },
};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::debug;
use uuid::Uuid;

use crate::{CollectionStore, StoreError, Subscription};

const EVENT_BUFFER: usize = 16;
const CHANGE_FANOUT: usize = 256;

#[derive(Debug, Clone)]
struct StoredDocument {
    text: String,
    completed: bool,
    created_at: chrono::DateTime<Utc>,
}

/// In-process collection backend. Serves as the injectable fake for
/// screen tests and as a standalone offline store; the remote service
/// satisfies the same contract.
pub struct MemoryCollection {
    documents: Arc<Mutex<HashMap<String, HashMap<TodoId, StoredDocument>>>>,
    changes: broadcast::Sender<String>,
    cached_first: bool,
}

impl MemoryCollection {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FANOUT);
        Self {
            documents: Arc::new(Mutex::new(HashMap::new())),
            changes,
            cached_first: false,
        }
    }

    /// Emits the initial snapshot twice per subscription: once as a
    /// provisional cache replay, then again as the authoritative state.
    /// Mirrors a remote service that answers from its local cache
    /// before the backend confirms.
    pub fn with_cached_first(mut self, cached_first: bool) -> Self {
        self.cached_first = cached_first;
        self
    }

    fn snapshot(
        docs: &HashMap<String, HashMap<TodoId, StoredDocument>>,
        query: &Query,
    ) -> Vec<TodoItem> {
        let mut items: Vec<TodoItem> = docs
            .get(&query.collection)
            .map(|collection| {
                collection
                    .iter()
                    .map(|(id, doc)| TodoItem {
                        id: id.clone(),
                        text: doc.text.clone(),
                        completed: doc.completed,
                        created_at: doc.created_at,
                    })
                    .collect()
            })
            .unwrap_or_default();

        // Full re-sort on every snapshot; ids break timestamp ties so
        // the order is deterministic.
        items.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        if query.direction == SortDirection::Asc {
            items.reverse();
        }
        items
    }
}

impl Default for MemoryCollection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CollectionStore for MemoryCollection {
    async fn add_document(
        &self,
        collection: &str,
        fields: DocumentFields,
    ) -> Result<CreatedDocument, StoreError> {
        let id = TodoId(Uuid::new_v4().to_string());
        let created_at = fields.created_at.unwrap_or_else(Utc::now);
        {
            let mut docs = self.documents.lock().await;
            docs.entry(collection.to_string()).or_default().insert(
                id.clone(),
                StoredDocument {
                    text: fields.text,
                    completed: fields.completed,
                    created_at,
                },
            );
        }
        debug!(%collection, %id, "document added");
        let _ = self.changes.send(collection.to_string());
        Ok(CreatedDocument { id, created_at })
    }

    async fn update_document(
        &self,
        collection: &str,
        id: &TodoId,
        patch: DocumentPatch,
    ) -> Result<(), StoreError> {
        if patch.is_empty() {
            return Ok(());
        }
        {
            let mut docs = self.documents.lock().await;
            let doc = docs
                .get_mut(collection)
                .and_then(|c| c.get_mut(id))
                .ok_or_else(|| StoreError::NotFound(format!("document {id}")))?;
            if let Some(text) = patch.text {
                doc.text = text;
            }
            if let Some(completed) = patch.completed {
                doc.completed = completed;
            }
        }
        let _ = self.changes.send(collection.to_string());
        Ok(())
    }

    async fn delete_document(&self, collection: &str, id: &TodoId) -> Result<(), StoreError> {
        let removed = {
            let mut docs = self.documents.lock().await;
            docs.get_mut(collection)
                .and_then(|c| c.remove(id))
                .is_some()
        };
        // Deleting an id that was already gone stays silent.
        if removed {
            let _ = self.changes.send(collection.to_string());
        }
        Ok(())
    }

    async fn subscribe(&self, query: Query) -> Result<Subscription, StoreError> {
        if query.collection.trim().is_empty() {
            return Err(StoreError::InvalidQuery(
                "collection path cannot be empty".to_string(),
            ));
        }

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let documents = Arc::clone(&self.documents);
        let mut changes = self.changes.subscribe();
        let cached_first = self.cached_first;

        let pump = tokio::spawn(async move {
            let initial = {
                let docs = documents.lock().await;
                MemoryCollection::snapshot(&docs, &query)
            };
            if cached_first {
                // Provisional cache replay; the authoritative snapshot
                // follows immediately with the same logical state.
                if tx
                    .send(CollectionEvent::Snapshot {
                        collection: query.collection.clone(),
                        items: initial.clone(),
                    })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            if tx
                .send(CollectionEvent::Snapshot {
                    collection: query.collection.clone(),
                    items: initial,
                })
                .await
                .is_err()
            {
                return;
            }

            loop {
                tokio::select! {
                    changed = changes.recv() => {
                        match changed {
                            Ok(name) if name != query.collection => continue,
                            // Lagged receivers resync with a fresh
                            // snapshot instead of dropping out.
                            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                        let items = {
                            let docs = documents.lock().await;
                            MemoryCollection::snapshot(&docs, &query)
                        };
                        if tx
                            .send(CollectionEvent::Snapshot {
                                collection: query.collection.clone(),
                                items,
                            })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    _ = tx.closed() => break,
                }
            }
        });

        Ok(Subscription::new(rx, pump))
    }

    fn cached_first_snapshot(&self) -> bool {
        self.cached_first
    }
}
