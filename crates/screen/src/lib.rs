use std::sync::Arc;

use collection::{CollectionStore, StoreError, Subscription};
use shared::{
    domain::{TodoId, TodoItem},
    protocol::{CollectionEvent, DocumentFields, DocumentPatch, Query},
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};

const SCREEN_EVENT_FANOUT: usize = 64;

/// Lifecycle of one mounted screen. `Failed` is terminal; recovery is
/// a fresh mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScreenPhase {
    Loading,
    Ready,
    Failed(String),
}

/// What the UI renders. Items are a cache of the latest pushed
/// snapshot, replaced wholesale on every update.
#[derive(Debug, Clone)]
pub struct ViewState {
    pub phase: ScreenPhase,
    pub items: Vec<TodoItem>,
    pub input: String,
    pub notice: Option<String>,
    pub pending_delete: Option<TodoId>,
}

impl ViewState {
    fn new() -> Self {
        Self {
            phase: ScreenPhase::Loading,
            items: Vec::new(),
            input: String::new(),
            notice: None,
            pending_delete: None,
        }
    }

    pub fn loading(&self) -> bool {
        self.phase == ScreenPhase::Loading
    }
}

#[derive(Debug, Clone)]
pub enum ScreenEvent {
    Updated,
    WriteFailed(String),
    SubscriptionFailed(String),
}

#[derive(Debug, Error)]
pub enum CommandError {
    /// Caught before any remote call is attempted.
    #[error("todo text cannot be empty")]
    EmptyText,
    #[error("remote write failed: {0}")]
    RemoteWrite(#[from] StoreError),
    #[error("no delete awaiting confirmation")]
    NoPendingDelete,
}

/// Projects a pushed snapshot into render order: newest first, ids
/// breaking timestamp ties. Recomputed in full on every snapshot.
pub fn project(mut items: Vec<TodoItem>) -> Vec<TodoItem> {
    items.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.id.cmp(&a.id))
    });
    items
}

/// A live todo list over an injected [`CollectionStore`]. Holds exactly
/// one open subscription; commands go to the store and the view waits
/// for the resulting pushed snapshot instead of mutating locally.
pub struct TodoListScreen {
    store: Arc<dyn CollectionStore>,
    collection: String,
    state: Arc<Mutex<ViewState>>,
    events: broadcast::Sender<ScreenEvent>,
    snapshot_task: Mutex<Option<JoinHandle<()>>>,
}

impl TodoListScreen {
    /// Opens the live query and starts applying snapshots. The screen
    /// stays in `Loading` until the first event arrives.
    pub async fn mount(
        store: Arc<dyn CollectionStore>,
        collection: impl Into<String>,
    ) -> Result<Arc<Self>, StoreError> {
        let collection = collection.into();
        let subscription = store.subscribe(Query::created_at_desc(&collection)).await?;
        let state = Arc::new(Mutex::new(ViewState::new()));
        let (events, _) = broadcast::channel(SCREEN_EVENT_FANOUT);

        let task = tokio::spawn(Self::apply_snapshots(
            subscription,
            Arc::clone(&state),
            events.clone(),
        ));

        Ok(Arc::new(Self {
            store,
            collection,
            state,
            events,
            snapshot_task: Mutex::new(Some(task)),
        }))
    }

    async fn apply_snapshots(
        mut subscription: Subscription,
        state: Arc<Mutex<ViewState>>,
        events: broadcast::Sender<ScreenEvent>,
    ) {
        while let Some(event) = subscription.next_event().await {
            match event {
                CollectionEvent::Snapshot { items, .. } => {
                    {
                        let mut guard = state.lock().await;
                        guard.items = project(items);
                        guard.phase = ScreenPhase::Ready;
                    }
                    let _ = events.send(ScreenEvent::Updated);
                }
                CollectionEvent::Error(err) => {
                    warn!(code = ?err.code, message = %err.message, "subscription failed");
                    {
                        let mut guard = state.lock().await;
                        guard.phase = ScreenPhase::Failed(err.message.clone());
                    }
                    let _ = events.send(ScreenEvent::SubscriptionFailed(err.message));
                    // Terminal: stop consuming; remount to recover.
                    break;
                }
            }
        }
    }

    pub async fn state(&self) -> ViewState {
        self.state.lock().await.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ScreenEvent> {
        self.events.subscribe()
    }

    pub async fn set_input(&self, text: impl Into<String>) {
        self.state.lock().await.input = text.into();
    }

    /// Creates a todo from the current input. Whitespace-only input is
    /// rejected locally without touching the store or the input field;
    /// the input is cleared only after the remote write succeeds.
    pub async fn submit(&self) -> Result<(), CommandError> {
        let trimmed = {
            let guard = self.state.lock().await;
            guard.input.trim().to_string()
        };
        if trimmed.is_empty() {
            self.state.lock().await.notice = Some("Please enter a todo item".to_string());
            return Err(CommandError::EmptyText);
        }

        let fields = DocumentFields {
            text: trimmed,
            completed: false,
            // None: the service assigns the timestamp, so sort order
            // does not depend on this device's clock.
            created_at: None,
        };
        match self.store.add_document(&self.collection, fields).await {
            Ok(created) => {
                info!(id = %created.id, "todo created");
                let mut guard = self.state.lock().await;
                guard.input.clear();
                guard.notice = None;
                Ok(())
            }
            Err(err) => Err(self.surface_write_failure("Failed to add todo", err).await),
        }
    }

    /// Flips `completed` via a partial update. Applying it twice with
    /// no intervening external change restores the original value.
    pub async fn toggle(
        &self,
        id: &TodoId,
        currently_completed: bool,
    ) -> Result<(), CommandError> {
        let patch = DocumentPatch::completed(!currently_completed);
        match self.store.update_document(&self.collection, id, patch).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.surface_write_failure("Failed to update todo", err).await),
        }
    }

    /// Marks an item for deletion; nothing is sent until
    /// [`confirm_delete`](Self::confirm_delete).
    pub async fn request_delete(&self, id: TodoId) {
        let mut guard = self.state.lock().await;
        guard.pending_delete = Some(id);
    }

    /// Aborts a pending delete with no remote call.
    pub async fn cancel_delete(&self) {
        let mut guard = self.state.lock().await;
        guard.pending_delete = None;
    }

    /// Dispatches the pending delete. An id that vanished in the
    /// meantime is a no-op success at the service.
    pub async fn confirm_delete(&self) -> Result<(), CommandError> {
        let Some(id) = self.state.lock().await.pending_delete.take() else {
            return Err(CommandError::NoPendingDelete);
        };
        match self.store.delete_document(&self.collection, &id).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.surface_write_failure("Failed to delete todo", err).await),
        }
    }

    pub async fn dismiss_notice(&self) {
        self.state.lock().await.notice = None;
    }

    /// Releases the subscription. Idempotent; in-flight command calls
    /// are not cancelled, their results are simply not observed.
    pub async fn unmount(&self) {
        if let Some(task) = self.snapshot_task.lock().await.take() {
            task.abort();
        }
    }

    async fn surface_write_failure(&self, notice: &str, err: StoreError) -> CommandError {
        warn!(%err, "remote write failed");
        self.state.lock().await.notice = Some(notice.to_string());
        let _ = self.events.send(ScreenEvent::WriteFailed(err.to_string()));
        CommandError::RemoteWrite(err)
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
