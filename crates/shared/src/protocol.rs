use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{TodoId, TodoItem},
    error::ApiError,
};

/// Fields of a document to create. `created_at = None` asks the service
/// to assign its own timestamp; `Some` carries client wall-clock time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentFields {
    pub text: String,
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Partial update. Absent fields are left untouched by the service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
}

impl DocumentPatch {
    pub fn completed(completed: bool) -> Self {
        Self {
            text: None,
            completed: Some(completed),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_none() && self.completed.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedDocument {
    pub id: TodoId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    CreatedAt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Asc,
    Desc,
}

/// A live query: one collection, one order-by clause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub collection: String,
    pub order_by: SortField,
    pub direction: SortDirection,
}

impl Query {
    /// The query every todo screen opens: newest first.
    pub fn created_at_desc(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            order_by: SortField::CreatedAt,
            direction: SortDirection::Desc,
        }
    }
}

/// Pushed subscription payload: always a full snapshot, never a delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum CollectionEvent {
    Snapshot {
        collection: String,
        items: Vec<TodoItem>,
    },
    Error(ApiError),
}
