use shared::{
    domain::{TodoId, TodoItem},
    error::{ApiError, ErrorCode},
    protocol::{CreatedDocument, DocumentFields, DocumentPatch, Query, SortDirection, SortField},
};
use storage::Storage;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
}

/// Stores a new document. Text is trimmed server-side so clients cannot
/// persist padded duplicates; a missing `created_at` gets the server clock
/// inside storage.
pub async fn add_document(
    ctx: &ApiContext,
    collection: &str,
    mut fields: DocumentFields,
) -> Result<CreatedDocument, ApiError> {
    validate_collection(collection)?;
    let trimmed = fields.text.trim();
    if trimmed.is_empty() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "todo text cannot be empty",
        ));
    }
    fields.text = trimmed.to_string();
    ctx.storage
        .insert_document(collection, &fields)
        .await
        .map_err(internal)
}

pub async fn update_document(
    ctx: &ApiContext,
    collection: &str,
    id: &TodoId,
    patch: &DocumentPatch,
) -> Result<(), ApiError> {
    validate_collection(collection)?;
    if let Some(text) = patch.text.as_deref() {
        if text.trim().is_empty() {
            return Err(ApiError::new(
                ErrorCode::Validation,
                "todo text cannot be empty",
            ));
        }
    }
    if patch.is_empty() {
        return Ok(());
    }

    let changed = ctx
        .storage
        .update_document(collection, id, patch)
        .await
        .map_err(internal)?;
    if changed {
        Ok(())
    } else {
        Err(ApiError::new(
            ErrorCode::NotFound,
            format!("document '{id}' not found"),
        ))
    }
}

/// Returns whether a row was actually removed. Deleting an unknown id
/// succeeds, matching the idempotent contract of the write API.
pub async fn delete_document(
    ctx: &ApiContext,
    collection: &str,
    id: &TodoId,
) -> Result<bool, ApiError> {
    validate_collection(collection)?;
    ctx.storage
        .delete_document(collection, id)
        .await
        .map_err(internal)
}

pub async fn snapshot(ctx: &ApiContext, query: &Query) -> Result<Vec<TodoItem>, ApiError> {
    validate_collection(&query.collection)?;
    ctx.storage
        .list_documents(&query.collection, query.direction)
        .await
        .map_err(internal)
}

/// Parses the wire form of a query (`?order_by=created_at&direction=desc`)
/// used by both the snapshot route and the websocket upgrade.
pub fn parse_query(
    collection: &str,
    order_by: Option<&str>,
    direction: Option<&str>,
) -> Result<Query, ApiError> {
    validate_collection(collection)?;

    let order_by = match order_by {
        None | Some("created_at") => SortField::CreatedAt,
        Some(other) => {
            return Err(ApiError::new(
                ErrorCode::Validation,
                format!("unsupported order_by field '{other}'"),
            ))
        }
    };

    let direction = match direction {
        None | Some("desc") => SortDirection::Desc,
        Some("asc") => SortDirection::Asc,
        Some(other) => {
            return Err(ApiError::new(
                ErrorCode::Validation,
                format!("unsupported direction '{other}'"),
            ))
        }
    };

    Ok(Query {
        collection: collection.to_string(),
        order_by,
        direction,
    })
}

fn validate_collection(collection: &str) -> Result<(), ApiError> {
    if collection.trim().is_empty() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "collection path cannot be empty",
        ));
    }
    Ok(())
}

fn internal(error: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, error.to_string())
}
