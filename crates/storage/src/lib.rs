use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use uuid::Uuid;

use shared::{
    domain::{TodoId, TodoItem},
    protocol::{CreatedDocument, DocumentFields, DocumentPatch, SortDirection},
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Inserts a document with a fresh UUID id. A missing `created_at`
    /// gets the server clock, so a skewed client clock cannot reorder
    /// the collection unless the client explicitly supplies a stamp.
    pub async fn insert_document(
        &self,
        collection: &str,
        fields: &DocumentFields,
    ) -> Result<CreatedDocument> {
        let id = TodoId(Uuid::new_v4().to_string());
        let created_at = fields.created_at.unwrap_or_else(Utc::now);
        sqlx::query(
            "INSERT INTO documents (collection, id, text, completed, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(collection)
        .bind(id.as_str())
        .bind(&fields.text)
        .bind(fields.completed)
        .bind(created_at)
        .execute(&self.pool)
        .await?;
        Ok(CreatedDocument { id, created_at })
    }

    /// Partial update; untouched fields keep their stored value.
    /// Returns whether a row actually changed.
    pub async fn update_document(
        &self,
        collection: &str,
        id: &TodoId,
        patch: &DocumentPatch,
    ) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE documents
             SET text = COALESCE(?, text), completed = COALESCE(?, completed)
             WHERE collection = ? AND id = ?",
        )
        .bind(patch.text.as_deref())
        .bind(patch.completed)
        .bind(collection)
        .bind(id.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    /// Returns whether a row was removed; deleting an unknown id is not
    /// an error.
    pub async fn delete_document(&self, collection: &str, id: &TodoId) -> Result<bool> {
        let removed = sqlx::query("DELETE FROM documents WHERE collection = ? AND id = ?")
            .bind(collection)
            .bind(id.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed > 0)
    }

    /// Full snapshot of one collection, ordered by creation time with
    /// ids breaking timestamp ties.
    pub async fn list_documents(
        &self,
        collection: &str,
        direction: SortDirection,
    ) -> Result<Vec<TodoItem>> {
        let order = match direction {
            SortDirection::Desc => "ORDER BY created_at DESC, id DESC",
            SortDirection::Asc => "ORDER BY created_at ASC, id ASC",
        };
        let rows = sqlx::query(&format!(
            "SELECT id, text, completed, created_at FROM documents WHERE collection = ? {order}"
        ))
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| TodoItem {
                id: TodoId(r.get::<String, _>(0)),
                text: r.get::<String, _>(1),
                completed: r.get::<bool, _>(2),
                created_at: r.get::<DateTime<Utc>, _>(3),
            })
            .collect())
    }
}

/// Creates the parent directory of a file-backed sqlite url. Non-sqlite
/// and in-memory urls pass through untouched.
pub fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
