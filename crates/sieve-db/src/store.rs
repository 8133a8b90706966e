use chrono::{DateTime, Utc};
use serde_json::Value;
use sieve_core::error::AppError;
use sieve_core::traits::DocumentStore;
use sqlx::SqlitePool;
use sqlx::types::Json;

/// JSON document store in a single SQLite table.
///
/// Documents are keyed by `(collection, id)`; `put` replaces in place and
/// keeps the original `created_at`. Through the blanket impl this is also a
/// [`Storage`](sieve_core::traits::Storage).
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Number of documents in `collection`.
    pub async fn count(&self, collection: &str) -> Result<i64, AppError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM documents WHERE collection = ?")
            .bind(collection)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        Ok(row.0)
    }

    /// When the document was last written.
    pub async fn updated_at(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Option<DateTime<Utc>>, AppError> {
        let row: Option<(DateTime<Utc>,)> =
            sqlx::query_as("SELECT updated_at FROM documents WHERE collection = ? AND id = ?")
                .bind(collection)
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        Ok(row.map(|r| r.0))
    }
}

impl DocumentStore for SqliteStore {
    async fn put(&self, collection: &str, id: &str, document: &Value) -> Result<(), AppError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO documents (collection, id, body, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (collection, id)
            DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at
            "#,
        )
        .bind(collection)
        .bind(id)
        .bind(Json(document))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        tracing::trace!(%collection, %id, "Stored document");
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, AppError> {
        let row: Option<(Json<Value>,)> =
            sqlx::query_as("SELECT body FROM documents WHERE collection = ? AND id = ?")
                .bind(collection)
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        Ok(row.map(|(Json(body),)| body))
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM documents WHERE collection = ? AND id = ?")
            .bind(collection)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, collection: &str) -> Result<Vec<Value>, AppError> {
        let rows: Vec<(Json<Value>,)> =
            sqlx::query_as("SELECT body FROM documents WHERE collection = ? ORDER BY id")
                .bind(collection)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        Ok(rows.into_iter().map(|(Json(body),)| body).collect())
    }
}
