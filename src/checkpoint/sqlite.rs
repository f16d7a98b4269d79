//! SQLite 检查点（sqlx，完全异步）：thread_id 为主键的 upsert，重启后可恢复

use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use super::Checkpointer;
use crate::core::{CheckpointError, ConversationState};

impl From<sqlx::Error> for CheckpointError {
    fn from(e: sqlx::Error) -> Self {
        CheckpointError::Database(e.to_string())
    }
}

pub struct SqliteCheckpointer {
    pool: SqlitePool,
}

impl SqliteCheckpointer {
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;
        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    async fn init_tables(&self) -> Result<(), CheckpointError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS conversation_checkpoints (
                thread_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                state TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Checkpointer for SqliteCheckpointer {
    async fn save(&self, state: &ConversationState) -> Result<(), CheckpointError> {
        let json = serde_json::to_string(state)?;
        let status = serde_json::to_value(state.status)?
            .as_str()
            .unwrap_or_default()
            .to_string();
        sqlx::query(
            "INSERT INTO conversation_checkpoints (thread_id, status, state, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(thread_id) DO UPDATE SET
                status = excluded.status, state = excluded.state, updated_at = excluded.updated_at",
        )
        .bind(&state.thread_id)
        .bind(status)
        .bind(json)
        .bind(state.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load(&self, thread_id: &str) -> Result<Option<ConversationState>, CheckpointError> {
        let row = sqlx::query("SELECT state FROM conversation_checkpoints WHERE thread_id = ?")
            .bind(thread_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let json: String = row.get("state");
                Ok(Some(serde_json::from_str(&json)?))
            }
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<String>, CheckpointError> {
        let rows = sqlx::query("SELECT thread_id FROM conversation_checkpoints ORDER BY thread_id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|row| row.get("thread_id")).collect())
    }

    async fn delete(&self, thread_id: &str) -> Result<bool, CheckpointError> {
        let result = sqlx::query("DELETE FROM conversation_checkpoints WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
