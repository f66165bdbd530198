//! SQLite flow store implementation.
//!
//! Implements `FlowStore` from `flowrun-core` using sqlx with split
//! read/write pools. Flow definitions and executions are stored as JSON
//! documents; each `save_all_*` replaces the table contents in a single
//! transaction.

use chrono::Utc;
use flowrun_core::repository::FlowStore;
use flowrun_types::error::RepositoryError;
use flowrun_types::execution::FlowExecution;
use flowrun_types::flow::FlowDefinition;
use sqlx::Row;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `FlowStore`.
pub struct SqliteFlowStore {
    pool: DatabasePool,
}

impl SqliteFlowStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Open the database at `database_url` and wrap it in a store.
    pub async fn connect(database_url: &str) -> Result<Self, RepositoryError> {
        let pool = DatabasePool::new(database_url)
            .await
            .map_err(|e| RepositoryError::Connection(e.to_string()))?;
        Ok(Self::new(pool))
    }
}

fn query_err(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

impl FlowStore for SqliteFlowStore {
    async fn load_all_flows(&self) -> Result<Vec<FlowDefinition>, RepositoryError> {
        let rows = sqlx::query("SELECT definition FROM flows ORDER BY position ASC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;

        rows.iter()
            .map(|row| {
                let json: String = row.try_get("definition").map_err(query_err)?;
                serde_json::from_str(&json)
                    .map_err(|e| RepositoryError::Serialization(format!("invalid flow definition JSON: {e}")))
            })
            .collect()
    }

    async fn save_all_flows(&self, flows: &[FlowDefinition]) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        sqlx::query("DELETE FROM flows")
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;

        let saved_at = Utc::now().to_rfc3339();
        for (position, flow) in flows.iter().enumerate() {
            let definition = serde_json::to_string(flow)?;
            sqlx::query(
                "INSERT INTO flows (flow_id, version, position, definition, saved_at)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&flow.id)
            .bind(&flow.version)
            .bind(position as i64)
            .bind(definition)
            .bind(&saved_at)
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;
        }

        tx.commit().await.map_err(query_err)?;
        tracing::debug!(count = flows.len(), "flows saved");
        Ok(())
    }

    async fn load_all_executions(&self) -> Result<Vec<FlowExecution>, RepositoryError> {
        let rows = sqlx::query("SELECT document FROM executions ORDER BY created_at ASC, id ASC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;

        rows.iter()
            .map(|row| {
                let json: String = row.try_get("document").map_err(query_err)?;
                serde_json::from_str(&json)
                    .map_err(|e| RepositoryError::Serialization(format!("invalid execution JSON: {e}")))
            })
            .collect()
    }

    async fn save_all_executions(&self, executions: &[FlowExecution]) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        sqlx::query("DELETE FROM executions")
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;

        for exec in executions {
            let document = serde_json::to_string(exec)?;
            sqlx::query(
                "INSERT INTO executions (id, flow_id, status, created_at, document)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(exec.id.to_string())
            .bind(&exec.flow_id)
            .bind(exec.status.to_string())
            .bind(exec.created_at.to_rfc3339())
            .bind(document)
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;
        }

        tx.commit().await.map_err(query_err)?;
        tracing::debug!(count = executions.len(), "executions saved");
        Ok(())
    }
}
