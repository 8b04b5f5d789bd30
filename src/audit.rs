//! Audit trail of raw insertion requests.
//!
//! Narrow interface: the enqueue handler records what was asked of us,
//! keyed by req_id, so queued work can be traced back to its original
//! payload. Backed by Postgres when DATABASE_URL is configured;
//! otherwise rows go to the log only (local development).

use crate::errors::{AppError, Result};
use crate::types::Message;
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

/// Capability surface of the audit store.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Persist one raw insertion request.
    async fn record_insertion(
        &self,
        req_id: &Uuid,
        user_id: &str,
        messages: &[Message],
    ) -> Result<()>;
}

/// Postgres-backed [`AuditStore`].
pub struct PostgresAuditStore {
    pool: PgPool,
}

impl PostgresAuditStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|e| AppError::Transport(format!("postgres: {e}")))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS memory_requests (
                req_id UUID PRIMARY KEY,
                user_id TEXT NOT NULL,
                payload JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| AppError::Transport(format!("postgres migrate: {e}")))?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl AuditStore for PostgresAuditStore {
    async fn record_insertion(
        &self,
        req_id: &Uuid,
        user_id: &str,
        messages: &[Message],
    ) -> Result<()> {
        let payload = serde_json::to_value(messages)?;
        sqlx::query(
            "INSERT INTO memory_requests (req_id, user_id, payload)
             VALUES ($1, $2, $3)
             ON CONFLICT (req_id) DO NOTHING",
        )
        .bind(req_id)
        .bind(user_id)
        .bind(payload)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Transport(format!("postgres insert: {e}")))?;
        Ok(())
    }
}

/// Log-only [`AuditStore`] used when no database is configured.
pub struct LogAuditStore;

#[async_trait]
impl AuditStore for LogAuditStore {
    async fn record_insertion(
        &self,
        req_id: &Uuid,
        user_id: &str,
        messages: &[Message],
    ) -> Result<()> {
        info!(%req_id, user_id, turns = messages.len(), "insertion request (audit store disabled)");
        Ok(())
    }
}
