//! Redis adapter: the authoritative store for core memories and for
//! request-idempotency records.
//!
//! A user's core-memory list is one JSON blob under the `user_id` key,
//! never expired. Request status lives in a small hash under the
//! `req_id` key with a 24h TTL. The core-list read-modify-write is not
//! transactional; writers are serialized per user by the worker pool
//! under typical load, so a lost update is accepted (see DESIGN.md).

use crate::errors::{AppError, Result};
use crate::types::{MemoryRecord, ReqStatus, RequestStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{aio::ConnectionManager, AsyncCommands};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// TTL for request-idempotency records.
const REQ_TTL_SECS: i64 = 24 * 60 * 60;

/// Capability surface of the identity cache.
#[async_trait]
pub trait IdentityCache: Send + Sync {
    /// The user's core-memory snapshot. Returns
    /// [`AppError::NotFound`] when the user has no entry at all, which
    /// lets callers tell a new user apart from a transport error.
    async fn get(&self, user_id: &str) -> Result<Vec<MemoryRecord>>;

    /// Overwrite the snapshot.
    async fn set(&self, user_id: &str, records: &[MemoryRecord]) -> Result<()>;

    /// Read-modify-write removal of the given ids from the snapshot.
    async fn delete(&self, ids: &[Uuid], user_id: &str) -> Result<()>;

    /// Mint a new user with an empty core list.
    async fn create_user(&self) -> Result<String>;

    /// Initialize an idempotency record. Returns
    /// [`AppError::Duplicate`] if the request already exists in any
    /// state other than Failure; a failed request may be retried.
    async fn create_req(&self, req_id: &Uuid) -> Result<()>;

    /// Update the status (and error text) of a request record.
    async fn change_req_status(&self, req_id: &Uuid, error: &str, status: ReqStatus) -> Result<()>;

    /// Read a request record back; [`AppError::NotFound`] when absent
    /// or expired.
    async fn get_req_status(&self, req_id: &Uuid) -> Result<RequestStatus>;
}

/// Production [`IdentityCache`] over a pooled Redis connection.
#[derive(Clone)]
pub struct RedisIdentityCache {
    conn: ConnectionManager,
}

impl RedisIdentityCache {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| AppError::BadRequest(format!("redis url: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| AppError::Transport(format!("redis: {e}")))?;
        Ok(Self { conn })
    }
}

fn transport(op: &str, err: redis::RedisError) -> AppError {
    AppError::Transport(format!("redis {op}: {err}"))
}

#[async_trait]
impl IdentityCache for RedisIdentityCache {
    async fn get(&self, user_id: &str) -> Result<Vec<MemoryRecord>> {
        let mut conn = self.conn.clone();
        let raw: Option<Vec<u8>> = conn.get(user_id).await.map_err(|e| transport("get", e))?;

        let Some(raw) = raw else {
            debug!(user_id, "no core-memory entry for user");
            return Err(AppError::NotFound(format!("user {user_id}")));
        };

        let records: Vec<MemoryRecord> = serde_json::from_slice(&raw)?;
        Ok(records)
    }

    async fn set(&self, user_id: &str, records: &[MemoryRecord]) -> Result<()> {
        let mut conn = self.conn.clone();
        let blob = serde_json::to_vec(records)?;
        conn.set::<_, _, ()>(user_id, blob)
            .await
            .map_err(|e| transport("set", e))?;
        debug!(user_id, count = records.len(), "core snapshot written");
        Ok(())
    }

    async fn delete(&self, ids: &[Uuid], user_id: &str) -> Result<()> {
        let current = self.get(user_id).await?;

        let retained: Vec<MemoryRecord> = current
            .iter()
            .filter(|record| !ids.contains(&record.id))
            .cloned()
            .collect();

        if retained.len() == current.len() {
            warn!(user_id, "none of the given core-memory ids exist for this user");
        }

        self.set(user_id, &retained).await
    }

    async fn create_user(&self) -> Result<String> {
        let user_id = Uuid::new_v4().to_string();
        self.set(&user_id, &[]).await?;
        info!(%user_id, "user created");
        Ok(user_id)
    }

    async fn create_req(&self, req_id: &Uuid) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = req_id.to_string();

        let is_new: bool = conn
            .hset_nx(&key, "status", ReqStatus::Pending.as_str())
            .await
            .map_err(|e| transport("hsetnx", e))?;

        if !is_new {
            let current: Option<String> = conn
                .hget(&key, "status")
                .await
                .map_err(|e| transport("hget", e))?;

            // Anything still pending, in flight, or already done blocks
            // the duplicate. Only a failed request may be retried.
            if current.as_deref() != Some(ReqStatus::Failure.as_str()) {
                info!(%req_id, status = ?current, "duplicate request rejected");
                return Err(AppError::Duplicate(key));
            }

            info!(%req_id, "retrying a previously failed request");
            conn.hset::<_, _, _, ()>(&key, "status", ReqStatus::Pending.as_str())
                .await
                .map_err(|e| transport("hset", e))?;
        }

        conn.hset_multiple::<_, _, _, ()>(
            &key,
            &[("error", String::new()), ("created_at", Utc::now().to_rfc3339())],
        )
        .await
        .map_err(|e| transport("hset", e))?;

        conn.expire::<_, ()>(&key, REQ_TTL_SECS)
            .await
            .map_err(|e| transport("expire", e))?;

        Ok(())
    }

    async fn change_req_status(&self, req_id: &Uuid, error: &str, status: ReqStatus) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.hset_multiple::<_, _, _, ()>(
            &req_id.to_string(),
            &[("status", status.as_str()), ("error", error)],
        )
        .await
        .map_err(|e| transport("hset", e))?;
        debug!(%req_id, status = status.as_str(), "request status updated");
        Ok(())
    }

    async fn get_req_status(&self, req_id: &Uuid) -> Result<RequestStatus> {
        let mut conn = self.conn.clone();
        let fields: std::collections::HashMap<String, String> = conn
            .hgetall(&req_id.to_string())
            .await
            .map_err(|e| transport("hgetall", e))?;

        if fields.is_empty() {
            return Err(AppError::NotFound(format!("request {req_id}")));
        }

        let status = fields
            .get("status")
            .and_then(|s| ReqStatus::parse(s))
            .ok_or_else(|| AppError::Permanent(format!("request {req_id}: corrupt status")))?;

        let created_at = fields
            .get("created_at")
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Ok(RequestStatus {
            status,
            error: fields.get("error").cloned().unwrap_or_default(),
            created_at,
        })
    }
}
