//! Memory endpoints: enqueue, retrieval, enumeration, deletion.

use axum::{
    extract::{Path, State},
    response::Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use super::state::AppState;
use crate::errors::{AppError, Result};
use crate::query;
use crate::types::{IngestionJob, MemoryRecord, Message, RequestStatus};

/// Deadline for the full-enumeration read.
const GET_ALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for the core-only read.
const GET_CORE_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// REQUEST/RESPONSE TYPES
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct InsertMemoryRequest {
    pub user_id: String,
    pub messages: Vec<Message>,
    /// Optional idempotency key; minted server-side when absent.
    #[serde(default)]
    pub req_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct InsertMemoryResponse {
    pub req_id: Uuid,
    pub msg: String,
}

#[derive(Debug, Deserialize)]
pub struct RetrievalRequest {
    pub user_id: String,
    #[serde(default)]
    pub messages: Option<Vec<Message>>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub threshold: Option<f32>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteMemoryRequest {
    pub user_id: String,
    pub memory_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct DeleteMemoryResponse {
    pub deleted: usize,
    pub msg: String,
}

#[derive(Debug, Serialize)]
pub struct CreateUserResponse {
    pub user_id: String,
}

fn parse_memory_ids(raw: &[String]) -> Result<Vec<Uuid>> {
    raw.iter()
        .map(|s| {
            Uuid::parse_str(s.trim())
                .map_err(|_| AppError::BadRequest(format!("invalid memory id: {s}")))
        })
        .collect()
}

fn clean_path_id(raw: &str) -> Result<String> {
    let clean = raw.trim_matches(['"', '\'', ' ']).to_string();
    if clean.is_empty() {
        return Err(AppError::BadRequest("empty id".to_string()));
    }
    Ok(clean)
}

// =============================================================================
// WRITE PATH
// =============================================================================

/// POST /add_memory - enqueue an ingestion job.
pub async fn add_memory(
    State(state): State<AppState>,
    Json(req): Json<InsertMemoryRequest>,
) -> Result<Json<InsertMemoryResponse>> {
    if req.user_id.trim().is_empty() {
        return Err(AppError::BadRequest("user_id is required".to_string()));
    }
    if req.messages.is_empty() {
        return Err(AppError::BadRequest("need at least one message".to_string()));
    }

    let req_id = req.req_id.unwrap_or_else(Uuid::new_v4);
    info!(%req_id, user_id = %req.user_id, "insertion request received");

    // Idempotency record. A duplicate is a hard stop; an unavailable
    // cache only costs us duplicate protection, not ingestion.
    match state.cache.create_req(&req_id).await {
        Ok(()) => {}
        Err(err @ AppError::Duplicate(_)) => return Err(err),
        Err(err) => {
            warn!(%req_id, "idempotency record unavailable: {}", err.message());
        }
    }

    let job = IngestionJob {
        req_id,
        user_id: req.user_id.clone(),
        messages: req.messages.clone(),
        threshold: state.config.insert_threshold,
    };
    state.queue.submit(&job).await?;

    if let Err(err) = state
        .audit
        .record_insertion(&req_id, &req.user_id, &req.messages)
        .await
    {
        warn!(%req_id, "audit row not persisted: {}", err.message());
    }

    Ok(Json(InsertMemoryResponse {
        req_id,
        msg: "Memory insertion job queued".to_string(),
    }))
}

/// POST /delete_memory/general - delete from the vector store.
pub async fn delete_general_memory(
    State(state): State<AppState>,
    Json(req): Json<DeleteMemoryRequest>,
) -> Result<Json<DeleteMemoryResponse>> {
    let ids = parse_memory_ids(&req.memory_ids)?;
    state.pipeline.delete_general(&ids).await?;
    Ok(Json(DeleteMemoryResponse {
        deleted: ids.len(),
        msg: "Memory deletion successful".to_string(),
    }))
}

/// POST /delete_memory/core - remove ids from the core snapshot.
pub async fn delete_core_memory(
    State(state): State<AppState>,
    Json(req): Json<DeleteMemoryRequest>,
) -> Result<Json<DeleteMemoryResponse>> {
    if req.user_id.trim().is_empty() {
        return Err(AppError::BadRequest("user_id is required".to_string()));
    }
    let ids = parse_memory_ids(&req.memory_ids)?;
    state.pipeline.delete_core(&ids, &req.user_id).await?;
    Ok(Json(DeleteMemoryResponse {
        deleted: ids.len(),
        msg: "Memory deletion successful".to_string(),
    }))
}

/// POST /create_user - mint a user with an empty core list.
pub async fn create_user(State(state): State<AppState>) -> Result<Json<CreateUserResponse>> {
    let user_id = state.cache.create_user().await?;
    Ok(Json(CreateUserResponse { user_id }))
}

// =============================================================================
// READ PATH
// =============================================================================

/// POST /get_memory - hybrid retrieval.
///
/// Accepts either a dialogue (turned into a contextual query) or a
/// plain query string.
pub async fn get_memory(
    State(state): State<AppState>,
    Json(req): Json<RetrievalRequest>,
) -> Result<Json<Vec<MemoryRecord>>> {
    if req.user_id.trim().is_empty() {
        return Err(AppError::BadRequest("user_id is required".to_string()));
    }

    let threshold = req.threshold.unwrap_or(state.config.retrieve_threshold);
    let req_id = Uuid::new_v4();

    let query_text = match (&req.messages, &req.query) {
        (Some(messages), _) if !messages.is_empty() => {
            query::build_contextual_query(messages, query::DEFAULT_CHAR_LIMIT)
        }
        (_, Some(query)) if !query.trim().is_empty() => query.clone(),
        _ => {
            return Err(AppError::BadRequest(
                "need messages or a query".to_string(),
            ))
        }
    };

    let memories = state
        .pipeline
        .get_memories(&query_text, &req.user_id, &req_id, threshold)
        .await?;
    Ok(Json(memories))
}

/// GET /get_all/{id} - every memory of a user, core first.
pub async fn get_all_memories(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<MemoryRecord>>> {
    let user_id = clean_path_id(&id)?;

    let memories = tokio::time::timeout(
        GET_ALL_TIMEOUT,
        state.pipeline.get_all_memories(&user_id),
    )
    .await
    .map_err(|_| AppError::Timeout("get all memories".to_string()))??;

    Ok(Json(memories))
}

/// GET /get_core/{id} - core snapshot only.
///
/// A user without core memories is a successful, empty answer, not an
/// error envelope.
pub async fn get_core_memories(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let user_id = clean_path_id(&id)?;

    let records = tokio::time::timeout(
        GET_CORE_TIMEOUT,
        state.pipeline.get_core_memories(&user_id),
    )
    .await
    .map_err(|_| AppError::Timeout("get core memories".to_string()))??;

    if records.is_empty() {
        return Ok(Json(json!("User has no core memories")));
    }
    Ok(Json(json!(records)))
}

/// GET /request_status/{req_id} - idempotency record of an enqueue.
pub async fn get_request_status(
    State(state): State<AppState>,
    Path(req_id): Path<String>,
) -> Result<Json<RequestStatus>> {
    let req_id = Uuid::parse_str(req_id.trim())
        .map_err(|_| AppError::BadRequest("invalid req_id".to_string()))?;
    let status = state.cache.get_req_status(&req_id).await?;
    Ok(Json(status))
}
