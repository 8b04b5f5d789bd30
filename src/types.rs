//! Core domain types shared across the service.
//!
//! Wire formats match the public HTTP API: `user_id` and friends are
//! snake_case JSON, the assistant role serializes as `model` (the
//! convention of the LLM provider this service grew up with).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Dense vector dimension expected by the vector index.
pub const DENSE_DIM: usize = 384;

/// One turn of dialogue. Immutable once ingested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Speaker of a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    #[serde(rename = "model", alias = "assistant")]
    Assistant,
    System,
}

/// Which tier a memory belongs to.
///
/// Core memories are identity-level facts held authoritatively in the
/// identity cache; general memories live in the hybrid vector index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    Core,
    General,
}

/// One durable fact about a user.
///
/// `text` is a self-contained statement ("User lives in Tokyo, Japan."),
/// never pronominal. Records are replaced (delete + insert), not edited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: Uuid,
    pub user_id: String,
    pub text: String,
    pub kind: MemoryKind,
}

impl MemoryRecord {
    pub fn core(user_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            text: text.into(),
            kind: MemoryKind::Core,
        }
    }

    pub fn general(id: Uuid, user_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id,
            user_id: user_id.into(),
            text: text.into(),
            kind: MemoryKind::General,
        }
    }
}

/// Dense embedding: fixed-dimension float vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseEmbedding(pub Vec<f32>);

/// Sparse embedding: parallel `(indices, values)` of equal length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparseEmbedding {
    pub indices: Vec<u32>,
    pub values: Vec<f32>,
}

/// Queued unit of ingestion work, serialized as JSON on the job subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionJob {
    pub req_id: Uuid,
    pub user_id: String,
    pub messages: Vec<Message>,
    pub threshold: f32,
}

/// A single planned store mutation.
///
/// Tagged sum type: an INSERT without a payload or a DELETE without a
/// target cannot be represented past the deserialization boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action_type")]
pub enum MemoryAction {
    #[serde(rename = "INSERT")]
    Insert { payload: String },
    #[serde(rename = "DELETE")]
    Delete { target_memory_id: String },
}

/// Output of the memory-planning prompt, one action list per tier.
///
/// `reasoning` is opaque: logged for debugging, never interpreted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryActionPlan {
    pub reasoning: String,
    pub core_actions: Vec<MemoryAction>,
    pub general_actions: Vec<MemoryAction>,
}

/// Lifecycle states of an ingestion request, kept under its idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReqStatus {
    Pending,
    Processing,
    Success,
    Failure,
}

impl ReqStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            _ => None,
        }
    }
}

/// Idempotency record for one enqueue request (24h TTL in the cache).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestStatus {
    pub status: ReqStatus,
    #[serde(default)]
    pub error: String,
    pub created_at: DateTime<Utc>,
}
