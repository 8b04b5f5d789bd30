//! In-memory fakes of the collaborator traits.
//!
//! Each fake records enough about how it was called for tests to assert
//! on interaction order and absence ("no embedding call happened"),
//! not just end state.

use async_trait::async_trait;
use cortex_memory::embed::Embedder;
use cortex_memory::errors::{AppError, Result};
use cortex_memory::identity_cache::IdentityCache;
use cortex_memory::llm::LanguageModel;
use cortex_memory::queue::JobQueue;
use cortex_memory::types::{
    DenseEmbedding, IngestionJob, MemoryActionPlan, MemoryRecord, Message, ReqStatus,
    RequestStatus, SparseEmbedding,
};
use cortex_memory::vector_index::{content_addressed_id, VectorIndex};
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

// =============================================================================
// VECTOR INDEX
// =============================================================================

#[derive(Debug, Clone)]
pub struct StoredPoint {
    pub user_id: String,
    pub text: String,
}

#[derive(Default)]
pub struct FakeVectorIndex {
    pub points: Mutex<HashMap<Uuid, StoredPoint>>,
    pub fail_search: Mutex<bool>,
}

impl FakeVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, user_id: &str, text: &str) -> Uuid {
        let id = content_addressed_id(text, user_id);
        self.points.lock().insert(
            id,
            StoredPoint {
                user_id: user_id.to_string(),
                text: text.to_string(),
            },
        );
        id
    }

    pub fn count(&self) -> usize {
        self.points.lock().len()
    }
}

#[async_trait]
impl VectorIndex for FakeVectorIndex {
    async fn search(
        &self,
        _dense: &DenseEmbedding,
        _sparse: &SparseEmbedding,
        user_id: &str,
        _threshold: f32,
    ) -> Result<Vec<MemoryRecord>> {
        if *self.fail_search.lock() {
            return Err(AppError::Transport("vector index down".to_string()));
        }
        let points = self.points.lock();
        let mut records: Vec<MemoryRecord> = points
            .iter()
            .filter(|(_, p)| p.user_id == user_id)
            .map(|(id, p)| MemoryRecord::general(*id, user_id, p.text.clone()))
            .collect();
        records.sort_by(|a, b| a.text.cmp(&b.text));
        Ok(records)
    }

    async fn upsert(
        &self,
        dense: &[DenseEmbedding],
        sparse: &[SparseEmbedding],
        texts: &[String],
        user_id: &str,
    ) -> Result<()> {
        assert_eq!(dense.len(), texts.len());
        assert_eq!(sparse.len(), texts.len());
        let mut points = self.points.lock();
        for text in texts {
            points.insert(
                content_addressed_id(text, user_id),
                StoredPoint {
                    user_id: user_id.to_string(),
                    text: text.clone(),
                },
            );
        }
        Ok(())
    }

    async fn delete(&self, ids: &[Uuid]) -> Result<()> {
        let mut points = self.points.lock();
        for id in ids {
            points.remove(id);
        }
        Ok(())
    }

    async fn scroll_by_user(&self, user_id: &str) -> Result<Vec<MemoryRecord>> {
        let points = self.points.lock();
        let mut records: Vec<MemoryRecord> = points
            .iter()
            .filter(|(_, p)| p.user_id == user_id)
            .map(|(id, p)| MemoryRecord::general(*id, user_id, p.text.clone()))
            .collect();
        records.sort_by(|a, b| a.text.cmp(&b.text));
        Ok(records)
    }
}

// =============================================================================
// IDENTITY CACHE
// =============================================================================

#[derive(Default)]
pub struct FakeIdentityCache {
    pub users: Mutex<HashMap<String, Vec<MemoryRecord>>>,
    pub reqs: Mutex<HashMap<Uuid, (ReqStatus, String)>>,
    pub fail_reads: Mutex<bool>,
}

impl FakeIdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_core(&self, user_id: &str, records: Vec<MemoryRecord>) {
        self.users.lock().insert(user_id.to_string(), records);
    }

    pub fn core_of(&self, user_id: &str) -> Option<Vec<MemoryRecord>> {
        self.users.lock().get(user_id).cloned()
    }

    pub fn req_status(&self, req_id: &Uuid) -> Option<ReqStatus> {
        self.reqs.lock().get(req_id).map(|(s, _)| *s)
    }
}

#[async_trait]
impl IdentityCache for FakeIdentityCache {
    async fn get(&self, user_id: &str) -> Result<Vec<MemoryRecord>> {
        if *self.fail_reads.lock() {
            return Err(AppError::Transport("cache down".to_string()));
        }
        self.users
            .lock()
            .get(user_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("user {user_id}")))
    }

    async fn set(&self, user_id: &str, records: &[MemoryRecord]) -> Result<()> {
        self.users
            .lock()
            .insert(user_id.to_string(), records.to_vec());
        Ok(())
    }

    async fn delete(&self, ids: &[Uuid], user_id: &str) -> Result<()> {
        let mut users = self.users.lock();
        let current = users
            .get(user_id)
            .ok_or_else(|| AppError::NotFound(format!("user {user_id}")))?;
        let retained = current
            .iter()
            .filter(|r| !ids.contains(&r.id))
            .cloned()
            .collect();
        users.insert(user_id.to_string(), retained);
        Ok(())
    }

    async fn create_user(&self) -> Result<String> {
        let user_id = Uuid::new_v4().to_string();
        self.users.lock().insert(user_id.clone(), Vec::new());
        Ok(user_id)
    }

    async fn create_req(&self, req_id: &Uuid) -> Result<()> {
        let mut reqs = self.reqs.lock();
        match reqs.get(req_id) {
            Some((ReqStatus::Failure, _)) | None => {
                reqs.insert(*req_id, (ReqStatus::Pending, String::new()));
                Ok(())
            }
            Some(_) => Err(AppError::Duplicate(req_id.to_string())),
        }
    }

    async fn change_req_status(&self, req_id: &Uuid, error: &str, status: ReqStatus) -> Result<()> {
        self.reqs
            .lock()
            .insert(*req_id, (status, error.to_string()));
        Ok(())
    }

    async fn get_req_status(&self, req_id: &Uuid) -> Result<RequestStatus> {
        self.reqs
            .lock()
            .get(req_id)
            .map(|(status, error)| RequestStatus {
                status: *status,
                error: error.clone(),
                created_at: chrono::Utc::now(),
            })
            .ok_or_else(|| AppError::NotFound(format!("request {req_id}")))
    }
}

// =============================================================================
// EMBEDDER
// =============================================================================

/// Deterministic embedder that records every batch it was asked for.
#[derive(Default)]
pub struct FakeEmbedder {
    pub batches: Mutex<Vec<Vec<String>>>,
}

impl FakeEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batch_count(&self) -> usize {
        self.batches.lock().len()
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn generate(
        &self,
        texts: &[String],
    ) -> Result<(Vec<DenseEmbedding>, Vec<SparseEmbedding>)> {
        if texts.is_empty() {
            return Err(AppError::BadRequest("no texts to embed".to_string()));
        }
        self.batches.lock().push(texts.to_vec());
        let dense = texts
            .iter()
            .map(|t| DenseEmbedding(vec![t.len() as f32; 4]))
            .collect();
        let sparse = texts
            .iter()
            .map(|t| SparseEmbedding {
                indices: vec![t.len() as u32],
                values: vec![1.0],
            })
            .collect();
        Ok((dense, sparse))
    }

    async fn generate_dense(&self, text: &str) -> Result<DenseEmbedding> {
        Ok(DenseEmbedding(vec![text.len() as f32; 4]))
    }
}

// =============================================================================
// LANGUAGE MODEL
// =============================================================================

/// Scripted model: a fixed expansion plus a queue of plans, recording
/// the existing-memory lists each planning call was shown.
pub struct ScriptedLlm {
    pub expansion: Mutex<String>,
    pub plans: Mutex<Vec<MemoryActionPlan>>,
    pub seen_existing: Mutex<Vec<(Vec<MemoryRecord>, Vec<MemoryRecord>)>>,
}

impl ScriptedLlm {
    pub fn new(expansion: &str) -> Self {
        Self {
            expansion: Mutex::new(expansion.to_string()),
            plans: Mutex::new(Vec::new()),
            seen_existing: Mutex::new(Vec::new()),
        }
    }

    pub fn push_plan(&self, plan: MemoryActionPlan) {
        self.plans.lock().push(plan);
    }
}

#[async_trait]
impl LanguageModel for ScriptedLlm {
    async fn expand_query(&self, _messages: &[Message]) -> Result<String> {
        Ok(self.expansion.lock().clone())
    }

    async fn plan_actions(
        &self,
        _messages: &[Message],
        existing_core: &[MemoryRecord],
        existing_general: &[MemoryRecord],
    ) -> Result<MemoryActionPlan> {
        self.seen_existing
            .lock()
            .push((existing_core.to_vec(), existing_general.to_vec()));
        let mut plans = self.plans.lock();
        if plans.is_empty() {
            return Ok(MemoryActionPlan::default());
        }
        Ok(plans.remove(0))
    }
}

// =============================================================================
// JOB QUEUE
// =============================================================================

#[derive(Default)]
pub struct FakeJobQueue {
    pub submitted: Mutex<Vec<IngestionJob>>,
}

impl FakeJobQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobQueue for FakeJobQueue {
    async fn submit(&self, job: &IngestionJob) -> Result<()> {
        self.submitted.lock().push(job.clone());
        Ok(())
    }
}
