//! Delivery-protocol tests: decode failures, ack/terminate decisions,
//! and idempotency-record bookkeeping.

mod common;

use async_trait::async_trait;
use common::{FakeEmbedder, FakeIdentityCache, FakeVectorIndex, ScriptedLlm};
use cortex_memory::errors::{AppError, Result};
use cortex_memory::identity_cache::IdentityCache;
use cortex_memory::pipeline::MemoryPipeline;
use cortex_memory::queue::{process_delivery, Disposition};
use cortex_memory::types::{
    IngestionJob, MemoryAction, MemoryActionPlan, MemoryRecord, Message, ReqStatus, RequestStatus,
};
use std::sync::Arc;
use uuid::Uuid;

struct Harness {
    cache: Arc<FakeIdentityCache>,
    vector: Arc<FakeVectorIndex>,
    llm: Arc<ScriptedLlm>,
    pipeline: MemoryPipeline,
}

impl Harness {
    fn new(expansion: &str) -> Self {
        let vector = Arc::new(FakeVectorIndex::new());
        let cache = Arc::new(FakeIdentityCache::new());
        let embedder = Arc::new(FakeEmbedder::new());
        let llm = Arc::new(ScriptedLlm::new(expansion));
        let pipeline = MemoryPipeline::new(
            vector.clone(),
            cache.clone(),
            embedder,
            llm.clone(),
        );
        Self {
            cache,
            vector,
            llm,
            pipeline,
        }
    }
}

fn payload(user_id: &str, req_id: Uuid, content: &str) -> Vec<u8> {
    serde_json::to_vec(&IngestionJob {
        req_id,
        user_id: user_id.to_string(),
        messages: vec![Message::user(content)],
        threshold: 0.6,
    })
    .unwrap()
}

#[tokio::test]
async fn undecodable_payload_is_terminated_not_requeued() {
    let h = Harness::new("SKIP");
    let disposition =
        process_delivery(&h.pipeline, h.cache.as_ref(), b"{not json at all").await;
    assert_eq!(disposition, Disposition::Term);
    assert_eq!(h.vector.count(), 0);
}

#[tokio::test]
async fn successful_job_is_acked_and_marked_success() {
    let h = Harness::new("pet ownership");
    h.llm.push_plan(MemoryActionPlan {
        reasoning: String::new(),
        core_actions: vec![],
        general_actions: vec![MemoryAction::Insert {
            payload: "User has a parrot.".to_string(),
        }],
    });

    let req_id = Uuid::new_v4();
    let disposition = process_delivery(
        &h.pipeline,
        h.cache.as_ref(),
        &payload("u1", req_id, "I got a parrot!"),
    )
    .await;

    assert_eq!(disposition, Disposition::Ack);
    assert_eq!(h.vector.count(), 1);
    assert_eq!(h.cache.req_status(&req_id), Some(ReqStatus::Success));
}

#[tokio::test]
async fn skipped_job_is_still_acked() {
    let h = Harness::new("SKIP");
    let req_id = Uuid::new_v4();
    let disposition =
        process_delivery(&h.pipeline, h.cache.as_ref(), &payload("u1", req_id, "hey")).await;

    assert_eq!(disposition, Disposition::Ack);
    assert_eq!(h.cache.req_status(&req_id), Some(ReqStatus::Success));
}

/// Cache that refuses snapshot writes but behaves normally otherwise;
/// lets a core-tier plan fail exactly at the apply step.
struct WriteRejectingCache(FakeIdentityCache);

#[async_trait]
impl IdentityCache for WriteRejectingCache {
    async fn get(&self, user_id: &str) -> Result<Vec<MemoryRecord>> {
        self.0.get(user_id).await
    }

    async fn set(&self, _user_id: &str, _records: &[MemoryRecord]) -> Result<()> {
        Err(AppError::Transport("cache write refused".to_string()))
    }

    async fn delete(&self, ids: &[Uuid], user_id: &str) -> Result<()> {
        self.0.delete(ids, user_id).await
    }

    async fn create_user(&self) -> Result<String> {
        self.0.create_user().await
    }

    async fn create_req(&self, req_id: &Uuid) -> Result<()> {
        self.0.create_req(req_id).await
    }

    async fn change_req_status(&self, req_id: &Uuid, error: &str, status: ReqStatus) -> Result<()> {
        self.0.change_req_status(req_id, error, status).await
    }

    async fn get_req_status(&self, req_id: &Uuid) -> Result<RequestStatus> {
        self.0.get_req_status(req_id).await
    }
}

#[tokio::test]
async fn core_write_failure_terminates_and_marks_failure() {
    let vector = Arc::new(FakeVectorIndex::new());
    let cache = Arc::new(WriteRejectingCache(FakeIdentityCache::new()));
    let embedder = Arc::new(FakeEmbedder::new());
    let llm = Arc::new(ScriptedLlm::new("residence"));
    llm.push_plan(MemoryActionPlan {
        reasoning: String::new(),
        core_actions: vec![MemoryAction::Insert {
            payload: "User lives in Rome".to_string(),
        }],
        general_actions: vec![],
    });
    let pipeline = MemoryPipeline::new(vector.clone(), cache.clone(), embedder, llm);

    let req_id = Uuid::new_v4();
    let disposition = process_delivery(
        &pipeline,
        cache.as_ref(),
        &payload("u2", req_id, "Vivo a Roma"),
    )
    .await;

    assert_eq!(disposition, Disposition::Term);
    assert_eq!(cache.0.req_status(&req_id), Some(ReqStatus::Failure));
    assert_eq!(vector.count(), 0, "planning effort is abandoned");
}
