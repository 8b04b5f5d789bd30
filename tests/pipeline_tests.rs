//! End-to-end pipeline scenarios against in-memory fakes.
//!
//! Covers the gatekeeper short-circuit, first-fact insertion,
//! refinement (delete + insert), core snapshot updates, retrieval
//! merge order, and retry behavior of the planning call.

mod common;

use common::{FakeEmbedder, FakeIdentityCache, FakeVectorIndex, ScriptedLlm};
use cortex_memory::errors::{AppError, Result};
use cortex_memory::llm::LanguageModel;
use cortex_memory::pipeline::{IngestOutcome, MemoryPipeline};
use cortex_memory::retry;
use cortex_memory::types::{
    IngestionJob, MemoryAction, MemoryActionPlan, MemoryRecord, Message,
};
use cortex_memory::vector_index::content_addressed_id;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use uuid::Uuid;

struct Harness {
    vector: Arc<FakeVectorIndex>,
    cache: Arc<FakeIdentityCache>,
    embedder: Arc<FakeEmbedder>,
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
            embedder.clone(),
            llm.clone(),
        );
        Self {
            vector,
            cache,
            embedder,
            llm,
            pipeline,
        }
    }
}

fn job(user_id: &str, content: &str) -> IngestionJob {
    IngestionJob {
        req_id: Uuid::new_v4(),
        user_id: user_id.to_string(),
        messages: vec![Message::user(content)],
        threshold: 0.6,
    }
}

fn insert(payload: &str) -> MemoryAction {
    MemoryAction::Insert {
        payload: payload.to_string(),
    }
}

fn delete(id: Uuid) -> MemoryAction {
    MemoryAction::Delete {
        target_memory_id: id.to_string(),
    }
}

// ─── S1: chit-chat skip ──────────────────────────────────────────────

#[tokio::test]
async fn chitchat_skips_without_any_store_mutation() {
    let h = Harness::new("SKIP");

    let outcome = h.pipeline.ingest(&job("u1", "Hi")).await.unwrap();

    assert_eq!(outcome, IngestOutcome::Skipped);
    assert_eq!(h.embedder.batch_count(), 0, "no embedding call expected");
    assert_eq!(h.vector.count(), 0);
    assert!(h.cache.core_of("u1").is_none());
}

#[tokio::test]
async fn skip_detection_is_case_and_whitespace_insensitive() {
    let h = Harness::new("  Skip \n");
    let outcome = h.pipeline.ingest(&job("u1", "hello there")).await.unwrap();
    assert_eq!(outcome, IngestOutcome::Skipped);
}

// ─── S2: first fact ──────────────────────────────────────────────────

#[tokio::test]
async fn first_fact_lands_with_content_addressed_id() {
    let h = Harness::new("current residence city");
    h.llm.push_plan(MemoryActionPlan {
        reasoning: "user stated their city".to_string(),
        core_actions: vec![],
        general_actions: vec![insert("User lives in Tokyo, Japan.")],
    });

    let outcome = h.pipeline.ingest(&job("u2", "I live in Tokyo.")).await.unwrap();

    assert_eq!(outcome, IngestOutcome::Applied);
    assert_eq!(h.vector.count(), 1);
    let expected = content_addressed_id("User lives in Tokyo, Japan.", "u2");
    assert!(h.vector.points.lock().contains_key(&expected));
    assert!(h.cache.core_of("u2").is_none(), "cache must stay untouched");
}

#[tokio::test]
async fn reingesting_the_same_fact_is_idempotent() {
    let h = Harness::new("current residence city");
    for _ in 0..2 {
        h.llm.push_plan(MemoryActionPlan {
            reasoning: String::new(),
            core_actions: vec![],
            general_actions: vec![insert("User lives in Tokyo, Japan.")],
        });
    }

    h.pipeline.ingest(&job("u2", "I live in Tokyo.")).await.unwrap();
    h.pipeline.ingest(&job("u2", "I live in Tokyo.")).await.unwrap();

    assert_eq!(h.vector.count(), 1, "same fact must map to one point");
}

// ─── S3: refinement ──────────────────────────────────────────────────

#[tokio::test]
async fn refinement_replaces_the_old_general_memory() {
    let h = Harness::new("dog name pet");
    let g1 = h.vector.seed("u3", "User has a dog");
    h.llm.push_plan(MemoryActionPlan {
        reasoning: "dog fact refined".to_string(),
        core_actions: vec![],
        general_actions: vec![delete(g1), insert("User has a dog named Rover.")],
    });

    h.pipeline
        .ingest(&job("u3", "My dog's name is Rover."))
        .await
        .unwrap();

    let points = h.vector.points.lock();
    assert_eq!(points.len(), 1, "one out, one in");
    assert!(!points.contains_key(&g1));
    let replacement = content_addressed_id("User has a dog named Rover.", "u3");
    assert!(points.contains_key(&replacement));
}

// ─── S4: core update ─────────────────────────────────────────────────

#[tokio::test]
async fn core_update_replaces_deleted_and_keeps_the_rest() {
    let h = Harness::new("residence city");
    let c1 = MemoryRecord::core("u4", "User lives in Berlin");
    let c2 = MemoryRecord::core("u4", "User is a student");
    h.cache.seed_core("u4", vec![c1.clone(), c2.clone()]);

    h.llm.push_plan(MemoryActionPlan {
        reasoning: "moved cities".to_string(),
        core_actions: vec![delete(c1.id), insert("User lives in London")],
        general_actions: vec![],
    });

    h.pipeline
        .ingest(&job("u4", "I moved to London!"))
        .await
        .unwrap();

    let core = h.cache.core_of("u4").unwrap();
    assert_eq!(core.len(), 2);
    assert!(core.iter().any(|r| r.id == c2.id));
    assert!(!core.iter().any(|r| r.id == c1.id));
    let fresh = core.iter().find(|r| r.text == "User lives in London").unwrap();
    assert_ne!(fresh.id, c1.id, "replacement gets a fresh id");

    // Core never touches the vector index.
    assert_eq!(h.vector.count(), 0);
}

#[tokio::test]
async fn planner_sees_current_state_from_both_stores() {
    let h = Harness::new("anything");
    let c1 = MemoryRecord::core("u4", "User is vegetarian");
    h.cache.seed_core("u4", vec![c1.clone()]);
    let g1 = h.vector.seed("u4", "User likes ramen");

    h.llm.push_plan(MemoryActionPlan::default());
    h.pipeline.ingest(&job("u4", "nothing new")).await.unwrap();

    let seen = h.llm.seen_existing.lock();
    let (core, general) = &seen[0];
    assert_eq!(core.len(), 1);
    assert_eq!(core[0].id, c1.id);
    assert_eq!(general.len(), 1);
    assert_eq!(general[0].id, g1);
}

#[tokio::test]
async fn fetch_failures_degrade_to_empty_planner_input() {
    let h = Harness::new("anything");
    *h.vector.fail_search.lock() = true;
    *h.cache.fail_reads.lock() = true;

    h.llm.push_plan(MemoryActionPlan::default());
    let outcome = h.pipeline.ingest(&job("u9", "some fact")).await.unwrap();

    assert_eq!(outcome, IngestOutcome::Applied);
    let seen = h.llm.seen_existing.lock();
    let (core, general) = &seen[0];
    assert!(core.is_empty());
    assert!(general.is_empty());
}

#[tokio::test]
async fn empty_plan_writes_nothing() {
    let h = Harness::new("some topic");
    h.llm.push_plan(MemoryActionPlan::default());

    h.pipeline.ingest(&job("u5", "mildly interesting")).await.unwrap();

    assert_eq!(h.vector.count(), 0);
    assert!(h.cache.core_of("u5").is_none(), "no core action, no snapshot write");
    // Only the query embedding was requested, never a document batch.
    assert_eq!(h.embedder.batch_count(), 1);
}

// ─── S5: retrieval merge ─────────────────────────────────────────────

#[tokio::test]
async fn retrieval_returns_core_before_general() {
    let h = Harness::new("unused");
    let c1 = MemoryRecord::core("u6", "User lives in Oslo");
    h.cache.seed_core("u6", vec![c1.clone()]);
    h.vector.seed("u6", "User climbs on weekends");
    h.vector.seed("u6", "User prefers tea over coffee");

    let memories = h
        .pipeline
        .get_memories("weekend plans", "u6", &Uuid::new_v4(), 0.65)
        .await
        .unwrap();

    assert_eq!(memories.len(), 3);
    assert_eq!(memories[0].id, c1.id, "core first");
    assert!(memories[1..]
        .iter()
        .all(|r| r.kind == cortex_memory::types::MemoryKind::General));
}

#[tokio::test]
async fn retrieval_query_carries_the_query_prefix() {
    let h = Harness::new("unused");
    h.pipeline
        .get_memories("where do I live", "u6", &Uuid::new_v4(), 0.65)
        .await
        .unwrap();

    let batches = h.embedder.batches.lock();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0][0], "_Query_where do I live");
}

#[tokio::test]
async fn retrieval_survives_both_stores_failing() {
    let h = Harness::new("unused");
    *h.vector.fail_search.lock() = true;
    *h.cache.fail_reads.lock() = true;

    let memories = h
        .pipeline
        .get_memories("anything", "u7", &Uuid::new_v4(), 0.65)
        .await
        .unwrap();
    assert!(memories.is_empty(), "both sides degrade to empty, not error");
}

#[tokio::test]
async fn get_all_merges_scroll_with_core() {
    let h = Harness::new("unused");
    let c1 = MemoryRecord::core("u8", "User is a nurse");
    h.cache.seed_core("u8", vec![c1.clone()]);
    h.vector.seed("u8", "User owns a bicycle");

    let all = h.pipeline.get_all_memories("u8").await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].id, c1.id);
}

// ─── S6: transient planner failure, then success ─────────────────────

/// Planner that fails transiently `failures` times before yielding its
/// plan, retried the same way the production client retries.
struct FlakyLlm {
    attempts: AtomicU32,
    failures: u32,
    plan: MemoryActionPlan,
}

#[async_trait::async_trait]
impl LanguageModel for FlakyLlm {
    async fn expand_query(&self, _messages: &[Message]) -> Result<String> {
        Ok("flaky topic".to_string())
    }

    async fn plan_actions(
        &self,
        _messages: &[Message],
        _existing_core: &[MemoryRecord],
        _existing_general: &[MemoryRecord],
    ) -> Result<MemoryActionPlan> {
        retry::with_backoff("plan_actions", || {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            let plan = self.plan.clone();
            async move {
                if n < self.failures {
                    Err(AppError::Transient("llm returned 503".to_string()))
                } else {
                    Ok(plan)
                }
            }
        })
        .await
    }
}

#[tokio::test(start_paused = true)]
async fn transient_planner_failures_are_retried_to_success() {
    let vector = Arc::new(FakeVectorIndex::new());
    let cache = Arc::new(FakeIdentityCache::new());
    let embedder = Arc::new(FakeEmbedder::new());
    let llm = Arc::new(FlakyLlm {
        attempts: AtomicU32::new(0),
        failures: 2,
        plan: MemoryActionPlan {
            reasoning: String::new(),
            core_actions: vec![],
            general_actions: vec![insert("User speaks Portuguese.")],
        },
    });

    let pipeline = MemoryPipeline::new(vector.clone(), cache, embedder, llm.clone());
    let outcome = pipeline
        .ingest(&job("u10", "Falo portugues!"))
        .await
        .unwrap();

    assert_eq!(outcome, IngestOutcome::Applied);
    assert_eq!(llm.attempts.load(Ordering::SeqCst), 3, "two retries, then success");
    assert_eq!(vector.count(), 1, "effects equal the successful response");
}
