//! The memory pipeline: turns conversation turns into store mutations,
//! and serves the read path.
//!
//! Ingestion (one [`IngestionJob`]):
//! 1. expand the dialogue into a retrieval query (`SKIP` short-circuits);
//! 2. embed the query;
//! 3. fetch existing general + core memories in parallel (either side
//!    degrades to empty on failure);
//! 4. ask the planner for INSERT/DELETE actions per tier;
//! 5. apply core snapshot, then general deletes, then general inserts.
//!
//! The pipeline owns no collaborator lifecycles; it holds shared
//! handles that live for the process.

use crate::embed::{Embedder, QUERY_PREFIX};
use crate::errors::{AppError, Result};
use crate::identity_cache::IdentityCache;
use crate::llm::LanguageModel;
use crate::metrics;
use crate::types::{IngestionJob, MemoryAction, MemoryRecord};
use crate::vector_index::VectorIndex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Terminal state of one ingestion run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The gatekeeper saw nothing memorable; no store was touched.
    Skipped,
    /// The plan was applied.
    Applied,
}

/// Orchestrates the four collaborators.
pub struct MemoryPipeline {
    vector: Arc<dyn VectorIndex>,
    cache: Arc<dyn IdentityCache>,
    embedder: Arc<dyn Embedder>,
    llm: Arc<dyn LanguageModel>,
}

impl MemoryPipeline {
    pub fn new(
        vector: Arc<dyn VectorIndex>,
        cache: Arc<dyn IdentityCache>,
        embedder: Arc<dyn Embedder>,
        llm: Arc<dyn LanguageModel>,
    ) -> Self {
        Self {
            vector,
            cache,
            embedder,
            llm,
        }
    }

    /// Core snapshot for a user; a user the cache has never seen reads
    /// as an empty list, transport errors propagate.
    pub async fn get_core_memories(&self, user_id: &str) -> Result<Vec<MemoryRecord>> {
        match self.cache.get(user_id).await {
            Ok(records) => Ok(records),
            Err(AppError::NotFound(_)) => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    /// Read path: hybrid retrieval merged with the core snapshot, core
    /// first. Either side's failure degrades to empty for that side.
    pub async fn get_memories(
        &self,
        query_text: &str,
        user_id: &str,
        req_id: &Uuid,
        threshold: f32,
    ) -> Result<Vec<MemoryRecord>> {
        let (dense, sparse) = self
            .embedder
            .generate(&[format!("{QUERY_PREFIX}{query_text}")])
            .await?;

        let (general_res, core_res) = tokio::join!(
            self.vector.search(&dense[0], &sparse[0], user_id, threshold),
            self.cache.get(user_id),
        );

        let general = general_res.unwrap_or_else(|err| {
            warn!(%req_id, user_id, "vector search failed, serving core only: {}", err.message());
            Vec::new()
        });
        let core = match core_res {
            Ok(records) => records,
            Err(AppError::NotFound(_)) => Vec::new(),
            Err(err) => {
                warn!(%req_id, user_id, "core read failed, serving general only: {}", err.message());
                Vec::new()
            }
        };

        let mut memories = core;
        memories.extend(general);
        metrics::RETRIEVE_RESULTS.observe(memories.len() as f64);
        Ok(memories)
    }

    /// Full enumeration: scroll of the vector index merged with the
    /// core snapshot, core first. Both sides degrade to empty.
    pub async fn get_all_memories(&self, user_id: &str) -> Result<Vec<MemoryRecord>> {
        let (general_res, core_res) = tokio::join!(
            self.vector.scroll_by_user(user_id),
            self.cache.get(user_id),
        );

        let general = general_res.unwrap_or_else(|err| {
            warn!(user_id, "scroll failed, serving core only: {}", err.message());
            Vec::new()
        });
        let core = match core_res {
            Ok(records) => records,
            Err(AppError::NotFound(_)) => Vec::new(),
            Err(err) => {
                warn!(user_id, "core read failed during get-all: {}", err.message());
                Vec::new()
            }
        };

        let mut memories = core;
        memories.extend(general);
        Ok(memories)
    }

    /// Explicit deletion from the general store.
    pub async fn delete_general(&self, ids: &[Uuid]) -> Result<()> {
        self.vector.delete(ids).await
    }

    /// Explicit deletion from the core snapshot.
    pub async fn delete_core(&self, ids: &[Uuid], user_id: &str) -> Result<()> {
        self.cache.delete(ids, user_id).await
    }

    /// Run the full ingestion pipeline for one job.
    pub async fn ingest(&self, job: &IngestionJob) -> Result<IngestOutcome> {
        let _timer = metrics::Timer::new(metrics::PIPELINE_DURATION.clone());
        let req_id = job.req_id;
        info!(%req_id, user_id = %job.user_id, "ingestion started");

        // 1. Expand. The gatekeeper also filters out chit-chat.
        let expanded = self.llm.expand_query(&job.messages).await?;
        if expanded.trim().eq_ignore_ascii_case("skip") {
            info!(%req_id, "nothing memorable in this turn, skipping");
            return Ok(IngestOutcome::Skipped);
        }
        info!(%req_id, query = %expanded, "expanded query ready");

        // 2. Embed the retrieval query.
        let (dense, sparse) = self
            .embedder
            .generate(&[format!("{QUERY_PREFIX}{expanded}")])
            .await?;

        // 3. Fetch existing state from both stores in parallel. Either
        //    failure is recoverable: the planner just sees less context.
        let (general_res, core_res) = tokio::join!(
            self.vector
                .search(&dense[0], &sparse[0], &job.user_id, job.threshold),
            self.cache.get(&job.user_id),
        );
        let existing_general = general_res.unwrap_or_else(|err| {
            warn!(%req_id, "could not fetch existing general memories: {}", err.message());
            Vec::new()
        });
        let existing_core = match core_res {
            Ok(records) => records,
            Err(AppError::NotFound(_)) => Vec::new(),
            Err(err) => {
                warn!(%req_id, "could not fetch existing core memories: {}", err.message());
                Vec::new()
            }
        };

        // 4. Plan.
        let plan = self
            .llm
            .plan_actions(&job.messages, &existing_core, &existing_general)
            .await?;

        // 5./6a. Core tier: recompute and overwrite the snapshot only
        //    if the planner touched it. Failure here abandons the job.
        if !plan.core_actions.is_empty() {
            let new_core = apply_core_actions(&existing_core, &plan.core_actions, &job.user_id);
            info!(%req_id, count = new_core.len(), "writing new core snapshot");
            self.cache.set(&job.user_id, &new_core).await?;
        }

        // 5./6b-6c. General tier.
        let (texts_to_insert, ids_to_delete) = split_general_actions(&plan.general_actions);

        if !ids_to_delete.is_empty() {
            info!(%req_id, count = ids_to_delete.len(), "deleting superseded general memories");
            if let Err(err) = self.vector.delete(&ids_to_delete).await {
                // The replacement insert below still runs; a stale
                // leftover beats losing the new fact.
                warn!(%req_id, "general delete failed: {}", err.message());
            }
        }

        if !texts_to_insert.is_empty() {
            info!(%req_id, count = texts_to_insert.len(), "inserting new general memories");
            let (dense, sparse) = self.embedder.generate(&texts_to_insert).await?;
            self.vector
                .upsert(&dense, &sparse, &texts_to_insert, &job.user_id)
                .await?;
        }

        info!(%req_id, "ingestion complete");
        Ok(IngestOutcome::Applied)
    }
}

/// Split the general tier's actions into insert payloads and delete
/// targets. Targets that are not valid UUIDs at this point (the alias
/// rewrite normally guarantees they are) are dropped with a warning.
fn split_general_actions(actions: &[MemoryAction]) -> (Vec<String>, Vec<Uuid>) {
    let mut texts = Vec::new();
    let mut ids = Vec::new();
    for action in actions {
        match action {
            MemoryAction::Insert { payload } => texts.push(payload.clone()),
            MemoryAction::Delete { target_memory_id } => match Uuid::parse_str(target_memory_id) {
                Ok(id) => ids.push(id),
                Err(_) => warn!(target = %target_memory_id, "dropping DELETE with non-uuid target"),
            },
        }
    }
    (texts, ids)
}

/// Compute the next core snapshot: existing records minus the planner's
/// deletions, plus inserts under freshly minted ids.
fn apply_core_actions(
    existing: &[MemoryRecord],
    actions: &[MemoryAction],
    user_id: &str,
) -> Vec<MemoryRecord> {
    let mut deletes: HashSet<Uuid> = HashSet::new();
    let mut inserts: Vec<&str> = Vec::new();

    for action in actions {
        match action {
            MemoryAction::Insert { payload } => inserts.push(payload),
            MemoryAction::Delete { target_memory_id } => match Uuid::parse_str(target_memory_id) {
                Ok(id) => {
                    deletes.insert(id);
                }
                Err(_) => warn!(target = %target_memory_id, "dropping core DELETE with non-uuid target"),
            },
        }
    }

    existing
        .iter()
        .filter(|record| !deletes.contains(&record.id))
        .cloned()
        .chain(inserts.into_iter().map(|text| MemoryRecord::core(user_id, text)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MemoryKind;

    #[test]
    fn split_separates_inserts_and_deletes() {
        let id = Uuid::new_v4();
        let actions = vec![
            MemoryAction::Insert {
                payload: "User has a dog named Rover.".to_string(),
            },
            MemoryAction::Delete {
                target_memory_id: id.to_string(),
            },
            MemoryAction::Delete {
                target_memory_id: "not-a-uuid".to_string(),
            },
        ];
        let (texts, ids) = split_general_actions(&actions);
        assert_eq!(texts, vec!["User has a dog named Rover.".to_string()]);
        assert_eq!(ids, vec![id]);
    }

    #[test]
    fn core_snapshot_replaces_deleted_and_appends_inserts() {
        let keep = MemoryRecord::core("u4", "User is a student");
        let drop = MemoryRecord::core("u4", "User lives in Berlin");
        let actions = vec![
            MemoryAction::Delete {
                target_memory_id: drop.id.to_string(),
            },
            MemoryAction::Insert {
                payload: "User lives in London".to_string(),
            },
        ];

        let next = apply_core_actions(&[drop.clone(), keep.clone()], &actions, "u4");

        assert_eq!(next.len(), 2);
        assert!(next.iter().any(|r| r.id == keep.id));
        assert!(!next.iter().any(|r| r.id == drop.id));
        let inserted = next.iter().find(|r| r.text == "User lives in London").unwrap();
        assert_eq!(inserted.kind, MemoryKind::Core);
        assert_ne!(inserted.id, drop.id);
    }

    #[test]
    fn core_snapshot_with_only_inserts_keeps_existing() {
        let existing = MemoryRecord::core("u4", "User is vegetarian");
        let actions = vec![MemoryAction::Insert {
            payload: "User speaks French".to_string(),
        }];
        let next = apply_core_actions(&[existing.clone()], &actions, "u4");
        assert_eq!(next.len(), 2);
        assert_eq!(next[0].id, existing.id);
    }
}
