//! Qdrant adapter: hybrid dense+sparse retrieval over general memories.
//!
//! One logical collection partitioned by `user_id`. Search fuses a
//! sparse and a dense prefetch with Reciprocal-Rank-Fusion; inserts are
//! content-addressed (UUIDv5 of `text || user_id`) so re-emitting the
//! same fact lands on the same point.

use crate::errors::{AppError, Result};
use crate::metrics;
use crate::types::{DenseEmbedding, MemoryRecord, SparseEmbedding, DENSE_DIM};
use async_trait::async_trait;
use qdrant_client::qdrant::{
    point_id::PointIdOptions, value::Kind, Condition, CreateCollectionBuilder,
    CreateFieldIndexCollectionBuilder, DeletePointsBuilder, Distance, FieldType, Filter, Fusion,
    GetPointsBuilder, NamedVectors, PointId, PointStruct, PointsIdsList, PrefetchQueryBuilder,
    Query, QueryPointsBuilder, ScrollPointsBuilder, SparseVectorParamsBuilder,
    SparseVectorsConfigBuilder, UpsertPointsBuilder, Vector, VectorInput, VectorParamsBuilder,
    VectorsConfigBuilder,
};
use qdrant_client::{Payload, Qdrant};
use std::collections::HashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

const COLLECTION: &str = "cortex_memories";
const DENSE_VECTOR: &str = "dense";
const SPARSE_VECTOR: &str = "sparse";
const PAYLOAD_USER: &str = "user_id";
const PAYLOAD_TEXT: &str = "text";

/// Fused results returned per search.
const SEARCH_LIMIT: u64 = 20;

/// Candidates per prefetch branch before fusion.
const PREFETCH_LIMIT: u64 = 50;

/// Page size for scroll enumeration.
const SCROLL_PAGE: u32 = 256;

/// Deterministic id for a fact: the same text for the same user always
/// maps to the same point, making re-insertion idempotent.
pub fn content_addressed_id(text: &str, user_id: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("{text}{user_id}").as_bytes())
}

/// Capability surface of the general-memory vector store.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Hybrid RRF search scoped to one user; fused scores below
    /// `threshold` are dropped.
    async fn search(
        &self,
        dense: &DenseEmbedding,
        sparse: &SparseEmbedding,
        user_id: &str,
        threshold: f32,
    ) -> Result<Vec<MemoryRecord>>;

    /// Insert or overwrite one point per text. The three slices must be
    /// parallel.
    async fn upsert(
        &self,
        dense: &[DenseEmbedding],
        sparse: &[SparseEmbedding],
        texts: &[String],
        user_id: &str,
    ) -> Result<()>;

    /// Delete points by id. Missing ids are tolerated and logged; only
    /// transport failures are errors.
    async fn delete(&self, ids: &[Uuid]) -> Result<()>;

    /// Enumerate all of a user's general memories.
    async fn scroll_by_user(&self, user_id: &str) -> Result<Vec<MemoryRecord>>;
}

/// Production [`VectorIndex`] backed by Qdrant.
pub struct QdrantIndex {
    client: Qdrant,
}

impl QdrantIndex {
    /// Connect and bootstrap the collection if absent. Idempotent:
    /// re-running against an existing collection changes nothing.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Qdrant::from_url(url)
            .build()
            .map_err(|e| AppError::Transport(format!("qdrant: {e}")))?;

        let exists = client
            .collection_exists(COLLECTION)
            .await
            .map_err(|e| AppError::Transport(format!("qdrant collection check: {e}")))?;

        if !exists {
            info!(collection = COLLECTION, "creating vector collection");

            let mut vectors = VectorsConfigBuilder::default();
            vectors.add_named_vector_params(
                DENSE_VECTOR,
                VectorParamsBuilder::new(DENSE_DIM as u64, Distance::Cosine),
            );
            let mut sparse = SparseVectorsConfigBuilder::default();
            sparse.add_named_vector_params(SPARSE_VECTOR, SparseVectorParamsBuilder::default());

            client
                .create_collection(
                    CreateCollectionBuilder::new(COLLECTION)
                        .vectors_config(vectors)
                        .sparse_vectors_config(sparse),
                )
                .await
                .map_err(|e| AppError::Transport(format!("qdrant create collection: {e}")))?;

            // Keyword index keeps the per-user filter fast as the
            // collection grows.
            client
                .create_field_index(CreateFieldIndexCollectionBuilder::new(
                    COLLECTION,
                    PAYLOAD_USER,
                    FieldType::Keyword,
                ))
                .await
                .map_err(|e| AppError::Transport(format!("qdrant field index: {e}")))?;
        }

        Ok(Self { client })
    }
}

fn user_filter(user_id: &str) -> Filter {
    Filter::must([Condition::matches(PAYLOAD_USER, user_id.to_string())])
}

fn payload_str(
    payload: &HashMap<String, qdrant_client::qdrant::Value>,
    key: &str,
) -> Option<String> {
    payload.get(key).and_then(|v| match &v.kind {
        Some(Kind::StringValue(s)) => Some(s.clone()),
        _ => None,
    })
}

fn point_uuid(id: Option<&PointId>) -> Option<Uuid> {
    match id?.point_id_options.as_ref()? {
        PointIdOptions::Uuid(s) => Uuid::parse_str(s).ok(),
        PointIdOptions::Num(_) => None,
    }
}

/// Decode a point's payload into a general [`MemoryRecord`]; points
/// missing the text payload are skipped with a log line.
fn decode_record(
    id: Option<&PointId>,
    payload: &HashMap<String, qdrant_client::qdrant::Value>,
    user_id: &str,
) -> Option<MemoryRecord> {
    let Some(id) = point_uuid(id) else {
        warn!("point without a uuid id in collection, skipping");
        return None;
    };
    let Some(text) = payload_str(payload, PAYLOAD_TEXT) else {
        warn!(%id, "point payload is missing the text field, skipping");
        return None;
    };
    Some(MemoryRecord::general(id, user_id, text))
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn search(
        &self,
        dense: &DenseEmbedding,
        sparse: &SparseEmbedding,
        user_id: &str,
        threshold: f32,
    ) -> Result<Vec<MemoryRecord>> {
        let _timer = metrics::Timer::new(metrics::VECTOR_SEARCH_DURATION.clone());
        let filter = user_filter(user_id);

        let sparse_prefetch = PrefetchQueryBuilder::default()
            .query(Query::new_nearest(VectorInput::new_sparse(
                sparse.indices.clone(),
                sparse.values.clone(),
            )))
            .using(SPARSE_VECTOR)
            .filter(filter.clone())
            .limit(PREFETCH_LIMIT);
        let dense_prefetch = PrefetchQueryBuilder::default()
            .query(Query::new_nearest(dense.0.clone()))
            .using(DENSE_VECTOR)
            .filter(filter.clone())
            .limit(PREFETCH_LIMIT);

        let response = self
            .client
            .query(
                QueryPointsBuilder::new(COLLECTION)
                    .add_prefetch(sparse_prefetch)
                    .add_prefetch(dense_prefetch)
                    .query(Query::new_fusion(Fusion::Rrf))
                    .filter(filter)
                    .score_threshold(threshold)
                    .with_payload(true)
                    .limit(SEARCH_LIMIT),
            )
            .await
            .map_err(|e| AppError::Transport(format!("qdrant query: {e}")))?;

        let records: Vec<MemoryRecord> = response
            .result
            .iter()
            .filter_map(|point| decode_record(point.id.as_ref(), &point.payload, user_id))
            .collect();

        debug!(user_id, count = records.len(), "hybrid search complete");
        Ok(records)
    }

    async fn upsert(
        &self,
        dense: &[DenseEmbedding],
        sparse: &[SparseEmbedding],
        texts: &[String],
        user_id: &str,
    ) -> Result<()> {
        if dense.len() != texts.len() || sparse.len() != texts.len() {
            return Err(AppError::Permanent(format!(
                "embedding/text arity mismatch: {} dense, {} sparse, {} texts",
                dense.len(),
                sparse.len(),
                texts.len()
            )));
        }
        if texts.is_empty() {
            return Ok(());
        }

        let points: Vec<PointStruct> = texts
            .iter()
            .enumerate()
            .map(|(i, text)| {
                let id = content_addressed_id(text, user_id);
                let vectors = NamedVectors::default()
                    .add_vector(DENSE_VECTOR, Vector::new_dense(dense[i].0.clone()))
                    .add_vector(
                        SPARSE_VECTOR,
                        Vector::new_sparse(sparse[i].indices.clone(), sparse[i].values.clone()),
                    );
                let mut payload = Payload::new();
                payload.insert(PAYLOAD_USER, user_id.to_string());
                payload.insert(PAYLOAD_TEXT, text.clone());
                PointStruct::new(id.to_string(), vectors, payload)
            })
            .collect();

        self.client
            .upsert_points(UpsertPointsBuilder::new(COLLECTION, points).wait(true))
            .await
            .map_err(|e| AppError::Transport(format!("qdrant upsert: {e}")))?;

        info!(user_id, count = texts.len(), "memories upserted");
        Ok(())
    }

    async fn delete(&self, ids: &[Uuid]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let point_ids: Vec<PointId> = ids.iter().map(|id| PointId::from(id.to_string())).collect();

        // Existence pre-check: a planner that referenced a stale id is
        // worth a log line, not a failure.
        match self
            .client
            .get_points(
                GetPointsBuilder::new(COLLECTION, point_ids.clone())
                    .with_payload(false)
                    .with_vectors(false),
            )
            .await
        {
            Ok(found) => {
                if found.result.len() != ids.len() {
                    warn!(
                        requested = ids.len(),
                        found = found.result.len(),
                        "some delete targets no longer exist"
                    );
                }
            }
            Err(e) => warn!("existence check before delete failed: {e}"),
        }

        self.client
            .delete_points(
                DeletePointsBuilder::new(COLLECTION)
                    .points(PointsIdsList { ids: point_ids })
                    .wait(true),
            )
            .await
            .map_err(|e| AppError::Transport(format!("qdrant delete: {e}")))?;

        info!(count = ids.len(), "memories deleted from vector index");
        Ok(())
    }

    async fn scroll_by_user(&self, user_id: &str) -> Result<Vec<MemoryRecord>> {
        let mut records = Vec::new();
        let mut offset: Option<PointId> = None;

        loop {
            let mut builder = ScrollPointsBuilder::new(COLLECTION)
                .filter(user_filter(user_id))
                .with_payload(true)
                .limit(SCROLL_PAGE);
            if let Some(next) = offset.take() {
                builder = builder.offset(next);
            }

            let response = self
                .client
                .scroll(builder)
                .await
                .map_err(|e| AppError::Transport(format!("qdrant scroll: {e}")))?;

            records.extend(
                response
                    .result
                    .iter()
                    .filter_map(|point| decode_record(point.id.as_ref(), &point.payload, user_id)),
            );

            match response.next_page_offset {
                Some(next) => offset = Some(next),
                None => break,
            }
        }

        debug!(user_id, count = records.len(), "scrolled user memories");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_addressed_id_is_deterministic() {
        let a = content_addressed_id("User lives in Tokyo, Japan.", "u2");
        let b = content_addressed_id("User lives in Tokyo, Japan.", "u2");
        assert_eq!(a, b);
    }

    #[test]
    fn content_addressed_id_separates_users() {
        let a = content_addressed_id("User lives in Tokyo, Japan.", "u2");
        let b = content_addressed_id("User lives in Tokyo, Japan.", "u3");
        assert_ne!(a, b);
    }

    #[test]
    fn content_addressed_id_separates_texts() {
        let a = content_addressed_id("User has a dog", "u2");
        let b = content_addressed_id("User has a cat", "u2");
        assert_ne!(a, b);
    }
}
