//! Client for the embedding gRPC service.
//!
//! The service produces dense (384-dim BGE) and sparse (SPLADE)
//! embeddings in one batched call. Retrieval queries are marked with
//! the [`QUERY_PREFIX`] so the service applies asymmetric query
//! encoding; document texts are sent unprefixed.

use crate::errors::{AppError, Result};
use crate::metrics;
use crate::types::{DenseEmbedding, SparseEmbedding};
use async_trait::async_trait;
use std::time::Duration;
use tonic::transport::Channel;
use tracing::debug;

pub mod pb {
    tonic::include_proto!("embedding");
}

use pb::embedding_service_client::EmbeddingServiceClient;

/// Inline marker for query-side asymmetric encoding.
pub const QUERY_PREFIX: &str = "_Query_";

/// Timeout for batched generation.
const BATCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for the single-query dense variant.
const DENSE_TIMEOUT: Duration = Duration::from_secs(15);

/// Capability surface of the embedding service.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Batched dense + sparse generation. The returned vectors are
    /// parallel to `texts` and of equal length.
    async fn generate(
        &self,
        texts: &[String],
    ) -> Result<(Vec<DenseEmbedding>, Vec<SparseEmbedding>)>;

    /// Single dense embedding with a shorter deadline.
    async fn generate_dense(&self, text: &str) -> Result<DenseEmbedding>;
}

/// gRPC-backed [`Embedder`]. The channel is established once at startup
/// and multiplexed for the process lifetime.
#[derive(Clone)]
pub struct GrpcEmbeddingClient {
    client: EmbeddingServiceClient<Channel>,
}

impl GrpcEmbeddingClient {
    pub async fn connect(url: &str) -> Result<Self> {
        let channel = Channel::from_shared(url.to_string())
            .map_err(|e| AppError::BadRequest(format!("embedding url: {e}")))?
            .connect_timeout(Duration::from_secs(5))
            .connect()
            .await
            .map_err(|e| AppError::Transport(format!("embedding service: {e}")))?;

        Ok(Self {
            client: EmbeddingServiceClient::new(channel),
        })
    }
}

fn map_status(status: tonic::Status) -> AppError {
    match status.code() {
        tonic::Code::InvalidArgument => AppError::BadRequest(status.message().to_string()),
        tonic::Code::DeadlineExceeded => AppError::Timeout(format!("embedding: {}", status.message())),
        tonic::Code::Unavailable | tonic::Code::ResourceExhausted => {
            AppError::Transient(format!("embedding: {status}"))
        }
        _ => AppError::Transport(format!("embedding: {status}")),
    }
}

#[async_trait]
impl Embedder for GrpcEmbeddingClient {
    async fn generate(
        &self,
        texts: &[String],
    ) -> Result<(Vec<DenseEmbedding>, Vec<SparseEmbedding>)> {
        if texts.is_empty() {
            return Err(AppError::BadRequest("no texts to embed".to_string()));
        }

        let _timer = metrics::Timer::new(metrics::EMBEDDING_DURATION.clone());
        let request = tonic::Request::new(pb::Queries {
            queries: texts.to_vec(),
        });

        let response = tokio::time::timeout(
            BATCH_TIMEOUT,
            self.client.clone().create_embeddings(request),
        )
        .await
        .map_err(|_| {
            metrics::EMBEDDING_REQUESTS_TOTAL
                .with_label_values(&["timeout"])
                .inc();
            AppError::Timeout("embedding batch call".to_string())
        })?
        .map_err(|status| {
            metrics::EMBEDDING_REQUESTS_TOTAL
                .with_label_values(&["error"])
                .inc();
            map_status(status)
        })?
        .into_inner();

        if response.dense_embeddings.len() != texts.len()
            || response.sparse_embeddings.len() != texts.len()
        {
            return Err(AppError::Permanent(format!(
                "embedding count mismatch: sent {}, got {} dense / {} sparse",
                texts.len(),
                response.dense_embeddings.len(),
                response.sparse_embeddings.len()
            )));
        }

        let dense = response
            .dense_embeddings
            .into_iter()
            .map(|d| DenseEmbedding(d.values))
            .collect();
        let sparse = response
            .sparse_embeddings
            .into_iter()
            .map(|s| SparseEmbedding {
                indices: s.indices,
                values: s.values,
            })
            .collect();

        metrics::EMBEDDING_REQUESTS_TOTAL
            .with_label_values(&["ok"])
            .inc();
        debug!(count = texts.len(), "embeddings generated");
        Ok((dense, sparse))
    }

    async fn generate_dense(&self, text: &str) -> Result<DenseEmbedding> {
        if text.trim().is_empty() {
            return Err(AppError::BadRequest("empty query".to_string()));
        }

        let _timer = metrics::Timer::new(metrics::EMBEDDING_DURATION.clone());
        let request = tonic::Request::new(pb::Query {
            query: text.to_string(),
        });

        let response = tokio::time::timeout(
            DENSE_TIMEOUT,
            self.client.clone().create_dense_embedding(request),
        )
        .await
        .map_err(|_| AppError::Timeout("dense embedding call".to_string()))?
        .map_err(map_status)?
        .into_inner();

        Ok(DenseEmbedding(response.values))
    }
}
