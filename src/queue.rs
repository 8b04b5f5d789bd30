//! Durable job queue and the ingestion worker pool.
//!
//! Jobs ride a JetStream stream as JSON. A durable pull consumer is
//! shared by N workers, so each delivery reaches exactly one of them
//! with at-least-once semantics. Workers account for in-flight jobs so
//! shutdown can drain: dispatched deliveries run to their ack or
//! terminate before the pool releases.

use crate::errors::{AppError, Result};
use crate::identity_cache::IdentityCache;
use crate::metrics;
use crate::pipeline::{IngestOutcome, MemoryPipeline};
use crate::types::{IngestionJob, ReqStatus};
use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, PullConsumer},
    stream::StorageType,
    AckKind,
};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const STREAM_NAME: &str = "CORTEX_MEMORY";
const SUBJECT: &str = "memory.jobs";
const CONSUMER_NAME: &str = "memory-workers";

/// Hard deadline for one pipeline run.
const PIPELINE_DEADLINE: Duration = Duration::from_secs(60);

/// Enqueue side of the queue.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Publish a job and wait for the broker's ack. Broker errors are
    /// returned unchanged to the caller.
    async fn submit(&self, job: &IngestionJob) -> Result<()>;
}

/// Create (or re-use) the memory stream. Idempotent.
pub async fn ensure_stream(
    js: &jetstream::Context,
    durable: bool,
) -> Result<jetstream::stream::Stream> {
    let storage = if durable {
        StorageType::File
    } else {
        StorageType::Memory
    };
    js.get_or_create_stream(jetstream::stream::Config {
        name: STREAM_NAME.to_string(),
        subjects: vec![SUBJECT.to_string()],
        storage,
        ..Default::default()
    })
    .await
    .map_err(|e| AppError::Transport(format!("jetstream stream: {e}")))
}

/// Create (or re-use) the shared durable pull consumer.
pub async fn ensure_consumer(
    stream: &jetstream::stream::Stream,
) -> Result<PullConsumer> {
    stream
        .get_or_create_consumer(
            CONSUMER_NAME,
            pull::Config {
                durable_name: Some(CONSUMER_NAME.to_string()),
                ack_policy: AckPolicy::Explicit,
                ..Default::default()
            },
        )
        .await
        .map_err(|e| AppError::Transport(format!("jetstream consumer: {e}")))
}

/// Production [`JobQueue`] over a JetStream context.
pub struct JetStreamQueue {
    context: jetstream::Context,
}

impl JetStreamQueue {
    pub fn new(context: jetstream::Context) -> Self {
        Self { context }
    }
}

#[async_trait]
impl JobQueue for JetStreamQueue {
    async fn submit(&self, job: &IngestionJob) -> Result<()> {
        let payload = serde_json::to_vec(job)?;
        self.context
            .publish(SUBJECT, payload.into())
            .await
            .map_err(|e| AppError::Transport(format!("publish: {e}")))?
            .await
            .map_err(|e| AppError::Transport(format!("publish ack: {e}")))?;

        metrics::JOBS_SUBMITTED_TOTAL.inc();
        info!(req_id = %job.req_id, user_id = %job.user_id, "job queued");
        Ok(())
    }
}

// =============================================================================
// DELIVERY PROTOCOL
// =============================================================================

/// What the worker tells the broker about a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Done, remove from the stream.
    Ack,
    /// Do not redeliver. Used for undecodable payloads and pipeline
    /// failures; promoting transient failures to redelivery needs an
    /// error classification pass first.
    // TODO: classify AppError::Transient pipeline failures as retriable
    // and Nak them instead once redelivery caps are configured.
    Term,
}

/// Run one delivery through the pipeline and decide its fate.
///
/// Status bookkeeping on the idempotency record is best-effort: a
/// failure to update it never changes the disposition.
pub async fn process_delivery(
    pipeline: &MemoryPipeline,
    cache: &dyn IdentityCache,
    payload: &[u8],
) -> Disposition {
    let job: IngestionJob = match serde_json::from_slice(payload) {
        Ok(job) => job,
        Err(err) => {
            error!("undecodable job payload, terminating delivery: {err}");
            metrics::JOBS_PROCESSED_TOTAL
                .with_label_values(&["malformed"])
                .inc();
            return Disposition::Term;
        }
    };

    if let Err(err) = cache
        .change_req_status(&job.req_id, "", ReqStatus::Processing)
        .await
    {
        warn!(req_id = %job.req_id, "could not mark request processing: {}", err.message());
    }

    let result = tokio::time::timeout(PIPELINE_DEADLINE, pipeline.ingest(&job))
        .await
        .unwrap_or_else(|_| Err(AppError::Timeout("pipeline deadline".to_string())));

    match result {
        Ok(outcome) => {
            let label = match outcome {
                IngestOutcome::Skipped => "skip",
                IngestOutcome::Applied => "success",
            };
            metrics::JOBS_PROCESSED_TOTAL.with_label_values(&[label]).inc();
            if let Err(err) = cache
                .change_req_status(&job.req_id, "", ReqStatus::Success)
                .await
            {
                warn!(req_id = %job.req_id, "could not mark request success: {}", err.message());
            }
            Disposition::Ack
        }
        Err(err) => {
            error!(
                req_id = %job.req_id,
                user_id = %job.user_id,
                "pipeline failed, terminating delivery: {}",
                err.message()
            );
            metrics::JOBS_PROCESSED_TOTAL
                .with_label_values(&["failure"])
                .inc();
            if let Err(status_err) = cache
                .change_req_status(&job.req_id, err.code(), ReqStatus::Failure)
                .await
            {
                warn!(req_id = %job.req_id, "could not mark request failure: {}", status_err.message());
            }
            Disposition::Term
        }
    }
}

// =============================================================================
// IN-FLIGHT ACCOUNTING
// =============================================================================

/// Counts jobs between dispatch and ack/terminate.
#[derive(Clone, Default)]
pub struct JobTracker {
    active: Arc<AtomicI64>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dispatched job; the guard releases it on drop, so the
    /// count stays correct on every exit path.
    pub fn track(&self) -> JobGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        metrics::ACTIVE_JOBS.inc();
        JobGuard {
            active: Arc::clone(&self.active),
        }
    }

    pub fn active_jobs(&self) -> i64 {
        self.active.load(Ordering::SeqCst)
    }
}

pub struct JobGuard {
    active: Arc<AtomicI64>,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        metrics::ACTIVE_JOBS.dec();
    }
}

// =============================================================================
// WORKER POOL
// =============================================================================

/// N workers sharing one durable pull consumer.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    tracker: JobTracker,
}

impl WorkerPool {
    /// Spawn the workers. They stop pulling new deliveries once
    /// `shutdown` fires but always finish the delivery in hand.
    pub fn start(
        worker_count: usize,
        consumer: PullConsumer,
        pipeline: Arc<MemoryPipeline>,
        cache: Arc<dyn IdentityCache>,
        shutdown: CancellationToken,
    ) -> Self {
        let tracker = JobTracker::new();
        let handles = (0..worker_count)
            .map(|worker_id| {
                let consumer = consumer.clone();
                let pipeline = Arc::clone(&pipeline);
                let cache = Arc::clone(&cache);
                let shutdown = shutdown.clone();
                let tracker = tracker.clone();
                tokio::spawn(async move {
                    worker_loop(worker_id, consumer, pipeline, cache, shutdown, tracker).await;
                })
            })
            .collect();

        Self { handles, tracker }
    }

    pub fn tracker(&self) -> JobTracker {
        self.tracker.clone()
    }

    /// Wait for the workers to finish their in-flight jobs. The grace
    /// window bounds the wait; overrunning it is reported, not
    /// prevented.
    pub async fn drain(self, grace: Duration) {
        info!(
            active = self.tracker.active_jobs(),
            "draining ingestion workers"
        );

        let deadline = tokio::time::Instant::now() + grace;
        for handle in self.handles {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, handle).await.is_err() {
                warn!("worker did not stop within the drain window");
            }
        }

        let leftover = self.tracker.active_jobs();
        if leftover == 0 {
            info!("worker pool drained");
        } else {
            warn!(leftover, "drain window elapsed with jobs still in flight");
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    consumer: PullConsumer,
    pipeline: Arc<MemoryPipeline>,
    cache: Arc<dyn IdentityCache>,
    shutdown: CancellationToken,
    tracker: JobTracker,
) {
    info!(worker_id, "ingestion worker up");

    let mut messages = match consumer.messages().await {
        Ok(stream) => stream,
        Err(err) => {
            error!(worker_id, "could not open delivery stream: {err}");
            return;
        }
    };

    loop {
        let delivery = tokio::select! {
            _ = shutdown.cancelled() => {
                info!(worker_id, "shutdown signal, no longer accepting deliveries");
                break;
            }
            next = messages.next() => next,
        };

        let message = match delivery {
            Some(Ok(message)) => message,
            Some(Err(err)) => {
                warn!(worker_id, "delivery stream error: {err}");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
            None => {
                warn!(worker_id, "delivery stream closed");
                break;
            }
        };

        // Dispatched: counted until ack/terminate completes.
        let guard = tracker.track();
        let disposition = process_delivery(&pipeline, cache.as_ref(), &message.payload).await;

        match disposition {
            Disposition::Ack => {
                if let Err(err) = message.ack().await {
                    // The broker will redeliver; the pipeline's
                    // content-addressed inserts make that safe.
                    warn!(worker_id, "ack failed, job will be redelivered: {err}");
                }
            }
            Disposition::Term => {
                if let Err(err) = message.ack_with(AckKind::Term).await {
                    warn!(worker_id, "terminate failed: {err}");
                }
            }
        }
        drop(guard);
    }

    info!(worker_id, "ingestion worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_counts_between_dispatch_and_release() {
        let tracker = JobTracker::new();
        assert_eq!(tracker.active_jobs(), 0);

        let a = tracker.track();
        let b = tracker.track();
        assert_eq!(tracker.active_jobs(), 2);

        drop(a);
        assert_eq!(tracker.active_jobs(), 1);
        drop(b);
        assert_eq!(tracker.active_jobs(), 0);
    }

    #[test]
    fn tracker_releases_on_panic_unwind() {
        let tracker = JobTracker::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = tracker.track();
            panic!("worker blew up");
        }));
        assert!(result.is_err());
        assert_eq!(tracker.active_jobs(), 0);
    }
}
