//! cortex-memory server entry point.
//!
//! Wires the process-wide collaborator clients together, starts the
//! worker pool and the HTTP front door, and tears everything down in
//! reverse order on shutdown: HTTP stops accepting first, the worker
//! pool drains its in-flight jobs, and the telemetry exporter is
//! flushed last.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tracing::{error, info, warn};

use cortex_memory::{
    audit::{AuditStore, LogAuditStore, PostgresAuditStore},
    config::ServerConfig,
    embed::GrpcEmbeddingClient,
    handlers::{self, ServiceState},
    identity_cache::RedisIdentityCache,
    llm::GeminiClient,
    metrics, middleware,
    pipeline::MemoryPipeline,
    queue::{self, JetStreamQueue, WorkerPool},
    vector_index::QdrantIndex,
};

#[cfg(feature = "telemetry")]
use cortex_memory::tracing_setup;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    #[cfg(feature = "telemetry")]
    {
        tracing_setup::init_tracing().expect("Failed to initialize tracing");
    }
    #[cfg(not(feature = "telemetry"))]
    {
        if std::env::var("RUST_LOG").is_err() {
            std::env::set_var("RUST_LOG", "cortex_memory=info,tower_http=warn");
        }
        tracing_subscriber::fmt::init();
    }

    print_banner();

    metrics::register_metrics().expect("Failed to register metrics");

    let config = ServerConfig::from_env();
    config.log();

    // =========================================================================
    // Collaborator clients (process lifetime, torn down in reverse)
    // =========================================================================

    let vector = Arc::new(
        QdrantIndex::connect(&config.qdrant_url)
            .await
            .context("qdrant init")?,
    );

    let cache = Arc::new(
        RedisIdentityCache::connect(&config.redis_url)
            .await
            .context("redis init")?,
    );

    let embedder = Arc::new(
        GrpcEmbeddingClient::connect(&config.embedding_url)
            .await
            .context("embedding service init")?,
    );

    let llm = Arc::new(GeminiClient::new(
        &config.gemini_base_url,
        &config.gemini_model,
        &config.gemini_api_key,
    ));

    let audit: Arc<dyn AuditStore> = match &config.database_url {
        Some(url) => Arc::new(
            PostgresAuditStore::connect(url)
                .await
                .context("audit store init")?,
        ),
        None => {
            info!("DATABASE_URL not set, audit rows go to the log");
            Arc::new(LogAuditStore)
        }
    };

    let nats = async_nats::connect(&config.nats_url)
        .await
        .context("nats connect")?;
    let jetstream = async_nats::jetstream::new(nats);
    let stream = queue::ensure_stream(&jetstream, config.durable_stream)
        .await
        .context("jetstream stream init")?;
    let consumer = queue::ensure_consumer(&stream)
        .await
        .context("jetstream consumer init")?;

    // =========================================================================
    // Pipeline and worker pool
    // =========================================================================

    let pipeline = Arc::new(MemoryPipeline::new(
        vector,
        cache.clone(),
        embedder,
        llm,
    ));

    let shutdown = CancellationToken::new();
    let pool = WorkerPool::start(
        config.worker_count,
        consumer,
        Arc::clone(&pipeline),
        cache.clone(),
        shutdown.clone(),
    );

    // =========================================================================
    // HTTP front door
    // =========================================================================

    let state = Arc::new(ServiceState {
        pipeline,
        queue: Arc::new(JetStreamQueue::new(jetstream)),
        cache,
        audit,
        tracker: pool.tracker(),
        config: config.clone(),
    });

    let app = handlers::build_router(state).layer(
        ServiceBuilder::new()
            .layer(axum::middleware::from_fn(middleware::track_metrics))
            .layer(tower::limit::ConcurrencyLimitLayer::new(200))
            .layer(tower_http::cors::CorsLayer::permissive()),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;

    info!("Server ready on http://{addr}");

    // SIGINT/SIGTERM fires the token; the server then stops accepting
    // and finishes its in-flight requests.
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        signal_token.cancel();
    });

    let http_shutdown = shutdown.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                http_shutdown.cancelled().await;
            })
            .await
    });

    // =========================================================================
    // Ordered teardown: HTTP, then workers, then telemetry
    // =========================================================================

    tokio::select! {
        result = &mut server => {
            match result {
                Ok(Err(e)) => error!("Server error: {e}"),
                Err(e) => error!("Server task failed: {e}"),
                Ok(Ok(())) => {}
            }
            shutdown.cancel();
        }
        _ = shutdown.cancelled() => {
            if tokio::time::timeout(Duration::from_secs(config.http_grace_secs), &mut server)
                .await
                .is_err()
            {
                warn!("HTTP connections still open after the grace window, moving on");
                server.abort();
            }
        }
    }

    pool.drain(Duration::from_secs(config.drain_grace_secs)).await;

    #[cfg(feature = "telemetry")]
    tracing_setup::shutdown_tracing();

    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn print_banner() {
    eprintln!();
    eprintln!("  ============================================");
    eprintln!(
        "   cortex-memory v{}",
        env!("CARGO_PKG_VERSION")
    );
    eprintln!("   Long-term memory for conversational agents");
    eprintln!("  ============================================");
    eprintln!();
}
