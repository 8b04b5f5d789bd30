//! Configuration management for cortex-memory.
//!
//! All configurable parameters in one place with environment variable
//! overrides. Sensible defaults for local development; everything is
//! overridable in production.

use std::env;
use tracing::info;

/// Server configuration loaded from environment with defaults.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP listen port (default: 9000)
    pub port: u16,

    /// Qdrant gRPC endpoint (default: http://127.0.0.1:6334)
    pub qdrant_url: String,

    /// Redis endpoint for the identity cache (default: redis://127.0.0.1:6379)
    pub redis_url: String,

    /// NATS endpoint for the job stream (default: nats://127.0.0.1:4222)
    pub nats_url: String,

    /// Embedding gRPC service endpoint (default: http://127.0.0.1:50051)
    pub embedding_url: String,

    /// Postgres URL for the insertion-request audit store (optional;
    /// audit rows are logged instead when unset)
    pub database_url: Option<String>,

    /// Gemini API key (GEMINI_API_KEY)
    pub gemini_api_key: String,

    /// Gemini model id (default: gemini-2.0-flash)
    pub gemini_model: String,

    /// Gemini API base URL
    pub gemini_base_url: String,

    /// Number of ingestion workers sharing the queue group (default: 2)
    pub worker_count: usize,

    /// Similarity threshold used when fetching existing memories during
    /// ingestion (default: 0.6)
    pub insert_threshold: f32,

    /// Default similarity threshold for the retrieval API (default: 0.65)
    pub retrieve_threshold: f32,

    /// Persist the job stream to file storage (prod) instead of memory (dev)
    pub durable_stream: bool,

    /// Grace given to in-flight HTTP requests on shutdown (default: 5s)
    pub http_grace_secs: u64,

    /// Bound on the worker-drain window after HTTP shutdown (default: 30s)
    pub drain_grace_secs: u64,

    /// Whether running in production mode
    pub is_production: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 9000,
            qdrant_url: "http://127.0.0.1:6334".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            nats_url: "nats://127.0.0.1:4222".to_string(),
            embedding_url: "http://127.0.0.1:50051".to_string(),
            database_url: None,
            gemini_api_key: String::new(),
            gemini_model: "gemini-2.0-flash".to_string(),
            gemini_base_url: "https://generativelanguage.googleapis.com".to_string(),
            worker_count: 2,
            insert_threshold: 0.6,
            retrieve_threshold: 0.65,
            durable_stream: false,
            http_grace_secs: 5,
            drain_grace_secs: 30,
            is_production: false,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    #[allow(clippy::field_reassign_with_default)] // Environment overrides require mutable config
    pub fn from_env() -> Self {
        let mut config = Self::default();

        config.is_production = env::var("CORTEX_ENV")
            .map(|v| {
                let v = v.to_lowercase();
                v == "production" || v == "prod"
            })
            .unwrap_or(false);

        // Production defaults to a file-backed stream so queued jobs
        // survive a restart.
        config.durable_stream = config.is_production;

        if let Ok(val) = env::var("CORTEX_PORT") {
            if let Ok(port) = val.parse() {
                config.port = port;
            }
        }

        if let Ok(val) = env::var("CORTEX_QDRANT_URL") {
            config.qdrant_url = val;
        }

        if let Ok(val) = env::var("CORTEX_REDIS_URL") {
            config.redis_url = val;
        }

        if let Ok(val) = env::var("CORTEX_NATS_URL") {
            config.nats_url = val;
        }

        if let Ok(val) = env::var("CORTEX_EMBEDDING_URL") {
            config.embedding_url = val;
        }

        if let Ok(val) = env::var("DATABASE_URL") {
            if !val.is_empty() {
                config.database_url = Some(val);
            }
        }

        if let Ok(val) = env::var("GEMINI_API_KEY") {
            config.gemini_api_key = val;
        }

        if let Ok(val) = env::var("CORTEX_GEMINI_MODEL") {
            config.gemini_model = val;
        }

        if let Ok(val) = env::var("CORTEX_GEMINI_BASE_URL") {
            config.gemini_base_url = val;
        }

        if let Ok(val) = env::var("CORTEX_WORKERS") {
            if let Ok(n) = val.parse::<usize>() {
                config.worker_count = n.max(1);
            }
        }

        if let Ok(val) = env::var("CORTEX_INSERT_THRESHOLD") {
            if let Ok(n) = val.parse() {
                config.insert_threshold = n;
            }
        }

        if let Ok(val) = env::var("CORTEX_RETRIEVE_THRESHOLD") {
            if let Ok(n) = val.parse() {
                config.retrieve_threshold = n;
            }
        }

        if let Ok(val) = env::var("CORTEX_DURABLE_STREAM") {
            config.durable_stream = val.to_lowercase() == "true" || val == "1";
        }

        if let Ok(val) = env::var("CORTEX_HTTP_GRACE_SECS") {
            if let Ok(n) = val.parse() {
                config.http_grace_secs = n;
            }
        }

        if let Ok(val) = env::var("CORTEX_DRAIN_GRACE_SECS") {
            if let Ok(n) = val.parse() {
                config.drain_grace_secs = n;
            }
        }

        config
    }

    /// Log the current configuration. Secrets are not echoed.
    pub fn log(&self) {
        info!("Configuration:");
        info!(
            "   Mode:       {}",
            if self.is_production {
                "PRODUCTION"
            } else {
                "Development"
            }
        );
        info!("   Port:       {}", self.port);
        info!("   Qdrant:     {}", self.qdrant_url);
        info!("   Redis:      {}", self.redis_url);
        info!("   NATS:       {}", self.nats_url);
        info!("   Embeddings: {}", self.embedding_url);
        info!(
            "   Audit:      {}",
            if self.database_url.is_some() {
                "postgres"
            } else {
                "log-only"
            }
        );
        info!("   Model:      {}", self.gemini_model);
        info!(
            "   Workers:    {} (stream: {})",
            self.worker_count,
            if self.durable_stream { "file" } else { "memory" }
        );
        info!(
            "   Thresholds: insert {:.2}, retrieve {:.2}",
            self.insert_threshold, self.retrieve_threshold
        );
    }
}
