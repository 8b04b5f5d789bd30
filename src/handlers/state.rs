//! Shared application state handed to every handler.

use crate::audit::AuditStore;
use crate::config::ServerConfig;
use crate::identity_cache::IdentityCache;
use crate::pipeline::MemoryPipeline;
use crate::queue::{JobQueue, JobTracker};
use std::sync::Arc;

/// Process-wide handles. Collaborator clients are created once at
/// startup; handlers and workers share them through here.
pub struct ServiceState {
    pub pipeline: Arc<MemoryPipeline>,
    pub queue: Arc<dyn JobQueue>,
    pub cache: Arc<dyn IdentityCache>,
    pub audit: Arc<dyn AuditStore>,
    pub tracker: JobTracker,
    pub config: ServerConfig,
}

/// Application state type alias.
pub type AppState = Arc<ServiceState>;
