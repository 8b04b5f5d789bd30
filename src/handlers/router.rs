//! Route definitions.

use axum::{
    routing::{get, post},
    Router,
};

use super::memory;
use super::state::AppState;
use super::health;

/// Build the service router. Global layers (metrics tracking,
/// concurrency limits, CORS) are applied by the caller.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Write path
        .route("/add_memory", post(memory::add_memory))
        .route("/delete_memory/general", post(memory::delete_general_memory))
        .route("/delete_memory/core", post(memory::delete_core_memory))
        .route("/create_user", post(memory::create_user))
        // Read path
        .route("/get_memory", post(memory::get_memory))
        .route("/get_all/{id}", get(memory::get_all_memories))
        .route("/get_core/{id}", get(memory::get_core_memories))
        .route("/request_status/{req_id}", get(memory::get_request_status))
        // Infrastructure
        .route("/health", get(health::health))
        .route("/metrics", get(health::metrics_endpoint))
        .with_state(state)
}
