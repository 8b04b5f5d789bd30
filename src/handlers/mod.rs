//! HTTP API handlers.
//!
//! Thin layer over the pipeline: request parsing, defaults, and status
//! mapping live here; all memory semantics live in [`crate::pipeline`].

pub mod health;
pub mod memory;
pub mod router;
pub mod state;

pub use router::build_router;
pub use state::{AppState, ServiceState};
