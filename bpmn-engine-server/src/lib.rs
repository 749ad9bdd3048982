//! Library half of the HTTP server, split out from `main.rs` so
//! `tests/integration.rs` can build the same router in-process (grounded on
//! the teacher's own src/lib.rs + src/main.rs split, which exists for the
//! identical reason: its `tests/` directory exercises the gRPC service
//! without a bound socket).

pub mod error;
pub mod routes;
pub mod state;

use std::sync::Arc;

use bpmn_engine_core::scheduler::Engine;

use crate::state::AppState;

/// Build the full axum [`axum::Router`] for a given engine, without binding
/// a socket or installing tracing/CORS layers (the binary entry point in
/// `main.rs` adds those around this).
pub fn build_router(engine: Arc<Engine>) -> axum::Router {
    routes::router(AppState { engine })
}
