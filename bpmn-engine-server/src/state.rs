//! Shared application state handed to every route handler. Grounded on the
//! teacher's `ob-poc-web/src/state.rs` pattern: one small `Clone` struct
//! wrapping the `Arc`s the handlers need, injected via axum's `State`
//! extractor rather than thread-locals or globals.

use std::sync::Arc;

use bpmn_engine_core::scheduler::Engine;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}
