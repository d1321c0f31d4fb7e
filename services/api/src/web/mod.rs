pub mod middleware;
pub mod rest;
pub mod state;

use axum::{
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;

pub use middleware::identify_caller;
pub use rest::{
    complete_session_handler, list_queue_handler, process_queue_handler,
    provider_callback_handler, start_session_handler,
};
use state::AppState;

/// Builds the API router. CORS and the Swagger UI are layered on by the binary.
pub fn build_router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/sessions", post(start_session_handler))
        .route("/sessions/{id}/complete", post(complete_session_handler))
        .route("/queue", get(list_queue_handler))
        .route("/queue/process", post(process_queue_handler))
        .route(
            "/api/callback/{user_id}/{session_id}/{timestamp}/{suffix}",
            post(provider_callback_handler),
        )
        .layer(axum_middleware::from_fn(identify_caller))
        .with_state(app_state)
}
