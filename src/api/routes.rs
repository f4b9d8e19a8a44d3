use axum::{
    routing::{get, post},
    Router,
};

use crate::api::handlers::{self, AppState};

pub fn create_router() -> Router<AppState> {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Branch queue
        .route("/branch-queue", get(handlers::list_queue_entries))
        .route("/branch-queue", post(handlers::enqueue_entry))
        .route("/branch-queue/:id", get(handlers::get_queue_entry))
}
