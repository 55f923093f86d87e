use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};

use super::handlers::{self, AppState};

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/rebalance", post(handlers::start_rebalance))
        .route("/api/rebalance/:id", get(handlers::get_rebalance))
        .route(
            "/api/rebalance/:id/analysis-completed",
            post(handlers::analysis_completed),
        )
        .route(
            "/api/rebalance/:id/opportunity-completed",
            post(handlers::opportunity_completed),
        )
        .route("/api/rebalance/:id/retry", post(handlers::retry_rebalance))
        .route(
            "/api/rebalance/:id/complete",
            post(handlers::complete_rebalance),
        )
        .route("/api/rebalance/:id/cancel", post(handlers::cancel_rebalance))
        .route("/health", get(handlers::health))
        .with_state(state)
        .layer(cors)
}
