//! Route table: binds handlers to the app state and layers in CORS/tracing.

pub mod metrics;
pub mod requests;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/v1/requests", post(requests::enqueue))
        .route("/v1/requests/:req_id", get(requests::poll))
        .route("/v1/metrics", get(metrics::metrics))
        .with_state(state.clone());

    if state.cors_enabled {
        router = router.layer(CorsLayer::permissive());
    }

    router.layer(TraceLayer::new_for_http())
}
