//! `/v1/metrics` handler: a point-in-time snapshot of pool occupancy.

use axum::extract::State;
use axum::Json;

use stratum_core::BlockManagerStats;

use crate::state::AppState;

/// `GET /v1/metrics` — device/host block pool occupancy per rank.
pub async fn metrics(State(state): State<AppState>) -> Json<BlockManagerStats> {
    Json(state.block_manager.stats())
}
