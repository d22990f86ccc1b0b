//! `/v1/requests` handlers: enqueue and poll.

use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;

use stratum_core::{FinishReason, Request, RequestId};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub req_id: u64,
}

/// `POST /v1/requests` — admits the request and returns immediately; the
/// caller polls `GET /v1/requests/{req_id}` for the result.
pub async fn enqueue(
    State(state): State<AppState>,
    Json(req): Json<Request>,
) -> Result<Json<EnqueueResponse>, ApiError> {
    let (req_id, rx) = state.manager.enqueue(req)?;

    let outcomes = state.outcomes.clone();
    tokio::task::spawn_blocking(move || {
        if let Ok(outcome) = rx.recv() {
            outcomes.lock().unwrap().insert(req_id, outcome);
        }
    });

    Ok(Json(EnqueueResponse { req_id: req_id.0 }))
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StatusResponse {
    Pending,
    Finished {
        finish_reason: FinishReason,
        output_tokens: Vec<i32>,
        error: Option<String>,
    },
}

/// `GET /v1/requests/{req_id}` — reports `pending` until the notifier bridge
/// has filed an outcome, then the terminal `finish_reason`/tokens/error.
pub async fn poll(
    State(state): State<AppState>,
    Path(req_id): Path<u64>,
) -> Json<StatusResponse> {
    let outcomes = state.outcomes.lock().unwrap();
    match outcomes.get(&RequestId(req_id)) {
        Some(outcome) => Json(StatusResponse::Finished {
            finish_reason: outcome.finish_reason,
            output_tokens: outcome.output_tokens.clone(),
            error: outcome.error.clone(),
        }),
        None => Json(StatusResponse::Pending),
    }
}
