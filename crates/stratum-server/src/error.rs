//! API error handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// API error type
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: msg.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.message,
                "code": self.status.as_u16()
            }
        }));
        (self.status, body).into_response()
    }
}

impl From<stratum_core::Error> for ApiError {
    fn from(err: stratum_core::Error) -> Self {
        use stratum_core::Error::*;
        match &err {
            ExceedCapacity { .. } | ExceedLength { .. } | InvalidArgument(_) => {
                ApiError::bad_request(err.to_string())
            }
            OutOfDeviceMemory { .. } | InsufficientHostMemory { .. } => {
                ApiError::unavailable(err.to_string())
            }
            Unimplemented(_) | DeviceError { .. } | Stopped => ApiError::internal(err.to_string()),
        }
    }
}
