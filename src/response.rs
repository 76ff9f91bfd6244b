use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Success envelope shared by every endpoint. Failures use the same shape
/// with `success: false` (see `error.rs`).
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub message: String,
    pub data: Option<T>,
}

pub fn respond<T: Serialize>(
    status: StatusCode,
    message: impl Into<String>,
    data: Option<T>,
) -> Response {
    (
        status,
        Json(ApiResponse {
            success: true,
            message: message.into(),
            data,
        }),
    )
        .into_response()
}

/// Success with no payload.
pub fn respond_empty(status: StatusCode, message: impl Into<String>) -> Response {
    respond::<serde_json::Value>(status, message, None)
}
