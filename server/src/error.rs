//! Mapping of the core error taxonomy onto HTTP responses.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use uttar_rag::RagError;

pub struct ApiError(pub RagError);

impl From<RagError> for ApiError {
    fn from(e: RagError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self.0 {
            RagError::Validation(msg) => error_response(StatusCode::BAD_REQUEST, "validation", &msg),
            RagError::NotFound(msg) => error_response(StatusCode::NOT_FOUND, "not_found", &msg),
            RagError::Conflict(msg) => error_response(StatusCode::CONFLICT, "conflict", &msg),
            RagError::Transient(msg) => {
                let mut response =
                    error_response(StatusCode::SERVICE_UNAVAILABLE, "transient", &msg);
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, header::HeaderValue::from_static("2"));
                response
            }
            RagError::Permanent(msg) => {
                error_response(StatusCode::UNPROCESSABLE_ENTITY, "permanent", &msg)
            }
            RagError::Cancelled => error_response(StatusCode::BAD_REQUEST, "cancelled", "cancelled"),
            RagError::Internal(msg) => {
                // Opaque to the client; the correlation id links to the log line.
                let correlation_id = uuid::Uuid::new_v4();
                tracing::error!(%correlation_id, error = %msg, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({
                        "error": "internal",
                        "message": "internal error",
                        "correlation_id": correlation_id,
                    })),
                )
                    .into_response()
            }
        }
    }
}

fn error_response(status: StatusCode, kind: &str, message: &str) -> Response {
    (
        status,
        Json(json!({ "error": kind, "message": message })),
    )
        .into_response()
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
