//! Error → HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use crate::relay::RelayError;
use crate::session::SessionError;
use crate::upstream::UpstreamError;

fn error_response(status: StatusCode, message: String) -> Response {
    if status.is_server_error() {
        warn!(status = status.as_u16(), error = %message, "Request failed");
    }
    (status, message).into_response()
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Resolution(_) => StatusCode::BAD_REQUEST,
            Self::Launch(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::StreamFailure { .. } => StatusCode::BAD_GATEWAY,
            Self::Session(SessionError::NotFound { .. }) => StatusCode::NOT_FOUND,
            Self::Session(SessionError::CapacityExhausted { .. }) | Self::Cancelled => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        };
        error_response(status, self.to_string())
    }
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::CapacityExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
        };
        error_response(status, self.to_string())
    }
}

impl IntoResponse for UpstreamError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::NotConfigured(_) => StatusCode::NOT_FOUND,
            Self::Http(_) | Self::Status { .. } => StatusCode::BAD_GATEWAY,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        error_response(status, self.to_string())
    }
}
