//! Client-facing error taxonomy of the dispatch pipeline.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::proxy::correlation::CORRELATION_HEADER;

/// Terminal outcome of a pipeline stage. Each variant maps to one row of the
/// gateway's status table.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("No service configured for endpoint: {0}")]
    ServiceNotFound(String),

    #[error("The {0} service is currently not available")]
    ServiceDisabled(String),

    #[error("Authorization header with Bearer token required")]
    MissingAuthorization,

    #[error("Token is invalid or expired")]
    InvalidToken,

    #[error("The {0} service is currently unavailable")]
    ServiceUnhealthy(String),

    #[error("Unable to connect to service")]
    UpstreamConnect(String),

    #[error("The request timed out")]
    UpstreamTimeout(String),

    #[error("Maximum {limit} requests per minute allowed")]
    RateLimited { limit: u64, retry_after_secs: u64 },

    #[error("Request body could not be read")]
    InvalidBody(String),

    #[error("An unexpected error occurred")]
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::ServiceNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::ServiceDisabled(_)
            | GatewayError::ServiceUnhealthy(_)
            | GatewayError::UpstreamConnect(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::MissingAuthorization | GatewayError::InvalidToken => {
                StatusCode::UNAUTHORIZED
            }
            GatewayError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::InvalidBody(_) => StatusCode::BAD_REQUEST,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short, stable value of the `error` field.
    pub fn title(&self) -> &'static str {
        match self {
            GatewayError::ServiceNotFound(_) => "Service not found",
            GatewayError::ServiceDisabled(_) => "Service not available",
            GatewayError::MissingAuthorization => "Missing authorization",
            GatewayError::InvalidToken => "Invalid token",
            GatewayError::ServiceUnhealthy(_) => "Service unhealthy",
            GatewayError::UpstreamConnect(_) => "Service connection failed",
            GatewayError::UpstreamTimeout(_) => "Service timeout",
            GatewayError::RateLimited { .. } => "Rate limit exceeded",
            GatewayError::InvalidBody(_) => "Bad request",
            GatewayError::Internal(_) => "Internal server error",
        }
    }

    /// Attach the correlation id so the error can be rendered.
    pub fn with_request_id(self, request_id: impl Into<String>) -> ErrorResponse {
        ErrorResponse {
            error: self,
            request_id: request_id.into(),
        }
    }
}

/// A [`GatewayError`] bound to the request it terminated.
#[derive(Debug)]
pub struct ErrorResponse {
    pub error: GatewayError,
    pub request_id: String,
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        let status = self.error.status();
        let mut body = json!({
            "error": self.error.title(),
            "message": self.error.to_string(),
            "request_id": self.request_id,
        });

        let retry_after = match self.error {
            GatewayError::RateLimited {
                retry_after_secs, ..
            } => {
                body["retry_after"] = json!(retry_after_secs);
                Some(retry_after_secs)
            }
            _ => None,
        };

        let mut response = (status, Json(body)).into_response();
        let headers = response.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&self.request_id) {
            headers.insert(CORRELATION_HEADER, value);
        }
        if let Some(secs) = retry_after {
            headers.insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
