//! Crate-wide error type and its HTTP mapping.
//!
//! Components return [`ApiError`] kinds; the HTTP surface relies on the
//! `IntoResponse` impl to turn them into a status code plus a JSON
//! `{"detail": …}` body. Internal causes are logged, never returned.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::error;

/// Error kinds surfaced by the service components.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Malformed facet, time range, bbox or pagination input (422).
    #[error("{0}")]
    InvalidInput(String),
    /// Missing or invalid bearer token (401).
    #[error("{0}")]
    Unauthenticated(String),
    /// Authenticated but not authorised (403).
    #[error("{0}")]
    Forbidden(String),
    /// Addressed resource does not exist (404).
    #[error("{0}")]
    NotFound(String),
    /// Uniqueness violation, e.g. a flavour name collision (409).
    #[error("{0}")]
    Conflict(String),
    /// Attempt to modify a built-in entity (422).
    #[error("{0}")]
    Immutable(String),
    /// Upstream timeout or connection failure after retries (503).
    #[error("{0}")]
    BackendUnavailable(String),
    /// Anything unexpected (500). The cause is logged, the client only sees
    /// a generic message.
    #[error("internal server error")]
    Internal(anyhow::Error),
}

impl ApiError {
    /// HTTP status for this kind.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) | Self::Immutable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Shorthand used by backend clients when a request failed for reasons
    /// the caller cannot fix.
    pub fn internal<E: Into<anyhow::Error>>(err: E) -> Self {
        Self::Internal(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::Internal(ref cause) = self {
            error!("internal error: {cause:#}");
        }
        let status = self.status();
        let body = Json(serde_json::json!({ "detail": self.to_string() }));
        (status, body).into_response()
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            Self::BackendUnavailable(format!("upstream unreachable: {err}"))
        } else {
            Self::internal(err)
        }
    }
}

/// Convenience alias used throughout the crate.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_the_documented_status_codes() {
        let cases = [
            (ApiError::InvalidInput("x".into()), 422),
            (ApiError::Unauthenticated("x".into()), 401),
            (ApiError::Forbidden("x".into()), 403),
            (ApiError::NotFound("x".into()), 404),
            (ApiError::Conflict("x".into()), 409),
            (ApiError::Immutable("x".into()), 422),
            (ApiError::BackendUnavailable("x".into()), 503),
            (ApiError::Internal(anyhow::anyhow!("boom")), 500),
        ];
        for (err, code) in cases {
            assert_eq!(err.status().as_u16(), code);
        }
    }

    #[test]
    fn internal_errors_do_not_leak_their_cause() {
        let err = ApiError::Internal(anyhow::anyhow!("mongo password wrong"));
        assert_eq!(err.to_string(), "internal server error");
    }
}
