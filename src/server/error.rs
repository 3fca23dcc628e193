use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::resolver::ResolutionFailure;

pub type AppResult<T> = Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    // origin answered with a non 2xx, the player gets the same status and nothing else
    #[error("upstream returned {0}")]
    Upstream(StatusCode),

    #[error("{0}")]
    BadGateway(String),

    #[error("{0}")]
    GatewayTimeout(String),

    #[error("{0}")]
    Conflict(String),

    #[error("no port available in {0}..{1}")]
    RelayUnavailable(u16, u16),

    #[error("internal server error")]
    InternalServerError,

    #[error("{0}")]
    InternalServerErrorWithContext(String),
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Upstream(status) => *status,
            Self::BadGateway(_) => StatusCode::BAD_GATEWAY,
            Self::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::RelayUnavailable(..) => StatusCode::SERVICE_UNAVAILABLE,
            Self::InternalServerError | Self::InternalServerErrorWithContext(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::GatewayTimeout(format!("upstream timed out: {}", e))
        } else {
            Self::BadGateway(format!("upstream request failed: {}", e))
        }
    }
}

impl From<ResolutionFailure> for Error {
    fn from(failure: ResolutionFailure) -> Self {
        match failure {
            ResolutionFailure::Timeout => Self::GatewayTimeout(failure.to_string()),
            ResolutionFailure::Superseded => Self::Conflict(failure.to_string()),
            ResolutionFailure::Browser(_)
            | ResolutionFailure::Network(_)
            | ResolutionFailure::Exhausted(_) => Self::BadGateway(failure.to_string()),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();

        match self {
            // passthrough, no body so the player only sees the status
            Self::Upstream(_) => status.into_response(),
            Self::InternalServerError | Self::InternalServerErrorWithContext(_) => {
                error!("internal error: {}", self);
                (status, Json(json!({ "error": "internal server error" }))).into_response()
            }
            other => (status, Json(json!({ "error": other.to_string() }))).into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_status_is_passed_through() {
        let response = Error::Upstream(StatusCode::FORBIDDEN).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn resolution_failures_map_to_gateway_statuses() {
        assert_eq!(
            Error::from(ResolutionFailure::Timeout).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            Error::from(ResolutionFailure::Superseded).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            Error::from(ResolutionFailure::Exhausted("x".into())).status(),
            StatusCode::BAD_GATEWAY
        );
    }
}
