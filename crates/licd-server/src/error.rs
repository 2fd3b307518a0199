//! Activation outcomes that reach the caller.

use std::time::Duration;

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Every failure of an activation or deactivation request.
///
/// `NotFound`, `Conflict`, `Mismatch` and `InvalidRequest` are permanent.
/// `Timeout`, `StoreUnavailable` and `Contended` are transient and safe to
/// retry with backoff.
#[derive(Debug, Error)]
pub enum ActivationError {
    #[error("License not found")]
    NotFound,

    #[error("License already used on another device")]
    Conflict,

    #[error("HWID mismatch")]
    Mismatch,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("store unavailable: {0:#}")]
    StoreUnavailable(anyhow::Error),

    #[error("license record is contended, retry later")]
    Contended,

    #[error("token signing failed: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),
}

pub type ActivationResult<T> = Result<T, ActivationError>;

impl ActivationError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::StoreUnavailable(_) | Self::Contended
        )
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict | Self::Mismatch => StatusCode::FORBIDDEN,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Timeout(_) | Self::StoreUnavailable(_) | Self::Contended => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Signing(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ActivationError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, transient = self.is_transient(), "activation failed");
        }
        // Internal details stay in the log.
        let message = match &self {
            Self::StoreUnavailable(_) | Self::Timeout(_) => "store unavailable, retry later".to_owned(),
            Self::Signing(_) => "internal server error".to_owned(),
            other => other.to_string(),
        };
        let body = Json(json!({ "error": message }));
        if self.is_transient() {
            (status, [(header::RETRY_AFTER, "1")], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}
