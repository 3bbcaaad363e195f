//! Error types for the HTTP surface
//!
//! Core errors map to a status code plus `{success:false, error, reason}`.
//! `Invariant` surfaces as an opaque 500 after logging with full context.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;
use tracing::{debug, error, warn};

use shogun_core::CoreError;

#[derive(Error, Debug)]
#[error(transparent)]
pub struct ApiError(#[from] pub CoreError);

impl From<shogun_storage::StorageError> for ApiError {
    fn from(err: shogun_storage::StorageError) -> Self {
        Self(err.into())
    }
}

impl From<shogun_ipfs::IpfsError> for ApiError {
    fn from(err: shogun_ipfs::IpfsError) -> Self {
        Self(err.into())
    }
}

impl From<shogun_ledger::LedgerError> for ApiError {
    fn from(err: shogun_ledger::LedgerError) -> Self {
        Self(err.into())
    }
}

pub fn status_of(err: &CoreError) -> StatusCode {
    match err {
        CoreError::Malformed { .. } => StatusCode::BAD_REQUEST,
        CoreError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
        CoreError::PaymentRequired(_) | CoreError::PaymentInvalid(_) => {
            StatusCode::PAYMENT_REQUIRED
        }
        CoreError::Forbidden(_) | CoreError::QuotaExceeded(_) => StatusCode::FORBIDDEN,
        CoreError::NotFound(_) => StatusCode::NOT_FOUND,
        CoreError::Conflict(_) => StatusCode::CONFLICT,
        CoreError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        CoreError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
        CoreError::Transient(_) | CoreError::Disabled(_) => StatusCode::SERVICE_UNAVAILABLE,
        CoreError::Backend(_) | CoreError::Invariant { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status = status_of(&err);

        let message = match &err {
            // Never leak invariant details to the caller.
            CoreError::Invariant { component, detail } => {
                error!(component, detail, "invariant violated");
                "internal error".to_string()
            }
            other => {
                match other.log_level() {
                    tracing::Level::ERROR => error!(error = %other, "request failed"),
                    tracing::Level::WARN => warn!(error = %other, "request failed"),
                    _ => debug!(error = %other, "request failed"),
                }
                other.to_string()
            }
        };

        let body = serde_json::json!({
            "success": false,
            "error": message,
            "reason": err.reason(),
        });
        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;
