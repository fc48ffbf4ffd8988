//! HTTP request handlers for the cartback API.
//!
//! Handlers take the raw body as [`Bytes`] and parse it themselves, so a
//! malformed payload gets the same `{"error": {"code", "message"}}` body as
//! any other rejected request.
//!
//! - `capture` - lead capture form endpoint
//! - `purchase` - payment provider webhook
//! - `health` - liveness and readiness probes

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use cartback_recovery::RecoveryError;
use serde::{de::DeserializeOwned, Serialize};

pub mod capture;
pub mod health;
pub mod purchase;

pub use capture::capture_email;
pub use health::{health_check, liveness_check, readiness_check};
pub use purchase::purchase_webhook;

/// Error response with code and message.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error details including code and message
    pub error: ErrorDetail,
}

/// Detailed error information.
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    /// Stable error code (E1001-E9999)
    pub code: String,
    /// Human-readable error description
    pub message: String,
}

/// HTTP status for an engine error.
pub fn status_for(error: &RecoveryError) -> StatusCode {
    match error {
        RecoveryError::InvalidInput { .. }
        | RecoveryError::AlreadyCaptured { .. }
        | RecoveryError::PurchaseNotApproved { .. } => StatusCode::BAD_REQUEST,
        RecoveryError::VerifierUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        RecoveryError::Mailer { .. }
        | RecoveryError::Store { .. }
        | RecoveryError::Configuration { .. }
        | RecoveryError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn create_error_response(error: &RecoveryError) -> Response {
    let error_response = ErrorResponse {
        error: ErrorDetail { code: error.code().to_string(), message: error.to_string() },
    };

    (status_for(error), Json(error_response)).into_response()
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, RecoveryError> {
    if body.is_empty() {
        return Err(RecoveryError::invalid_input("request body is required"));
    }
    serde_json::from_slice(body)
        .map_err(|e| RecoveryError::invalid_input(format!("malformed JSON body: {e}")))
}
