//! Lead capture from the checkout form.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use cartback_core::models::{LeadEmail, LeadStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use super::{create_error_response, parse_body};
use crate::AppState;

/// Request body for lead capture.
#[derive(Debug, Deserialize)]
pub struct CaptureRequest {
    /// Address typed into the form
    #[serde(default)]
    pub email: Option<String>,
}

/// Response from a successful capture.
#[derive(Debug, Serialize)]
pub struct CaptureResponse {
    /// Normalized email
    pub email: LeadEmail,
    /// Always `initiated`
    pub status: LeadStatus,
    /// When the purchase check is due
    pub verification_at: DateTime<Utc>,
}

/// Captures an email and schedules its purchase check.
///
/// # Errors
///
/// Returns appropriate HTTP status codes:
/// - 400: Missing, malformed or already captured email
/// - 500: Store errors
#[instrument(name = "capture_email", skip(state, body), fields(content_length = body.len()))]
pub async fn capture_email(State(state): State<AppState>, body: Bytes) -> Response {
    let request: CaptureRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Rejected capture request");
            return create_error_response(&e);
        },
    };

    let email = request.email.unwrap_or_default();
    match state.engine.capture_email(&email).await {
        Ok(created) => {
            info!(email = %created.email, verification_at = %created.verification_at, "Lead captured");
            (
                StatusCode::OK,
                Json(CaptureResponse {
                    email: created.email,
                    status: created.status,
                    verification_at: created.verification_at,
                }),
            )
                .into_response()
        },
        Err(e) => {
            warn!(error = %e, code = e.code(), "Capture failed");
            create_error_response(&e)
        },
    }
}
