//! Purchase notification webhook.
//!
//! The payment provider posts either a flat `{"email", "status"}` body or
//! its nested event shape with `data.buyer.email` and
//! `data.purchase.status`. Flat fields win when both are present.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use cartback_core::models::LeadEmail;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use super::{create_error_response, parse_body};
use crate::AppState;

/// Webhook body in either accepted shape.
#[derive(Debug, Default, Deserialize)]
pub struct PurchaseNotification {
    /// Buyer email (flat shape)
    #[serde(default)]
    pub email: Option<String>,
    /// Purchase status (flat shape)
    #[serde(default)]
    pub status: Option<String>,
    /// Provider event payload (nested shape)
    #[serde(default)]
    pub data: Option<PurchaseData>,
}

/// Nested provider payload.
#[derive(Debug, Default, Deserialize)]
pub struct PurchaseData {
    /// Buyer details
    #[serde(default)]
    pub buyer: Option<Buyer>,
    /// Purchase details
    #[serde(default)]
    pub purchase: Option<Purchase>,
}

/// Buyer section of the nested payload.
#[derive(Debug, Default, Deserialize)]
pub struct Buyer {
    /// Buyer email
    #[serde(default)]
    pub email: Option<String>,
}

/// Purchase section of the nested payload.
#[derive(Debug, Default, Deserialize)]
pub struct Purchase {
    /// Purchase status, e.g. `APPROVED`
    #[serde(default)]
    pub status: Option<String>,
}

impl PurchaseNotification {
    /// Buyer email from whichever shape carries it.
    pub fn email(&self) -> Option<&str> {
        self.email.as_deref().or_else(|| {
            self.data.as_ref()?.buyer.as_ref()?.email.as_deref()
        })
    }

    /// Purchase status from whichever shape carries it.
    pub fn status(&self) -> Option<&str> {
        self.status.as_deref().or_else(|| {
            self.data.as_ref()?.purchase.as_ref()?.status.as_deref()
        })
    }
}

/// Response from an accepted purchase notification.
#[derive(Debug, Serialize)]
pub struct PurchaseResponse {
    /// Buyer email
    pub email: LeadEmail,
    /// Always `purchased`
    pub status: &'static str,
    /// Whether a captured lead matched the email
    pub lead_found: bool,
}

/// Records an approved purchase, stopping any pending reminders.
///
/// # Errors
///
/// Returns appropriate HTTP status codes:
/// - 400: Missing fields, malformed email or a status other than `APPROVED`
/// - 500: Store errors
#[instrument(name = "purchase_webhook", skip(state, body), fields(content_length = body.len()))]
pub async fn purchase_webhook(State(state): State<AppState>, body: Bytes) -> Response {
    let notification: PurchaseNotification = match parse_body(&body) {
        Ok(notification) => notification,
        Err(e) => {
            warn!(error = %e, "Rejected purchase webhook");
            return create_error_response(&e);
        },
    };

    let email = notification.email().unwrap_or_default();
    let status = notification.status().unwrap_or_default();

    match state.engine.on_purchase_webhook(email, status).await {
        Ok(recorded) => {
            info!(email = %recorded.email, lead_found = recorded.lead_found, "Purchase webhook applied");
            (
                StatusCode::OK,
                Json(PurchaseResponse {
                    email: recorded.email,
                    status: "purchased",
                    lead_found: recorded.lead_found,
                }),
            )
                .into_response()
        },
        Err(e) => {
            warn!(error = %e, code = e.code(), "Purchase webhook rejected");
            create_error_response(&e)
        },
    }
}
