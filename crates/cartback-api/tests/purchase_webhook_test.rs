//! Purchase webhook endpoint tests.

mod common;

use axum::http::StatusCode;
use cartback_core::models::LeadStatus;
use cartback_recovery::ActionOutcome;
use common::{email, TestApp};

#[tokio::test]
async fn approved_flat_payload_marks_lead_purchased() {
    let app = TestApp::new();
    app.engine.capture_email("a@x.com").await.unwrap();

    let (status, body) =
        app.post_json("/compra-finalizada", r#"{"email":"a@x.com","status":"APPROVED"}"#).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "purchased");
    assert_eq!(body["lead_found"], true);
    assert_eq!(app.storage.lead_status(&email("a@x.com")).await, Some(LeadStatus::Purchased));
}

#[tokio::test]
async fn approved_nested_payload_marks_lead_purchased() {
    let app = TestApp::new();
    app.engine.capture_email("b@x.com").await.unwrap();

    let payload = r#"{
        "event": "PURCHASE_APPROVED",
        "data": {
            "buyer": { "email": "b@x.com" },
            "purchase": { "status": "APPROVED" }
        }
    }"#;
    let (status, _) = app.post_json("/compra-finalizada", payload).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(app.storage.lead_status(&email("b@x.com")).await, Some(LeadStatus::Purchased));
}

#[tokio::test]
async fn repeated_approval_is_idempotent() {
    let app = TestApp::new();
    app.engine.capture_email("a@x.com").await.unwrap();
    let payload = r#"{"email":"a@x.com","status":"APPROVED"}"#;

    let (first, _) = app.post_json("/compra-finalizada", payload).await;
    let (second, _) = app.post_json("/compra-finalizada", payload).await;

    assert_eq!(first, StatusCode::OK);
    assert_eq!(second, StatusCode::OK);
    assert_eq!(app.storage.lead_status(&email("a@x.com")).await, Some(LeadStatus::Purchased));
}

#[tokio::test]
async fn unapproved_status_leaves_lead_unchanged() {
    let app = TestApp::new();
    app.engine.capture_email("c@x.com").await.unwrap();

    for status in ["REFUNDED", "approved", "CANCELED"] {
        let payload = format!(r#"{{"email":"c@x.com","status":"{status}"}}"#);
        let (code, body) = app.post_json("/compra-finalizada", &payload).await;

        assert_eq!(code, StatusCode::BAD_REQUEST, "status {status}");
        assert_eq!(body["error"]["code"], "E1003", "status {status}");
    }

    assert_eq!(app.storage.lead_status(&email("c@x.com")).await, Some(LeadStatus::Initiated));
}

#[tokio::test]
async fn missing_fields_are_rejected() {
    let app = TestApp::new();

    for payload in [r#"{"email":"a@x.com"}"#, r#"{"status":"APPROVED"}"#, r#"{"data":{}}"#] {
        let (status, body) = app.post_json("/compra-finalizada", payload).await;

        assert_eq!(status, StatusCode::BAD_REQUEST, "payload {payload}");
        assert_eq!(body["error"]["code"], "E1001", "payload {payload}");
    }
}

#[tokio::test]
async fn unknown_lead_is_acknowledged_without_creating_one() {
    let app = TestApp::new();

    let (status, body) =
        app.post_json("/compra-finalizada", r#"{"email":"ghost@x.com","status":"APPROVED"}"#).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["lead_found"], false);
    assert_eq!(app.storage.lead_count().await, 0);
}

#[tokio::test]
async fn approval_before_verification_skips_the_check() {
    let app = TestApp::new();
    app.engine.capture_email("d@x.com").await.unwrap();
    app.post_json("/compra-finalizada", r#"{"email":"d@x.com","status":"APPROVED"}"#).await;

    let action = app.storage.all_actions().await.remove(0);
    let outcome = app.engine.execute(&action).await.unwrap();

    assert!(matches!(outcome, ActionOutcome::Skipped { .. }));
    assert_eq!(app.storage.lead_status(&email("d@x.com")).await, Some(LeadStatus::Purchased));
    assert_eq!(app.storage.all_actions().await.len(), 1);
}

#[tokio::test]
async fn store_outage_returns_internal_error() {
    let app = TestApp::new();
    app.storage.set_unavailable(true).await;

    let (status, body) =
        app.post_json("/compra-finalizada", r#"{"email":"a@x.com","status":"APPROVED"}"#).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"]["code"], "E3001");
}

#[tokio::test]
async fn other_methods_are_not_allowed() {
    let app = TestApp::new();

    let (status, _) = app.get("/compra-finalizada").await;

    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
}
