//! Shared router fixture backed by in-memory collaborators.

#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use cartback_api::{create_router, AppState};
use cartback_core::{models::LeadEmail, TestClock};
use cartback_recovery::{
    mailer::mock::RecordingMailer, storage::mock::MockLeadStorage,
    verifier::mock::MockPurchaseVerifier, LifecycleConfig, LifecycleEngine,
};
use serde_json::Value;
use tower::ServiceExt;

pub struct TestApp {
    pub router: Router,
    pub engine: Arc<LifecycleEngine>,
    pub storage: MockLeadStorage,
    pub clock: TestClock,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_request_timeout(Duration::from_secs(30))
    }

    pub fn with_request_timeout(request_timeout: Duration) -> Self {
        let storage = MockLeadStorage::new();
        let clock = TestClock::new();

        let engine = Arc::new(LifecycleEngine::new(
            Arc::new(storage.clone()),
            Arc::new(MockPurchaseVerifier::rejecting()),
            Arc::new(RecordingMailer::new()),
            Arc::new(clock.clone()),
            LifecycleConfig::default(),
        ));
        let router = create_router(AppState::new(engine.clone()), request_timeout);

        Self { router, engine, storage, clock }
    }

    pub async fn post_json(&self, uri: &str, body: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.send(request).await
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap();
        self.send(request).await
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.expect("failed to make request");
        let status = response.status();

        let body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("failed to read response body");
        let body = serde_json::from_slice(&body_bytes).unwrap_or(Value::Null);

        (status, body)
    }
}

pub fn email(raw: &str) -> LeadEmail {
    LeadEmail::parse(raw).unwrap()
}
