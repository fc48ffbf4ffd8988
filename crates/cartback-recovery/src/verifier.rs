//! Purchase verification against the checkout provider's API.
//!
//! A verifier answers "did this email buy?". It must never turn a transport
//! failure into a "no": an unreachable provider is reported as
//! `VerifierUnavailable` so the engine can retry instead of starting a
//! reminder sequence for a customer who already paid.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use cartback_core::LeadEmail;
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};

use crate::error::{RecoveryError, Result};

/// Answer from the purchase verifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    /// A completed purchase exists for the email.
    Approved,
    /// The provider answered and no completed purchase exists.
    NotApproved,
}

/// Source of truth for purchase status.
#[async_trait]
pub trait PurchaseVerifier: Send + Sync {
    /// Looks up the purchase status for `email`.
    ///
    /// # Errors
    ///
    /// Returns `RecoveryError::VerifierUnavailable` when no definite answer
    /// could be obtained.
    async fn verify(&self, email: &LeadEmail) -> Result<Verification>;
}

/// HTTP verifier settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct VerifierConfig {
    /// Purchase-status endpoint.
    pub url: String,
    /// Bearer token, if the provider requires one.
    pub api_token: Option<String>,
    /// Request timeout.
    pub timeout: Duration,
    /// User agent sent with every request.
    pub user_agent: String,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            url: "https://api.hotmart.com/v2/purchase-status".to_string(),
            api_token: None,
            timeout: Duration::from_secs(10),
            user_agent: concat!("cartback/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl fmt::Debug for VerifierConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerifierConfig")
            .field("url", &self.url)
            .field("api_token", &self.api_token.as_deref().map(crate::redact))
            .field("timeout", &self.timeout)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

#[derive(Serialize)]
struct VerifyRequest<'a> {
    email: &'a str,
}

#[derive(Deserialize)]
struct VerifyResponse {
    status: String,
}

/// Verifier that POSTs `{"email": ..}` and reads `{"status": ..}` back.
#[derive(Clone)]
pub struct HttpPurchaseVerifier {
    client: reqwest::Client,
    config: VerifierConfig,
}

impl HttpPurchaseVerifier {
    /// Creates a verifier with its own connection pool.
    ///
    /// # Errors
    ///
    /// Returns `RecoveryError::Configuration` if the HTTP client cannot be
    /// built.
    pub fn new(config: VerifierConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| RecoveryError::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, config })
    }
}

impl fmt::Debug for HttpPurchaseVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpPurchaseVerifier").field("config", &self.config).finish_non_exhaustive()
    }
}

#[async_trait]
impl PurchaseVerifier for HttpPurchaseVerifier {
    async fn verify(&self, email: &LeadEmail) -> Result<Verification> {
        let span = info_span!("purchase_verification", email = %email, url = %self.config.url);

        async move {
            let mut request =
                self.client.post(&self.config.url).json(&VerifyRequest { email: email.as_str() });
            if let Some(token) = &self.config.api_token {
                request = request.bearer_auth(token);
            }

            let response = request.send().await.map_err(|e| {
                if e.is_timeout() {
                    RecoveryError::verifier_unavailable(format!(
                        "timeout after {}s",
                        self.config.timeout.as_secs()
                    ))
                } else {
                    RecoveryError::verifier_unavailable(e.to_string())
                }
            })?;

            let status = response.status();
            if !status.is_success() {
                tracing::warn!(status = status.as_u16(), "verifier returned error status");
                return Err(RecoveryError::verifier_unavailable(format!("HTTP {status}")));
            }

            let body: VerifyResponse = response.json().await.map_err(|e| {
                RecoveryError::verifier_unavailable(format!("unparsable response: {e}"))
            })?;

            let verification = if body.status.eq_ignore_ascii_case("approved") {
                Verification::Approved
            } else {
                Verification::NotApproved
            };
            tracing::debug!(purchase_status = %body.status, ?verification, "verifier answered");

            Ok(verification)
        }
        .instrument(span)
        .await
    }
}

pub mod mock {
    //! Scripted verifier for lifecycle tests.

    use std::{collections::VecDeque, sync::Arc};

    use async_trait::async_trait;
    use cartback_core::LeadEmail;
    use tokio::sync::Mutex;

    use super::{PurchaseVerifier, Verification};
    use crate::error::{RecoveryError, Result};

    /// Verifier that replays queued answers, then falls back to a default.
    #[derive(Clone)]
    pub struct MockPurchaseVerifier {
        scripted: Arc<Mutex<VecDeque<Result<Verification>>>>,
        fallback: Arc<Mutex<Result<Verification>>>,
        calls: Arc<Mutex<Vec<LeadEmail>>>,
    }

    impl MockPurchaseVerifier {
        fn with_fallback(fallback: Result<Verification>) -> Self {
            Self {
                scripted: Arc::new(Mutex::new(VecDeque::new())),
                fallback: Arc::new(Mutex::new(fallback)),
                calls: Arc::new(Mutex::new(Vec::new())),
            }
        }

        /// Answers `Approved` for everyone.
        pub fn approving() -> Self {
            Self::with_fallback(Ok(Verification::Approved))
        }

        /// Answers `NotApproved` for everyone.
        pub fn rejecting() -> Self {
            Self::with_fallback(Ok(Verification::NotApproved))
        }

        /// Fails every call with `VerifierUnavailable`.
        pub fn unavailable() -> Self {
            Self::with_fallback(Err(RecoveryError::verifier_unavailable("connection refused")))
        }

        /// Queues one answer ahead of the fallback.
        pub async fn push(&self, answer: Result<Verification>) {
            self.scripted.lock().await.push_back(answer);
        }

        /// Replaces the fallback answer.
        pub async fn set_fallback(&self, answer: Result<Verification>) {
            *self.fallback.lock().await = answer;
        }

        /// Emails verified so far, in call order.
        pub async fn calls(&self) -> Vec<LeadEmail> {
            self.calls.lock().await.clone()
        }
    }

    #[async_trait]
    impl PurchaseVerifier for MockPurchaseVerifier {
        async fn verify(&self, email: &LeadEmail) -> Result<Verification> {
            self.calls.lock().await.push(email.clone());

            if let Some(answer) = self.scripted.lock().await.pop_front() {
                return answer;
            }
            self.fallback.lock().await.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;

    #[test]
    fn debug_output_hides_api_token() {
        let verifier = HttpPurchaseVerifier::new(VerifierConfig {
            api_token: Some("hm_s3cr3t_token".to_string()),
            ..VerifierConfig::default()
        })
        .unwrap();

        let printed = format!("{verifier:?}");

        assert!(!printed.contains("hm_s3cr3t_token"));
        assert!(printed.contains("api_token: Some(\"***\")"));
        assert!(format!("{:?}", VerifierConfig::default()).contains("api_token: None"));
    }

    fn verifier_for(server: &MockServer, token: Option<&str>) -> HttpPurchaseVerifier {
        HttpPurchaseVerifier::new(VerifierConfig {
            url: format!("{}/v2/purchase-status", server.uri()),
            api_token: token.map(str::to_string),
            timeout: Duration::from_secs(2),
            ..VerifierConfig::default()
        })
        .unwrap()
    }

    fn email() -> LeadEmail {
        LeadEmail::parse("buyer@example.com").unwrap()
    }

    #[tokio::test]
    async fn approved_status_is_case_insensitive() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/v2/purchase-status"))
            .and(matchers::body_json(serde_json::json!({ "email": "buyer@example.com" })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "status": "APPROVED" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let result = verifier_for(&server, None).verify(&email()).await.unwrap();
        assert_eq!(result, Verification::Approved);
    }

    #[tokio::test]
    async fn other_status_is_not_approved() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "status": "waiting_payment" })),
            )
            .mount(&server)
            .await;

        let result = verifier_for(&server, None).verify(&email()).await.unwrap();
        assert_eq!(result, Verification::NotApproved);
    }

    #[tokio::test]
    async fn bearer_token_is_sent_when_configured() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::header("authorization", "Bearer secret-token"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "status": "approved" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let result = verifier_for(&server, Some("secret-token")).verify(&email()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn server_error_is_unavailable_not_rejection() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = verifier_for(&server, None).verify(&email()).await.unwrap_err();
        assert!(matches!(err, RecoveryError::VerifierUnavailable { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn garbage_body_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
            .mount(&server)
            .await;

        let err = verifier_for(&server, None).verify(&email()).await.unwrap_err();
        assert!(matches!(err, RecoveryError::VerifierUnavailable { .. }));
    }

    #[tokio::test]
    async fn slow_verifier_times_out_as_unavailable() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "status": "approved" }))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let verifier = HttpPurchaseVerifier::new(VerifierConfig {
            url: server.uri(),
            timeout: Duration::from_millis(200),
            ..VerifierConfig::default()
        })
        .unwrap();

        let err = verifier.verify(&email()).await.unwrap_err();
        assert!(matches!(err, RecoveryError::VerifierUnavailable { .. }));
    }
}
