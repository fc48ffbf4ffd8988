//! Reminder email templates and delivery through Resend.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use cartback_core::LeadEmail;
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};

use crate::error::{RecoveryError, Result};

/// Subject and plain-text body of one reminder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderTemplate {
    /// Email subject line.
    pub subject: String,
    /// Plain-text body.
    pub body: String,
}

impl ReminderTemplate {
    /// Creates a template.
    pub fn new(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self { subject: subject.into(), body: body.into() }
    }

    /// The three-step campaign sent by default.
    pub fn default_sequence() -> Vec<Self> {
        vec![
            Self::new(
                "Você esqueceu algo no seu carrinho!",
                "Oi, você ainda tem um item esperando por você! Não deixe para depois!",
            ),
            Self::new(
                "Ainda está de olho no produto?",
                "Seu carrinho está esperando! Aproveite antes que acabe.",
            ),
            Self::new(
                "Última chance para garantir seu produto!",
                "Não perca! Finalize sua compra agora e receba um desconto exclusivo.",
            ),
        ]
    }

    /// Picks the template for 1-based reminder `n`.
    ///
    /// Reminders past the end of the list reuse the last template. Returns
    /// `None` only for an empty list.
    pub fn for_reminder(templates: &[Self], n: u32) -> Option<&Self> {
        let index = usize::try_from(n.saturating_sub(1)).unwrap_or(usize::MAX);
        templates.get(index).or_else(|| templates.last())
    }
}

/// Outbound email transport.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Sends one plain-text email.
    ///
    /// # Errors
    ///
    /// Returns `RecoveryError::Mailer` if the provider rejects the message
    /// or cannot be reached.
    async fn send(&self, to: &LeadEmail, subject: &str, body: &str) -> Result<()>;
}

/// Resend API settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct MailerConfig {
    /// Send endpoint.
    pub url: String,
    /// Resend API key.
    pub api_key: String,
    /// Sender address.
    pub from: String,
    /// Request timeout.
    pub timeout: Duration,
}

impl Default for MailerConfig {
    fn default() -> Self {
        Self {
            url: "https://api.resend.com/emails".to_string(),
            api_key: String::new(),
            from: "noreply@pedagoteca.io".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

impl fmt::Debug for MailerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailerConfig")
            .field("url", &self.url)
            .field("api_key", &crate::redact(&self.api_key))
            .field("from", &self.from)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Serialize)]
struct SendEmailRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    text: &'a str,
}

/// Mailer backed by the Resend HTTP API.
#[derive(Clone)]
pub struct ResendMailer {
    client: reqwest::Client,
    config: MailerConfig,
}

impl ResendMailer {
    /// Creates a mailer.
    ///
    /// # Errors
    ///
    /// Returns `RecoveryError::Configuration` if the HTTP client cannot be
    /// built.
    pub fn new(config: MailerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| RecoveryError::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, config })
    }
}

impl fmt::Debug for ResendMailer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResendMailer").field("config", &self.config).finish_non_exhaustive()
    }
}

#[async_trait]
impl Mailer for ResendMailer {
    async fn send(&self, to: &LeadEmail, subject: &str, body: &str) -> Result<()> {
        let span = info_span!("send_email", to = %to, subject);

        async move {
            let payload = SendEmailRequest {
                from: &self.config.from,
                to: [to.as_str()],
                subject,
                text: body,
            };

            let response = self
                .client
                .post(&self.config.url)
                .bearer_auth(&self.config.api_key)
                .json(&payload)
                .send()
                .await
                .map_err(|e| RecoveryError::mailer(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(RecoveryError::mailer(format!("HTTP {status}: {body}")));
            }

            tracing::debug!("email accepted by provider");
            Ok(())
        }
        .instrument(span)
        .await
    }
}

pub mod mock {
    //! Mailer that records instead of sending.

    use std::sync::Arc;

    use async_trait::async_trait;
    use cartback_core::LeadEmail;
    use tokio::sync::Mutex;

    use super::Mailer;
    use crate::error::{RecoveryError, Result};

    /// One recorded email.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct SentEmail {
        /// Recipient.
        pub to: LeadEmail,
        /// Subject line.
        pub subject: String,
        /// Body.
        pub body: String,
    }

    /// Records sends; can be told to fail.
    #[derive(Clone, Default)]
    pub struct RecordingMailer {
        sent: Arc<Mutex<Vec<SentEmail>>>,
        failures_left: Arc<Mutex<usize>>,
    }

    impl RecordingMailer {
        /// Creates a mailer that accepts everything.
        pub fn new() -> Self {
            Self::default()
        }

        /// Makes the next `count` sends fail.
        pub async fn fail_next(&self, count: usize) {
            *self.failures_left.lock().await = count;
        }

        /// Emails accepted so far.
        pub async fn sent(&self) -> Vec<SentEmail> {
            self.sent.lock().await.clone()
        }
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send(&self, to: &LeadEmail, subject: &str, body: &str) -> Result<()> {
            {
                let mut failures = self.failures_left.lock().await;
                if *failures > 0 {
                    *failures -= 1;
                    return Err(RecoveryError::mailer("provider rejected message"));
                }
            }

            self.sent.lock().await.push(SentEmail {
                to: to.clone(),
                subject: subject.to_string(),
                body: body.to_string(),
            });
            Ok(())
        }
    }
}
