//! Abandoned-cart recovery lifecycle.
//!
//! A captured email becomes a lead with a pending purchase check. When the
//! check fires, the lead is either marked purchased or moved into recovery
//! and sent a sequence of reminder emails. A purchase webhook at any point
//! stops the remaining reminders.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   ┌─────────────────┐   ┌────────────────────┐
//! │ ActionScheduler  │──▶│ LifecycleEngine │──▶│ PurchaseVerifier   │
//! │ (worker pool)    │   │ (state machine) │──▶│ Mailer             │
//! └──────────────────┘   └─────────────────┘   └────────────────────┘
//!          │                      │
//!          ▼                      ▼
//! ┌──────────────────────────────────────────┐
//! │ LeadStorage (leads + scheduled_actions)  │
//! └──────────────────────────────────────────┘
//! ```
//!
//! Delayed work is stored as rows in `scheduled_actions`, so pending
//! verifications and reminders survive restarts.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use cartback_core::{storage::Storage, RealClock};
//! use cartback_recovery::{
//!     ActionScheduler, HttpPurchaseVerifier, LifecycleConfig, LifecycleEngine,
//!     MailerConfig, PostgresLeadStorage, ResendMailer, SchedulerConfig, VerifierConfig,
//! };
//!
//! # async fn example(pool: sqlx::PgPool) -> cartback_recovery::Result<()> {
//! let storage = Arc::new(PostgresLeadStorage::new(Arc::new(Storage::new(pool))));
//! let engine = Arc::new(LifecycleEngine::new(
//!     storage,
//!     Arc::new(HttpPurchaseVerifier::new(VerifierConfig::default())?),
//!     Arc::new(ResendMailer::new(MailerConfig::default())?),
//!     Arc::new(RealClock::new()),
//!     LifecycleConfig::default(),
//! ));
//!
//! let mut scheduler = ActionScheduler::new(engine.clone(), SchedulerConfig::default());
//! scheduler.recover_stalled().await?;
//! scheduler.start().await;
//!
//! engine.capture_email("lead@example.com").await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod engine;
pub mod error;
pub mod mailer;
pub mod retry;
pub mod scheduler;
pub mod storage;
pub mod verifier;

pub use engine::{ActionOutcome, LeadCreated, LifecycleConfig, LifecycleEngine, PurchaseRecorded};
pub use error::{RecoveryError, Result};
pub use mailer::{Mailer, MailerConfig, ReminderTemplate, ResendMailer};
pub use retry::VerificationRetryPolicy;
pub use scheduler::{ActionScheduler, SchedulerConfig, SchedulerStats};
pub use storage::{LeadStorage, PostgresLeadStorage};
pub use verifier::{HttpPurchaseVerifier, PurchaseVerifier, Verification, VerifierConfig};

/// Default number of scheduler workers.
pub const DEFAULT_WORKER_COUNT: usize = 2;

/// Default number of actions claimed per poll.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Stand-in printed instead of a credential.
pub(crate) fn redact(secret: &str) -> &'static str {
    if secret.is_empty() {
        "<unset>"
    } else {
        "***"
    }
}
