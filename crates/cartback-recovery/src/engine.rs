//! Lead lifecycle engine.
//!
//! Owns the lead state machine and decides which delayed actions exist:
//!
//! ```text
//! capture ──▶ Initiated ──(verify: approved | webhook)──▶ Purchased
//!                 │                                          ▲
//!                 └──(verify: not approved)──▶ InRecovery ───┘ (webhook)
//! ```
//!
//! Nothing here cancels a scheduled action. Every action re-reads the lead
//! right before acting and skips itself once the lead is purchased, so a
//! purchase recorded at any point stops the rest of the sequence.

use std::{sync::Arc, time::Duration};

use cartback_core::{
    models::{ActionKind, Lead, LeadEmail, LeadStatus, ScheduledAction},
    Clock,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::{
    error::{RecoveryError, Result},
    mailer::{Mailer, ReminderTemplate},
    retry::{RetryDecision, VerificationRetryPolicy},
    storage::LeadStorage,
    verifier::{PurchaseVerifier, Verification},
};

/// Purchase status value that confirms a purchase on the webhook.
pub const APPROVED_STATUS: &str = "APPROVED";

/// Timing and content of the recovery sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Wait between capture and the purchase check.
    pub verification_delay: Duration,

    /// Offset of each reminder from the moment recovery starts. One entry
    /// per reminder.
    pub reminder_delays: Vec<Duration>,

    /// Reminder content; reminder `n` uses entry `n - 1`, or the last one.
    pub templates: Vec<ReminderTemplate>,

    /// Backoff for verifier outages.
    pub retry_policy: VerificationRetryPolicy,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            verification_delay: Duration::from_secs(20 * 60),
            reminder_delays: vec![
                Duration::ZERO,
                Duration::from_secs(24 * 60 * 60),
                Duration::from_secs(3 * 24 * 60 * 60),
            ],
            templates: ReminderTemplate::default_sequence(),
            retry_policy: VerificationRetryPolicy::default(),
        }
    }
}

/// Result of a successful capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeadCreated {
    /// Normalized email.
    pub email: LeadEmail,
    /// Always `initiated`.
    pub status: LeadStatus,
    /// Capture time.
    pub captured_at: DateTime<Utc>,
    /// When the purchase check will run.
    pub verification_at: DateTime<Utc>,
}

/// Result of an approved purchase webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurchaseRecorded {
    /// Normalized email.
    pub email: LeadEmail,
    /// False when the webhook named an email that was never captured.
    pub lead_found: bool,
}

/// What happened when a scheduled action ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    /// The side effect happened.
    Completed,
    /// Nothing to do.
    Skipped {
        /// Why the action was a no-op
        reason: String,
    },
    /// Try again later.
    Rescheduled {
        /// New fire time
        fire_at: DateTime<Utc>,
        /// Failure that caused the retry
        reason: String,
    },
    /// Gave up.
    Failed {
        /// Final error
        error: String,
    },
}

impl ActionOutcome {
    fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped { reason: reason.into() }
    }
}

/// Lead state machine plus the collaborators it drives.
pub struct LifecycleEngine {
    storage: Arc<dyn LeadStorage>,
    verifier: Arc<dyn PurchaseVerifier>,
    mailer: Arc<dyn Mailer>,
    clock: Arc<dyn Clock>,
    config: LifecycleConfig,
}

impl LifecycleEngine {
    /// Creates an engine.
    pub fn new(
        storage: Arc<dyn LeadStorage>,
        verifier: Arc<dyn PurchaseVerifier>,
        mailer: Arc<dyn Mailer>,
        clock: Arc<dyn Clock>,
        config: LifecycleConfig,
    ) -> Self {
        Self { storage, verifier, mailer, clock, config }
    }

    /// Store the engine reads and writes.
    pub fn storage(&self) -> Arc<dyn LeadStorage> {
        self.storage.clone()
    }

    /// Clock used for every timestamp.
    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Records a new lead and schedules its purchase check.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` for a malformed email
    /// - `AlreadyCaptured` if a lead with this exact email exists
    /// - `Store` if persistence fails
    #[instrument(skip(self))]
    pub async fn capture_email(&self, raw_email: &str) -> Result<LeadCreated> {
        let email = LeadEmail::parse(raw_email)?;

        if self.storage.find_lead(email.clone()).await?.is_some() {
            return Err(RecoveryError::already_captured(email.as_str()));
        }

        let now = self.clock.now_utc();
        let verification_at = fire_time(now, self.config.verification_delay)?;
        let lead = Lead::new(email.clone(), now);
        let verify =
            ScheduledAction::new(email.clone(), ActionKind::VerifyPurchase, verification_at, now);

        if !self.storage.create_lead(lead, verify).await? {
            // Lost an insert race with a concurrent capture.
            return Err(RecoveryError::already_captured(email.as_str()));
        }

        info!(%email, %verification_at, "lead captured");
        Ok(LeadCreated { email, status: LeadStatus::Initiated, captured_at: now, verification_at })
    }

    /// Runs the purchase check for a lead.
    ///
    /// `attempt` is the 1-based number of times this verification has been
    /// claimed and drives the outage backoff.
    ///
    /// # Errors
    ///
    /// Returns `Store` when the lead cannot be read or written; the action
    /// is then left for lease expiry to pick up again.
    #[instrument(skip(self))]
    pub async fn on_verify_purchase_fire(
        &self,
        email: &LeadEmail,
        attempt: u32,
    ) -> Result<ActionOutcome> {
        let Some(lead) = self.storage.find_lead(email.clone()).await? else {
            warn!(%email, "verification fired for unknown lead");
            return Ok(ActionOutcome::skipped("lead not found"));
        };

        match lead.status {
            LeadStatus::Purchased => return Ok(ActionOutcome::skipped("lead already purchased")),
            LeadStatus::InRecovery => return Ok(ActionOutcome::skipped("lead already in recovery")),
            LeadStatus::Initiated => {},
        }

        match self.verifier.verify(email).await {
            Ok(Verification::Approved) => {
                self.storage.mark_purchased(email.clone(), self.clock.now_utc()).await?;
                info!(%email, "purchase verified");
                Ok(ActionOutcome::Completed)
            },
            Ok(Verification::NotApproved) => self.start_recovery(email).await,
            Err(error) => {
                let now = self.clock.now_utc();
                match self.config.retry_policy.decide(attempt, &error, now) {
                    RetryDecision::Retry { next_attempt_at } => {
                        warn!(%email, attempt, %error, %next_attempt_at, "verifier unavailable, retrying");
                        Ok(ActionOutcome::Rescheduled {
                            fire_at: next_attempt_at,
                            reason: error.to_string(),
                        })
                    },
                    RetryDecision::GiveUp { reason } => {
                        warn!(%email, attempt, %reason, "giving up on purchase verification");
                        Ok(ActionOutcome::Failed { error: reason })
                    },
                }
            },
        }
    }

    async fn start_recovery(&self, email: &LeadEmail) -> Result<ActionOutcome> {
        let now = self.clock.now_utc();

        let mut reminders = Vec::with_capacity(self.config.reminder_delays.len());
        for (n, delay) in (1_u32..).zip(&self.config.reminder_delays) {
            let fire_at = fire_time(now, *delay)?;
            reminders.push(ScheduledAction::new(
                email.clone(),
                ActionKind::SendReminder(n),
                fire_at,
                now,
            ));
        }
        let count = reminders.len();

        if self.storage.begin_recovery(email.clone(), now, reminders).await? {
            info!(%email, reminders = count, "no purchase found, recovery started");
            Ok(ActionOutcome::Completed)
        } else {
            debug!(%email, "lead left initiated before recovery could start");
            Ok(ActionOutcome::skipped("lead no longer initiated"))
        }
    }

    /// Sends reminder `n` unless the lead has purchased since it was
    /// scheduled.
    ///
    /// A mailer failure fails this reminder only; the lead and the other
    /// reminders are untouched.
    ///
    /// # Errors
    ///
    /// Returns `Store` when the lead cannot be read.
    #[instrument(skip(self))]
    pub async fn on_reminder_fire(&self, email: &LeadEmail, n: u32) -> Result<ActionOutcome> {
        let Some(lead) = self.storage.find_lead(email.clone()).await? else {
            warn!(%email, reminder = n, "reminder fired for unknown lead");
            return Ok(ActionOutcome::skipped("lead not found"));
        };

        match lead.status {
            LeadStatus::Purchased => {
                debug!(%email, reminder = n, "lead purchased, reminder skipped");
                return Ok(ActionOutcome::skipped("lead already purchased"));
            },
            LeadStatus::Initiated => return Ok(ActionOutcome::skipped("lead not in recovery")),
            LeadStatus::InRecovery => {},
        }

        let Some(template) = ReminderTemplate::for_reminder(&self.config.templates, n) else {
            return Ok(ActionOutcome::Failed { error: "no reminder templates configured".into() });
        };

        match self.mailer.send(email, &template.subject, &template.body).await {
            Ok(()) => {
                info!(%email, reminder = n, "reminder sent");
                Ok(ActionOutcome::Completed)
            },
            Err(error) => {
                warn!(%email, reminder = n, %error, code = error.code(), "reminder send failed");
                Ok(ActionOutcome::Failed { error: error.to_string() })
            },
        }
    }

    /// Applies a purchase notification.
    ///
    /// Only the exact status `APPROVED` records a purchase. Repeating it is
    /// harmless. An unknown email still succeeds with `lead_found = false`
    /// and creates nothing.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` when either field is missing or the email is malformed
    /// - `PurchaseNotApproved` for any other status
    /// - `Store` if persistence fails
    #[instrument(skip(self))]
    pub async fn on_purchase_webhook(&self, email: &str, status: &str) -> Result<PurchaseRecorded> {
        if email.trim().is_empty() {
            return Err(RecoveryError::invalid_input("email is required"));
        }
        if status.trim().is_empty() {
            return Err(RecoveryError::invalid_input("status is required"));
        }

        let email = LeadEmail::parse(email)?;

        if status != APPROVED_STATUS {
            info!(%email, status, "purchase webhook without approval ignored");
            return Err(RecoveryError::purchase_not_approved(status));
        }

        let lead_found = self.storage.mark_purchased(email.clone(), self.clock.now_utc()).await?;
        if lead_found {
            info!(%email, "purchase recorded");
        } else {
            warn!(%email, "purchase webhook for unknown lead");
        }

        Ok(PurchaseRecorded { email, lead_found })
    }

    /// Runs a claimed action.
    ///
    /// # Errors
    ///
    /// Returns `Store` when the lead could not be read or written. The
    /// action outcome is then unknown and it should stay claimed until its
    /// lease expires.
    pub async fn execute(&self, action: &ScheduledAction) -> Result<ActionOutcome> {
        let attempt = u32::try_from(action.attempts.max(1)).unwrap_or(1);

        match action.kind {
            ActionKind::VerifyPurchase => {
                self.on_verify_purchase_fire(&action.lead_email, attempt).await
            },
            ActionKind::SendReminder(n) => self.on_reminder_fire(&action.lead_email, n).await,
        }
    }
}

fn fire_time(now: DateTime<Utc>, delay: Duration) -> Result<DateTime<Utc>> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .ok_or_else(|| RecoveryError::configuration(format!("delay out of range: {delay:?}")))
}
