//! Lead and scheduled-action domain models.
//!
//! Defines the lead lifecycle state machine, the validated email key and
//! the durable scheduled actions that drive verification and reminder
//! sends. Includes database serialization traits for every type that is
//! stored as a column.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use uuid::Uuid;

use crate::error::CoreError;

type PgDb = sqlx::Postgres;
type PgRow = sqlx::postgres::PgRow;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult = Result<sqlx::encode::IsNull, BoxDynError>;
type BoxDynError = sqlx::error::BoxDynError;

/// Upper bound on address length (RFC 5321 path limit).
const MAX_EMAIL_LEN: usize = 254;

/// Validated email address used as the lead key.
///
/// Surrounding whitespace is trimmed on parse; everything else is kept
/// verbatim, so matching is case-sensitive.
///
/// # Example
///
/// ```
/// use cartback_core::models::LeadEmail;
/// let email = LeadEmail::parse("  ana@example.com ").unwrap();
/// assert_eq!(email.as_str(), "ana@example.com");
/// assert!(LeadEmail::parse("not-an-email").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LeadEmail(String);

impl LeadEmail {
    /// Parses and validates a raw address.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` when the address is empty, too long,
    /// contains whitespace or lacks a local part or domain around `@`.
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let trimmed = raw.trim();

        if trimmed.is_empty() {
            return Err(CoreError::InvalidInput("email must not be empty".to_string()));
        }
        if trimmed.chars().count() > MAX_EMAIL_LEN {
            return Err(CoreError::InvalidInput(format!(
                "email exceeds {MAX_EMAIL_LEN} characters"
            )));
        }
        if trimmed.chars().any(char::is_whitespace) {
            return Err(CoreError::InvalidInput("email must not contain whitespace".to_string()));
        }

        let Some((local, domain)) = trimmed.rsplit_once('@') else {
            return Err(CoreError::InvalidInput("email must contain '@'".to_string()));
        };
        if local.is_empty() || domain.is_empty() {
            return Err(CoreError::InvalidInput(
                "email needs both a local part and a domain".to_string(),
            ));
        }

        Ok(Self(trimmed.to_string()))
    }

    /// Returns the address as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LeadEmail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for LeadEmail {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for LeadEmail {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<LeadEmail> for String {
    fn from(email: LeadEmail) -> Self {
        email.0
    }
}

impl sqlx::Type<PgDb> for LeadEmail {
    fn type_info() -> PgTypeInfo {
        <String as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for LeadEmail {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <String as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(s))
    }
}

impl sqlx::Encode<'_, PgDb> for LeadEmail {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Lead lifecycle status.
///
/// ```text
/// Initiated --(verified / webhook approved)--> Purchased
/// Initiated --(verified not approved)-------> InRecovery
/// InRecovery --(webhook approved)-----------> Purchased
/// ```
///
/// `Purchased` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    /// Email captured, verification window still open.
    Initiated,

    /// Purchase confirmed. Terminal.
    Purchased,

    /// Verification found no purchase; reminders are being sent.
    InRecovery,
}

impl LeadStatus {
    /// Database and wire representation.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::Purchased => "purchased",
            Self::InRecovery => "in_recovery",
        }
    }
}

impl fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LeadStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initiated" => Ok(Self::Initiated),
            "purchased" => Ok(Self::Purchased),
            "in_recovery" => Ok(Self::InRecovery),
            other => Err(CoreError::InvalidInput(format!("invalid lead status: {other}"))),
        }
    }
}

impl sqlx::Type<PgDb> for LeadStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for LeadStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(s.parse()?)
    }
}

impl sqlx::Encode<'_, PgDb> for LeadStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// A captured email and its purchase-funnel status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Lead {
    /// Unique key.
    pub email: LeadEmail,

    /// Current lifecycle status.
    pub status: LeadStatus,

    /// When the email was captured. Never changes.
    pub captured_at: DateTime<Utc>,

    /// Last status change.
    pub updated_at: DateTime<Utc>,

    /// First time the lead reached `Purchased`.
    pub purchased_at: Option<DateTime<Utc>>,
}

impl Lead {
    /// Creates a freshly captured lead in `Initiated`.
    pub fn new(email: LeadEmail, captured_at: DateTime<Utc>) -> Self {
        Self {
            email,
            status: LeadStatus::Initiated,
            captured_at,
            updated_at: captured_at,
            purchased_at: None,
        }
    }
}

/// Strongly-typed scheduled action identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionId(pub Uuid);

impl ActionId {
    /// Creates a new random action ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ActionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for ActionId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for ActionId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for ActionId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for ActionId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// What a scheduled action does when it fires.
///
/// Stored as a `kind` column plus a `reminder_number` column (0 for
/// verification, 1-based for reminders).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Ask the purchase verifier whether the lead bought.
    VerifyPurchase,

    /// Send reminder `n` of the recovery sequence (1-based).
    SendReminder(u32),
}

impl ActionKind {
    /// Value stored in the `kind` column.
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::VerifyPurchase => "verify_purchase",
            Self::SendReminder(_) => "send_reminder",
        }
    }

    /// Value stored in the `reminder_number` column.
    pub fn reminder_number(&self) -> i32 {
        match self {
            Self::VerifyPurchase => 0,
            Self::SendReminder(n) => i32::try_from(*n).unwrap_or(i32::MAX),
        }
    }

    /// Rebuilds a kind from its two stored columns.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` for unknown kinds or a reminder
    /// number below 1.
    pub fn from_parts(kind: &str, reminder_number: i32) -> Result<Self, CoreError> {
        match kind {
            "verify_purchase" => Ok(Self::VerifyPurchase),
            "send_reminder" => u32::try_from(reminder_number)
                .ok()
                .filter(|n| *n >= 1)
                .map(Self::SendReminder)
                .ok_or_else(|| {
                    CoreError::InvalidInput(format!("invalid reminder number: {reminder_number}"))
                }),
            other => Err(CoreError::InvalidInput(format!("invalid action kind: {other}"))),
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VerifyPurchase => write!(f, "verify_purchase"),
            Self::SendReminder(n) => write!(f, "send_reminder#{n}"),
        }
    }
}

/// Scheduled action lifecycle status.
///
/// ```text
/// Pending -> Running -> Completed
///    ^          |    -> Skipped
///    |          |    -> Failed
///    +----------+ (rescheduled, or recovered after a crash)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Waiting for `fire_at`.
    Pending,

    /// Claimed by a scheduler worker.
    Running,

    /// Side effect performed.
    Completed,

    /// Fired but nothing to do (lead already purchased or gone).
    Skipped,

    /// Gave up. `last_error` says why.
    Failed,
}

impl ActionStatus {
    /// Database representation.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }

    /// Returns true once the action will never run again.
    pub const fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped | Self::Failed)
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "skipped" => Ok(Self::Skipped),
            "failed" => Ok(Self::Failed),
            other => Err(CoreError::InvalidInput(format!("invalid action status: {other}"))),
        }
    }
}

impl sqlx::Type<PgDb> for ActionStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for ActionStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(s.parse()?)
    }
}

impl sqlx::Encode<'_, PgDb> for ActionStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// Durable fire-once action tied to a lead.
///
/// Persisting these rows is what lets a restart resume pending
/// verifications and reminders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledAction {
    /// Unique identifier.
    pub id: ActionId,

    /// Lead the action belongs to.
    pub lead_email: LeadEmail,

    /// What to do when the action fires.
    pub kind: ActionKind,

    /// Earliest time the action may run.
    pub fire_at: DateTime<Utc>,

    /// Current status.
    pub status: ActionStatus,

    /// Number of times a worker has claimed this action.
    pub attempts: i32,

    /// Error recorded by the last failed or rescheduled run.
    pub last_error: Option<String>,

    /// When the current claim started. Used for lease expiry.
    pub claimed_at: Option<DateTime<Utc>>,

    /// When the action was scheduled.
    pub created_at: DateTime<Utc>,

    /// When the action reached a finished status.
    pub completed_at: Option<DateTime<Utc>>,
}

impl ScheduledAction {
    /// Creates a pending action.
    pub fn new(
        lead_email: LeadEmail,
        kind: ActionKind,
        fire_at: DateTime<Utc>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ActionId::new(),
            lead_email,
            kind,
            fire_at,
            status: ActionStatus::Pending,
            attempts: 0,
            last_error: None,
            claimed_at: None,
            created_at,
            completed_at: None,
        }
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for ScheduledAction {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let kind_name: String = row.try_get("kind")?;
        let reminder_number: i32 = row.try_get("reminder_number")?;
        let kind = ActionKind::from_parts(&kind_name, reminder_number).map_err(|e| {
            sqlx::Error::ColumnDecode { index: "kind".to_string(), source: Box::new(e) }
        })?;

        Ok(Self {
            id: row.try_get("id")?,
            lead_email: row.try_get("lead_email")?,
            kind,
            fire_at: row.try_get("fire_at")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            last_error: row.try_get("last_error")?,
            claimed_at: row.try_get("claimed_at")?,
            created_at: row.try_get("created_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_is_trimmed_but_case_preserved() {
        let email = LeadEmail::parse("  Ana@Example.com\n").unwrap();
        assert_eq!(email.as_str(), "Ana@Example.com");
        assert_ne!(email, LeadEmail::parse("ana@example.com").unwrap());
    }

    #[test]
    fn malformed_emails_rejected() {
        for raw in ["", "   ", "no-at-sign", "@example.com", "ana@", "a na@example.com"] {
            assert!(LeadEmail::parse(raw).is_err(), "{raw:?} should be rejected");
        }
    }

    #[test]
    fn email_length_is_counted_in_characters() {
        // 120 two-byte characters: 253 characters, 373 bytes.
        let within = format!("{}@{}.com", "ç".repeat(120), "d".repeat(128));
        assert_eq!(within.chars().count(), 253);
        assert!(within.len() > MAX_EMAIL_LEN);
        assert!(LeadEmail::parse(&within).is_ok());

        let over = format!("{}@{}.com", "ç".repeat(122), "d".repeat(128));
        let err = LeadEmail::parse(&over).unwrap_err();
        assert!(err.to_string().contains("exceeds 254 characters"));
    }

    #[test]
    fn email_deserialization_validates() {
        let ok: Result<LeadEmail, _> = serde_json::from_str("\"a@x.com\"");
        assert!(ok.is_ok());

        let bad: Result<LeadEmail, _> = serde_json::from_str("\"nope\"");
        assert!(bad.is_err());
    }

    #[test]
    fn lead_status_string_forms() {
        for status in [LeadStatus::Initiated, LeadStatus::Purchased, LeadStatus::InRecovery] {
            assert_eq!(status.to_string().parse::<LeadStatus>().unwrap(), status);
        }
        assert_eq!(serde_json::to_string(&LeadStatus::InRecovery).unwrap(), "\"in_recovery\"");
    }

    #[test]
    fn action_kind_columns() {
        assert_eq!(ActionKind::VerifyPurchase.reminder_number(), 0);
        assert_eq!(ActionKind::SendReminder(3).kind_name(), "send_reminder");
        assert_eq!(
            ActionKind::from_parts("send_reminder", 2).unwrap(),
            ActionKind::SendReminder(2)
        );
        assert!(ActionKind::from_parts("send_reminder", 0).is_err());
        assert!(ActionKind::from_parts("launch_rockets", 0).is_err());
    }

    #[test]
    fn new_action_starts_pending() {
        let now = Utc::now();
        let action = ScheduledAction::new(
            LeadEmail::parse("a@x.com").unwrap(),
            ActionKind::VerifyPurchase,
            now + chrono::Duration::minutes(20),
            now,
        );

        assert_eq!(action.status, ActionStatus::Pending);
        assert_eq!(action.attempts, 0);
        assert!(action.claimed_at.is_none());
    }
}
