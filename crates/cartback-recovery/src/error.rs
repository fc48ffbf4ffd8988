//! Error taxonomy for the recovery lifecycle.
//!
//! Every variant carries a stable code (`E1xxx` caller errors, `E2xxx`
//! collaborator failures, `E3xxx` infrastructure, `E9999` internal) that
//! the HTTP boundary puts in its error bodies.

use cartback_core::CoreError;
use thiserror::Error;

/// Result type alias for recovery operations.
pub type Result<T> = std::result::Result<T, RecoveryError>;

/// Errors raised by the lifecycle engine and its collaborators.
#[derive(Debug, Clone, Error)]
pub enum RecoveryError {
    /// Caller supplied a missing or malformed value.
    #[error("invalid input: {message}")]
    InvalidInput {
        /// What was wrong with the input
        message: String,
    },

    /// A lead already exists for this email.
    #[error("email already captured: {email}")]
    AlreadyCaptured {
        /// The duplicate email
        email: String,
    },

    /// Purchase webhook reported a status other than approved.
    #[error("purchase not approved: status {status:?}")]
    PurchaseNotApproved {
        /// Status value received
        status: String,
    },

    /// Purchase verifier could not give an answer.
    #[error("purchase verifier unavailable: {message}")]
    VerifierUnavailable {
        /// Transport or protocol failure description
        message: String,
    },

    /// Reminder email could not be sent.
    #[error("mailer error: {message}")]
    Mailer {
        /// Provider failure description
        message: String,
    },

    /// Lead store operation failed.
    #[error("store error: {message}")]
    Store {
        /// Store failure description
        message: String,
    },

    /// Invalid configuration.
    #[error("configuration error: {message}")]
    Configuration {
        /// Configuration problem
        message: String,
    },

    /// Unexpected internal error.
    #[error("internal error: {message}")]
    Internal {
        /// Internal error message
        message: String,
    },
}

impl RecoveryError {
    /// Creates an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput { message: message.into() }
    }

    /// Creates an already-captured error.
    pub fn already_captured(email: impl Into<String>) -> Self {
        Self::AlreadyCaptured { email: email.into() }
    }

    /// Creates a purchase-not-approved error.
    pub fn purchase_not_approved(status: impl Into<String>) -> Self {
        Self::PurchaseNotApproved { status: status.into() }
    }

    /// Creates a verifier-unavailable error.
    pub fn verifier_unavailable(message: impl Into<String>) -> Self {
        Self::VerifierUnavailable { message: message.into() }
    }

    /// Creates a mailer error.
    pub fn mailer(message: impl Into<String>) -> Self {
        Self::Mailer { message: message.into() }
    }

    /// Creates a store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Stable error code for API responses and logs.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput { .. } => "E1001",
            Self::AlreadyCaptured { .. } => "E1002",
            Self::PurchaseNotApproved { .. } => "E1003",
            Self::VerifierUnavailable { .. } => "E2001",
            Self::Mailer { .. } => "E2002",
            Self::Store { .. } => "E3001",
            Self::Configuration { .. } => "E3002",
            Self::Internal { .. } => "E9999",
        }
    }

    /// Returns true if repeating the operation later may succeed.
    ///
    /// Only verifier outages are retried; mail sends are best-effort.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::VerifierUnavailable { .. })
    }
}

impl From<CoreError> for RecoveryError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidInput(message) => Self::InvalidInput { message },
            other => Self::Store { message: other.to_string() },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_verifier_outages_are_retryable() {
        assert!(RecoveryError::verifier_unavailable("timeout").is_retryable());

        assert!(!RecoveryError::mailer("rejected").is_retryable());
        assert!(!RecoveryError::store("pool closed").is_retryable());
        assert!(!RecoveryError::invalid_input("missing email").is_retryable());
        assert!(!RecoveryError::already_captured("a@x.com").is_retryable());
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(RecoveryError::invalid_input("x").code(), "E1001");
        assert_eq!(RecoveryError::already_captured("x").code(), "E1002");
        assert_eq!(RecoveryError::purchase_not_approved("x").code(), "E1003");
        assert_eq!(RecoveryError::verifier_unavailable("x").code(), "E2001");
        assert_eq!(RecoveryError::mailer("x").code(), "E2002");
        assert_eq!(RecoveryError::store("x").code(), "E3001");
        assert_eq!(RecoveryError::configuration("x").code(), "E3002");
        assert_eq!(RecoveryError::internal("x").code(), "E9999");
    }

    #[test]
    fn core_errors_convert() {
        let invalid: RecoveryError = CoreError::InvalidInput("bad email".into()).into();
        assert!(matches!(invalid, RecoveryError::InvalidInput { ref message } if message == "bad email"));

        let db: RecoveryError = CoreError::Database("connection reset".into()).into();
        assert_eq!(db.code(), "E3001");
    }
}
