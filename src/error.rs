//! Error types for federation jobs (FED-23).
//!
//! Errors are classified by how the runner should react:
//! - Retryable: delivery timeouts, connection failures
//! - Security: signature verification failures (stored for audit, never retried)
//! - Informational: single-flight conflicts (the run is skipped, nothing is wrong)
//! - NonRetryable: everything else (bad config, policy violations, local faults)

use thiserror::Error;

use crate::db::DbError;

#[derive(Debug, Error)]
pub enum FederationError {
    // Retryable errors
    #[error("Network error: {0}")]
    TransientNetwork(String),

    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    // Informational: a concurrent run already holds the job lock
    #[error("Job already running: {0}")]
    ConcurrencyConflict(String),

    // Security-relevant, recorded for audit and permanently excluded from merge
    #[error("Signature verification failed for peer '{peer}': {detail}")]
    SignatureInvalid { peer: String, detail: String },

    // Non-retryable errors
    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    #[error("Misconfigured: {0}")]
    Misconfigured(String),

    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Key error: {0}")]
    Key(String),

    #[error("Database error: {0}")]
    Db(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl FederationError {
    /// Returns true if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FederationError::TransientNetwork(_) | FederationError::Timeout(_)
        )
    }

    /// Returns true if this error should be surfaced as a security event
    pub fn is_security_event(&self) -> bool {
        matches!(self, FederationError::SignatureInvalid { .. })
    }

    /// Returns true if this error means a run was skipped, not failed
    pub fn is_informational(&self) -> bool {
        matches!(self, FederationError::ConcurrencyConflict(_))
    }

    /// Get an operator-friendly recovery suggestion
    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            FederationError::TransientNetwork(_) => {
                "Check network connectivity to the peer. Delivery retries automatically."
            }
            FederationError::Timeout(_) => "The peer took too long to respond. Delivery retries automatically.",
            FederationError::ConcurrencyConflict(_) => {
                "A previous run is still in progress. No action needed."
            }
            FederationError::SignatureInvalid { .. } => {
                "Verify the peer's registered public key matches their node identity."
            }
            FederationError::PolicyViolation(_) => {
                "Review the sharing policy (shared divisions, privacy parameters)."
            }
            FederationError::Misconfigured(_) => {
                "Fix the federation policy values before re-running."
            }
            FederationError::NotAuthorized(_) => {
                "Check that the peer is registered and enabled for this direction."
            }
            FederationError::NotFound(_) => "Check the identifier and try again.",
            FederationError::InvalidInput(_) => "Correct the request fields and try again.",
            FederationError::Config(_) => "Check ~/.impactos/federation.json",
            FederationError::Key(_) => {
                "Check the node key file in the data directory and its permissions."
            }
            FederationError::Db(_) => "Check disk space and database file permissions.",
            FederationError::Http(_) => "Check the peer's base URL and try again.",
            FederationError::Io(_) => "Check file permissions and disk space.",
        }
    }
}

impl From<std::io::Error> for FederationError {
    fn from(err: std::io::Error) -> Self {
        FederationError::Io(err.to_string())
    }
}

impl From<DbError> for FederationError {
    fn from(err: DbError) -> Self {
        FederationError::Db(err.to_string())
    }
}

impl From<serde_json::Error> for FederationError {
    fn from(err: serde_json::Error) -> Self {
        FederationError::InvalidInput(format!("JSON error: {}", err))
    }
}

/// Serializable error representation for the admin boundary
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminError {
    pub message: String,
    pub error_kind: ErrorKind,
    pub can_retry: bool,
    pub recovery_suggestion: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Retryable,
    NonRetryable,
    Security,
    Informational,
}

impl From<&FederationError> for AdminError {
    fn from(err: &FederationError) -> Self {
        let error_kind = if err.is_security_event() {
            ErrorKind::Security
        } else if err.is_informational() {
            ErrorKind::Informational
        } else if err.is_retryable() {
            ErrorKind::Retryable
        } else {
            ErrorKind::NonRetryable
        };

        AdminError {
            message: err.to_string(),
            error_kind,
            can_retry: err.is_retryable(),
            recovery_suggestion: err.recovery_suggestion().to_string(),
        }
    }
}
