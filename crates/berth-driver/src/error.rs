//! Driver failure taxonomy.

use berth_process::ProcessError;
use thiserror::Error;

use crate::credentials::CredentialError;

pub type DriverResult<T> = Result<T, DriverError>;

/// Why a driver operation failed. The lifecycle engine picks its reaction
/// (retry, fail, re-sync) from the variant alone.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DriverError {
    /// Network hiccup, rate limit, temporary capacity shortage.
    #[error("transient: {0}")]
    Transient(String),

    /// Invalid parameters, exhausted quota, missing credentials.
    #[error("permanent: {0}")]
    Permanent(String),

    /// An external call exceeded its budget.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The backend reports something the engine did not expect.
    #[error("inconsistent state: {0}")]
    InconsistentState(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl DriverError {
    /// Transient failures and timeouts may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DriverError::Transient(_) | DriverError::Timeout(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DriverError::Transient(_) => "transient",
            DriverError::Permanent(_) => "permanent",
            DriverError::Timeout(_) => "timeout",
            DriverError::InconsistentState(_) => "inconsistent_state",
            DriverError::Unsupported(_) => "unsupported",
        }
    }

    /// Human-readable cause without the kind prefix.
    pub fn cause(&self) -> &str {
        match self {
            DriverError::Transient(m)
            | DriverError::Permanent(m)
            | DriverError::Timeout(m)
            | DriverError::InconsistentState(m)
            | DriverError::Unsupported(m) => m,
        }
    }
}

impl From<ProcessError> for DriverError {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::Timeout { .. } => DriverError::Timeout(err.to_string()),
            // A missing CLI binary will not appear on retry.
            ProcessError::Spawn { .. } => DriverError::Permanent(err.to_string()),
            ProcessError::Wait { .. } => DriverError::Transient(err.to_string()),
        }
    }
}

impl From<CredentialError> for DriverError {
    fn from(err: CredentialError) -> Self {
        DriverError::Permanent(err.to_string())
    }
}
