//! Decision point error types.
//!
//! Callers of the decision pipeline only ever observe one of the three
//! [`PdpError`] kinds. Component-level errors (circuit breaker, policy source,
//! evaluation engines) are translated at the component boundary that owns
//! them.

use std::fmt;

/// Errors surfaced by the decision pipeline.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PdpError {
    /// The request is malformed or incomplete. Always caused by the caller.
    #[error("{message}")]
    Validation {
        /// Description of what is wrong with the request.
        message: String,
    },

    /// The policy set could not be obtained.
    ///
    /// Covers an unreachable or failing policy source, a malformed response,
    /// an open circuit and an empty policy set.
    #[error("{message}")]
    PolicyLoad {
        /// Description of the load failure.
        message: String,
    },

    /// The evaluation engine failed to produce a result.
    #[error("{message}")]
    PolicyEvaluation {
        /// Description of the evaluation failure.
        message: String,
    },
}

impl PdpError {
    /// Creates a new `Validation` error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a new `PolicyLoad` error.
    #[must_use]
    pub fn policy_load(message: impl Into<String>) -> Self {
        Self::PolicyLoad {
            message: message.into(),
        }
    }

    /// Creates a new `PolicyEvaluation` error.
    #[must_use]
    pub fn policy_evaluation(message: impl Into<String>) -> Self {
        Self::PolicyEvaluation {
            message: message.into(),
        }
    }

    /// Returns the human-readable message carried by the error.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Validation { message }
            | Self::PolicyLoad { message }
            | Self::PolicyEvaluation { message } => message,
        }
    }

    /// Returns the error category for logging and monitoring.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation { .. } => ErrorCategory::Validation,
            Self::PolicyLoad { .. } => ErrorCategory::PolicyLoad,
            Self::PolicyEvaluation { .. } => ErrorCategory::PolicyEvaluation,
        }
    }

    /// Returns `true` if retrying the same request later may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PolicyLoad { .. })
    }
}

/// Categories of decision point errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Request validation errors.
    Validation,
    /// Policy retrieval errors.
    PolicyLoad,
    /// Policy evaluation errors.
    PolicyEvaluation,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::PolicyLoad => write!(f, "policy_load"),
            Self::PolicyEvaluation => write!(f, "policy_evaluation"),
        }
    }
}
