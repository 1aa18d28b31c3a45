//! Error kinds recognised by the mining core.
//!
//! The transport returns [`ApiError`]; the strategy layer never errors (it
//! returns typed skip reasons); the controller wraps everything in
//! [`ControllerError`] and is the single place that turns an error into a
//! state transition.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::transport::Endpoint;
use crate::types::SessionState;

/// Flat classification used for status reporting and fault reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    AuthExpired,
    NotFound,
    RateLimited,
    Transient,
    ProtocolMismatch,
    Rejected,
    RiskTripped,
    ConfigInvalid,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::AuthExpired => "AuthExpired",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::RateLimited => "RateLimited",
            ErrorKind::Transient => "Transient",
            ErrorKind::ProtocolMismatch => "ProtocolMismatch",
            ErrorKind::Rejected => "Rejected",
            ErrorKind::RiskTripped => "RiskTripped",
            ErrorKind::ConfigInvalid => "ConfigInvalid",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Transport errors
// ---------------------------------------------------------------------------

/// Failure of a single call against the refinORE API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("{endpoint}: credentials rejected")]
    AuthExpired { endpoint: Endpoint },

    #[error("{endpoint}: not found")]
    NotFound { endpoint: Endpoint },

    #[error("{endpoint}: rate limited (retry after {retry_after:?})")]
    RateLimited {
        endpoint: Endpoint,
        retry_after: Option<Duration>,
    },

    /// Network, timeout or 5xx failure. `sent` is false only when the
    /// request provably never left the process (connect failure).
    #[error("{endpoint}: transient failure: {message}")]
    Transient {
        endpoint: Endpoint,
        message: String,
        sent: bool,
    },

    #[error("{endpoint}: response does not match the expected schema: {detail}")]
    ProtocolMismatch { endpoint: Endpoint, detail: String },

    /// Any other 4xx. Not retried.
    #[error("{endpoint}: rejected with HTTP {status}: {message}")]
    Rejected {
        endpoint: Endpoint,
        status: u16,
        message: String,
    },
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::AuthExpired { .. } => ErrorKind::AuthExpired,
            ApiError::NotFound { .. } => ErrorKind::NotFound,
            ApiError::RateLimited { .. } => ErrorKind::RateLimited,
            ApiError::Transient { .. } => ErrorKind::Transient,
            ApiError::ProtocolMismatch { .. } => ErrorKind::ProtocolMismatch,
            ApiError::Rejected { .. } => ErrorKind::Rejected,
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        match self {
            ApiError::AuthExpired { endpoint }
            | ApiError::NotFound { endpoint }
            | ApiError::RateLimited { endpoint, .. }
            | ApiError::Transient { endpoint, .. }
            | ApiError::ProtocolMismatch { endpoint, .. }
            | ApiError::Rejected { endpoint, .. } => *endpoint,
        }
    }

    /// Whether a read may be retried under the backoff policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::RateLimited { .. } | ApiError::Transient { .. })
    }

    /// Whether a write may be retried without reconciling first: the server
    /// either refused to process it (429) or never received it.
    pub fn is_safe_to_resend(&self) -> bool {
        matches!(
            self,
            ApiError::RateLimited { .. } | ApiError::Transient { sent: false, .. }
        )
    }

    /// A write whose outcome is unknown: it may or may not have been applied.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, ApiError::Transient { sent: true, .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ApiError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation / bookkeeping errors
// ---------------------------------------------------------------------------

/// Structural validation failure of a session config.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid session config: {0}")]
pub struct ConfigInvalid(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("round {round} is already recorded")]
    Duplicate { round: u64 },

    #[error("round {round} cannot follow round {last}")]
    OutOfOrder { last: u64, round: u64 },
}

// ---------------------------------------------------------------------------
// Controller errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Config(#[from] ConfigInvalid),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("cannot {action} while the session is {state}")]
    InvalidTransition {
        action: &'static str,
        state: SessionState,
    },

    #[error("backend already runs a different session ({session_id}); stop it first")]
    SessionConflict { session_id: String },

    #[error("controller is faulted ({kind}): {message}")]
    Faulted { kind: ErrorKind, message: String },
}

impl ControllerError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ControllerError::Config(_) => Some(ErrorKind::ConfigInvalid),
            ControllerError::Api(e) => Some(e.kind()),
            ControllerError::Faulted { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resend_and_ambiguity_rules() {
        let unsent = ApiError::Transient {
            endpoint: Endpoint::Start,
            message: "connect refused".into(),
            sent: false,
        };
        let sent = ApiError::Transient {
            endpoint: Endpoint::Start,
            message: "timed out".into(),
            sent: true,
        };
        let limited = ApiError::RateLimited {
            endpoint: Endpoint::Start,
            retry_after: Some(Duration::from_secs(3)),
        };

        assert!(unsent.is_safe_to_resend());
        assert!(!unsent.is_ambiguous());
        assert!(!sent.is_safe_to_resend());
        assert!(sent.is_ambiguous());
        assert!(limited.is_safe_to_resend());
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_kind_mapping() {
        let e = ApiError::AuthExpired { endpoint: Endpoint::Session };
        assert_eq!(e.kind(), ErrorKind::AuthExpired);
        assert_eq!(e.endpoint(), Endpoint::Session);
        assert!(!e.is_retryable());

        let c: ControllerError = ConfigInvalid("bad".into()).into();
        assert_eq!(c.kind(), Some(ErrorKind::ConfigInvalid));
    }
}
