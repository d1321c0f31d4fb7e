//! crates/session_reliability_core/src/error.rs
//!
//! The error taxonomy of the session reliability layer, as a sum type.
//! Retry and deferral decisions are made from `kind()`, `is_retryable()`
//! and `should_defer()`, never from message text.

use crate::domain::SessionStatus;
use crate::ports::PortError;
use uuid::Uuid;

/// Coarse classification used for exhaustive handling by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Network,
    Timeout,
    Api,
    Config,
    Limit,
    RetryExhausted,
    Store,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// No connectivity, or the request never reached the provider.
    #[error("Network error: {0}")]
    Network(String),

    /// An in-flight call exceeded its deadline.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The provider answered with a non-success status.
    #[error("Provider API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Missing or malformed configuration, or invalid input.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The daily conversation quota is exhausted.
    #[error("{0}")]
    Limit(String),

    /// Terminal wrapper once the retry budget is spent.
    #[error("Gave up after {attempts} attempts: {last}")]
    RetryExhausted {
        attempts: u32,
        last: Box<SessionError>,
    },

    /// Work attempted on a session whose TTL ran out.
    #[error("Session {session_id} has expired")]
    Expired { session_id: Uuid },

    #[error("Invalid session transition from {from} to {to}")]
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error("Store error: {0}")]
    Store(#[from] PortError),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Network(_) => ErrorKind::Network,
            SessionError::Timeout(_) | SessionError::Expired { .. } => ErrorKind::Timeout,
            SessionError::Api { .. } => ErrorKind::Api,
            SessionError::Config(_) | SessionError::InvalidTransition { .. } => ErrorKind::Config,
            SessionError::Limit(_) => ErrorKind::Limit,
            SessionError::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            SessionError::Store(_) => ErrorKind::Store,
        }
    }

    /// Whether another attempt of the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SessionError::Network(_) | SessionError::Timeout(_) => true,
            SessionError::Api { status, .. } => *status >= 500 || *status == 429,
            SessionError::Store(PortError::Unavailable(_)) => true,
            SessionError::Store(_)
            | SessionError::Config(_)
            | SessionError::Limit(_)
            | SessionError::RetryExhausted { .. }
            | SessionError::Expired { .. }
            | SessionError::InvalidTransition { .. } => false,
        }
    }

    /// Whether the failed operation belongs in the offline queue rather than
    /// in front of the caller. Exhausted retries of a transient failure qualify.
    pub fn should_defer(&self) -> bool {
        match self {
            SessionError::RetryExhausted { last, .. } => last.is_retryable(),
            other => other.is_retryable(),
        }
    }

    /// The innermost error, looking through `RetryExhausted`.
    pub fn root(&self) -> &SessionError {
        match self {
            SessionError::RetryExhausted { last, .. } => last.root(),
            other => other,
        }
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.root(), SessionError::Expired { .. })
    }
}

/// A convenience type alias for `Result<T, SessionError>`.
pub type SessionResult<T> = Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn api(status: u16) -> SessionError {
        SessionError::Api {
            status,
            message: "x".into(),
        }
    }

    #[test]
    fn retry_table_matches_taxonomy() {
        assert!(SessionError::Network("offline".into()).is_retryable());
        assert!(SessionError::Timeout("30s".into()).is_retryable());
        assert!(api(500).is_retryable());
        assert!(api(503).is_retryable());
        assert!(api(429).is_retryable());
        assert!(!api(400).is_retryable());
        assert!(!api(422).is_retryable());
        assert!(!SessionError::Config("missing api key".into()).is_retryable());
        assert!(!SessionError::Limit("Daily limit of 1".into()).is_retryable());
        assert!(!SessionError::Expired {
            session_id: Uuid::nil()
        }
        .is_retryable());
    }

    #[test]
    fn exhausted_transient_failures_are_deferred_but_not_retried() {
        let exhausted = SessionError::RetryExhausted {
            attempts: 3,
            last: Box::new(SessionError::Timeout("30s".into())),
        };
        assert!(!exhausted.is_retryable());
        assert!(exhausted.should_defer());
        assert_eq!(exhausted.root().kind(), ErrorKind::Timeout);

        let permanent = SessionError::RetryExhausted {
            attempts: 1,
            last: Box::new(api(404)),
        };
        assert!(!permanent.should_defer());
    }

    #[test]
    fn expired_is_timeout_class() {
        let err = SessionError::Expired {
            session_id: Uuid::nil(),
        };
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.is_expired());
    }
}
