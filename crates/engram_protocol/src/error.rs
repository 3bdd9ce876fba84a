//! Error taxonomy shared across the dispatch substrate.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Classified error kinds. Retry policy keys off the kind, not the text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// WS close, connection reset, HTTP network failure.
    Transport,
    /// Invalid, revoked, or expired token; scope mismatch.
    Auth,
    /// Malformed payload, missing required field.
    Validation,
    /// Unknown task/worker/hub id.
    NotFound,
    /// Dedup hit; reported as idempotent success, never an error response.
    Conflict,
    RateLimited,
    /// AI provider failure.
    Upstream,
    Timeout,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Auth => "auth",
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Upstream => "upstream",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }

    /// Whether a task failing with this kind should be rescheduled.
    pub fn is_retryable(&self) -> bool {
        match self {
            ErrorKind::Transport
            | ErrorKind::RateLimited
            | ErrorKind::Upstream
            | ErrorKind::Timeout
            | ErrorKind::Internal => true,
            ErrorKind::Auth
            | ErrorKind::Validation
            | ErrorKind::NotFound
            | ErrorKind::Conflict
            | ErrorKind::Cancelled => false,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transport" => Ok(ErrorKind::Transport),
            "auth" => Ok(ErrorKind::Auth),
            "validation" => Ok(ErrorKind::Validation),
            "not_found" => Ok(ErrorKind::NotFound),
            "conflict" => Ok(ErrorKind::Conflict),
            "rate_limited" => Ok(ErrorKind::RateLimited),
            "upstream" => Ok(ErrorKind::Upstream),
            "timeout" => Ok(ErrorKind::Timeout),
            "cancelled" => Ok(ErrorKind::Cancelled),
            "internal" => Ok(ErrorKind::Internal),
            _ => Err(format!("Invalid error kind: '{}'", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_split() {
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::Upstream.is_retryable());
        assert!(!ErrorKind::Validation.is_retryable());
        assert!(!ErrorKind::Auth.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
    }
}
