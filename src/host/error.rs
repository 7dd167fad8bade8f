//! Host API error types.
//!
//! Errors are categorized as transient or permanent. The distinction drives
//! the retry layer inside the production client: transient errors (5xx, rate
//! limits, network failures) are retried with backoff, permanent errors are
//! surfaced immediately. The merge state machine itself never retries a host
//! call; it either swallows the failure or folds it into a failure reason.

use std::fmt;
use thiserror::Error;

/// The kind of host API error, categorized for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostErrorKind {
    /// Transient error - safe to retry with backoff.
    ///
    /// Examples: HTTP 5xx, HTTP 429, HTTP 403 with rate limit messages,
    /// network timeouts.
    Transient,

    /// Permanent error - retrying the same request would fail again.
    ///
    /// Examples: most 4xx, missing permissions, PR not found.
    Permanent,
}

impl HostErrorKind {
    pub fn is_retriable(&self) -> bool {
        matches!(self, HostErrorKind::Transient)
    }
}

/// A host API error with categorization for retry decisions.
#[derive(Debug, Error)]
pub struct HostError {
    /// The kind of error (transient or permanent).
    pub kind: HostErrorKind,

    /// The HTTP status code, if one was observed.
    pub status_code: Option<u16>,

    /// A human-readable description of the error.
    pub message: String,

    /// The underlying octocrab error, if available.
    #[source]
    pub source: Option<octocrab::Error>,
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "host API error (HTTP {}): {}", code, self.message),
            None => write!(f, "host API error: {}", self.message),
        }
    }
}

impl HostError {
    /// Creates a transient error without an underlying octocrab source.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: HostErrorKind::Transient,
            status_code: None,
            message: message.into(),
            source: None,
        }
    }

    /// Creates a permanent error without an underlying octocrab source.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: HostErrorKind::Permanent,
            status_code: None,
            message: message.into(),
            source: None,
        }
    }

    /// Creates an error from an observed HTTP status code.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = if status == 429 || (500..600).contains(&status) {
            HostErrorKind::Transient
        } else {
            HostErrorKind::Permanent
        };
        Self {
            kind,
            status_code: Some(status),
            message: message.into(),
            source: None,
        }
    }

    /// Categorizes an octocrab error.
    ///
    /// The categorization is based on HTTP status codes where octocrab exposes
    /// them, falling back to message patterns for network-level failures.
    pub fn from_octocrab(err: octocrab::Error) -> Self {
        let status_code = extract_status_code(&err);
        let message = err.to_string();

        let kind = match status_code {
            Some(429) => HostErrorKind::Transient,
            Some(403) if is_rate_limit_message(&message) => HostErrorKind::Transient,
            Some(code) if (500..600).contains(&code) => HostErrorKind::Transient,
            Some(_) => HostErrorKind::Permanent,
            None => {
                if is_network_message(&message) {
                    HostErrorKind::Transient
                } else {
                    HostErrorKind::Permanent
                }
            }
        };

        Self {
            kind,
            status_code,
            message,
            source: Some(err),
        }
    }
}

/// Extracts the HTTP status code from an octocrab error, if present.
fn extract_status_code(err: &octocrab::Error) -> Option<u16> {
    if let octocrab::Error::GitHub { source, .. } = err {
        return Some(source.status_code.as_u16());
    }
    None
}

/// Checks if an error message indicates a rate limit.
fn is_rate_limit_message(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("rate limit")
        || message.contains("api rate")
        || message.contains("secondary rate")
        || message.contains("abuse detection")
}

/// Checks if an error message indicates a network-level error.
fn is_network_message(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("timeout")
        || message.contains("timed out")
        || message.contains("connection")
        || message.contains("network")
        || message.contains("dns")
}
