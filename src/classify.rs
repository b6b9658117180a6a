//! Classification of backend failures

use crate::backend::BackendError;

/// Broad failure category driving retry and notification policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Network,
    Auth,
    /// Missing relation or other schema level failure
    Database,
    RateLimit,
    Unknown,
}

impl ErrorKind {
    /// Whether a refresh cycle may retry after this failure
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorKind::Auth)
    }
}

/// Maps a backend failure to an [`ErrorKind`]
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, error: &BackendError) -> ErrorKind;
}

/// Default rules: status and code first, then substrings of the message
#[derive(Debug, Clone, Copy, Default)]
pub struct SubstringClassifier;

const NETWORK_PATTERNS: &[&str] = &[
    "network",
    "failed to fetch",
    "fetch failed",
    "timeout",
    "timed out",
    "connection refused",
    "connection reset",
    "error sending request",
    "dns error",
];

const AUTH_PATTERNS: &[&str] = &[
    "jwt",
    "auth session missing",
    "invalid refresh token",
    "refresh token not found",
    "not authenticated",
    "unauthorized",
    "invalid token",
    "token has expired",
];

const RATE_LIMIT_PATTERNS: &[&str] = &["rate limit", "too many requests"];

const DATABASE_PATTERNS: &[&str] = &["relation", "does not exist", "schema cache"];

impl ErrorClassifier for SubstringClassifier {
    fn classify(&self, error: &BackendError) -> ErrorKind {
        match error.status {
            Some(401) | Some(403) => return ErrorKind::Auth,
            Some(429) => return ErrorKind::RateLimit,
            _ => {}
        }
        match error.code.as_deref() {
            Some("42P01") | Some("PGRST205") => return ErrorKind::Database,
            Some("PGRST301") | Some("PGRST302") => return ErrorKind::Auth,
            _ => {}
        }

        let message = error.message.to_lowercase();
        let contains_any = |patterns: &[&str]| patterns.iter().any(|p| message.contains(p));

        if contains_any(RATE_LIMIT_PATTERNS) {
            ErrorKind::RateLimit
        } else if contains_any(NETWORK_PATTERNS) {
            ErrorKind::Network
        } else if contains_any(AUTH_PATTERNS) {
            ErrorKind::Auth
        } else if contains_any(DATABASE_PATTERNS) {
            ErrorKind::Database
        } else {
            ErrorKind::Unknown
        }
    }
}
