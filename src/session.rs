//! Session validation, renewal and recovery

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::backend::{Backend, Session};
use crate::classify::{ErrorClassifier, ErrorKind};
use crate::connectivity::ConnectivityMonitor;
use crate::notify::{Notice, Notifier};

/// Result of one session check
#[derive(Debug, Clone, PartialEq)]
pub struct SessionCheck {
    pub valid: bool,
    pub session: Option<Session>,
    /// The check could not reach the backend
    pub network_error: bool,
}

impl SessionCheck {
    fn offline() -> Self {
        Self {
            valid: false,
            session: None,
            network_error: true,
        }
    }
}

/// Guards backend calls that need a usable session
#[derive(Clone)]
pub struct SessionGuard {
    backend: Arc<dyn Backend>,
    connectivity: ConnectivityMonitor,
    notifier: Arc<dyn Notifier>,
    classifier: Arc<dyn ErrorClassifier>,
}

impl SessionGuard {
    pub fn new(
        backend: Arc<dyn Backend>,
        connectivity: ConnectivityMonitor,
        notifier: Arc<dyn Notifier>,
        classifier: Arc<dyn ErrorClassifier>,
    ) -> Self {
        Self {
            backend,
            connectivity,
            notifier,
            classifier,
        }
    }

    /// Check the current session without contacting the backend while offline
    pub async fn is_session_valid(&self) -> SessionCheck {
        if self.connectivity.is_offline() {
            debug!("Offline, skipping session check");
            return SessionCheck::offline();
        }

        match self.backend.get_session().await {
            Ok(session) => SessionCheck {
                valid: session.is_some(),
                session,
                network_error: false,
            },
            Err(e) => {
                let kind = self.classifier.classify(&e);
                warn!("Session check failed ({:?}): {}", kind, e);
                SessionCheck {
                    valid: false,
                    session: None,
                    network_error: kind == ErrorKind::Network,
                }
            }
        }
    }

    /// Try to renew credentials; never fails, false means no fresh session
    pub async fn refresh_session(&self) -> bool {
        if self.connectivity.is_offline() {
            debug!("Offline, not refreshing session");
            return false;
        }

        match self.backend.refresh_session().await {
            Ok(session) => {
                info!("Session refreshed for {}", session.user.id);
                true
            }
            Err(e) => {
                warn!("Session refresh failed: {}", e);
                false
            }
        }
    }

    /// Make sure the caller ends up with a usable session if possible.
    ///
    /// Offline and network failures return false without telling the user;
    /// an invalid session triggers one refresh attempt whose outcome is
    /// reported through the notifier.
    pub async fn handle_session_recovery(&self) -> bool {
        if self.connectivity.is_offline() {
            return false;
        }

        let check = self.is_session_valid().await;
        if check.valid {
            return true;
        }
        if check.network_error {
            debug!("Session check hit a network error, not attempting recovery");
            return false;
        }

        if self.refresh_session().await {
            self.notifier.notify(Notice::info(
                "Session restored",
                "Your session has been refreshed.",
            ));
            true
        } else {
            self.notifier.notify(Notice::destructive(
                "Session expired",
                "Please sign in again to continue.",
            ));
            false
        }
    }
}

/// User-facing categories of auth failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthErrorKind {
    Offline,
    EmailNotConfirmed,
    InvalidCredentials,
    AlreadyRegistered,
    RateLimited,
    NetworkFailure,
    Other,
}

impl AuthErrorKind {
    /// Match a raw auth error message. These are substring rules against the
    /// auth service's wording and break if that wording changes.
    pub fn from_message(message: &str, is_offline: bool) -> Self {
        if is_offline {
            return AuthErrorKind::Offline;
        }
        let message = message.to_lowercase();
        if message.contains("email not confirmed") {
            AuthErrorKind::EmailNotConfirmed
        } else if message.contains("invalid login credentials") {
            AuthErrorKind::InvalidCredentials
        } else if message.contains("already registered") || message.contains("already been registered") {
            AuthErrorKind::AlreadyRegistered
        } else if message.contains("rate limit") || message.contains("too many requests") {
            AuthErrorKind::RateLimited
        } else if message.contains("failed to fetch")
            || message.contains("networkerror")
            || message.contains("network error")
        {
            AuthErrorKind::NetworkFailure
        } else {
            AuthErrorKind::Other
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            AuthErrorKind::Offline => {
                "You appear to be offline. Please check your internet connection and try again."
            }
            AuthErrorKind::EmailNotConfirmed => {
                "Please confirm your email address before signing in."
            }
            AuthErrorKind::InvalidCredentials => "Invalid email or password. Please try again.",
            AuthErrorKind::AlreadyRegistered => {
                "An account with this email already exists. Please sign in instead."
            }
            AuthErrorKind::RateLimited => "Too many attempts. Please wait a moment and try again.",
            AuthErrorKind::NetworkFailure => {
                "Unable to reach the server. Please check your connection and try again."
            }
            AuthErrorKind::Other => "An unexpected error occurred. Please try again.",
        }
    }
}

/// Message to show for a failed sign-in, sign-up or session operation
pub fn auth_error_message(message: &str, is_offline: bool) -> &'static str {
    AuthErrorKind::from_message(message, is_offline).message()
}
