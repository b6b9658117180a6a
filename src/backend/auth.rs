//! Auth service access: password sign-in, session storage and renewal

use reqwest::Client;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{BackendError, Session};
use crate::fetch::Fetch;

const CLIENT_INFO: &str = concat!("field-report-sync/", env!("CARGO_PKG_VERSION"));

/// Client for the auth endpoints
pub(crate) struct AuthApi {
    url: String,
    key: String,
    client: Client,
    session: Arc<RwLock<Option<Session>>>,
    auto_refresh_token: bool,
}

impl AuthApi {
    pub(crate) fn new(url: &str, key: &str, client: Client, auto_refresh_token: bool) -> Self {
        Self {
            url: url.to_string(),
            key: key.to_string(),
            client,
            session: Arc::new(RwLock::new(None)),
            auto_refresh_token,
        }
    }

    fn auth_url(&self, path: &str) -> String {
        format!("{}/auth/v1{}", self.url, path)
    }

    /// Sign in a user with email and password
    pub(crate) async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, BackendError> {
        let url = self.auth_url("/token");

        let session = Fetch::post(&self.client, &url)
            .query("grant_type", "password")
            .header("apikey", &self.key)
            .header("X-Client-Info", CLIENT_INFO)
            .json(&json!({ "email": email, "password": password }))?
            .execute::<Session>()
            .await?
            .stamp_expiry();

        info!("Signed in as {}", session.user.id);
        *self.session.write().await = Some(session.clone());
        Ok(session)
    }

    /// Stored session, renewed first when expired and auto refresh is on
    pub(crate) async fn get_session(&self) -> Result<Option<Session>, BackendError> {
        let current = self.session.read().await.clone();
        match current {
            Some(session) if session.is_expired() && self.auto_refresh_token => {
                debug!("Stored session expired, refreshing");
                self.refresh_session().await.map(Some)
            }
            other => Ok(other),
        }
    }

    pub(crate) async fn current_session(&self) -> Option<Session> {
        self.session.read().await.clone()
    }

    pub(crate) async fn set_session(&self, session: Option<Session>) {
        *self.session.write().await = session;
    }

    /// Exchange the refresh token for a new session
    pub(crate) async fn refresh_session(&self) -> Result<Session, BackendError> {
        let refresh_token = match self.session.read().await.as_ref() {
            Some(session) => session.refresh_token.clone(),
            None => return Err(BackendError::new("Auth session missing!").with_status(401)),
        };

        let url = self.auth_url("/token");
        let result = Fetch::post(&self.client, &url)
            .query("grant_type", "refresh_token")
            .header("apikey", &self.key)
            .header("X-Client-Info", CLIENT_INFO)
            .json(&json!({ "refresh_token": refresh_token }))?
            .execute::<Session>()
            .await;

        match result {
            Ok(session) => {
                let session = session.stamp_expiry();
                *self.session.write().await = Some(session.clone());
                Ok(session)
            }
            Err(e) => {
                warn!("Session refresh failed: {}", e);
                Err(e)
            }
        }
    }

    /// Sign out the current user; the local session is cleared either way
    pub(crate) async fn sign_out(&self) -> Result<(), BackendError> {
        let token = match self.session.write().await.take() {
            Some(session) => session.access_token,
            None => return Ok(()),
        };

        let url = self.auth_url("/logout");
        Fetch::post(&self.client, &url)
            .header("apikey", &self.key)
            .header("X-Client-Info", CLIENT_INFO)
            .bearer_auth(&token)
            .execute_empty()
            .await
    }

    /// Token for data requests, the anon key when signed out
    pub(crate) async fn bearer_token(&self) -> String {
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| s.access_token.clone())
            .unwrap_or_else(|| self.key.clone())
    }
}
