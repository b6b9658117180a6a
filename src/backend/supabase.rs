use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use super::auth::AuthApi;
use super::realtime::RealtimeApi;
use super::rest::RestApi;
use super::{
    Backend, BackendError, ChangeCallback, EventMask, Query, Session, SubscriptionHandle,
};
use crate::config::{BackendConfig, SyncOptions};
use crate::models::CurrentUser;

/// [`Backend`] over a Supabase project: GoTrue auth, PostgREST and Realtime
pub struct SupabaseBackend {
    http_client: Client,
    auth: AuthApi,
    rest: RestApi,
    realtime: RealtimeApi,
}

impl SupabaseBackend {
    /// Create a backend with default options
    ///
    /// # Example
    ///
    /// ```
    /// use field_report_sync::backend::SupabaseBackend;
    /// use field_report_sync::config::BackendConfig;
    ///
    /// let config = BackendConfig::new("https://your-project.supabase.co", "anon-key".to_string()).unwrap();
    /// let backend = SupabaseBackend::new(&config);
    /// ```
    pub fn new(config: &BackendConfig) -> Self {
        Self::new_with_options(config, &SyncOptions::default())
    }

    pub fn new_with_options(config: &BackendConfig, options: &SyncOptions) -> Self {
        let http_client = Client::new();
        let url = config.base_url();
        Self {
            auth: AuthApi::new(
                &url,
                &config.anon_key,
                http_client.clone(),
                options.auto_refresh_token,
            ),
            rest: RestApi::new(&url, &config.anon_key, http_client.clone()),
            realtime: RealtimeApi::new(&url, &config.anon_key, options.heartbeat_interval),
            http_client,
        }
    }

    /// HTTP client shared with the network probe
    pub fn http_client(&self) -> Client {
        self.http_client.clone()
    }

    /// Sign in with email and password, storing the session
    pub async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, BackendError> {
        self.auth.sign_in_with_password(email, password).await
    }

    /// Sign out and forget the stored session
    pub async fn sign_out(&self) -> Result<(), BackendError> {
        self.auth.sign_out().await
    }

    /// Replace the stored session, e.g. one restored from disk
    pub async fn set_session(&self, session: Option<Session>) {
        self.auth.set_session(session).await;
    }

    /// User of the stored session
    pub async fn current_user(&self) -> Option<CurrentUser> {
        self.auth.current_session().await.map(|s| CurrentUser::from(&s.user))
    }
}

#[async_trait]
impl Backend for SupabaseBackend {
    async fn get_session(&self) -> Result<Option<Session>, BackendError> {
        self.auth.get_session().await
    }

    async fn refresh_session(&self) -> Result<Session, BackendError> {
        self.auth.refresh_session().await
    }

    async fn query(&self, query: &Query) -> Result<Vec<Value>, BackendError> {
        let token = self.auth.bearer_token().await;
        self.rest.select(query, &token).await
    }

    async fn insert(&self, collection: &str, record: Value) -> Result<(), BackendError> {
        let token = self.auth.bearer_token().await;
        self.rest.insert(collection, &record, &token).await
    }

    async fn subscribe(
        &self,
        collection: &str,
        events: EventMask,
        callback: ChangeCallback,
    ) -> Result<SubscriptionHandle, BackendError> {
        let token = self.auth.current_session().await.map(|s| s.access_token);
        self.realtime
            .subscribe(collection, events, token, callback)
            .await
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), BackendError> {
        self.realtime.unsubscribe(handle).await
    }
}
