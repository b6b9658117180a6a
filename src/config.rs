//! Configuration for the sync core and the backend connection

use std::time::Duration;
use url::Url;

use crate::error::{Error, Result};

/// Connection settings for the hosted backend.
/// Load these from the environment or a secure config source.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub url: Url,
    pub anon_key: String,
}

impl BackendConfig {
    /// Creates a new configuration, validating the URL.
    pub fn new(url_str: &str, anon_key: String) -> Result<Self> {
        let url = Url::parse(url_str)?;
        if anon_key.is_empty() {
            return Err(Error::config("anon_key cannot be empty"));
        }
        Ok(Self { url, anon_key })
    }

    /// Reads `SUPABASE_URL` and `SUPABASE_ANON_KEY`.
    pub fn from_env() -> Result<Self> {
        let url_str = std::env::var("SUPABASE_URL")
            .map_err(|_| Error::config("SUPABASE_URL environment variable not found"))?;
        let anon_key = std::env::var("SUPABASE_ANON_KEY")
            .map_err(|_| Error::config("SUPABASE_ANON_KEY environment variable not found"))?;
        Self::new(&url_str, anon_key)
    }

    /// Base URL without the trailing slash `Url` adds to bare hosts
    pub fn base_url(&self) -> String {
        self.url.as_str().trim_end_matches('/').to_string()
    }
}

/// Tuning knobs for the sync engine
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// The backend collection holding field reports
    pub collection: String,

    /// Column the collection is ordered by, newest first
    pub order_column: String,

    /// Local store key for the cached report list
    pub cache_key: String,

    /// Minimum time between effective refreshes
    pub debounce: Duration,

    /// Retries after the first failed query of a refresh cycle
    pub max_retries: u32,

    /// Base of the exponential backoff (`2^attempt * base`)
    pub retry_base_delay: Duration,

    /// Wait after a native online signal before probing
    pub settle_delay: Duration,

    /// Upper bound for a connectivity probe
    pub probe_timeout: Duration,

    /// Same-origin path hit by the HTTP probe
    pub probe_path: String,

    /// Whether an expired session is renewed on read
    pub auto_refresh_token: bool,

    /// Period of realtime heartbeats
    pub heartbeat_interval: Duration,

    /// Wait before the first attempt to restore a dropped realtime channel
    pub resubscribe_interval: Duration,

    /// Growth of the wait between restore attempts
    pub resubscribe_backoff_factor: f64,

    /// Upper bound of the wait between restore attempts
    pub max_resubscribe_interval: Duration,

    /// Give up restoring after this many attempts, `None` for no limit
    pub max_resubscribe_attempts: Option<u32>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            collection: "field_reports".to_string(),
            order_column: "submitted_at".to_string(),
            cache_key: "fieldReports".to_string(),
            debounce: Duration::from_millis(2000),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(1000),
            settle_delay: Duration::from_millis(500),
            probe_timeout: Duration::from_secs(5),
            probe_path: "/auth/v1/health".to_string(),
            auto_refresh_token: true,
            heartbeat_interval: Duration::from_secs(30),
            resubscribe_interval: Duration::from_millis(1000),
            resubscribe_backoff_factor: 1.5,
            max_resubscribe_interval: Duration::from_secs(30),
            max_resubscribe_attempts: None,
        }
    }
}

impl SyncOptions {
    /// Set the backend collection
    pub fn with_collection(mut self, value: &str) -> Self {
        self.collection = value.to_string();
        self
    }

    /// Set the cache key
    pub fn with_cache_key(mut self, value: &str) -> Self {
        self.cache_key = value.to_string();
        self
    }

    /// Set the debounce window
    pub fn with_debounce(mut self, value: Duration) -> Self {
        self.debounce = value;
        self
    }

    /// Set the retry budget
    pub fn with_max_retries(mut self, value: u32) -> Self {
        self.max_retries = value;
        self
    }

    /// Set the backoff base delay
    pub fn with_retry_base_delay(mut self, value: Duration) -> Self {
        self.retry_base_delay = value;
        self
    }

    /// Set the online settle delay
    pub fn with_settle_delay(mut self, value: Duration) -> Self {
        self.settle_delay = value;
        self
    }

    /// Set the probe timeout
    pub fn with_probe_timeout(mut self, value: Duration) -> Self {
        self.probe_timeout = value;
        self
    }

    /// Set the probe path
    pub fn with_probe_path(mut self, value: &str) -> Self {
        self.probe_path = value.to_string();
        self
    }

    /// Set whether expired sessions are renewed on read
    pub fn with_auto_refresh_token(mut self, value: bool) -> Self {
        self.auto_refresh_token = value;
        self
    }

    /// Set the realtime heartbeat period
    pub fn with_heartbeat_interval(mut self, value: Duration) -> Self {
        self.heartbeat_interval = value;
        self
    }

    /// Set the first wait before restoring a dropped realtime channel
    pub fn with_resubscribe_interval(mut self, value: Duration) -> Self {
        self.resubscribe_interval = value;
        self
    }

    /// Set the limit on channel restore attempts
    pub fn with_max_resubscribe_attempts(mut self, value: Option<u32>) -> Self {
        self.max_resubscribe_attempts = value;
        self
    }

    /// Wait before restore attempt number `attempt` (zero based)
    pub fn resubscribe_delay(&self, attempt: u32) -> Duration {
        let factor = self.resubscribe_backoff_factor.max(1.0).powi(attempt as i32);
        self.resubscribe_interval
            .mul_f64(factor)
            .min(self.max_resubscribe_interval)
    }

    /// Backoff delay before retry number `attempt` (zero based)
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        self.retry_base_delay * 2u32.saturating_pow(attempt)
    }
}
