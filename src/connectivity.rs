//! Connectivity monitoring
//!
//! Offline signals are trusted immediately. Online signals are only trusted
//! after a settle delay and a successful probe, so a flaky reconnect does not
//! flip the state back and forth.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::SyncOptions;
use crate::fetch::Fetch;

/// Active check that the backend is reachable
#[async_trait]
pub trait NetworkProbe: Send + Sync {
    async fn probe(&self) -> bool;
}

/// `HEAD` request against a same-origin resource that is always served
pub struct HttpProbe {
    client: Client,
    url: String,
    api_key: Option<String>,
}

impl HttpProbe {
    pub fn new(client: Client, base_url: &str, path: &str) -> Self {
        Self {
            client,
            url: format!("{}{}", base_url.trim_end_matches('/'), path),
            api_key: None,
        }
    }

    /// Send `apikey` with the probe, needed by the hosted gateway
    pub fn with_api_key(mut self, key: &str) -> Self {
        self.api_key = Some(key.to_string());
        self
    }
}

#[async_trait]
impl NetworkProbe for HttpProbe {
    async fn probe(&self) -> bool {
        let cache_buster = Utc::now().timestamp_millis().to_string();
        let mut request = Fetch::head(&self.client, &self.url)
            .query("_", &cache_buster)
            .header("Cache-Control", "no-cache");
        if let Some(key) = &self.api_key {
            request = request.header("apikey", key);
        }
        match request.send().await {
            Ok(response) => {
                debug!("Probe {} answered {}", self.url, response.status());
                response.status().is_success()
            }
            Err(e) => {
                debug!("Probe {} failed: {}", self.url, e);
                false
            }
        }
    }
}

struct MonitorInner {
    offline: watch::Sender<bool>,
    probe: Arc<dyn NetworkProbe>,
    settle_delay: Duration,
    probe_timeout: Duration,
}

/// Process-wide `is_offline` flag, cheap to clone
#[derive(Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<MonitorInner>,
}

impl ConnectivityMonitor {
    /// `initially_online` is the platform's own indicator at startup
    pub fn new(initially_online: bool, probe: Arc<dyn NetworkProbe>) -> Self {
        Self::new_with_options(initially_online, probe, &SyncOptions::default())
    }

    pub fn new_with_options(
        initially_online: bool,
        probe: Arc<dyn NetworkProbe>,
        options: &SyncOptions,
    ) -> Self {
        let (offline, _) = watch::channel(!initially_online);
        Self {
            inner: Arc::new(MonitorInner {
                offline,
                probe,
                settle_delay: options.settle_delay,
                probe_timeout: options.probe_timeout,
            }),
        }
    }

    pub fn is_offline(&self) -> bool {
        *self.inner.offline.borrow()
    }

    /// Receiver that sees every change of the flag
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.offline.subscribe()
    }

    /// Native offline signal; returns true when this was a transition
    pub fn handle_offline(&self) -> bool {
        let changed = self.set_offline(true);
        if changed {
            info!("Connectivity lost");
        }
        changed
    }

    /// Native online signal; returns true only when the probe confirmed it
    /// and the monitor moved from offline to online
    pub async fn handle_online(&self) -> bool {
        sleep(self.inner.settle_delay).await;

        let reachable = match timeout(self.inner.probe_timeout, self.inner.probe.probe()).await {
            Ok(reachable) => reachable,
            Err(_) => {
                warn!("Connectivity probe timed out after {:?}", self.inner.probe_timeout);
                false
            }
        };

        if !reachable {
            warn!("Online signal not confirmed by probe, staying offline");
            return false;
        }

        let changed = self.set_offline(false);
        if changed {
            info!("Connectivity restored");
        }
        changed
    }

    fn set_offline(&self, offline: bool) -> bool {
        self.inner.offline.send_if_modified(|current| {
            if *current == offline {
                false
            } else {
                *current = offline;
                true
            }
        })
    }
}
