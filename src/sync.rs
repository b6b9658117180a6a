//! Remote sync engine
//!
//! [`SyncEngine::refresh_reports`] is the single read path. It is debounced
//! and single-flight: one refresh cycle owns an in-flight token from the
//! first query until it succeeds or gives up, backoff waits included, and
//! every call that arrives meanwhile is dropped.
//!
//! A cycle goes offline → cache, otherwise session check → query → publish
//! and write through to the cache. Failed queries are retried on a timer
//! with exponential backoff; once the budget is spent the cycle falls back to
//! the cache.
//!
//! A realtime channel that stops on its own is released and reopened with a
//! growing delay, followed by one refresh.

use futures_util::future::{BoxFuture, FutureExt};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::backend::{
    Backend, ChangeCallback, ChangeEvent, EventMask, Query, SubscriptionHandle,
};
use crate::cache::ReportCache;
use crate::classify::{ErrorClassifier, ErrorKind, SubstringClassifier};
use crate::config::SyncOptions;
use crate::connectivity::ConnectivityMonitor;
use crate::models::{reports_from_rows, CurrentUser, Report};
use crate::notify::{LogNotifier, Notice, Notifier};
use crate::session::SessionGuard;
use crate::storage::{LocalStore, MemoryStore};

/// Snapshot published to consumers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncState {
    pub reports: Vec<Report>,
    pub loading: bool,
    pub error: bool,
    pub is_submitting: bool,
}

/// What a call to [`SyncEngine::refresh_reports`] did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Dropped, the previous refresh started less than the debounce window ago
    Debounced,
    /// Dropped, another refresh cycle is still running or waiting to retry
    InFlight,
    /// The engine was shut down
    Closed,
    /// Offline; the cached collection was published
    FromCache(usize),
    /// A signed-in user has no valid session
    SessionInvalid,
    /// The query failed and will be retried after `delay`
    RetryScheduled { attempt: u32, delay: Duration },
    /// Fresh data was published and cached
    Fetched(usize),
    /// Gave up; `cached` reports were published as a fallback
    Failed { kind: ErrorKind, cached: usize },
}

struct InFlightToken(Arc<AtomicBool>);

impl InFlightToken {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag.clone()))
    }
}

impl Drop for InFlightToken {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub(crate) struct EngineInner {
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) cache: ReportCache,
    pub(crate) connectivity: ConnectivityMonitor,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) options: SyncOptions,
    session: SessionGuard,
    classifier: Arc<dyn ErrorClassifier>,
    state: watch::Sender<SyncState>,
    user: RwLock<Option<CurrentUser>>,
    last_refresh: Mutex<Option<Instant>>,
    in_flight: Arc<AtomicBool>,
    retry_count: AtomicU32,
    closed: AtomicBool,
    subscription: AsyncMutex<Option<SubscriptionHandle>>,
    pub(crate) last_temp_id: AtomicI64,
}

impl EngineInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// A realtime channel is only held for a signed-in user while online
    fn wants_subscription(&self) -> bool {
        !self.is_closed() && !self.connectivity.is_offline() && self.current_user().is_some()
    }

    pub(crate) fn current_user(&self) -> Option<CurrentUser> {
        self.user.read().ok().and_then(|user| user.clone())
    }

    /// Apply a change to the published state; a no-op after shutdown
    pub(crate) fn publish(&self, modify: impl FnOnce(&mut SyncState)) {
        if self.is_closed() {
            return;
        }
        self.state.send_modify(modify);
    }

    fn publish_cached(&self) -> usize {
        let cached = self.cache.load();
        let count = cached.len();
        self.publish(|state| {
            state.reports = cached;
            state.error = false;
            state.loading = false;
        });
        count
    }

    fn fail_with_cache_fallback(&self, kind: ErrorKind) -> RefreshOutcome {
        let cached = self.cache.load();
        let count = cached.len();

        if kind == ErrorKind::Auth {
            self.notifier.notify(Notice::destructive(
                "Authentication error",
                "Your session has expired. Please sign in again.",
            ));
        } else if count > 0 {
            self.notifier.notify(Notice::info(
                "Using cached data",
                "Could not reach the server. Showing your saved reports.",
            ));
        } else {
            self.notifier.notify(Notice::destructive(
                "Failed to load reports",
                "Please check your connection and try again.",
            ));
        }

        self.publish(|state| {
            if count > 0 {
                state.reports = cached;
            }
            state.error = true;
            state.loading = false;
        });
        RefreshOutcome::Failed { kind, cached: count }
    }
}

/// Keeps the in-memory report list in sync with the backend.
/// Clones share the same engine.
#[derive(Clone)]
pub struct SyncEngine {
    pub(crate) inner: Arc<EngineInner>,
}

/// Assembles a [`SyncEngine`] from its collaborators
pub struct SyncEngineBuilder {
    backend: Arc<dyn Backend>,
    connectivity: ConnectivityMonitor,
    store: Option<Arc<dyn LocalStore>>,
    notifier: Option<Arc<dyn Notifier>>,
    classifier: Option<Arc<dyn ErrorClassifier>>,
    options: SyncOptions,
    user: Option<CurrentUser>,
}

impl SyncEngineBuilder {
    /// Local store for the report cache, in-memory by default
    pub fn store(mut self, store: Arc<dyn LocalStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Notification sink, the log by default
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Error classifier, [`SubstringClassifier`] by default
    pub fn classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }

    /// Signed-in user at startup
    pub fn user(mut self, user: Option<CurrentUser>) -> Self {
        self.user = user;
        self
    }

    pub fn build(self) -> SyncEngine {
        let store = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let notifier = self.notifier.unwrap_or_else(|| Arc::new(LogNotifier));
        let classifier = self
            .classifier
            .unwrap_or_else(|| Arc::new(SubstringClassifier));
        let session = SessionGuard::new(
            self.backend.clone(),
            self.connectivity.clone(),
            notifier.clone(),
            classifier.clone(),
        );
        let (state, _) = watch::channel(SyncState::default());

        SyncEngine {
            inner: Arc::new(EngineInner {
                backend: self.backend,
                cache: ReportCache::new(store, &self.options.cache_key),
                connectivity: self.connectivity,
                notifier,
                options: self.options,
                session,
                classifier,
                state,
                user: RwLock::new(self.user),
                last_refresh: Mutex::new(None),
                in_flight: Arc::new(AtomicBool::new(false)),
                retry_count: AtomicU32::new(0),
                closed: AtomicBool::new(false),
                subscription: AsyncMutex::new(None),
                last_temp_id: AtomicI64::new(0),
            }),
        }
    }
}

impl SyncEngine {
    pub fn builder(backend: Arc<dyn Backend>, connectivity: ConnectivityMonitor) -> SyncEngineBuilder {
        SyncEngineBuilder {
            backend,
            connectivity,
            store: None,
            notifier: None,
            classifier: None,
            options: SyncOptions::default(),
            user: None,
        }
    }

    /// Current snapshot
    pub fn state(&self) -> SyncState {
        self.inner.state.borrow().clone()
    }

    /// Receiver that sees every published snapshot
    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.inner.state.subscribe()
    }

    pub fn reports(&self) -> Vec<Report> {
        self.inner.state.borrow().reports.clone()
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.inner.connectivity
    }

    pub fn session_guard(&self) -> &SessionGuard {
        &self.inner.session
    }

    pub fn cache(&self) -> &ReportCache {
        &self.inner.cache
    }

    pub fn current_user(&self) -> Option<CurrentUser> {
        self.inner.current_user()
    }

    /// Initial load plus realtime subscription
    pub async fn start(&self) -> RefreshOutcome {
        self.resubscribe().await;
        self.refresh_reports().await
    }

    /// Change the signed-in user; the realtime subscription follows
    pub async fn set_user(&self, user: Option<CurrentUser>) {
        match self.inner.user.write() {
            Ok(mut current) => *current = user,
            Err(_) => {
                error!("User slot lock poisoned, keeping previous user");
                return;
            }
        }
        self.resubscribe().await;
    }

    /// Native online signal. Returns true when the probe confirmed it, in
    /// which case the subscription is restored and one refresh is started.
    pub async fn network_online(&self) -> bool {
        if !self.inner.connectivity.handle_online().await {
            return false;
        }
        self.resubscribe().await;
        let outcome = self.refresh_reports().await;
        debug!("Refresh after reconnect: {:?}", outcome);
        true
    }

    /// Native offline signal
    pub async fn network_offline(&self) {
        if self.inner.connectivity.handle_offline() {
            self.resubscribe().await;
        }
    }

    /// Stop publishing, cancel pending retries and drop the subscription
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.teardown_subscription().await;
        info!("Sync engine shut down");
    }

    /// Debounced, single-flight refresh of the report collection
    pub async fn refresh_reports(&self) -> RefreshOutcome {
        if self.inner.is_closed() {
            return RefreshOutcome::Closed;
        }

        let token = {
            let mut last = match self.inner.last_refresh.lock() {
                Ok(last) => last,
                Err(poisoned) => poisoned.into_inner(),
            };
            let now = Instant::now();
            if let Some(previous) = *last {
                if now.duration_since(previous) < self.inner.options.debounce {
                    debug!("Refresh debounced");
                    return RefreshOutcome::Debounced;
                }
            }
            let Some(token) = InFlightToken::acquire(&self.inner.in_flight) else {
                debug!("Refresh already in flight");
                return RefreshOutcome::InFlight;
            };
            *last = Some(now);
            token
        };

        self.inner.retry_count.store(0, Ordering::SeqCst);
        run_cycle(self.inner.clone(), token).await
    }

    /// Drop the current subscription and open a new one when a user is
    /// signed in and the network is up. Returns true when a subscription is
    /// held afterwards.
    pub async fn resubscribe(&self) -> bool {
        let mut slot = self.inner.subscription.lock().await;
        if let Some(handle) = slot.take() {
            release(&*self.inner.backend, handle).await;
        }

        if !self.inner.wants_subscription() {
            return false;
        }

        let engine = Arc::downgrade(&self.inner);
        let callback: ChangeCallback = Arc::new(move |change: ChangeEvent| {
            let Some(inner) = engine.upgrade() else {
                return;
            };
            debug!("{:?} on {}, refreshing", change.kind, change.table);
            let engine = SyncEngine { inner };
            tokio::spawn(async move {
                engine.refresh_reports().await;
            });
        });

        match self
            .inner
            .backend
            .subscribe(&self.inner.options.collection, EventMask::All, callback)
            .await
        {
            Ok(handle) => {
                info!("Subscribed to changes on {}", handle.topic);
                self.watch_subscription(&handle);
                *slot = Some(handle);
                true
            }
            Err(e) => {
                warn!("Realtime subscription failed: {}", e);
                false
            }
        }
    }

    /// True while a live realtime subscription is held
    pub async fn is_subscribed(&self) -> bool {
        self.inner
            .subscription
            .lock()
            .await
            .as_ref()
            .map_or(false, |handle| !handle.is_closed())
    }

    fn watch_subscription(&self, handle: &SubscriptionHandle) {
        let closed = handle.closed();
        let id = handle.id.clone();
        let engine = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            closed.await;
            if let Some(inner) = engine.upgrade() {
                restore_subscription(inner, id).await;
            }
        });
    }

    async fn teardown_subscription(&self) {
        let handle = self.inner.subscription.lock().await.take();
        if let Some(handle) = handle {
            release(&*self.inner.backend, handle).await;
        }
    }
}

// Runs when a held channel stops on its own: released handles are no longer
// in the slot and are ignored. Boxed because it re-enters `resubscribe`.
fn restore_subscription(inner: Arc<EngineInner>, id: String) -> BoxFuture<'static, ()> {
    async move {
        let stale = {
            let mut slot = inner.subscription.lock().await;
            if !slot.as_ref().map_or(false, |handle| handle.id == id) {
                return;
            }
            slot.take()
        };
        if let Some(handle) = stale {
            warn!("Realtime channel {} closed, resubscribing", handle.topic);
            release(&*inner.backend, handle).await;
        }

        let engine = SyncEngine { inner };
        let options = &engine.inner.options;
        let mut attempt = 0;
        loop {
            if !engine.inner.wants_subscription() {
                debug!("Not restoring realtime channel, no longer wanted");
                return;
            }
            if let Some(max) = options.max_resubscribe_attempts {
                if attempt >= max {
                    error!("Giving up on realtime after {} attempts", attempt);
                    return;
                }
            }
            let delay = options.resubscribe_delay(attempt);
            attempt += 1;
            sleep(delay).await;

            if engine.inner.subscription.lock().await.is_some() {
                debug!("Realtime channel already restored");
                return;
            }
            if engine.resubscribe().await {
                info!("Realtime channel restored after {} attempt(s)", attempt);
                // Changes may have been missed while the channel was down.
                let outcome = engine.refresh_reports().await;
                debug!("Refresh after restore: {:?}", outcome);
                return;
            }
            warn!("Restoring realtime channel failed, attempt {}", attempt);
        }
    }
    .boxed()
}

async fn release(backend: &dyn Backend, handle: SubscriptionHandle) {
    let topic = handle.topic.clone();
    match backend.unsubscribe(handle).await {
        Ok(()) => debug!("Released subscription on {}", topic),
        Err(e) => warn!("Failed to release subscription on {}: {}", topic, e),
    }
}

// Boxed because a failed attempt spawns the next attempt of the same cycle.
fn run_cycle(inner: Arc<EngineInner>, token: InFlightToken) -> BoxFuture<'static, RefreshOutcome> {
    async move {
        if inner.is_closed() {
            return RefreshOutcome::Closed;
        }

        if inner.connectivity.is_offline() {
            let count = inner.publish_cached();
            info!("Offline, showing {} cached reports", count);
            return RefreshOutcome::FromCache(count);
        }

        inner.publish(|state| state.loading = true);

        if inner.current_user().is_some() {
            let check = inner.session.is_session_valid().await;
            if !check.valid && !check.network_error {
                warn!("Signed-in user has no valid session, aborting refresh");
                inner.notifier.notify(Notice::destructive(
                    "Session invalid",
                    "Your session is no longer valid. Please sign in again.",
                ));
                inner.publish(|state| {
                    state.error = true;
                    state.loading = false;
                });
                return RefreshOutcome::SessionInvalid;
            }
        }

        let query = Query::new(&inner.options.collection).order(&inner.options.order_column, false);
        let result = inner.backend.query(&query).await;
        if inner.is_closed() {
            return RefreshOutcome::Closed;
        }

        match result {
            Ok(rows) => {
                let reports = reports_from_rows(rows);
                let count = reports.len();
                inner.retry_count.store(0, Ordering::SeqCst);
                if let Err(e) = inner.cache.save(&reports) {
                    warn!("Failed to cache reports: {}", e);
                }
                inner.publish(|state| {
                    state.reports = reports;
                    state.error = false;
                    state.loading = false;
                });
                info!("Fetched {} reports", count);
                RefreshOutcome::Fetched(count)
            }
            Err(e) => {
                if inner.connectivity.is_offline() {
                    debug!("Query failed while offline: {}", e);
                    let count = inner.publish_cached();
                    return RefreshOutcome::FromCache(count);
                }

                let kind = inner.classifier.classify(&e);
                let attempt = inner.retry_count.load(Ordering::SeqCst);
                if kind.is_retryable() && attempt < inner.options.max_retries {
                    let delay = inner.options.retry_delay(attempt);
                    inner.retry_count.store(attempt + 1, Ordering::SeqCst);
                    warn!(
                        "Fetching reports failed ({:?}): {}. Retry {}/{} in {:?}",
                        kind,
                        e,
                        attempt + 1,
                        inner.options.max_retries,
                        delay
                    );
                    let next = inner.clone();
                    tokio::spawn(async move {
                        sleep(delay).await;
                        if next.is_closed() {
                            return;
                        }
                        run_cycle(next, token).await;
                    });
                    return RefreshOutcome::RetryScheduled {
                        attempt: attempt + 1,
                        delay,
                    };
                }

                error!("Fetching reports failed ({:?}): {}", kind, e);
                inner.fail_with_cache_fallback(kind)
            }
        }
    }
    .boxed()
}
