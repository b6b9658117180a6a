#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::time::Instant;

use field_report_sync::backend::{
    Backend, BackendError, ChangeCallback, ChangeEvent, ChangeKind, EventMask, Query, Session,
    SubscriptionHandle, User,
};
use field_report_sync::connectivity::NetworkProbe;
use field_report_sync::models::CurrentUser;
use field_report_sync::notify::{Notice, Notifier};

/// In-process backend with scripted answers
pub struct FakeBackend {
    pub rows: Mutex<Vec<Value>>,
    /// Consumed one per query before `rows` is returned
    pub query_failures: Mutex<VecDeque<BackendError>>,
    pub queries: Mutex<Vec<(Instant, Query)>>,
    pub inserts: Mutex<Vec<(String, Value)>>,
    pub insert_failure: Mutex<Option<BackendError>>,
    pub session: Mutex<Result<Option<Session>, BackendError>>,
    pub refresh_result: Mutex<Result<Session, BackendError>>,
    pub callbacks: Mutex<HashMap<String, ChangeCallback>>,
    pub closers: Mutex<HashMap<String, watch::Sender<bool>>>,
    /// Subscribe attempts still to be refused
    pub subscribe_failures: AtomicUsize,
    pub subscribe_calls: AtomicUsize,
    pub unsubscribe_calls: AtomicUsize,
    next_id: AtomicUsize,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rows: Mutex::new(Vec::new()),
            query_failures: Mutex::new(VecDeque::new()),
            queries: Mutex::new(Vec::new()),
            inserts: Mutex::new(Vec::new()),
            insert_failure: Mutex::new(None),
            session: Mutex::new(Ok(Some(session()))),
            refresh_result: Mutex::new(Ok(session())),
            callbacks: Mutex::new(HashMap::new()),
            closers: Mutex::new(HashMap::new()),
            subscribe_failures: AtomicUsize::new(0),
            subscribe_calls: AtomicUsize::new(0),
            unsubscribe_calls: AtomicUsize::new(0),
            next_id: AtomicUsize::new(0),
        })
    }

    pub fn set_rows(&self, rows: Vec<Value>) {
        *self.rows.lock().unwrap() = rows;
    }

    pub fn fail_queries(&self, errors: impl IntoIterator<Item = BackendError>) {
        self.query_failures.lock().unwrap().extend(errors);
    }

    pub fn set_session(&self, session: Result<Option<Session>, BackendError>) {
        *self.session.lock().unwrap() = session;
    }

    pub fn query_count(&self) -> usize {
        self.queries.lock().unwrap().len()
    }

    pub fn query_times(&self) -> Vec<Instant> {
        self.queries.lock().unwrap().iter().map(|(at, _)| *at).collect()
    }

    pub fn active_subscriptions(&self) -> usize {
        self.callbacks.lock().unwrap().len()
    }

    /// End every live feed as if the server went away
    pub fn drop_feeds(&self) {
        for closer in self.closers.lock().unwrap().values() {
            let _ = closer.send(true);
        }
        self.callbacks.lock().unwrap().clear();
    }

    /// Deliver a change to every live subscription
    pub fn emit(&self, kind: ChangeKind, table: &str) {
        let callbacks: Vec<ChangeCallback> = self.callbacks.lock().unwrap().values().cloned().collect();
        for callback in callbacks {
            callback(ChangeEvent {
                kind,
                schema: "public".to_string(),
                table: table.to_string(),
                record: Some(json!({ "id": 99 })),
                old_record: None,
                commit_timestamp: None,
            });
        }
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn get_session(&self) -> Result<Option<Session>, BackendError> {
        self.session.lock().unwrap().clone()
    }

    async fn refresh_session(&self) -> Result<Session, BackendError> {
        self.refresh_result.lock().unwrap().clone()
    }

    async fn query(&self, query: &Query) -> Result<Vec<Value>, BackendError> {
        self.queries.lock().unwrap().push((Instant::now(), query.clone()));
        if let Some(error) = self.query_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        Ok(self.rows.lock().unwrap().clone())
    }

    async fn insert(&self, collection: &str, record: Value) -> Result<(), BackendError> {
        if let Some(error) = self.insert_failure.lock().unwrap().clone() {
            return Err(error);
        }
        self.inserts.lock().unwrap().push((collection.to_string(), record));
        Ok(())
    }

    async fn subscribe(
        &self,
        collection: &str,
        _events: EventMask,
        callback: ChangeCallback,
    ) -> Result<SubscriptionHandle, BackendError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .subscribe_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(network_error());
        }
        let id = format!("sub-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let (handle, closer) =
            SubscriptionHandle::new(id.clone(), format!("realtime:public:{}", collection));
        self.callbacks.lock().unwrap().insert(id.clone(), callback);
        self.closers.lock().unwrap().insert(id, closer);
        Ok(handle)
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), BackendError> {
        self.unsubscribe_calls.fetch_add(1, Ordering::SeqCst);
        self.callbacks.lock().unwrap().remove(&handle.id);
        self.closers.lock().unwrap().remove(&handle.id);
        Ok(())
    }
}

/// Keeps every notice for later inspection
#[derive(Default)]
pub struct RecordingNotifier {
    pub notices: Mutex<Vec<Notice>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn titles(&self) -> Vec<String> {
        self.notices.lock().unwrap().iter().map(|n| n.title.clone()).collect()
    }

    pub fn last(&self) -> Option<Notice> {
        self.notices.lock().unwrap().last().cloned()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notice: Notice) {
        self.notices.lock().unwrap().push(notice);
    }
}

/// Probe with a switchable answer
pub struct StaticProbe {
    pub reachable: AtomicBool,
    pub calls: AtomicUsize,
}

impl StaticProbe {
    pub fn new(reachable: bool) -> Arc<Self> {
        Arc::new(Self {
            reachable: AtomicBool::new(reachable),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl NetworkProbe for StaticProbe {
    async fn probe(&self) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.reachable.load(Ordering::SeqCst)
    }
}

pub fn session() -> Session {
    Session::new(
        "access".to_string(),
        "refresh".to_string(),
        User {
            id: "user-1".to_string(),
            email: Some("farmer@example.com".to_string()),
        },
        3600,
    )
}

pub fn user() -> CurrentUser {
    CurrentUser {
        id: "user-1".to_string(),
        email: Some("farmer@example.com".to_string()),
    }
}

pub fn row(id: i64, title: &str, submitted_at: &str) -> Value {
    json!({
        "id": id,
        "report_type": "crop",
        "location": "North field",
        "title": title,
        "description": "Observed on walk",
        "submitted_at": submitted_at,
        "files": null,
        "user_id": "user-1",
    })
}

pub fn network_error() -> BackendError {
    BackendError::network("connection refused")
}

/// Let spawned tasks run without advancing the clock
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}
