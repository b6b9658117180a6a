//! Contract of the hosted backend this core consumes
//!
//! The sync engine only talks to a [`Backend`]. [`SupabaseBackend`] is the
//! concrete implementation over Auth, PostgREST and Realtime; tests plug in
//! fakes.

mod auth;
mod realtime;
mod rest;
mod session;
mod supabase;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

pub use realtime::{ChannelEvent, RealtimeMessage};
pub use session::{Session, User};
pub use supabase::SupabaseBackend;

/// Structured description of a backend failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct BackendError {
    /// Human readable message as reported by the backend
    pub message: String,
    /// Backend specific error code (`42P01`, `invalid_grant`, ...)
    pub code: Option<String>,
    /// HTTP status, absent for transport failures
    pub status: Option<u16>,
}

impl BackendError {
    pub fn new<T: fmt::Display>(message: T) -> Self {
        Self {
            message: message.to_string(),
            code: None,
            status: None,
        }
    }

    pub fn with_code(mut self, code: &str) -> Self {
        self.code = Some(code.to_string());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// A transport level failure, the request never got an answer
    pub fn network<T: fmt::Display>(message: T) -> Self {
        Self::new(format!("network error: {}", message))
    }

    /// Build from a non-success HTTP response body.
    ///
    /// Understands PostgREST (`code`, `message`, `details`, `hint`) and
    /// GoTrue (`error`, `error_description`, `msg`, `error_code`) bodies and
    /// falls back to the raw text.
    pub fn from_response(status: u16, body: &str) -> Self {
        let parsed = serde_json::from_str::<ApiErrorBody>(body).ok();
        let message = parsed
            .as_ref()
            .and_then(|b| {
                b.message
                    .clone()
                    .or_else(|| b.error_description.clone())
                    .or_else(|| b.msg.clone())
                    .or_else(|| b.error.clone())
            })
            .or_else(|| {
                let trimmed = body.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            })
            .unwrap_or_else(|| format!("request failed with status {}", status));

        let code = parsed.and_then(|b| b.code.or(b.error_code)).and_then(|code| match code {
            Value::String(s) => Some(s),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });

        Self {
            message,
            code,
            status: Some(status),
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            let error = Self::new(format!("invalid response body: {}", err));
            match err.status() {
                Some(status) => error.with_status(status.as_u16()),
                None => error,
            }
        } else if let Some(status) = err.status() {
            Self::new(err.to_string()).with_status(status.as_u16())
        } else {
            Self::network(err)
        }
    }
}

#[derive(Deserialize)]
struct ApiErrorBody {
    code: Option<Value>,
    error_code: Option<Value>,
    message: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
    msg: Option<String>,
}

/// Filter operator understood by the query primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOperator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FilterOperator::Eq => "eq",
            FilterOperator::Neq => "neq",
            FilterOperator::Gt => "gt",
            FilterOperator::Gte => "gte",
            FilterOperator::Lt => "lt",
            FilterOperator::Lte => "lte",
        };
        write!(f, "{}", s)
    }
}

/// A single `column operator value` condition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub column: String,
    pub operator: FilterOperator,
    pub value: String,
}

/// Sort specification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

/// A read of one collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
}

impl Query {
    pub fn new(collection: &str) -> Self {
        Self {
            collection: collection.to_string(),
            filters: Vec::new(),
            order: None,
        }
    }

    pub fn filter(mut self, column: &str, operator: FilterOperator, value: &str) -> Self {
        self.filters.push(Filter {
            column: column.to_string(),
            operator,
            value: value.to_string(),
        });
        self
    }

    pub fn eq(self, column: &str, value: &str) -> Self {
        self.filter(column, FilterOperator::Eq, value)
    }

    pub fn order(mut self, column: &str, ascending: bool) -> Self {
        self.order = Some(Order {
            column: column.to_string(),
            ascending,
        });
        self
    }
}

/// Kind of row change delivered by the change feed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "INSERT" => Some(ChangeKind::Insert),
            "UPDATE" => Some(ChangeKind::Update),
            "DELETE" => Some(ChangeKind::Delete),
            _ => None,
        }
    }
}

/// Which change kinds a subscription wants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventMask {
    All,
    Insert,
    Update,
    Delete,
}

impl EventMask {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventMask::All => "*",
            EventMask::Insert => "INSERT",
            EventMask::Update => "UPDATE",
            EventMask::Delete => "DELETE",
        }
    }

    pub fn matches(&self, kind: ChangeKind) -> bool {
        matches!(
            (self, kind),
            (EventMask::All, _)
                | (EventMask::Insert, ChangeKind::Insert)
                | (EventMask::Update, ChangeKind::Update)
                | (EventMask::Delete, ChangeKind::Delete)
        )
    }
}

/// One row-level change
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub schema: String,
    pub table: String,
    pub record: Option<Value>,
    pub old_record: Option<Value>,
    pub commit_timestamp: Option<String>,
}

pub type ChangeCallback = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

/// Opaque handle of a live subscription
#[derive(Debug)]
pub struct SubscriptionHandle {
    pub id: String,
    pub topic: String,
    closed: watch::Receiver<bool>,
}

impl SubscriptionHandle {
    /// A handle plus the sender the backend sets once the feed stops
    /// delivering. Dropping the sender counts as closing.
    pub fn new(id: String, topic: String) -> (Self, watch::Sender<bool>) {
        let (closed_tx, closed) = watch::channel(false);
        (Self { id, topic, closed }, closed_tx)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow() || self.closed.has_changed().is_err()
    }

    /// Resolves once the feed has stopped
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut closed = self.closed.clone();
        async move {
            loop {
                let done = *closed.borrow_and_update();
                if done || closed.changed().await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Operations the sync core needs from the hosted backend
#[async_trait]
pub trait Backend: Send + Sync {
    /// Current session, if any
    async fn get_session(&self) -> Result<Option<Session>, BackendError>;

    /// Renew the credentials of the current session
    async fn refresh_session(&self) -> Result<Session, BackendError>;

    /// Read rows of a collection
    async fn query(&self, query: &Query) -> Result<Vec<Value>, BackendError>;

    /// Insert one row
    async fn insert(&self, collection: &str, record: Value) -> Result<(), BackendError>;

    /// Start receiving row changes of a collection
    async fn subscribe(
        &self,
        collection: &str,
        events: EventMask,
        callback: ChangeCallback,
    ) -> Result<SubscriptionHandle, BackendError>;

    /// Release a subscription
    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), BackendError>;
}
