//! Field report sync core
//!
//! Keeps a farm's field reports in sync between a local cache and a hosted
//! Supabase backend when the network comes and goes. Reads go through the
//! debounced, retrying [`sync::SyncEngine`]; writes go through the
//! [`submission::ReportSubmitter`], which saves reports locally while offline.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use field_report_sync::prelude::*;
//!
//! # async fn run() -> Result<(), Error> {
//! let config = BackendConfig::from_env()?;
//! let options = SyncOptions::default();
//! let backend = Arc::new(SupabaseBackend::new_with_options(&config, &options));
//!
//! let probe = HttpProbe::new(backend.http_client(), &config.base_url(), &options.probe_path)
//!     .with_api_key(&config.anon_key);
//! let connectivity = ConnectivityMonitor::new_with_options(true, Arc::new(probe), &options);
//!
//! let engine = SyncEngine::builder(backend.clone(), connectivity)
//!     .store(Arc::new(FileStore::open("field-reports.json")?))
//!     .options(options)
//!     .build();
//! engine.start().await;
//! println!("{} reports", engine.reports().len());
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod cache;
pub mod classify;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod fetch;
pub mod models;
pub mod notify;
pub mod session;
pub mod storage;
pub mod submission;
pub mod sync;

/// A convenience module for common imports
pub mod prelude {
    pub use crate::backend::{Backend, BackendError, SupabaseBackend};
    pub use crate::config::{BackendConfig, SyncOptions};
    pub use crate::connectivity::{ConnectivityMonitor, HttpProbe, NetworkProbe};
    pub use crate::error::Error;
    pub use crate::models::{CurrentUser, FileMeta, NewReport, Report};
    pub use crate::notify::{LogNotifier, Notice, Notifier};
    pub use crate::storage::{FileStore, LocalStore, MemoryStore};
    pub use crate::submission::{ReportSubmitter, SubmitOutcome};
    pub use crate::sync::{RefreshOutcome, SyncEngine, SyncState};
}
