//! Report submission pipeline

use chrono::Utc;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::models::{NewReport, Report, TEMP_ID_PREFIX};
use crate::notify::Notice;
use crate::sync::{EngineInner, SyncEngine};

/// How a submission was handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Inserted remotely; the row shows up with the next refresh
    Submitted,
    /// Stored locally under a temporary id, not queued for replay
    SavedOffline(Report),
}

/// Clears the submitting flag however the submission ends
struct SubmittingGuard<'a>(&'a EngineInner);

impl<'a> SubmittingGuard<'a> {
    fn enter(inner: &'a EngineInner) -> Self {
        inner.publish(|state| state.is_submitting = true);
        Self(inner)
    }
}

impl Drop for SubmittingGuard<'_> {
    fn drop(&mut self) {
        self.0.publish(|state| state.is_submitting = false);
    }
}

/// Accepts new reports and routes them to the backend or the local cache
#[derive(Clone)]
pub struct ReportSubmitter {
    engine: SyncEngine,
}

impl ReportSubmitter {
    pub fn new(engine: SyncEngine) -> Self {
        Self { engine }
    }

    /// Submit a report.
    ///
    /// Needs a signed-in user. Offline, the report gets a `temp-` id and is
    /// put in front of the cache and the published list. Online, it is
    /// inserted remotely; failures are reported and returned, never retried.
    pub async fn add_report(&self, draft: NewReport) -> Result<SubmitOutcome> {
        let inner: &Arc<EngineInner> = &self.engine.inner;

        let Some(user) = inner.current_user() else {
            inner.notifier.notify(Notice::destructive(
                "Authentication required",
                "Please sign in to submit reports.",
            ));
            return Err(Error::AuthRequired);
        };

        let _submitting = SubmittingGuard::enter(inner);

        if inner.connectivity.is_offline() {
            let report = Report::offline(draft, next_temp_id(inner), Utc::now());
            if let Err(e) = inner.cache.prepend(report.clone()) {
                warn!("Failed to cache offline report {}: {}", report.id, e);
                inner.notifier.notify(Notice::destructive(
                    "Could not save report",
                    "The report could not be stored on this device.",
                ));
                return Err(e);
            }
            let queued = report.clone();
            inner.publish(|state| state.reports.insert(0, queued));
            info!("Saved report {} offline", report.id);
            inner.notifier.notify(Notice::info(
                "Saved offline",
                "Your report will be synced when you are back online.",
            ));
            return Ok(SubmitOutcome::SavedOffline(report));
        }

        let record = draft.to_record(&user.id);
        match inner.backend.insert(&inner.options.collection, record).await {
            Ok(()) => {
                info!("Submitted report for {}", user.id);
                inner.notifier.notify(Notice::info(
                    "Report submitted",
                    "Your field report has been submitted.",
                ));
                Ok(SubmitOutcome::Submitted)
            }
            Err(e) => {
                warn!("Report submission failed: {}", e);
                inner.notifier.notify(Notice::destructive(
                    "Submission failed",
                    &format!("Could not submit the report: {}", e.message),
                ));
                Err(Error::Backend(e))
            }
        }
    }
}

impl SyncEngine {
    /// Submission pipeline sharing this engine's cache and state
    pub fn submitter(&self) -> ReportSubmitter {
        ReportSubmitter::new(self.clone())
    }
}

/// `temp-<millis>`, bumped when two reports land in the same millisecond
fn next_temp_id(inner: &EngineInner) -> String {
    let now = Utc::now().timestamp_millis();
    let mut previous = inner.last_temp_id.load(Ordering::SeqCst);
    loop {
        let candidate = now.max(previous + 1);
        match inner.last_temp_id.compare_exchange(
            previous,
            candidate,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => return format!("{}{}", TEMP_ID_PREFIX, candidate),
            Err(actual) => previous = actual,
        }
    }
}
