//! Local cache of the report collection

use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::models::Report;
use crate::storage::LocalStore;

/// Report list snapshot kept under a fixed key of a [`LocalStore`]
#[derive(Clone)]
pub struct ReportCache {
    store: Arc<dyn LocalStore>,
    key: String,
}

impl ReportCache {
    pub fn new(store: Arc<dyn LocalStore>, key: &str) -> Self {
        Self {
            store,
            key: key.to_string(),
        }
    }

    /// Cached reports; empty when nothing is stored or the entry is unreadable
    pub fn load(&self) -> Vec<Report> {
        let Some(raw) = self.store.get(&self.key) else {
            return Vec::new();
        };
        match serde_json::from_str::<Vec<Report>>(&raw) {
            Ok(reports) => reports,
            Err(e) => {
                warn!("Discarding unreadable report cache: {}", e);
                Vec::new()
            }
        }
    }

    /// Replace the cached collection
    pub fn save(&self, reports: &[Report]) -> Result<()> {
        let raw = serde_json::to_string(reports)?;
        self.store.set(&self.key, &raw)?;
        debug!("Cached {} reports", reports.len());
        Ok(())
    }

    /// Put one report in front of the cached collection
    pub fn prepend(&self, report: Report) -> Result<Vec<Report>> {
        let mut reports = self.load();
        reports.insert(0, report);
        self.save(&reports)?;
        Ok(reports)
    }

    pub fn clear(&self) -> Result<()> {
        self.store.remove(&self.key)
    }
}
