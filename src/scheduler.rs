//! Concurrency ceiling on active app records.

use crate::app::{AppRecord, LifecycleError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default number of apps allowed to be active at once
pub const DEFAULT_RUN_LIMIT: usize = 5;

/// Tracks active records and enforces the run limit.
///
/// The scheduler holds non-owning handles to records owned by the
/// [`Registry`](crate::registry::Registry). An identifier is tracked exactly
/// while its record has a supervision handle. The lock is held only for the
/// map update and the non-blocking `start()`/`stop()` call; process lifetimes
/// run on tasks spawned by the record.
pub struct RunScheduler {
    active: Mutex<HashMap<String, Arc<AppRecord>>>,
    limit: usize,
}

impl RunScheduler {
    pub fn new(limit: usize) -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Register `record` as active and start it.
    ///
    /// A record that is already tracked (its previous run ended without a
    /// stop) can be restarted without taking another slot.
    pub fn run_app(&self, record: &Arc<AppRecord>) -> Result<(), LifecycleError> {
        let mut active = self.active.lock();

        let already_tracked = active.contains_key(record.id());
        if !already_tracked && active.len() >= self.limit {
            warn!(app = %record.id(), limit = self.limit, "App limit reached");
            return Err(LifecycleError::CapacityExceeded(self.limit));
        }

        active.insert(record.id().to_string(), Arc::clone(record));
        if let Err(e) = record.start() {
            if !already_tracked {
                active.remove(record.id());
            }
            debug!(app = %record.id(), error = %e, "Start rejected");
            return Err(e);
        }

        info!(app = %record.id(), active = active.len(), limit = self.limit, "App scheduled");
        Ok(())
    }

    /// Stop a tracked record and release its slot
    pub fn stop_app(&self, record: &AppRecord) -> Result<(), LifecycleError> {
        let mut active = self.active.lock();

        if !active.contains_key(record.id()) {
            return Err(LifecycleError::NotActive(record.id().to_string()));
        }
        record.stop();
        active.remove(record.id());

        info!(app = %record.id(), active = active.len(), "App unscheduled");
        Ok(())
    }

    pub fn get_running_app(&self, id: &str) -> Option<Arc<AppRecord>> {
        self.active.lock().get(id).cloned()
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.active.lock().contains_key(id)
    }

    pub fn list_running_apps(&self) -> Vec<Arc<AppRecord>> {
        self.active.lock().values().cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Stop every tracked record (used at shutdown)
    pub fn stop_all(&self) {
        let mut active = self.active.lock();
        for (id, record) in active.drain() {
            debug!(app = %id, "Stopping app for shutdown");
            record.stop();
        }
    }
}

impl Default for RunScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_RUN_LIMIT)
    }
}
