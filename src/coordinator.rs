//! Update coordination — per-key mutual exclusion plus global build admission.
//!
//! Two independent mechanisms, both fail-fast:
//!   * a concurrent set of in-flight keys serializes updates to one key;
//!   * a counting semaphore bounds concurrent first-time builds across all
//!     keys (the most expensive path).
//!
//! Neither queues. Callers that hit a limit get `ConcurrencyLimit` and decide
//! for themselves whether to retry.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::KbError;

/// Token proving exclusive update rights for one key.
///
/// Releases on drop, so a failed pipeline run can never leave its key stuck
/// in the in-flight set. `release` is idempotent.
#[derive(Debug)]
pub struct KeyGuard {
    key: String,
    in_flight: Arc<Mutex<HashSet<String>>>,
    released: bool,
}

impl KeyGuard {
    /// Explicit early release. Safe to let the guard drop instead.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.in_flight
                .lock()
                .expect("in-flight lock poisoned")
                .remove(&self.key);
            debug!(key = %self.key, "per-key lock released");
        }
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Per-key exclusion set plus global build admission limiter.
#[derive(Debug)]
pub struct UpdateCoordinator {
    in_flight: Arc<Mutex<HashSet<String>>>,
    build_slots: Arc<Semaphore>,
    max_builds: usize,
}

impl UpdateCoordinator {
    pub fn new(max_concurrent_builds: usize) -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            build_slots: Arc::new(Semaphore::new(max_concurrent_builds)),
            max_builds: max_concurrent_builds,
        }
    }

    /// Claim exclusive update rights for `key`, or fail fast if an update is
    /// already in flight.
    pub fn begin(&self, key: &str) -> Result<KeyGuard, KbError> {
        let mut set = self.in_flight.lock().expect("in-flight lock poisoned");
        if !set.insert(key.to_string()) {
            return Err(KbError::ConcurrencyLimit(format!(
                "update already in flight for key '{key}'"
            )));
        }
        debug!(key, "per-key lock acquired");
        Ok(KeyGuard {
            key: key.to_string(),
            in_flight: Arc::clone(&self.in_flight),
            released: false,
        })
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.in_flight
            .lock()
            .expect("in-flight lock poisoned")
            .contains(key)
    }

    /// Claim one global build slot without waiting. The permit releases on
    /// drop.
    pub fn acquire_build_slot(&self) -> Result<OwnedSemaphorePermit, KbError> {
        Arc::clone(&self.build_slots)
            .try_acquire_owned()
            .map_err(|_| {
                KbError::ConcurrencyLimit(format!(
                    "all {} build slots in use; retry later",
                    self.max_builds
                ))
            })
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().expect("in-flight lock poisoned").len()
    }

    pub fn build_slots_in_use(&self) -> usize {
        self.max_builds - self.build_slots.available_permits()
    }

    pub fn max_builds(&self) -> usize {
        self.max_builds
    }
}
