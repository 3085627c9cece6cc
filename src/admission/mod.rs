//! Fleet-wide concurrency cap on attached client sockets.
//!
//! A counting semaphore initialized with `MAX_CLIENTS` permits stands in for
//! the spec's counter-plus-condvar admission gate: a non-blocking
//! `try_acquire_owned` either yields a permit immediately or fails, and
//! dropping the returned permit is the release-and-signal step. The accept
//! path never suspends on this — it always either has a free permit or
//! rejects immediately, matching §4.4.

use std::sync::Arc;
use tokio::sync::{Semaphore, TryAcquireError};

pub struct AdmissionController {
    semaphore: Arc<Semaphore>,
}

/// Held by a worker for the lifetime of one client's handling. Dropping it
/// returns the permit and is the only release mechanism.
pub struct AdmissionPermit {
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl AdmissionController {
    pub fn new(max_clients: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_clients)),
        }
    }

    /// Attempt to admit one more client without suspending. `None` means the
    /// fleet is at capacity; the caller must reject with 503.
    pub fn try_admit(&self) -> Option<AdmissionPermit> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Some(AdmissionPermit { _permit: permit }),
            Err(TryAcquireError::NoPermits) => None,
            Err(TryAcquireError::Closed) => None,
        }
    }

    /// Count of clients currently admitted and not yet released.
    pub fn active_count(&self, max_clients: usize) -> usize {
        max_clients - self.semaphore.available_permits()
    }
}
