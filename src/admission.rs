//! Admission Control Module
//!
//! Bounds how many requests may occupy an engine at once. Waiting for a slot is
//! limited in time: a request that cannot get in before its wait limit is turned
//! away with [`CapacityExceeded`] instead of queuing without bound.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::metrics::{ADMISSION_REJECTIONS, SLOTS_IN_FLIGHT};

/// No slot became free within the caller's wait limit
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{pipeline} capacity exceeded: no slot freed within {waited_ms}ms")]
pub struct CapacityExceeded {
    pub pipeline: &'static str,
    pub waited_ms: u64,
}

/// Counting semaphore with a time-limited acquire
#[derive(Clone)]
pub struct AdmissionController {
    pipeline: &'static str,
    capacity: usize,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
}

impl AdmissionController {
    pub fn new(pipeline: &'static str, capacity: usize) -> Self {
        Self {
            pipeline,
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wait up to `wait_limit` for a slot.
    ///
    /// Waiters are not served in any guaranteed order relative to each other;
    /// whoever is polled first after a release gets the permit.
    pub async fn acquire(&self, wait_limit: Duration) -> Result<AdmissionSlot, CapacityExceeded> {
        let started = Instant::now();
        match tokio::time::timeout(wait_limit, self.semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => {
                debug!(
                    pipeline = self.pipeline,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "Admission slot acquired"
                );
                Ok(self.slot(permit))
            }
            // The semaphore is never closed, so this arm only guards the API
            Ok(Err(_)) | Err(_) => {
                let waited_ms = started.elapsed().as_millis() as u64;
                ADMISSION_REJECTIONS.with_label_values(&[self.pipeline]).inc();
                warn!(
                    pipeline = self.pipeline,
                    waited_ms,
                    capacity = self.capacity,
                    "Admission rejected, no slot freed in time"
                );
                Err(CapacityExceeded {
                    pipeline: self.pipeline,
                    waited_ms,
                })
            }
        }
    }

    /// Take a slot only if one is free right now
    pub fn try_acquire(&self) -> Result<AdmissionSlot, CapacityExceeded> {
        let permit = self.semaphore.clone().try_acquire_owned().map_err(|_| {
            ADMISSION_REJECTIONS.with_label_values(&[self.pipeline]).inc();
            CapacityExceeded {
                pipeline: self.pipeline,
                waited_ms: 0,
            }
        })?;
        Ok(self.slot(permit))
    }

    fn slot(&self, permit: OwnedSemaphorePermit) -> AdmissionSlot {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        SLOTS_IN_FLIGHT.with_label_values(&[self.pipeline]).inc();
        AdmissionSlot {
            _permit: permit,
            pipeline: self.pipeline,
            acquired_at: Utc::now(),
            started: Instant::now(),
            in_flight: self.in_flight.clone(),
        }
    }

    pub fn pipeline(&self) -> &'static str {
        self.pipeline
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots free right now
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Slots held right now
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

/// RAII permit; the slot goes back to the controller when this is dropped,
/// including during unwinding.
#[derive(Debug)]
pub struct AdmissionSlot {
    _permit: OwnedSemaphorePermit,
    pipeline: &'static str,
    acquired_at: DateTime<Utc>,
    started: Instant,
    in_flight: Arc<AtomicUsize>,
}

impl AdmissionSlot {
    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    pub fn held_for(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        SLOTS_IN_FLIGHT.with_label_values(&[self.pipeline]).dec();
        debug!(
            pipeline = self.pipeline,
            held_ms = self.started.elapsed().as_millis() as u64,
            "Admission slot released"
        );
    }
}
