//! Concurrency admission controller
//!
//! The external generation provider rejects submissions once its own queue
//! fills up (`TASK_QUEUE_MAXED`), and recovering from that is expensive: the
//! prompt is wasted and the task state orphaned. The controller caps how
//! many generation requests this process keeps in flight so the provider
//! queue limit is never hit from here.
//!
//! A just-acquired slot is counted as running immediately, before the
//! provider confirms RUNNING. Polling never corrects the counters; only
//! `release()` does. This can transiently overcount running vs queued in
//! status output but keeps the counters race-free under concurrent pollers,
//! and it never violates the admission bound.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

/// Default in-flight cap against the provider
pub const DEFAULT_MAX_CONCURRENT: usize = 3;

#[derive(Debug, Default)]
struct Counters {
    /// Slots claimed, including queued-but-not-yet-running
    submitted: usize,
    /// Subset of `submitted` counted as actively executing
    running: usize,
}

/// Read-only snapshot of the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionStatus {
    pub submitted: usize,
    pub running: usize,
    pub queued: usize,
    pub max_concurrent: usize,
}

/// Gate limiting concurrent generation requests against the provider
///
/// Explicitly constructed and shared via `Arc` so tests get isolated
/// instances; this is a voluntary gate, protecting only requests issued
/// through it.
#[derive(Debug)]
pub struct AdmissionController {
    max_concurrent: usize,
    counters: Mutex<Counters>,
}

impl AdmissionController {
    pub fn new(max_concurrent: usize) -> Self {
        debug!(max_concurrent, "AdmissionController::new: called");
        Self {
            max_concurrent: max_concurrent.max(1),
            counters: Mutex::new(Counters::default()),
        }
    }

    /// Atomically claim a slot if one is free
    ///
    /// The check and both increments happen in one critical section, so
    /// concurrent callers can never admit more than `max_concurrent`.
    pub fn try_acquire(&self) -> bool {
        let mut counters = self.counters.lock().expect("admission mutex poisoned");
        if counters.submitted >= self.max_concurrent {
            debug!(
                submitted = counters.submitted,
                max_concurrent = self.max_concurrent,
                "AdmissionController::try_acquire: at capacity"
            );
            return false;
        }
        counters.submitted += 1;
        counters.running += 1;
        debug!(
            submitted = counters.submitted,
            running = counters.running,
            "AdmissionController::try_acquire: slot claimed"
        );
        true
    }

    /// Return a slot; floored at zero so a stray release cannot underflow
    pub fn release(&self) {
        let mut counters = self.counters.lock().expect("admission mutex poisoned");
        counters.submitted = counters.submitted.saturating_sub(1);
        counters.running = counters.running.saturating_sub(1);
        debug!(
            submitted = counters.submitted,
            running = counters.running,
            "AdmissionController::release: slot returned"
        );
    }

    pub fn status(&self) -> AdmissionStatus {
        let counters = self.counters.lock().expect("admission mutex poisoned");
        AdmissionStatus {
            submitted: counters.submitted,
            running: counters.running,
            queued: counters.submitted - counters.running,
            max_concurrent: self.max_concurrent,
        }
    }

    /// Claim a slot as an RAII guard; release happens on drop, exactly once,
    /// on every exit path
    pub fn try_acquire_slot(self: &Arc<Self>) -> Option<SlotGuard> {
        if self.try_acquire() {
            Some(SlotGuard {
                controller: Arc::clone(self),
            })
        } else {
            None
        }
    }

    /// Blocking wait-and-retry loop around `try_acquire`
    ///
    /// Callers bound the overall wait with their own timeout; the loop
    /// itself only sleeps between attempts.
    pub async fn acquire(self: &Arc<Self>, poll_backoff: Duration) -> SlotGuard {
        loop {
            if let Some(guard) = self.try_acquire_slot() {
                return guard;
            }
            let status = self.status();
            debug!(
                submitted = status.submitted,
                running = status.running,
                queued = status.queued,
                "AdmissionController::acquire: waiting for a free slot"
            );
            tokio::time::sleep(poll_backoff).await;
        }
    }
}

/// Held while a generation request is in flight
#[derive(Debug)]
pub struct SlotGuard {
    controller: Arc<AdmissionController>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.controller.release();
    }
}
