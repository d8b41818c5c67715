//! At-most-one-in-flight guard.
//!
//! A [`SingleFlight`] hands out at most one permit at a time. Callers that
//! fail to acquire a permit drop their work instead of queueing it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct SingleFlight {
    busy: AtomicBool,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to claim the slot. Returns `None` if another permit is alive.
    pub fn try_acquire(&self) -> Option<FlightPermit<'_>> {
        self.claim().then_some(FlightPermit { flight: self })
    }

    /// Like [`try_acquire`](Self::try_acquire), for permits that move into a spawned task.
    pub fn try_acquire_owned(self: &Arc<Self>) -> Option<OwnedFlightPermit> {
        self.claim().then(|| OwnedFlightPermit {
            flight: Arc::clone(self),
        })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    fn claim(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn release(&self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// Releases the slot on drop.
#[must_use = "the slot is released as soon as the permit is dropped"]
pub struct FlightPermit<'a> {
    flight: &'a SingleFlight,
}

impl Drop for FlightPermit<'_> {
    fn drop(&mut self) {
        self.flight.release();
    }
}

/// Releases the slot on drop.
#[must_use = "the slot is released as soon as the permit is dropped"]
pub struct OwnedFlightPermit {
    flight: Arc<SingleFlight>,
}

impl Drop for OwnedFlightPermit {
    fn drop(&mut self) {
        self.flight.release();
    }
}
