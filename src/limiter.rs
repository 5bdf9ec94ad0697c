//! Bounded concurrency per destination.
//!
//! A limiter admits at most `capacity` holders at once. Further callers wait
//! in FIFO order (tokio's semaphore is fair) and are resumed as permits are
//! dropped. Acquisition never fails, it only delays.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug)]
pub struct ConcurrencyLimiter {
    name: String,
    capacity: usize,
    semaphore: Arc<Semaphore>,
}

/// A held slot. Dropping it releases the slot to the next waiter.
#[derive(Debug)]
pub struct LimiterPermit {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyLimiter {
    /// Creates a limiter. A capacity of zero is raised to one so callers can never deadlock.
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name: name.into(),
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
        }
    }

    /// Waits for a free slot.
    pub async fn acquire(&self) -> LimiterPermit {
        if let Some(permit) = self.try_acquire() {
            return permit;
        }

        tracing::debug!(
            limiter = %self.name,
            capacity = self.capacity,
            "Limiter saturated, caller queued"
        );

        // The semaphore is owned here and never closed.
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("limiter semaphore is never closed");

        LimiterPermit { _permit: permit }
    }

    /// Grants a slot only if one is free right now.
    pub fn try_acquire(&self) -> Option<LimiterPermit> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| LimiterPermit { _permit: permit })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }
}

/// Hands out one shared limiter per destination name, so separate batch
/// calls against the same destination share a single bound.
#[derive(Debug, Default)]
pub struct LimiterRegistry {
    limiters: Mutex<HashMap<String, Arc<ConcurrencyLimiter>>>,
}

impl LimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the limiter for `destination`, creating it with `capacity` on first use.
    ///
    /// The first registered capacity wins for the lifetime of the process.
    pub fn for_destination(&self, destination: &str, capacity: usize) -> Arc<ConcurrencyLimiter> {
        let mut limiters = self
            .limiters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let limiter = limiters
            .entry(destination.to_string())
            .or_insert_with(|| {
                tracing::info!(
                    destination,
                    capacity,
                    "Created concurrency limiter for destination"
                );
                Arc::new(ConcurrencyLimiter::new(destination, capacity))
            })
            .clone();

        if limiter.capacity() != capacity.max(1) {
            tracing::warn!(
                destination,
                requested = capacity,
                active = limiter.capacity(),
                "Ignoring capacity change for existing limiter"
            );
        }

        limiter
    }
}
