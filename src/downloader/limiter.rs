//! Runtime-resizable concurrency limits
//!
//! [`ConcurrencyLimiter`] wraps a semaphore whose capacity can be changed while permits
//! are held. Growing adds permits immediately. Shrinking forgets idle permits right away
//! and retires the rest as in-flight holders release them, so nothing running is
//! interrupted.

use crate::error::{Error, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Semaphore with an adjustable capacity
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    capacity: Arc<AtomicUsize>,
}

impl ConcurrencyLimiter {
    /// Limiter admitting `capacity` holders (at least one)
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity: Arc::new(AtomicUsize::new(capacity)),
        }
    }

    /// Wait for a slot
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::ShuttingDown)
    }

    /// Current capacity
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::SeqCst)
    }

    /// Slots free right now
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Change the capacity without disturbing current holders
    pub fn set_capacity(&self, capacity: usize) {
        let capacity = capacity.max(1);
        let old = self.capacity.swap(capacity, Ordering::SeqCst);

        if capacity > old {
            self.semaphore.add_permits(capacity - old);
        } else if capacity < old {
            let excess = old - capacity;
            let forgotten = self.semaphore.forget_permits(excess);
            let remaining = excess - forgotten;
            if remaining > 0 {
                let semaphore = self.semaphore.clone();
                tokio::spawn(async move {
                    if let Ok(permits) = semaphore.acquire_many_owned(remaining as u32).await {
                        permits.forget();
                    }
                });
            }
        }

        tracing::debug!(old, new = capacity, "concurrency limit changed");
    }
}
