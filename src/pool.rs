//! Fair counting semaphore with RAII permits.
//!
//! Thin wrapper over [`tokio::sync::Semaphore`], which queues waiters in
//! FIFO order. Dropping a [`Permit`] returns it; [`Permit::forget`] consumes
//! it so an external party (the leaky-bucket refill) can [`PermitPool::release`]
//! later.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Duration;

/// Bounded, FIFO-fair permit pool.
pub struct PermitPool {
    sem: Arc<Semaphore>,
    capacity: usize,
}

/// One held permit. Returned to the pool on drop.
pub struct Permit {
    inner: OwnedSemaphorePermit,
}

impl Permit {
    /// Consumes the permit without returning it to the pool. The pool stays
    /// one permit short until someone calls [`PermitPool::release`].
    pub fn forget(self) {
        self.inner.forget();
    }
}

impl PermitPool {
    pub fn new(capacity: usize) -> Self {
        PermitPool {
            sem: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Waits for a permit. Waiters are served in FIFO order.
    pub async fn acquire(&self) -> Permit {
        let inner = Arc::clone(&self.sem)
            .acquire_owned()
            .await
            .expect("permit pool semaphore is never closed");
        Permit { inner }
    }

    /// Takes a permit if one is immediately available.
    pub fn try_acquire(&self) -> Option<Permit> {
        Arc::clone(&self.sem)
            .try_acquire_owned()
            .ok()
            .map(|inner| Permit { inner })
    }

    /// Waits up to `wait` for a permit. A zero wait degenerates to
    /// [`try_acquire`](Self::try_acquire).
    pub async fn acquire_timeout(&self, wait: Duration) -> Option<Permit> {
        if wait.is_zero() {
            return self.try_acquire();
        }
        tokio::time::timeout(wait, self.acquire()).await.ok()
    }

    /// Adds one permit back. Callers that released nothing may still call
    /// this (the refill path does); keeping `available <= capacity` is the
    /// caller's contract.
    pub fn release(&self) {
        self.sem.add_permits(1);
    }

    pub fn available(&self) -> usize {
        self.sem.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
