//! Leaky-bucket limiter: at most N acquisitions per rolling period.
//!
//! The bucket is a full [`PermitPool`] drained by acquirers and refilled by
//! a timer tick every `period / N`. Acquirers never release; the tick does.
//!
//! Lifecycle: the scheduled tick closures hold the bucket strongly, so a
//! bucket handed out by a [`WeakTable`](crate::keyed::WeakTable) survives
//! between requests even though no request references it. When the bucket
//! sits full for a whole period the expire task fires, unschedules the tick
//! chain, and with it drops the last strong reference; the next lookup for
//! that identity builds a fresh, full bucket. Inactive keys cost nothing.
//!
//! Looseness, inherent in the fencing-free reads: over any window of one
//! `period`, at most `N + 1` acquisitions can succeed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::time::{Duration, Instant};

use crate::pool::PermitPool;
use crate::timer::{TaskId, TimerHandle};

/// Rate limiter over a permit pool and a shared timer. Constructed behind
/// an `Arc` because its refill chain keeps strong clones of it alive.
pub struct LeakyBucket {
    pool: PermitPool,
    period: Duration,
    frequency: Duration,
    release_id: TaskId,
    expire_id: TaskId,
    /// Whether an expire task is pending. Mutated only from the refill and
    /// expire steps, which the timer worker serializes.
    expire_armed: AtomicBool,
    timer: TimerHandle,
}

impl LeakyBucket {
    /// Creates a bucket admitting `max_requests` per `period`.
    ///
    /// The pool starts full and the first refill tick is scheduled
    /// immediately.
    ///
    /// # Panics
    ///
    /// Panics if `max_requests` is zero.
    pub fn new(max_requests: usize, period: Duration, timer: TimerHandle) -> Arc<Self> {
        assert!(max_requests > 0, "leaky bucket needs a positive budget");
        let bucket = Arc::new(LeakyBucket {
            pool: PermitPool::new(max_requests),
            period,
            frequency: period / max_requests as u32,
            release_id: TaskId::next(),
            expire_id: TaskId::next(),
            expire_armed: AtomicBool::new(false),
            timer,
        });
        release_step(&bucket);
        bucket
    }

    /// Waits for an admission slot. FIFO among waiters; the slot is consumed
    /// and only the refill tick restores it.
    pub async fn acquire(&self) {
        self.pool.acquire().await.forget();
    }

    /// Takes a slot if one is immediately available.
    pub fn try_acquire(&self) -> bool {
        match self.pool.try_acquire() {
            Some(permit) => {
                permit.forget();
                true
            }
            None => false,
        }
    }

    /// Waits up to `wait` for a slot.
    pub async fn acquire_timeout(&self, wait: Duration) -> bool {
        match self.pool.acquire_timeout(wait).await {
            Some(permit) => {
                permit.forget();
                true
            }
            None => false,
        }
    }

    pub fn available(&self) -> usize {
        self.pool.available()
    }

    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }
}

/// One refill tick. Re-arms itself, refills when below capacity, and on the
/// transition into fullness arms the expiry that will stop the chain after
/// a full idle period.
fn release_step(bucket: &Arc<LeakyBucket>) {
    let now = Instant::now();

    let chained = Arc::clone(bucket);
    bucket
        .timer
        .schedule(now + bucket.frequency, bucket.release_id, move || {
            release_step(&chained);
        });

    if bucket.pool.available() < bucket.pool.capacity() {
        // Activity is ongoing; a pending expire is stale.
        if bucket.expire_armed.swap(false, Ordering::AcqRel) {
            bucket.timer.unschedule(bucket.expire_id);
        }
        bucket.pool.release();
    } else if !bucket.expire_armed.swap(true, Ordering::AcqRel) {
        let held = Arc::clone(bucket);
        bucket
            .timer
            .schedule(now + bucket.period, bucket.expire_id, move || {
                held.expire_armed.store(false, Ordering::Release);
                held.timer.unschedule(held.release_id);
            });
    }
}
