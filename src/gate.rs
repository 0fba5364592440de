//! Admission latch and drain barrier for maintenance windows.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::Duration;

/// Admission gate. Open by default; every [`close`](Gate::close) stacks a
/// closer and the gate reopens when the last [`GateClosed`] guard drops.
pub struct Gate {
    closers: Arc<watch::Sender<u32>>,
}

/// Guard for one closer. Reopens its share of the gate on drop, on every
/// exit path.
pub struct GateClosed {
    closers: Arc<watch::Sender<u32>>,
}

impl Gate {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Gate {
            closers: Arc::new(tx),
        }
    }

    pub fn is_open(&self) -> bool {
        *self.closers.borrow() == 0
    }

    /// Closes the gate. New waiters block until every outstanding guard has
    /// dropped; concurrent closers nest.
    pub fn close(&self) -> GateClosed {
        self.closers.send_modify(|closers| *closers += 1);
        GateClosed {
            closers: Arc::clone(&self.closers),
        }
    }

    /// Waits until the gate is open. Returns immediately when it already is.
    pub async fn wait_open(&self) {
        let mut rx = self.closers.subscribe();
        let _ = rx.wait_for(|closers| *closers == 0).await;
    }

    /// Waits up to `wait` for the gate to open. A zero wait is a bare
    /// open-check.
    pub async fn wait_open_timeout(&self, wait: Duration) -> bool {
        if wait.is_zero() {
            return self.is_open();
        }
        tokio::time::timeout(wait, self.wait_open()).await.is_ok()
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for GateClosed {
    fn drop(&mut self) {
        self.closers
            .send_modify(|closers| *closers = closers.saturating_sub(1));
    }
}

/// Counts in-flight requests for one identity so an operator can wait for
/// them to drain.
pub struct DrainBarrier {
    in_flight: Arc<watch::Sender<usize>>,
}

/// Registration of one in-flight request. Deregisters on drop; holding the
/// guard across the whole handler makes re-entry a no-op by construction.
pub struct DrainGuard {
    in_flight: Arc<watch::Sender<usize>>,
}

impl DrainBarrier {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        DrainBarrier {
            in_flight: Arc::new(tx),
        }
    }

    pub fn enter(&self) -> DrainGuard {
        self.in_flight.send_modify(|count| *count += 1);
        DrainGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// Waits until nothing is in flight. Entries made while waiting extend
    /// the wait.
    pub async fn await_drained(&self) {
        let mut rx = self.in_flight.subscribe();
        let _ = rx.wait_for(|count| *count == 0).await;
    }

    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }
}

impl Default for DrainBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        self.in_flight
            .send_modify(|count| *count = count.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::task::yield_now;

    #[tokio::test]
    async fn open_gate_admits_immediately() {
        let gate = Gate::new();
        assert!(gate.is_open());
        gate.wait_open().await;
        assert!(gate.wait_open_timeout(Duration::ZERO).await);
    }

    #[tokio::test]
    async fn closed_gate_blocks_until_guard_drops() {
        let gate = Arc::new(Gate::new());
        let closed = gate.close();
        let passed = Arc::new(AtomicBool::new(false));

        let waiter = {
            let gate = gate.clone();
            let passed = passed.clone();
            tokio::spawn(async move {
                gate.wait_open().await;
                passed.store(true, Ordering::SeqCst);
            })
        };

        for _ in 0..10 {
            yield_now().await;
        }
        assert!(!passed.load(Ordering::SeqCst));

        drop(closed);
        waiter.await.unwrap();
        assert!(passed.load(Ordering::SeqCst));
    }

    #[test]
    fn gate_reopens_when_closer_panics() {
        let gate = Gate::new();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _closed = gate.close();
            panic!("boom");
        }));
        assert!(outcome.is_err());
        assert!(gate.is_open());
    }

    #[test]
    fn drain_guard_releases_when_holder_panics() {
        let barrier = DrainBarrier::new();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _in_flight = barrier.enter();
            panic!("boom");
        }));
        assert!(outcome.is_err());
        assert_eq!(barrier.in_flight(), 0);
    }

    #[tokio::test]
    async fn nested_closers_all_must_release() {
        let gate = Gate::new();
        let first = gate.close();
        let second = gate.close();
        drop(first);
        assert!(!gate.is_open());
        drop(second);
        assert!(gate.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_open_timeout_expires_while_closed() {
        let gate = Gate::new();
        let _closed = gate.close();
        assert!(!gate.wait_open_timeout(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn drain_counts_and_releases() {
        let barrier = DrainBarrier::new();
        let a = barrier.enter();
        let b = barrier.enter();
        assert_eq!(barrier.in_flight(), 2);
        drop(a);
        assert_eq!(barrier.in_flight(), 1);
        drop(b);
        barrier.await_drained().await;
    }

    #[tokio::test]
    async fn await_drained_waits_for_leave() {
        let barrier = Arc::new(DrainBarrier::new());
        let guard = barrier.enter();
        let drained = Arc::new(AtomicBool::new(false));

        let op = {
            let barrier = barrier.clone();
            let drained = drained.clone();
            tokio::spawn(async move {
                barrier.await_drained().await;
                drained.store(true, Ordering::SeqCst);
            })
        };

        for _ in 0..10 {
            yield_now().await;
        }
        assert!(!drained.load(Ordering::SeqCst));

        drop(guard);
        op.await.unwrap();
        assert!(drained.load(Ordering::SeqCst));
    }
}
