//! Rate shaping middleware over per-identity leaky buckets.
//!
//! Admission slots are consumed, never returned by the caller; the bucket's
//! timer restores one slot every `period / max_requests`. `rate_throttle`
//! waits for a slot; `rate_limit` gives up after `max_wait`.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use tokio::time::Duration;

use crate::bucket::LeakyBucket;
use crate::keyed::WeakTable;
use crate::options::{DenyHandler, IdentFn, limit_exceeded, world_ident};
use crate::timer::{self, TimerHandle};

const DEFAULT_PERIOD: Duration = Duration::from_secs(60);
const DEFAULT_MAX_WAIT: Duration = Duration::from_millis(50);
const DEFAULT_THROTTLE_REQUESTS: usize = 100;
const DEFAULT_LIMIT_REQUESTS: usize = 500;

/// Configuration for [`rate_throttle`]. Clones share one set of buckets.
#[derive(Clone)]
pub struct RateThrottle {
    buckets: Arc<WeakTable<String, LeakyBucket>>,
    max_requests: usize,
    period: Duration,
    ident_fn: IdentFn,
    timer: Option<TimerHandle>,
}

impl RateThrottle {
    pub fn new(max_requests: usize, period: Duration) -> Self {
        RateThrottle {
            buckets: Arc::new(WeakTable::new()),
            max_requests,
            period,
            ident_fn: world_ident(),
            timer: None,
        }
    }

    pub fn with_ident_fn(mut self, ident_fn: IdentFn) -> Self {
        self.ident_fn = ident_fn;
        self
    }

    /// Uses a dedicated timer instead of the process-wide one.
    pub fn with_timer(mut self, timer: TimerHandle) -> Self {
        self.timer = Some(timer);
        self
    }
}

impl Default for RateThrottle {
    fn default() -> Self {
        RateThrottle::new(DEFAULT_THROTTLE_REQUESTS, DEFAULT_PERIOD)
    }
}

/// Blocks until the identity's bucket grants a slot.
pub async fn rate_throttle(State(cfg): State<RateThrottle>, req: Request, next: Next) -> Response {
    let ident = (cfg.ident_fn)(&req);
    let timer = cfg.timer.clone().unwrap_or_else(timer::global);
    let bucket = cfg
        .buckets
        .get_or_create(ident, |_| {
            LeakyBucket::new(cfg.max_requests, cfg.period, timer)
        });
    bucket.acquire().await;
    next.run(req).await
}

/// Configuration for [`rate_limit`].
#[derive(Clone)]
pub struct RateLimit {
    buckets: Arc<WeakTable<String, LeakyBucket>>,
    max_requests: usize,
    period: Duration,
    max_wait: Duration,
    ident_fn: IdentFn,
    deny: DenyHandler,
    timer: Option<TimerHandle>,
}

impl RateLimit {
    pub fn new(max_requests: usize, period: Duration) -> Self {
        RateLimit {
            buckets: Arc::new(WeakTable::new()),
            max_requests,
            period,
            max_wait: DEFAULT_MAX_WAIT,
            ident_fn: world_ident(),
            deny: limit_exceeded(),
            timer: None,
        }
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn with_ident_fn(mut self, ident_fn: IdentFn) -> Self {
        self.ident_fn = ident_fn;
        self
    }

    pub fn with_deny_handler(mut self, deny: DenyHandler) -> Self {
        self.deny = deny;
        self
    }

    pub fn with_timer(mut self, timer: TimerHandle) -> Self {
        self.timer = Some(timer);
        self
    }
}

impl Default for RateLimit {
    fn default() -> Self {
        RateLimit::new(DEFAULT_LIMIT_REQUESTS, DEFAULT_PERIOD)
    }
}

/// Waits up to `max_wait` for a slot, then rejects with the deny handler.
pub async fn rate_limit(State(cfg): State<RateLimit>, req: Request, next: Next) -> Response {
    let ident = (cfg.ident_fn)(&req);
    let timer = cfg.timer.clone().unwrap_or_else(timer::global);
    let bucket = cfg
        .buckets
        .get_or_create(ident, |_| {
            LeakyBucket::new(cfg.max_requests, cfg.period, timer)
        });
    if bucket.acquire_timeout(cfg.max_wait).await {
        next.run(req).await
    } else {
        tracing::debug!("request budget exhausted within max_wait");
        (cfg.deny)(&req)
    }
}
