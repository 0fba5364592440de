//! Concurrency bounding middleware.
//!
//! Both filters hold a permit from a per-identity [`PermitPool`] across the
//! inner handler. The permit is an RAII guard, so it returns to the pool on
//! every completion path. `concurrency_throttle` waits as long as it takes;
//! `concurrency_limit` gives up after `max_wait` and answers with the deny
//! handler.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use tokio::time::Duration;

use crate::keyed::WeakTable;
use crate::options::{DenyHandler, IdentFn, limit_exceeded, world_ident};
use crate::pool::PermitPool;

const DEFAULT_MAX_CONCURRENT: usize = 1;
const DEFAULT_MAX_WAIT: Duration = Duration::from_millis(50);

/// Configuration for [`concurrency_throttle`]. Clones share one set of
/// per-identity pools.
#[derive(Clone)]
pub struct ConcurrencyThrottle {
    pools: Arc<WeakTable<String, PermitPool>>,
    max_concurrent: usize,
    ident_fn: IdentFn,
}

impl ConcurrencyThrottle {
    pub fn new(max_concurrent: usize) -> Self {
        ConcurrencyThrottle {
            pools: Arc::new(WeakTable::new()),
            max_concurrent,
            ident_fn: world_ident(),
        }
    }

    /// Replaces the identity projection; distinct identities get distinct
    /// pools.
    pub fn with_ident_fn(mut self, ident_fn: IdentFn) -> Self {
        self.ident_fn = ident_fn;
        self
    }
}

impl Default for ConcurrencyThrottle {
    fn default() -> Self {
        ConcurrencyThrottle::new(DEFAULT_MAX_CONCURRENT)
    }
}

/// Blocks until an execution slot for the request's identity frees up.
pub async fn concurrency_throttle(
    State(cfg): State<ConcurrencyThrottle>,
    req: Request,
    next: Next,
) -> Response {
    let ident = (cfg.ident_fn)(&req);
    let pool = cfg
        .pools
        .get_or_create(ident, |_| Arc::new(PermitPool::new(cfg.max_concurrent)));
    let _permit = pool.acquire().await;
    next.run(req).await
}

/// Configuration for [`concurrency_limit`].
#[derive(Clone)]
pub struct ConcurrencyLimit {
    pools: Arc<WeakTable<String, PermitPool>>,
    max_concurrent: usize,
    max_wait: Duration,
    ident_fn: IdentFn,
    deny: DenyHandler,
}

impl ConcurrencyLimit {
    pub fn new(max_concurrent: usize) -> Self {
        ConcurrencyLimit {
            pools: Arc::new(WeakTable::new()),
            max_concurrent,
            max_wait: DEFAULT_MAX_WAIT,
            ident_fn: world_ident(),
            deny: limit_exceeded(),
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
}

impl Default for ConcurrencyLimit {
    fn default() -> Self {
        ConcurrencyLimit::new(DEFAULT_MAX_CONCURRENT)
    }
}

/// Waits up to `max_wait` for an execution slot, then rejects.
pub async fn concurrency_limit(
    State(cfg): State<ConcurrencyLimit>,
    req: Request,
    next: Next,
) -> Response {
    let ident = (cfg.ident_fn)(&req);
    let pool = cfg
        .pools
        .get_or_create(ident, |_| Arc::new(PermitPool::new(cfg.max_concurrent)));
    match pool.acquire_timeout(cfg.max_wait).await {
        Some(_permit) => next.run(req).await,
        None => {
            tracing::debug!("no execution slot within max_wait");
            (cfg.deny)(&req)
        }
    }
}
