//! Maintenance coordination: per-identity admission gate plus drain barrier.
//!
//! A [`Maintenance`] handle is shared between the middleware and the
//! operator. The middleware gates request admission and registers every
//! admitted request with the identity's drain barrier; the operator closes
//! the gate, waits for the in-flight count to reach zero, runs its body, and
//! reopens on every exit path.

use std::future::Future;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use tokio::time::Duration;

use crate::chain::client_chain;
use crate::cidr::chain_allowed;
use crate::gate::{DrainBarrier, Gate};
use crate::keyed::WeakTable;
use crate::options::{DenyHandler, IdentFn, IpList, under_maintenance, world_ident};

const DEFAULT_MAX_WAIT: Duration = Duration::from_millis(50);

/// Gate and drain barrier for one identity.
pub struct MaintenanceState {
    gate: Gate,
    drain: DrainBarrier,
}

impl MaintenanceState {
    fn new() -> Self {
        MaintenanceState {
            gate: Gate::new(),
            drain: DrainBarrier::new(),
        }
    }

    pub fn gate(&self) -> &Gate {
        &self.gate
    }

    pub fn drain(&self) -> &DrainBarrier {
        &self.drain
    }
}

/// Registry of per-identity maintenance state, shared between middleware and
/// operator. Cheap to clone.
#[derive(Clone, Default)]
pub struct Maintenance {
    states: Arc<WeakTable<String, MaintenanceState>>,
}

impl Maintenance {
    pub fn new() -> Self {
        Maintenance {
            states: Arc::new(WeakTable::new()),
        }
    }

    /// The state for one identity, created on first use and reclaimed once
    /// nothing references it.
    pub fn state(&self, ident: &str) -> Arc<MaintenanceState> {
        self.states
            .get_or_create(ident.to_string(), |_| Arc::new(MaintenanceState::new()))
    }

    /// Runs `body` inside a maintenance window for `ident`: closes the gate,
    /// waits for admitted requests to drain, runs the body, reopens.
    ///
    /// The gate reopens on every exit path, panic and cancellation included.
    /// Identities are independent; a window on `"a"` never blocks `"b"`.
    pub async fn with_maintenance<T>(&self, ident: &str, body: impl Future<Output = T>) -> T {
        let state = self.state(ident);
        let _closed = state.gate.close();
        state.drain.await_drained().await;
        tracing::info!(ident, "maintenance window open");
        let out = body.await;
        tracing::info!(ident, "maintenance window closing");
        out
    }
}

/// Configuration for [`maintenance_throttle`].
#[derive(Clone)]
pub struct MaintenanceThrottle {
    maintenance: Maintenance,
    ident_fn: IdentFn,
    bypass: IpList,
}

impl MaintenanceThrottle {
    pub fn new(maintenance: Maintenance) -> Self {
        MaintenanceThrottle {
            maintenance,
            ident_fn: world_ident(),
            bypass: IpList::empty(),
        }
    }

    pub fn with_ident_fn(mut self, ident_fn: IdentFn) -> Self {
        self.ident_fn = ident_fn;
        self
    }

    /// Client chains fully inside this list skip the gate entirely.
    pub fn with_bypass_list(mut self, bypass: impl Into<IpList>) -> Self {
        self.bypass = bypass.into();
        self
    }
}

/// Holds new requests at the gate while maintenance runs; admits them when
/// it reopens.
pub async fn maintenance_throttle(
    State(cfg): State<MaintenanceThrottle>,
    req: Request,
    next: Next,
) -> Response {
    if bypassed(&cfg.bypass, &req) {
        return next.run(req).await;
    }
    let ident = (cfg.ident_fn)(&req);
    let state = cfg.maintenance.state(&ident);
    state.gate.wait_open().await;
    let _in_flight = state.drain.enter();
    next.run(req).await
}

/// Configuration for [`maintenance_limit`].
#[derive(Clone)]
pub struct MaintenanceLimit {
    maintenance: Maintenance,
    ident_fn: IdentFn,
    bypass: IpList,
    max_wait: Duration,
    deny: DenyHandler,
}

impl MaintenanceLimit {
    pub fn new(maintenance: Maintenance) -> Self {
        MaintenanceLimit {
            maintenance,
            ident_fn: world_ident(),
            bypass: IpList::empty(),
            max_wait: DEFAULT_MAX_WAIT,
            deny: under_maintenance(),
        }
    }

    pub fn with_ident_fn(mut self, ident_fn: IdentFn) -> Self {
        self.ident_fn = ident_fn;
        self
    }

    pub fn with_bypass_list(mut self, bypass: impl Into<IpList>) -> Self {
        self.bypass = bypass.into();
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn with_deny_handler(mut self, deny: DenyHandler) -> Self {
        self.deny = deny;
        self
    }
}

/// Waits up to `max_wait` for the gate, then answers 503.
pub async fn maintenance_limit(
    State(cfg): State<MaintenanceLimit>,
    req: Request,
    next: Next,
) -> Response {
    if bypassed(&cfg.bypass, &req) {
        return next.run(req).await;
    }
    let ident = (cfg.ident_fn)(&req);
    let state = cfg.maintenance.state(&ident);
    if !state.gate.wait_open_timeout(cfg.max_wait).await {
        tracing::debug!(%ident, "gate closed past max_wait");
        return (cfg.deny)(&req);
    }
    let _in_flight = state.drain.enter();
    next.run(req).await
}

fn bypassed(bypass: &IpList, req: &Request) -> bool {
    let blocks = bypass.snapshot();
    !blocks.is_empty() && chain_allowed(&client_chain(req), &blocks)
}
