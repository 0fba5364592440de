//! Ban-on-offensive-status middleware.
//!
//! A client whose request terminates offensively — a response with an
//! offensive status (by default 401 or 404, the classic probe signature) or
//! a handler that panics — gets its whole chain recorded; later requests
//! from any recorded address are rejected before reaching the handler. The
//! panic is contained, so in both cases exactly one response is returned.

use std::any::Any;
use std::future::{Future, poll_fn};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::pin;
use std::sync::Arc;
use std::task::Poll;
use std::time::{Duration, Instant};

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;

use crate::chain::client_chain;
use crate::options::{DenyHandler, access_denied};

/// Configuration for [`ban_ips`]. Clones share one offender set.
#[derive(Clone)]
pub struct BanIps {
    offenders: Arc<DashMap<String, Instant>>,
    statuses: Arc<[StatusCode]>,
    ban_for: Option<Duration>,
    deny: DenyHandler,
}

impl BanIps {
    pub fn new() -> Self {
        BanIps {
            offenders: Arc::new(DashMap::new()),
            statuses: Arc::from([StatusCode::UNAUTHORIZED, StatusCode::NOT_FOUND]),
            ban_for: None,
            deny: access_denied(),
        }
    }

    /// Replaces the set of statuses that trigger a ban.
    pub fn with_statuses(mut self, statuses: impl Into<Arc<[StatusCode]>>) -> Self {
        self.statuses = statuses.into();
        self
    }

    /// Bans expire after this long. Without it, bans last for the process.
    pub fn with_ban_for(mut self, ban_for: Duration) -> Self {
        self.ban_for = Some(ban_for);
        self
    }

    pub fn with_deny_handler(mut self, deny: DenyHandler) -> Self {
        self.deny = deny;
        self
    }

    /// Lifts the ban on one address.
    pub fn pardon(&self, addr: &str) {
        self.offenders.remove(addr);
    }

    pub fn pardon_all(&self) {
        self.offenders.clear();
    }

    pub fn banned_count(&self) -> usize {
        self.offenders.len()
    }

    fn expire_stale(&self) {
        if let Some(ban_for) = self.ban_for {
            self.offenders
                .retain(|_, banned_at| banned_at.elapsed() <= ban_for);
        }
    }
}

impl Default for BanIps {
    fn default() -> Self {
        BanIps::new()
    }
}

/// Rejects banned clients; records the chain of any request whose response
/// status is offensive or whose handler panicked.
pub async fn ban_ips(State(cfg): State<BanIps>, req: Request, next: Next) -> Response {
    cfg.expire_stale();

    let chain = client_chain(&req);
    if chain.iter().any(|addr| cfg.offenders.contains_key(addr)) {
        tracing::debug!(?chain, "rejecting banned client");
        return (cfg.deny)(&req);
    }

    let (response, raised) = match run_contained(req, next).await {
        Ok(response) => (response, false),
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            tracing::error!(%msg, "handler panicked");
            let response = (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response();
            (response, true)
        }
    };

    if raised || cfg.statuses.contains(&response.status()) {
        let banned_at = Instant::now();
        tracing::debug!(?chain, status = %response.status(), raised, "banning chain");
        for addr in chain {
            cfg.offenders.insert(addr, banned_at);
        }
    }

    response
}

/// Polls the inner handler under `catch_unwind` so a panic surfaces as an
/// error value instead of unwinding through the filter, leaving the caller
/// free to rebuke the chain and still return a response.
async fn run_contained(req: Request, next: Next) -> Result<Response, Box<dyn Any + Send>> {
    let mut handler = pin!(next.run(req));
    poll_fn(
        move |cx| match catch_unwind(AssertUnwindSafe(|| handler.as_mut().poll(cx))) {
            Ok(Poll::Ready(response)) => Poll::Ready(Ok(response)),
            Ok(Poll::Pending) => Poll::Pending,
            Err(panic) => Poll::Ready(Err(panic)),
        },
    )
    .await
}
