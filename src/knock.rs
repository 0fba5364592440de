//! Knock-knock admission gate.
//!
//! Requests are rejected until the client presents a shared secret in a
//! query parameter (`?knock=<secret>` by default). A correct knock admits
//! the client's whole chain, optionally for a limited time, so follow-up
//! requests pass without the secret.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use dashmap::DashMap;

use crate::chain::client_chain;
use crate::options::{DenyHandler, access_denied};

/// Configuration for [`knock_knock`]. Clones share one admitted set.
#[derive(Clone)]
pub struct KnockKnock {
    secret: Arc<str>,
    param: Arc<str>,
    admitted: Arc<DashMap<String, Instant>>,
    remember_for: Option<Duration>,
    deny: DenyHandler,
}

impl KnockKnock {
    pub fn new(secret: impl Into<Arc<str>>) -> Self {
        KnockKnock {
            secret: secret.into(),
            param: "knock".into(),
            admitted: Arc::new(DashMap::new()),
            remember_for: None,
            deny: access_denied(),
        }
    }

    /// Renames the query parameter carrying the secret.
    pub fn with_param(mut self, param: impl Into<Arc<str>>) -> Self {
        self.param = param.into();
        self
    }

    /// Admissions expire after this long. Without it they last for the
    /// process.
    pub fn with_remember_for(mut self, remember_for: Duration) -> Self {
        self.remember_for = Some(remember_for);
        self
    }

    pub fn with_deny_handler(mut self, deny: DenyHandler) -> Self {
        self.deny = deny;
        self
    }

    pub fn forget_all(&self) {
        self.admitted.clear();
    }

    fn expire_stale(&self) {
        if let Some(remember_for) = self.remember_for {
            self.admitted
                .retain(|_, admitted_at| admitted_at.elapsed() <= remember_for);
        }
    }
}

/// Admits known clients, admits and remembers clients presenting the
/// secret, rejects the rest.
pub async fn knock_knock(State(cfg): State<KnockKnock>, req: Request, next: Next) -> Response {
    cfg.expire_stale();

    let chain = client_chain(&req);
    if chain.iter().any(|addr| cfg.admitted.contains_key(addr)) {
        return next.run(req).await;
    }

    if query_param(&req, &cfg.param).as_deref() == Some(cfg.secret.as_ref()) {
        let admitted_at = Instant::now();
        tracing::debug!(?chain, "admitting chain after knock");
        for addr in &chain {
            cfg.admitted.insert(addr.clone(), admitted_at);
        }
        return next.run(req).await;
    }

    tracing::debug!(?chain, "rejecting unknocked client");
    (cfg.deny)(&req)
}

fn query_param(req: &Request, name: &str) -> Option<String> {
    req.uri().query()?.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[test]
    fn query_param_finds_the_named_pair() {
        let req = Request::builder()
            .uri("/secret?foo=1&knock=sesame")
            .body(Body::empty())
            .unwrap();
        assert_eq!(query_param(&req, "knock").as_deref(), Some("sesame"));
        assert_eq!(query_param(&req, "missing"), None);
    }

    #[test]
    fn stale_admissions_expire() {
        let cfg = KnockKnock::new("sesame").with_remember_for(Duration::from_millis(0));
        cfg.admitted.insert(
            "1.2.3.4".into(),
            Instant::now() - Duration::from_millis(10),
        );
        cfg.expire_stale();
        assert!(cfg.admitted.is_empty());
    }
}
