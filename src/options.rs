//! Shared filter options: identity projection, deny responses, IP lists.

use std::sync::Arc;

use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::sync::watch;

use crate::cidr::CidrBlock;

/// Projects a request onto the grouping key that selects its primitive.
pub type IdentFn = Arc<dyn Fn(&Request) -> String + Send + Sync>;

/// Builds the response returned instead of calling the inner handler.
pub type DenyHandler = Arc<dyn Fn(&Request) -> Response + Send + Sync>;

/// The default identity: every request shares one global primitive.
pub fn world_ident() -> IdentFn {
    Arc::new(|_| "world".to_string())
}

/// Identity from the client chain: requests sharing every hop share a
/// primitive, so each client gets its own.
pub fn chain_ident() -> IdentFn {
    Arc::new(|req| {
        let mut hops: Vec<String> = crate::chain::client_chain(req).into_iter().collect();
        hops.sort();
        hops.join(",")
    })
}

/// 403 `Access denied`.
pub fn access_denied() -> DenyHandler {
    Arc::new(|_| (StatusCode::FORBIDDEN, "Access denied").into_response())
}

/// 429 `Limit exceeded`.
pub fn limit_exceeded() -> DenyHandler {
    Arc::new(|_| (StatusCode::TOO_MANY_REQUESTS, "Limit exceeded").into_response())
}

/// 503 `Undergoing maintenance`.
pub fn under_maintenance() -> DenyHandler {
    Arc::new(|_| (StatusCode::SERVICE_UNAVAILABLE, "Undergoing maintenance").into_response())
}

/// A CIDR list read once per request: either a fixed collection or the live
/// side of a `watch` channel, so callers can swap the list without touching
/// the middleware.
#[derive(Clone)]
pub enum IpList {
    Static(Arc<[CidrBlock]>),
    Watched(watch::Receiver<Arc<[CidrBlock]>>),
}

impl IpList {
    /// An empty fixed list; matches nothing.
    pub fn empty() -> Self {
        IpList::Static(Vec::new().into())
    }

    /// Parses a list of textual blocks. Unparseable entries are dropped with
    /// a warning; they must never fail a request.
    pub fn parse(texts: &[&str]) -> Self {
        let blocks: Vec<CidrBlock> = texts
            .iter()
            .filter_map(|text| match CidrBlock::parse(text) {
                Ok(block) => Some(block),
                Err(error) => {
                    tracing::warn!(%text, %error, "dropping unparseable CIDR block");
                    None
                }
            })
            .collect();
        IpList::Static(blocks.into())
    }

    /// The current value of the list.
    pub fn snapshot(&self) -> Arc<[CidrBlock]> {
        match self {
            IpList::Static(blocks) => Arc::clone(blocks),
            IpList::Watched(rx) => Arc::clone(&rx.borrow()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}

impl From<Vec<CidrBlock>> for IpList {
    fn from(blocks: Vec<CidrBlock>) -> Self {
        IpList::Static(blocks.into())
    }
}

impl From<&[CidrBlock]> for IpList {
    fn from(blocks: &[CidrBlock]) -> Self {
        IpList::Static(blocks.into())
    }
}

impl From<watch::Receiver<Arc<[CidrBlock]>>> for IpList {
    fn from(rx: watch::Receiver<Arc<[CidrBlock]>>) -> Self {
        IpList::Watched(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    #[test]
    fn parse_drops_bad_blocks() {
        let list = IpList::parse(&["10.0.0.0/8", "not-a-block", "fc00::/7"]);
        assert_eq!(list.snapshot().len(), 2);
    }

    #[test]
    fn watched_list_reads_current_value() {
        let initial: Arc<[CidrBlock]> = vec![].into();
        let (tx, rx) = watch::channel(initial);
        let list = IpList::from(rx);
        assert!(list.is_empty());

        let addr: IpAddr = "10.0.0.1".parse().unwrap();
        tx.send(vec![CidrBlock::parse("10.0.0.0/8").unwrap()].into())
            .unwrap();
        assert!(crate::cidr::any_contains(&list.snapshot(), addr));
    }

    #[test]
    fn default_deny_responses_carry_expected_statuses() {
        let req = Request::builder()
            .uri("/")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(access_denied()(&req).status(), StatusCode::FORBIDDEN);
        assert_eq!(limit_exceeded()(&req).status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            under_maintenance()(&req).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
