//! Source-address access control middleware.
//!
//! `allow_ips` admits a request only when every hop in its client chain is
//! inside the allow list; `deny_ips` rejects when any hop is inside the deny
//! list. Attach with `axum::middleware::from_fn_with_state`.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use crate::chain::client_chain;
use crate::cidr::{chain_allowed, chain_denied, private_blocks, public_blocks};
use crate::options::{DenyHandler, IpList, access_denied};

/// Configuration for [`allow_ips`]. Defaults to the private ranges
/// (RFC 1918 + RFC 4193) and a 403 deny response.
#[derive(Clone)]
pub struct AllowIps {
    list: IpList,
    deny: DenyHandler,
}

impl AllowIps {
    pub fn new(list: impl Into<IpList>) -> Self {
        AllowIps {
            list: list.into(),
            deny: access_denied(),
        }
    }

    pub fn with_deny_handler(mut self, deny: DenyHandler) -> Self {
        self.deny = deny;
        self
    }
}

impl Default for AllowIps {
    fn default() -> Self {
        AllowIps::new(private_blocks())
    }
}

/// Admits only requests whose whole client chain is on the allow list.
pub async fn allow_ips(State(cfg): State<AllowIps>, req: Request, next: Next) -> Response {
    let chain = client_chain(&req);
    if chain_allowed(&chain, &cfg.list.snapshot()) {
        next.run(req).await
    } else {
        tracing::debug!(?chain, "chain not on allow list");
        (cfg.deny)(&req)
    }
}

/// Configuration for [`deny_ips`]. Defaults to the public subnets and a 403
/// deny response.
#[derive(Clone)]
pub struct DenyIps {
    list: IpList,
    deny: DenyHandler,
}

impl DenyIps {
    pub fn new(list: impl Into<IpList>) -> Self {
        DenyIps {
            list: list.into(),
            deny: access_denied(),
        }
    }

    pub fn with_deny_handler(mut self, deny: DenyHandler) -> Self {
        self.deny = deny;
        self
    }
}

impl Default for DenyIps {
    fn default() -> Self {
        DenyIps::new(public_blocks())
    }
}

/// Rejects requests with any hop of the client chain on the deny list.
pub async fn deny_ips(State(cfg): State<DenyIps>, req: Request, next: Next) -> Response {
    let chain = client_chain(&req);
    if chain_denied(&chain, &cfg.list.snapshot()) {
        tracing::debug!(?chain, "chain hop on deny list");
        (cfg.deny)(&req)
    } else {
        next.run(req).await
    }
}
