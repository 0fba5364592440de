//! Tollgate - composable request filters for axum services.
//!
//! Protects an upstream handler along four axes: source-address access
//! control (CIDR allow/deny over the forwarded client chain), concurrency
//! bounding (blocking or rejecting), rate shaping (per-identity leaky
//! buckets), and maintenance coordination (drain in-flight requests, gate
//! new ones while an operator works).
//!
//! Every filter is a `Clone` config struct plus an async middleware fn,
//! attached with [`axum::middleware::from_fn_with_state`]:
//!
//! ```no_run
//! use axum::{Router, middleware, routing::get};
//! use tollgate::access::{AllowIps, allow_ips};
//! use tollgate::options::IpList;
//!
//! let cfg = AllowIps::new(IpList::parse(&["10.0.0.0/8"]));
//! let app: Router = Router::new()
//!     .route("/", get(|| async { "ok" }))
//!     .layer(middleware::from_fn_with_state(cfg, allow_ips));
//! ```
//!
//! Per-identity primitives (permit pools, buckets, maintenance state) are
//! materialized on first use and reclaimed once no in-flight request still
//! references them, so one-off identities cost nothing.

pub mod access;
pub mod ban;
pub mod bucket;
pub mod chain;
pub mod cidr;
pub mod concurrency;
pub mod gate;
pub mod keyed;
pub mod knock;
pub mod maintenance;
pub mod options;
pub mod pool;
pub mod rate;
pub mod timer;

pub use access::{AllowIps, DenyIps, allow_ips, deny_ips};
pub use ban::{BanIps, ban_ips};
pub use bucket::LeakyBucket;
pub use chain::client_chain;
pub use cidr::{CidrBlock, CidrParseError, private_blocks, public_blocks};
pub use concurrency::{
    ConcurrencyLimit, ConcurrencyThrottle, concurrency_limit, concurrency_throttle,
};
pub use keyed::WeakTable;
pub use knock::{KnockKnock, knock_knock};
pub use maintenance::{
    Maintenance, MaintenanceLimit, MaintenanceThrottle, maintenance_limit, maintenance_throttle,
};
pub use options::{DenyHandler, IdentFn, IpList};
pub use pool::{Permit, PermitPool};
pub use rate::{RateLimit, RateThrottle, rate_limit, rate_throttle};
pub use timer::{TaskId, TimerHandle};
