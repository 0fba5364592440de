//! Client chain extraction: the set of addresses associated with a request.

use std::collections::HashSet;
use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request};

/// Forwarded headers honored when building the chain, in lookup order.
/// Header name matching is case-insensitive.
const FORWARDED_HEADERS: [&str; 2] = ["true-client-ip", "x-forwarded-for"];

/// Builds the client chain for a request: the peer address from
/// [`ConnectInfo`] plus every hop named in the forwarded headers.
///
/// Header values are split on commas; elements are trimmed, empties dropped,
/// and a trailing `:port` stripped. Multiple headers concatenate.
pub fn client_chain(req: &Request) -> HashSet<String> {
    let mut chain = HashSet::new();

    if let Some(ConnectInfo(peer)) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        chain.insert(peer.ip().to_string());
    }

    for name in FORWARDED_HEADERS {
        for value in req.headers().get_all(name) {
            if let Ok(value) = value.to_str() {
                chain.extend(
                    value
                        .split(',')
                        .map(|hop| strip_port(hop.trim()))
                        .filter(|hop| !hop.is_empty())
                        .map(String::from),
                );
            }
        }
    }

    chain
}

/// Strips one trailing `:port` from an address text.
///
/// Bracketed IPv6 (`[::1]:8080`) is unwrapped; a bare `:digits` suffix is
/// only stripped when the rest contains no other colon, so unbracketed IPv6
/// texts pass through untouched.
fn strip_port(raw: &str) -> &str {
    if let Some(rest) = raw.strip_prefix('[')
        && let Some((addr, _)) = rest.split_once(']')
    {
        return addr;
    }
    if let Some((host, port)) = raw.rsplit_once(':')
        && !host.contains(':')
        && !port.is_empty()
        && port.bytes().all(|b| b.is_ascii_digit())
    {
        return host;
    }
    raw
}
