//! CIDR blocks and client-chain evaluation.
//!
//! A [`CidrBlock`] is an IPv4 or IPv6 address plus an optional prefix length.
//! Without a prefix the block matches exactly one address. Matching never
//! crosses address families.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::LazyLock;

/// Failure to parse a textual CIDR block.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum CidrParseError {
    /// The address part is not a valid IPv4 or IPv6 address.
    #[error("invalid address in {0:?}")]
    Address(String),
    /// The prefix part is not an integer, or exceeds the family's bit width.
    #[error("invalid prefix length in {0:?}")]
    Prefix(String),
}

/// An address range in CIDR notation.
///
/// `prefix == None` means exact match (no mask). A prefix of `0` matches
/// every address of the same family.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CidrBlock {
    addr: IpAddr,
    prefix: Option<u8>,
}

impl CidrBlock {
    /// Creates a masked block. The prefix length is clamped to the maximum
    /// for the address family (32 for IPv4, 128 for IPv6).
    pub fn new(addr: IpAddr, prefix: u8) -> Self {
        CidrBlock {
            addr,
            prefix: Some(prefix.min(family_bits(&addr))),
        }
    }

    /// Creates an exact-match block (no mask).
    pub fn exact(addr: IpAddr) -> Self {
        CidrBlock { addr, prefix: None }
    }

    /// Parses `ip` or `ip/prefix`. Both families are accepted, including
    /// IPv6 `::` elision.
    pub fn parse(text: &str) -> Result<Self, CidrParseError> {
        let text = text.trim();
        match text.split_once('/') {
            None => text
                .parse()
                .map(CidrBlock::exact)
                .map_err(|_| CidrParseError::Address(text.to_string())),
            Some((ip, prefix)) => {
                let addr: IpAddr = ip
                    .trim()
                    .parse()
                    .map_err(|_| CidrParseError::Address(text.to_string()))?;
                let bits: u8 = prefix
                    .trim()
                    .parse()
                    .map_err(|_| CidrParseError::Prefix(text.to_string()))?;
                if bits > family_bits(&addr) {
                    return Err(CidrParseError::Prefix(text.to_string()));
                }
                Ok(CidrBlock {
                    addr,
                    prefix: Some(bits),
                })
            }
        }
    }

    /// Checks whether the given address falls within this block.
    ///
    /// A family mismatch is never a match. Bits beyond the prefix length are
    /// ignored; a prefix of `0` matches the whole family.
    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.addr, addr) {
            (IpAddr::V4(base), IpAddr::V4(addr)) => match self.prefix {
                None => base == addr,
                Some(bits) => masked_eq(&base.octets(), &addr.octets(), bits),
            },
            (IpAddr::V6(base), IpAddr::V6(addr)) => match self.prefix {
                None => base == addr,
                Some(bits) => masked_eq(&base.octets(), &addr.octets(), bits),
            },
            _ => false,
        }
    }
}

fn family_bits(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

/// Prefix comparison over raw octets: whole bytes first, then the top bits
/// of the boundary byte under mask `0xFF00 >> partial`.
fn masked_eq(base: &[u8], addr: &[u8], prefix: u8) -> bool {
    let whole = (prefix / 8) as usize;
    let partial = prefix % 8;
    if base[..whole] != addr[..whole] {
        return false;
    }
    if partial == 0 {
        return true;
    }
    let mask = (0xff00_u16 >> partial) as u8;
    (base[whole] & mask) == (addr[whole] & mask)
}

/// Returns `true` iff any block contains the address. Short-circuits.
pub fn any_contains(blocks: &[CidrBlock], addr: IpAddr) -> bool {
    blocks.iter().any(|block| block.contains(addr))
}

/// Returns `true` iff every address in the chain parses and is contained in
/// the list. An empty chain carries no evidence and is not allowed; an
/// unparseable element fails the whole chain.
///
/// A request must have passed through only permitted intermediaries.
pub fn chain_allowed(chain: &HashSet<String>, blocks: &[CidrBlock]) -> bool {
    !chain.is_empty()
        && chain
            .iter()
            .all(|raw| raw.parse().is_ok_and(|addr| any_contains(blocks, addr)))
}

/// Returns `true` iff any address in the chain is contained in the list.
/// One bad hop poisons the chain; unparseable elements never match.
pub fn chain_denied(chain: &HashSet<String>, blocks: &[CidrBlock]) -> bool {
    chain
        .iter()
        .any(|raw| raw.parse().is_ok_and(|addr| any_contains(blocks, addr)))
}

static PRIVATE: LazyLock<Vec<CidrBlock>> = LazyLock::new(|| {
    parse_all(&[
        // RFC 1918
        "10.0.0.0/8",
        "172.16.0.0/12",
        "192.168.0.0/16",
        // RFC 4193
        "fc00::/7",
    ])
});

static PUBLIC: LazyLock<Vec<CidrBlock>> = LazyLock::new(|| {
    parse_all(&[
        // The non-private IPv4 space (0.0.0.0 - 223.255.255.255 minus the
        // RFC 1918 holes) as 30 aligned blocks.
        "0.0.0.0/5",
        "8.0.0.0/7",
        "11.0.0.0/8",
        "12.0.0.0/6",
        "16.0.0.0/4",
        "32.0.0.0/3",
        "64.0.0.0/2",
        "128.0.0.0/3",
        "160.0.0.0/5",
        "168.0.0.0/6",
        "172.0.0.0/12",
        "172.32.0.0/11",
        "172.64.0.0/10",
        "172.128.0.0/9",
        "173.0.0.0/8",
        "174.0.0.0/7",
        "176.0.0.0/4",
        "192.0.0.0/9",
        "192.128.0.0/11",
        "192.160.0.0/13",
        "192.169.0.0/16",
        "192.170.0.0/15",
        "192.172.0.0/14",
        "192.176.0.0/12",
        "192.192.0.0/10",
        "193.0.0.0/8",
        "194.0.0.0/7",
        "196.0.0.0/6",
        "200.0.0.0/5",
        "208.0.0.0/4",
        // The non-ULA IPv6 space up to fe00::/7.
        "::/1",
        "8000::/2",
        "c000::/3",
        "e000::/4",
        "f000::/5",
        "f800::/6",
        "fe00::/7",
    ])
});

fn parse_all(texts: &[&str]) -> Vec<CidrBlock> {
    texts
        .iter()
        .map(|text| CidrBlock::parse(text).expect("builtin block list parses"))
        .collect()
}

/// RFC 1918 IPv4 ranges plus the RFC 4193 IPv6 ULA range.
pub fn private_blocks() -> &'static [CidrBlock] {
    &PRIVATE
}

/// A partition of the public address space: everything routable that is not
/// in [`private_blocks`].
pub fn public_blocks() -> &'static [CidrBlock] {
    &PUBLIC
}
