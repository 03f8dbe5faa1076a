//! Client and target address filtering.
//!
//! [`Blacklist`] denies clients by single address or CIDR network.
//! [`is_private_ip`] backs the optional private-target filter.

use ipnet::{IpNet, Ipv4Net};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// One blacklist entry: a bare address or a network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlacklistEntry {
    Addr(IpAddr),
    Net(IpNet),
}

impl BlacklistEntry {
    fn matches(&self, ip: &IpAddr) -> bool {
        match self {
            BlacklistEntry::Addr(addr) => addr == ip,
            BlacklistEntry::Net(net) => net.contains(ip),
        }
    }
}

impl FromStr for BlacklistEntry {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty blacklist entry".to_string());
        }
        if s.contains('/') {
            let net: IpNet = s
                .parse()
                .map_err(|_| format!("invalid blacklist network: {}", s))?;
            return Ok(BlacklistEntry::Net(normalize_net(net).trunc()));
        }
        s.parse::<IpAddr>()
            .map(|ip| BlacklistEntry::Addr(normalize_ip(ip)))
            .map_err(|_| format!("invalid blacklist address: {}", s))
    }
}

impl fmt::Display for BlacklistEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlacklistEntry::Addr(addr) => write!(f, "{}", addr),
            BlacklistEntry::Net(net) => write!(f, "{}", net),
        }
    }
}

/// Set of denied client addresses
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Blacklist {
    entries: Vec<BlacklistEntry>,
}

impl Blacklist {
    /// Parse every entry, failing on the first invalid one
    pub fn parse<I, S>(items: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut entries = Vec::new();
        for item in items {
            let entry: BlacklistEntry = item.as_ref().parse()?;
            if !entries.contains(&entry) {
                entries.push(entry);
            }
        }
        Ok(Self { entries })
    }

    /// Whether the client address is denied
    pub fn contains(&self, ip: &IpAddr) -> bool {
        let ip = normalize_ip(*ip);
        self.entries.iter().any(|entry| entry.matches(&ip))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Entries rendered back to their textual form
    pub fn to_strings(&self) -> Vec<String> {
        self.entries.iter().map(ToString::to_string).collect()
    }
}

/// Treat IPv4-mapped IPv6 addresses as IPv4
pub fn normalize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

/// Rewrite an IPv4-mapped IPv6 network (`::ffff:a.b.c.d/96..128`) as its IPv4 network
fn normalize_net(net: IpNet) -> IpNet {
    if let IpNet::V6(v6) = net {
        if v6.prefix_len() >= 96 {
            if let Some(v4) = v6.addr().to_ipv4_mapped() {
                if let Ok(v4net) = Ipv4Net::new(v4, v6.prefix_len() - 96) {
                    return IpNet::V4(v4net);
                }
            }
        }
    }
    net
}

/// Check whether a resolved target is private, loopback, link-local or reserved
pub fn is_private_ip(ip: &IpAddr) -> bool {
    match normalize_ip(*ip) {
        IpAddr::V4(v4) => is_private_ipv4(&v4),
        IpAddr::V6(v6) => is_private_ipv6(&v6),
    }
}

fn is_private_ipv4(ip: &Ipv4Addr) -> bool {
    let [a, b, c, _] = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_multicast()
        || a == 0
        // 100.64.0.0/10 carrier-grade NAT
        || (a == 100 && (b & 0xC0) == 64)
        // 192.0.0.0/24 IETF protocol assignments
        || (a == 192 && b == 0 && c == 0)
}

fn is_private_ipv6(ip: &Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        // fc00::/7 unique local
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 link local
        || (first & 0xffc0) == 0xfe80
}
