//! IP address bookkeeping for the discovery table.
//!
//! Two concerns live here:
//! - [`SubnetSet`] counts distinct addresses per IP subnet and enforces a
//!   cap, so a single operator cannot fill a bucket (or the whole table)
//!   from one address block. Loopback and private ranges are exempt.
//! - [`NetRestrict`] is the optional CIDR allow-list from the configuration;
//!   when present, only addresses inside one of its networks are admitted.

use std::collections::HashMap;
use std::net::IpAddr;

use super::error::{DiscoveryError, DiscoveryResult};

/// Subnet granularity used for IPv4 diversity counting.
pub const V4_SUBNET_PREFIX: u8 = 24;

/// Subnet granularity used for IPv6 diversity counting.
pub const V6_SUBNET_PREFIX: u8 = 64;

/// Check whether an address belongs to a LAN range.
///
/// LAN addresses are exempt from subnet diversity caps: a local test
/// network would otherwise be capped at a handful of nodes.
pub fn is_lan(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique local
                || (v6.octets()[0] & 0xfe) == 0xfc
                // fe80::/10 link local
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

/// Map an address onto its diversity subnet key.
///
/// IPv4 counts /24 blocks, IPv6 counts /64 blocks. The keys carry a
/// family tag so the two spaces can never collide.
fn subnet_key(ip: &IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => {
            let bits = u32::from(*v4) >> (32 - V4_SUBNET_PREFIX as u32);
            (4u128 << 120) | bits as u128
        }
        IpAddr::V6(v6) => {
            let bits = u128::from(*v6) >> (128 - V6_SUBNET_PREFIX as u32);
            (6u128 << 120) | bits
        }
    }
}

/// Counter of addresses per subnet with a per-subnet cap.
#[derive(Debug)]
pub struct SubnetSet {
    /// Maximum number of addresses counted per subnet.
    limit: usize,
    /// Address count per subnet key.
    subnets: HashMap<u128, usize>,
}

impl SubnetSet {
    /// Create a new set with the given per-subnet cap.
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            subnets: HashMap::new(),
        }
    }

    /// Try to count an address against its subnet.
    ///
    /// Returns `false` if the subnet is already at capacity; LAN addresses
    /// are never counted and always accepted.
    pub fn try_add(&mut self, ip: &IpAddr) -> bool {
        if is_lan(ip) {
            return true;
        }
        let count = self.subnets.entry(subnet_key(ip)).or_insert(0);
        if *count >= self.limit {
            return false;
        }
        *count += 1;
        true
    }

    /// Release a previously counted address.
    pub fn remove(&mut self, ip: &IpAddr) {
        if is_lan(ip) {
            return;
        }
        if let Some(count) = self.subnets.get_mut(&subnet_key(ip)) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.subnets.remove(&subnet_key(ip));
            }
        }
    }

    /// Number of distinct non-empty subnets currently tracked.
    pub fn subnets(&self) -> usize {
        self.subnets.len()
    }
}

/// One parsed CIDR network.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Subnet {
    base: IpAddr,
    prefix: u8,
}

impl Subnet {
    fn contains(&self, ip: &IpAddr) -> bool {
        match (&self.base, ip) {
            (IpAddr::V4(base), IpAddr::V4(ip)) => {
                if self.prefix == 0 {
                    return true;
                }
                let shift = 32 - self.prefix as u32;
                (u32::from(*base) >> shift) == (u32::from(*ip) >> shift)
            }
            (IpAddr::V6(base), IpAddr::V6(ip)) => {
                if self.prefix == 0 {
                    return true;
                }
                let shift = 128 - self.prefix as u32;
                (u128::from(*base) >> shift) == (u128::from(*ip) >> shift)
            }
            // Mixed families never match
            _ => false,
        }
    }
}

/// CIDR allow-list restricting which addresses the table may store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetRestrict {
    nets: Vec<Subnet>,
}

impl NetRestrict {
    /// Parse a list of CIDR strings (e.g. `10.8.0.0/16`).
    ///
    /// An empty input yields an empty list that accepts everything;
    /// a malformed entry is a configuration error.
    pub fn parse(entries: &[String]) -> DiscoveryResult<Self> {
        let mut nets = Vec::with_capacity(entries.len());
        for entry in entries {
            let (addr, prefix) = entry.split_once('/').ok_or_else(|| {
                DiscoveryError::ConfigError(format!("CIDR '{}' is missing a prefix length", entry))
            })?;
            let base: IpAddr = addr.parse().map_err(|e| {
                DiscoveryError::ConfigError(format!("CIDR '{}' has an invalid address: {}", entry, e))
            })?;
            let prefix: u8 = prefix.parse().map_err(|e| {
                DiscoveryError::ConfigError(format!("CIDR '{}' has an invalid prefix: {}", entry, e))
            })?;
            let max_prefix = match base {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            };
            if prefix > max_prefix {
                return Err(DiscoveryError::ConfigError(format!(
                    "CIDR '{}' prefix exceeds {} bits",
                    entry, max_prefix
                )));
            }
            nets.push(Subnet { base, prefix });
        }
        Ok(Self { nets })
    }

    /// Check whether an address is allowed by the list.
    ///
    /// An empty list allows everything.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.nets.is_empty() || self.nets.iter().any(|net| net.contains(ip))
    }

    /// Check if any restriction is configured.
    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn public(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn test_is_lan() {
        assert!(is_lan(&public(127, 0, 0, 1)));
        assert!(is_lan(&public(10, 1, 2, 3)));
        assert!(is_lan(&public(192, 168, 0, 1)));
        assert!(!is_lan(&public(203, 0, 113, 7)));
        assert!(is_lan(&IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert!(!is_lan(&"2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn test_subnet_set_cap() {
        let mut set = SubnetSet::new(2);
        assert!(set.try_add(&public(203, 0, 113, 1)));
        assert!(set.try_add(&public(203, 0, 113, 2)));
        // Third address in the same /24 is rejected
        assert!(!set.try_add(&public(203, 0, 113, 3)));
        // A different /24 is still fine
        assert!(set.try_add(&public(203, 0, 114, 1)));
        assert_eq!(set.subnets(), 2);
    }

    #[test]
    fn test_subnet_set_lan_exempt() {
        let mut set = SubnetSet::new(1);
        for d in 1..=10 {
            assert!(set.try_add(&public(10, 0, 0, d)));
            assert!(set.try_add(&public(127, 0, 0, d)));
        }
        assert_eq!(set.subnets(), 0);
    }

    #[test]
    fn test_subnet_set_remove_frees_slot() {
        let mut set = SubnetSet::new(1);
        let ip = public(203, 0, 113, 1);
        assert!(set.try_add(&ip));
        assert!(!set.try_add(&public(203, 0, 113, 2)));
        set.remove(&ip);
        assert!(set.try_add(&public(203, 0, 113, 2)));
    }

    #[test]
    fn test_subnet_set_v6_distinct_from_v4() {
        let mut set = SubnetSet::new(1);
        assert!(set.try_add(&public(203, 0, 113, 1)));
        assert!(set.try_add(&"2001:db8::1".parse().unwrap()));
        // Same /64 block
        assert!(!set.try_add(&"2001:db8::2".parse().unwrap()));
        assert_eq!(set.subnets(), 2);
    }

    #[test]
    fn test_net_restrict_empty_allows_all() {
        let restrict = NetRestrict::parse(&[]).unwrap();
        assert!(restrict.is_empty());
        assert!(restrict.contains(&public(203, 0, 113, 1)));
    }

    #[test]
    fn test_net_restrict_contains() {
        let restrict =
            NetRestrict::parse(&["10.8.0.0/16".to_string(), "2001:db8::/32".to_string()]).unwrap();
        assert!(restrict.contains(&public(10, 8, 44, 5)));
        assert!(!restrict.contains(&public(10, 9, 0, 1)));
        assert!(restrict.contains(&"2001:db8:1::1".parse().unwrap()));
        assert!(!restrict.contains(&"2002::1".parse().unwrap()));
    }

    #[test]
    fn test_net_restrict_invalid_entries() {
        assert!(NetRestrict::parse(&["10.8.0.0".to_string()]).is_err());
        assert!(NetRestrict::parse(&["not-an-ip/8".to_string()]).is_err());
        assert!(NetRestrict::parse(&["10.8.0.0/33".to_string()]).is_err());
        assert!(NetRestrict::parse(&["10.8.0.0/x".to_string()]).is_err());
    }
}
