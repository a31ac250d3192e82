//! merinode:// URL parser for discovery bootstrap and static nodes.
//!
//! Format: `merinode://<node_id_hex>@<ip>:<udp_port>[?tcp=<port>][?role=<role>]`
//!
//! The query part is optional; `tcp` defaults to the UDP port and `role`
//! defaults to `boot`, which is what bootstrap entries are.
//!
//! Example: `merinode://1a2b3c4d5e6f...@192.168.1.1:7660?role=validator`

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use meridian_common::crypto::Hash;

use super::error::{DiscoveryError, DiscoveryResult};
use super::node::{Node, NodeId, NodeRole};

/// URL scheme for Meridian discovery nodes.
pub const MERINODE_URL_SCHEME: &str = "merinode://";

/// Parsed merinode:// URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeriNodeUrl {
    /// The node ID (32 bytes).
    pub node_id: NodeId,
    /// The discovery socket address (IP + UDP port).
    pub address: SocketAddr,
    /// The peer protocol TCP port.
    pub tcp_port: u16,
    /// The announced role.
    pub role: NodeRole,
}

impl MeriNodeUrl {
    /// Create a new MeriNodeUrl.
    pub fn new(node_id: NodeId, address: SocketAddr, tcp_port: u16, role: NodeRole) -> Self {
        Self {
            node_id,
            address,
            tcp_port,
            role,
        }
    }

    /// Parse a merinode:// URL string.
    pub fn parse(s: &str) -> DiscoveryResult<Self> {
        // Check scheme
        let rest = s.strip_prefix(MERINODE_URL_SCHEME).ok_or_else(|| {
            DiscoveryError::InvalidUrl(format!(
                "URL must start with '{}', got: {}",
                MERINODE_URL_SCHEME, s
            ))
        })?;

        // Split node_id@address
        let (node_id_hex, rest) = rest.split_once('@').ok_or_else(|| {
            DiscoveryError::InvalidUrl(format!(
                "URL must contain '@' separator between node_id and address: {}",
                s
            ))
        })?;

        // Validate and parse node ID (64 hex chars = 32 bytes)
        if node_id_hex.len() != 64 {
            return Err(DiscoveryError::InvalidUrl(format!(
                "Node ID must be 64 hex characters (32 bytes), got {} characters",
                node_id_hex.len()
            )));
        }

        let node_id = Hash::from_str(node_id_hex)
            .map_err(|e| DiscoveryError::InvalidUrl(format!("Invalid node ID hex: {}", e)))?;

        // Split off the optional query part
        let (address_str, query) = match rest.split_once('?') {
            Some((address, query)) => (address, Some(query)),
            None => (rest, None),
        };

        // Parse socket address
        let address: SocketAddr = address_str.parse().map_err(|e| {
            DiscoveryError::InvalidUrl(format!("Invalid socket address '{}': {}", address_str, e))
        })?;

        let mut tcp_port = address.port();
        let mut role = NodeRole::Boot;

        if let Some(query) = query {
            for pair in query.split('&') {
                let (key, value) = pair.split_once('=').ok_or_else(|| {
                    DiscoveryError::InvalidUrl(format!("Invalid query parameter '{}'", pair))
                })?;
                match key {
                    "tcp" => {
                        tcp_port = value.parse().map_err(|e| {
                            DiscoveryError::InvalidUrl(format!("Invalid tcp port '{}': {}", value, e))
                        })?;
                    }
                    "role" => {
                        role = NodeRole::from_str(value).map_err(|_| {
                            DiscoveryError::InvalidUrl(format!("Unknown role '{}'", value))
                        })?;
                    }
                    _ => {
                        return Err(DiscoveryError::InvalidUrl(format!(
                            "Unknown query parameter '{}'",
                            key
                        )));
                    }
                }
            }
        }

        Ok(Self {
            node_id,
            address,
            tcp_port,
            role,
        })
    }

    /// Build the node directory entry this URL describes.
    pub fn into_node(self) -> Node {
        Node::new(
            self.node_id,
            self.address.ip(),
            self.address.port(),
            self.tcp_port,
            self.role,
        )
    }

    /// Convert to URL string.
    pub fn to_string_url(&self) -> String {
        let mut url = format!(
            "{}{}@{}",
            MERINODE_URL_SCHEME,
            self.node_id.to_hex(),
            self.address
        );
        let mut separator = '?';
        if self.tcp_port != self.address.port() {
            url.push_str(&format!("{}tcp={}", separator, self.tcp_port));
            separator = '&';
        }
        if self.role != NodeRole::Boot {
            url.push_str(&format!("{}role={}", separator, self.role));
        }
        url
    }
}

impl fmt::Display for MeriNodeUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_url())
    }
}

impl FromStr for MeriNodeUrl {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    fn sample_node_id() -> NodeId {
        Hash::new([
            0x1a, 0x2b, 0x3c, 0x4d, 0x5e, 0x6f, 0x70, 0x81, 0x92, 0xa3, 0xb4, 0xc5, 0xd6, 0xe7,
            0xf8, 0x09, 0x10, 0x21, 0x32, 0x43, 0x54, 0x65, 0x76, 0x87, 0x98, 0xa9, 0xba, 0xcb,
            0xdc, 0xed, 0xfe, 0x0f,
        ])
    }

    #[test]
    fn test_parse_valid_ipv4() {
        let node_id = sample_node_id();
        let url_str = format!("merinode://{}@192.168.1.1:7660", node_id.to_hex());

        let parsed = MeriNodeUrl::parse(&url_str).unwrap();
        assert_eq!(parsed.node_id, node_id);
        assert_eq!(
            parsed.address,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)), 7660)
        );
        assert_eq!(parsed.tcp_port, 7660);
        assert_eq!(parsed.role, NodeRole::Boot);
    }

    #[test]
    fn test_parse_valid_ipv6() {
        let node_id = sample_node_id();
        let url_str = format!("merinode://{}@[::1]:7660", node_id.to_hex());

        let parsed = MeriNodeUrl::parse(&url_str).unwrap();
        assert_eq!(
            parsed.address,
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 7660)
        );
    }

    #[test]
    fn test_parse_query_params() {
        let node_id = sample_node_id();
        let url_str = format!(
            "merinode://{}@192.168.1.1:7660?tcp=7661&role=validator",
            node_id.to_hex()
        );

        let parsed = MeriNodeUrl::parse(&url_str).unwrap();
        assert_eq!(parsed.tcp_port, 7661);
        assert_eq!(parsed.role, NodeRole::Validator);

        let node = parsed.into_node();
        assert_eq!(node.udp_port(), 7660);
        assert_eq!(node.tcp_port(), 7661);
        assert_eq!(node.role(), NodeRole::Validator);
    }

    #[test]
    fn test_parse_missing_scheme() {
        let result = MeriNodeUrl::parse("1a2b3c@127.0.0.1:7660");
        assert!(result.is_err());
        if let Err(DiscoveryError::InvalidUrl(msg)) = result {
            assert!(msg.contains("merinode://"));
        }
    }

    #[test]
    fn test_parse_missing_separator() {
        let node_id = sample_node_id();
        let url_str = format!("merinode://{}192.168.1.1:7660", node_id.to_hex());

        assert!(MeriNodeUrl::parse(&url_str).is_err());
    }

    #[test]
    fn test_parse_invalid_node_id_length() {
        assert!(MeriNodeUrl::parse("merinode://1a2b3c@192.168.1.1:7660").is_err());
    }

    #[test]
    fn test_parse_invalid_role() {
        let node_id = sample_node_id();
        let url_str = format!("merinode://{}@192.168.1.1:7660?role=miner", node_id.to_hex());
        assert!(MeriNodeUrl::parse(&url_str).is_err());
    }

    #[test]
    fn test_parse_unknown_query_param() {
        let node_id = sample_node_id();
        let url_str = format!("merinode://{}@192.168.1.1:7660?foo=1", node_id.to_hex());
        assert!(MeriNodeUrl::parse(&url_str).is_err());
    }

    #[test]
    fn test_roundtrip() {
        let url = MeriNodeUrl::new(
            sample_node_id(),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 7660),
            7661,
            NodeRole::Proxy,
        );

        let parsed = MeriNodeUrl::parse(&url.to_string_url()).unwrap();
        assert_eq!(parsed, url);
    }

    #[test]
    fn test_roundtrip_defaults() {
        let url = MeriNodeUrl::new(
            sample_node_id(),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 7660),
            7660,
            NodeRole::Boot,
        );

        let url_str = url.to_string_url();
        assert!(!url_str.contains('?'));
        assert_eq!(MeriNodeUrl::parse(&url_str).unwrap(), url);
    }

    #[test]
    fn test_from_str() {
        let node_id = sample_node_id();
        let url_str = format!("merinode://{}@192.168.1.1:7660", node_id.to_hex());

        let parsed: MeriNodeUrl = url_str.parse().unwrap();
        assert_eq!(parsed.node_id, node_id);
    }
}
