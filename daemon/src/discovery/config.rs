//! Configuration for the discovery layer.

use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};

use meridian_common::crypto::Hash;

use super::node::{NodeId, NodeRole};
use super::storage::DEFAULT_BUCKET_SIZE;

/// Default discovery (UDP) port.
pub const DEFAULT_DISCOVERY_PORT: u16 = 7660;

/// Default peer protocol (TCP) port.
pub const DEFAULT_P2P_PORT: u16 = 7661;

/// Default bucket size for the distance-bucketed storage.
const fn default_bucket_size() -> usize {
    DEFAULT_BUCKET_SIZE
}

/// Default discovery port.
const fn default_discovery_port() -> u16 {
    DEFAULT_DISCOVERY_PORT
}

/// Default peer protocol port.
const fn default_p2p_port() -> u16 {
    DEFAULT_P2P_PORT
}

/// Default announced IP until one is configured.
const fn default_announce_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

/// Default role of the local node.
const fn default_node_role() -> NodeRole {
    NodeRole::Endpoint
}

/// Default role served by the distance-bucketed storage.
const fn default_kad_role() -> NodeRole {
    NodeRole::Validator
}

/// Default discovery target for validator-class nodes.
const fn default_validator_target() -> usize {
    16
}

/// Default discovery target for proxy-class nodes.
const fn default_proxy_target() -> usize {
    8
}

/// Default discovery target for endpoint-class nodes.
const fn default_endpoint_target() -> usize {
    8
}

/// Default discovery target for boot nodes.
///
/// Boot nodes come from configuration, not from discovery.
const fn default_boot_target() -> usize {
    0
}

/// Configuration for the discovery layer.
#[derive(Debug, Clone, clap::Args, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Node identity (hex format, 32 bytes).
    ///
    /// If not provided, a new identity will be generated on startup.
    /// For a persistent node identity, save and reuse the generated value.
    #[clap(name = "node-id", long, env = "MERIDIAN_NODE_ID")]
    #[serde(default)]
    pub node_id: Option<Hash>,

    /// Role announced by the local node.
    #[clap(name = "node-role", long, default_value_t = default_node_role())]
    #[serde(default = "default_node_role")]
    pub node_role: NodeRole,

    /// IP address announced to other nodes.
    #[clap(name = "announce-ip", long, default_value_t = default_announce_ip())]
    #[serde(default = "default_announce_ip")]
    pub announce_ip: IpAddr,

    /// UDP port for the discovery protocol.
    #[clap(name = "discovery-port", long, default_value_t = default_discovery_port())]
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,

    /// TCP port for the peer protocol.
    #[clap(name = "p2p-port", long, default_value_t = default_p2p_port())]
    #[serde(default = "default_p2p_port")]
    pub p2p_port: u16,

    /// Bootstrap nodes to seed the table from.
    ///
    /// Format: merinode://<node_id_hex>@<ip>:<port>[?tcp=<port>&role=<role>]
    #[clap(name = "discovery-bootstrap", long)]
    #[serde(default)]
    pub bootstrap_nodes: Vec<String>,

    /// CIDR allow-list restricting which node addresses are stored.
    ///
    /// When set, nodes outside of these networks are never admitted.
    #[clap(name = "net-restrict", long)]
    #[serde(default)]
    pub net_restrict: Vec<String>,

    /// Bucket size (k parameter) of the distance-bucketed storage.
    #[clap(name = "discovery-bucket-size", long, default_value_t = default_bucket_size())]
    #[serde(default = "default_bucket_size")]
    pub bucket_size: usize,

    /// Role served by the distance-bucketed storage.
    ///
    /// All other roles use flat recency storage.
    #[clap(name = "discovery-kad-role", long, default_value_t = default_kad_role())]
    #[serde(default = "default_kad_role")]
    pub kad_role: NodeRole,

    /// Discovery target for validator-class nodes per refresh.
    #[clap(name = "validator-discover-target", long, default_value_t = default_validator_target())]
    #[serde(default = "default_validator_target")]
    pub validator_target: usize,

    /// Discovery target for proxy-class nodes per refresh.
    #[clap(name = "proxy-discover-target", long, default_value_t = default_proxy_target())]
    #[serde(default = "default_proxy_target")]
    pub proxy_target: usize,

    /// Discovery target for endpoint-class nodes per refresh.
    #[clap(name = "endpoint-discover-target", long, default_value_t = default_endpoint_target())]
    #[serde(default = "default_endpoint_target")]
    pub endpoint_target: usize,

    /// Discovery target for boot nodes per refresh.
    ///
    /// Zero skips active discovery for the role entirely.
    #[clap(name = "boot-discover-target", long, default_value_t = default_boot_target())]
    #[serde(default = "default_boot_target")]
    pub boot_target: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            node_role: default_node_role(),
            announce_ip: default_announce_ip(),
            discovery_port: DEFAULT_DISCOVERY_PORT,
            p2p_port: DEFAULT_P2P_PORT,
            bootstrap_nodes: Vec::new(),
            net_restrict: Vec::new(),
            bucket_size: DEFAULT_BUCKET_SIZE,
            kad_role: default_kad_role(),
            validator_target: default_validator_target(),
            proxy_target: default_proxy_target(),
            endpoint_target: default_endpoint_target(),
            boot_target: default_boot_target(),
        }
    }
}

impl DiscoveryConfig {
    /// Get the discovery target configured for a role.
    pub fn discover_target(&self, role: NodeRole) -> usize {
        match role {
            NodeRole::Validator => self.validator_target,
            NodeRole::Proxy => self.proxy_target,
            NodeRole::Endpoint => self.endpoint_target,
            NodeRole::Boot => self.boot_target,
        }
    }

    /// Get the local node identity, generating a fresh one if none is set.
    pub fn node_id_or_generate(&self) -> NodeId {
        self.node_id.clone().unwrap_or_else(|| {
            Hash::new(meridian_common::crypto::random::secure_random_bytes::<32>())
        })
    }
}
