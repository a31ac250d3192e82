//! Node directory entries and distance math.
//!
//! A [`Node`] describes one known peer: its opaque identity, its network
//! endpoint and its role on the network. The identity is hashed once at
//! construction into a distance key used for Kademlia-style XOR distance
//! comparisons; both are immutable for the lifetime of the entry.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use meridian_common::crypto::{self, Hash};
use meridian_common::time::{get_current_time_in_millis, TimestampMillis};

/// Node ID is an opaque 32-byte identifier assigned to every node.
///
/// The node ID itself is never used as a DHT coordinate; its hash
/// (the distance key) is.
pub type NodeId = Hash;

/// Functional class of a node on the network.
///
/// The role decides which storage strategy holds the node and which
/// discovery/dial targets apply to it.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum NodeRole {
    /// Block producing nodes.
    Validator,
    /// Relay nodes fronting validators.
    Proxy,
    /// Public API serving nodes.
    Endpoint,
    /// Dedicated bootstrap nodes, configured rather than discovered.
    Boot,
}

impl NodeRole {
    /// All roles, in storage order.
    pub const ALL: [NodeRole; 4] = [
        NodeRole::Validator,
        NodeRole::Proxy,
        NodeRole::Endpoint,
        NodeRole::Boot,
    ];

    /// Position of the role in [`NodeRole::ALL`].
    pub(crate) fn index(self) -> usize {
        match self {
            NodeRole::Validator => 0,
            NodeRole::Proxy => 1,
            NodeRole::Endpoint => 2,
            NodeRole::Boot => 3,
        }
    }
}

/// One known peer of the network.
///
/// Shared as `Arc<Node>`; equality is by identity only.
pub struct Node {
    /// Opaque identity of the node.
    id: NodeId,
    /// IP address the node announced.
    ip: IpAddr,
    /// UDP port of the discovery endpoint.
    udp_port: u16,
    /// TCP port of the peer protocol endpoint.
    tcp_port: u16,
    /// Role the node announced.
    role: NodeRole,
    /// Distance key, hash of the identity. Computed once, never changes.
    dist_key: Hash,
    /// Last time this node was (re-)admitted into storage, in millis.
    added_at: AtomicU64,
}

impl Node {
    /// Create a new node entry.
    pub fn new(id: NodeId, ip: IpAddr, udp_port: u16, tcp_port: u16, role: NodeRole) -> Self {
        let dist_key = crypto::hash(id.as_bytes());
        Self {
            id,
            ip,
            udp_port,
            tcp_port,
            role,
            dist_key,
            added_at: AtomicU64::new(0),
        }
    }

    /// Get the node ID.
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Get the announced IP address.
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// Get the discovery (UDP) port.
    pub fn udp_port(&self) -> u16 {
        self.udp_port
    }

    /// Get the peer protocol (TCP) port.
    pub fn tcp_port(&self) -> u16 {
        self.tcp_port
    }

    /// Get the role.
    pub fn role(&self) -> NodeRole {
        self.role
    }

    /// Get the distance key (hash of the identity).
    pub fn dist_key(&self) -> &Hash {
        &self.dist_key
    }

    /// Get the discovery endpoint address.
    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.udp_port)
    }

    /// Get the peer protocol endpoint address.
    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.tcp_port)
    }

    /// Last time this node was admitted into a storage.
    pub fn added_at(&self) -> TimestampMillis {
        self.added_at.load(Ordering::SeqCst)
    }

    /// Record the admission time. Called by storage on `add`.
    pub(crate) fn mark_added(&self) {
        self.added_at
            .store(get_current_time_in_millis(), Ordering::SeqCst);
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Node {}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("address", &self.udp_addr())
            .field("role", &self.role)
            .finish()
    }
}

// Display as "role@<id prefix> ip:port", enough to recognize a node in logs
// without flooding them with full 64-char identities.
impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}... {}",
            self.role,
            hex::encode(&self.id.as_bytes()[..4]),
            self.udp_addr()
        )
    }
}

/// Calculate the XOR distance between two distance keys.
pub fn xor_distance(a: &Hash, b: &Hash) -> [u8; 32] {
    let mut result = [0u8; 32];
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();
    for i in 0..32 {
        result[i] = a_bytes[i] ^ b_bytes[i];
    }
    result
}

/// Calculate the log2 distance between two distance keys.
///
/// This returns the index of the most significant differing bit, which
/// decides the bucket a node belongs to.
///
/// Returns `None` if the keys are identical (distance is 0).
/// Returns `Some(0)` to `Some(255)` for different keys.
pub fn log2_distance(a: &Hash, b: &Hash) -> Option<u8> {
    let distance = xor_distance(a, b);

    for (i, byte) in distance.iter().enumerate() {
        if *byte != 0 {
            let leading_zeros = byte.leading_zeros() as usize;
            let bit_position = i.saturating_mul(8).saturating_add(leading_zeros);
            return Some(255u8.saturating_sub(bit_position as u8));
        }
    }

    // Keys are identical
    None
}

/// Compare two XOR distances to a target.
///
/// Returns:
/// - `Ordering::Less` if `a` is closer to `target` than `b`
/// - `Ordering::Greater` if `b` is closer to `target` than `a`
/// - `Ordering::Equal` if they are equidistant
pub fn compare_distance(target: &Hash, a: &Hash, b: &Hash) -> std::cmp::Ordering {
    let dist_a = xor_distance(target, a);
    let dist_b = xor_distance(target, b);

    for i in 0..32 {
        match dist_a[i].cmp(&dist_b[i]) {
            std::cmp::Ordering::Equal => continue,
            other => return other,
        }
    }
    std::cmp::Ordering::Equal
}
