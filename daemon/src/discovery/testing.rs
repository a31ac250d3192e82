//! In-memory test doubles for the discovery and dial layers.
//!
//! [`MemoryTransport`] is a scriptable stand-in for the packet transport:
//! tests register which nodes answer pings and what each node reports from
//! FINDNODE, and read back how often every node was contacted.
//! [`MemoryConnector`] does the same for outbound dial attempts.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use meridian_common::crypto::Hash;
use meridian_common::tokio::sync::Mutex;
use meridian_common::tokio::time::sleep;

use super::error::{DiscoveryError, DiscoveryResult};
use super::node::{Node, NodeId, NodeRole};
use super::transport::Transport;
use crate::p2p::dial::Connector;

/// Build a node with a deterministic identity and a private LAN address.
pub fn test_node(seed: u8, role: NodeRole) -> Arc<Node> {
    Arc::new(Node::new(
        Hash::new([seed; 32]),
        IpAddr::V4(Ipv4Addr::new(10, 0, seed, 1)),
        7660,
        7661,
        role,
    ))
}

/// Clone the immutable part of a node into a fresh directory entry.
fn copy_node(node: &Node) -> Node {
    Node::new(
        node.id().clone(),
        node.ip(),
        node.udp_port(),
        node.tcp_port(),
        node.role(),
    )
}

struct TransportState {
    /// Nodes that answer PING with PONG (and ping back during bonds).
    reachable: HashSet<NodeId>,
    /// Reachable nodes that never send their own PING.
    no_reverse_ping: HashSet<NodeId>,
    /// What each node reports from FINDNODE, before role filtering.
    neighbors: HashMap<NodeId, Vec<Arc<Node>>>,
    /// PINGs issued per target node.
    ping_counts: HashMap<NodeId, usize>,
    /// FINDNODEs issued per target node.
    find_node_counts: HashMap<NodeId, usize>,
    /// Artificial latency per PING, to force overlap in concurrency tests.
    ping_delay: Option<Duration>,
}

/// Scriptable in-memory [`Transport`].
pub struct MemoryTransport {
    state: Mutex<TransportState>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TransportState {
                reachable: HashSet::new(),
                no_reverse_ping: HashSet::new(),
                neighbors: HashMap::new(),
                ping_counts: HashMap::new(),
                find_node_counts: HashMap::new(),
                ping_delay: None,
            }),
        }
    }

    /// Register a node that answers pings.
    pub async fn add_peer(&self, node: Arc<Node>) {
        self.state.lock().await.reachable.insert(node.id().clone());
    }

    /// Toggle whether a node answers pings.
    pub async fn set_reachable(&self, id: NodeId, reachable: bool) {
        let mut state = self.state.lock().await;
        if reachable {
            state.reachable.insert(id);
        } else {
            state.reachable.remove(&id);
        }
    }

    /// Toggle whether a node sends its own PING during a bond.
    pub async fn set_reverse_ping(&self, id: NodeId, answers: bool) {
        let mut state = self.state.lock().await;
        if answers {
            state.no_reverse_ping.remove(&id);
        } else {
            state.no_reverse_ping.insert(id);
        }
    }

    /// Script the FINDNODE answer of a node.
    pub async fn set_neighbors(&self, id: NodeId, nodes: Vec<Arc<Node>>) {
        self.state.lock().await.neighbors.insert(id, nodes);
    }

    /// Add artificial latency to every PING.
    pub async fn set_ping_delay(&self, delay: Duration) {
        self.state.lock().await.ping_delay = Some(delay);
    }

    /// How many PINGs were sent to a node.
    pub async fn ping_count(&self, id: &NodeId) -> usize {
        self.state
            .lock()
            .await
            .ping_counts
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    /// How many FINDNODEs were sent to a node.
    pub async fn find_node_count(&self, id: &NodeId) -> usize {
        self.state
            .lock()
            .await
            .find_node_counts
            .get(id)
            .copied()
            .unwrap_or(0)
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn ping(&self, id: &NodeId, _address: SocketAddr) -> DiscoveryResult<()> {
        let delay = {
            let mut state = self.state.lock().await;
            *state.ping_counts.entry(id.clone()).or_insert(0) += 1;
            state.ping_delay
        };
        if let Some(delay) = delay {
            sleep(delay).await;
        }

        if self.state.lock().await.reachable.contains(id) {
            Ok(())
        } else {
            Err(DiscoveryError::Timeout("PONG"))
        }
    }

    async fn wait_for_ping(
        &self,
        id: &NodeId,
        _ip: IpAddr,
        _timeout: Duration,
    ) -> DiscoveryResult<()> {
        let state = self.state.lock().await;
        if state.reachable.contains(id) && !state.no_reverse_ping.contains(id) {
            Ok(())
        } else {
            Err(DiscoveryError::Timeout("PING"))
        }
    }

    async fn find_node(
        &self,
        id: &NodeId,
        _address: SocketAddr,
        _target: &Hash,
        role: NodeRole,
        max: usize,
    ) -> DiscoveryResult<Vec<Node>> {
        let mut state = self.state.lock().await;
        *state.find_node_counts.entry(id.clone()).or_insert(0) += 1;

        if !state.reachable.contains(id) {
            return Err(DiscoveryError::Timeout("NEIGHBORS"));
        }

        let nodes = state.neighbors.get(id).cloned().unwrap_or_default();
        Ok(nodes
            .iter()
            .filter(|node| node.role() == role)
            .take(max)
            .map(|node| copy_node(node))
            .collect())
    }
}

struct ConnectorState {
    /// Every dial attempt, in launch order.
    attempts: Vec<NodeId>,
    /// Nodes whose connections are refused.
    failing: HashSet<NodeId>,
}

/// Scriptable in-memory [`Connector`].
pub struct MemoryConnector {
    state: Mutex<ConnectorState>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ConnectorState {
                attempts: Vec::new(),
                failing: HashSet::new(),
            }),
        }
    }

    /// Make dials to a node fail.
    pub async fn set_failing(&self, id: NodeId, failing: bool) {
        let mut state = self.state.lock().await;
        if failing {
            state.failing.insert(id);
        } else {
            state.failing.remove(&id);
        }
    }

    /// Every dial attempt seen so far.
    pub async fn attempts(&self) -> Vec<NodeId> {
        self.state.lock().await.attempts.clone()
    }
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, node: Arc<Node>) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        state.attempts.push(node.id().clone());
        if state.failing.contains(node.id()) {
            anyhow::bail!("connection to {} refused", node);
        }
        Ok(())
    }
}
