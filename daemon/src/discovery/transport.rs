//! Transport seam consumed by the discovery layer.
//!
//! The discovery table never touches sockets or packet crypto itself: the
//! transport implementation owns wire encoding, signing, verification and
//! its own per-request timeouts. Conceptually it speaks PING / PONG /
//! FINDNODE / NEIGHBORS with remote nodes.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;

use meridian_common::crypto::Hash;

use super::error::DiscoveryResult;
use super::node::{Node, NodeId, NodeRole};

/// Discovery packet transport.
///
/// Every call applies its own timeout and returns an ordinary error on
/// expiry; none of these block indefinitely.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send a PING to a node and wait for the matching PONG.
    async fn ping(&self, id: &NodeId, address: SocketAddr) -> DiscoveryResult<()>;

    /// Wait until the given node pings us, or the timeout expires.
    async fn wait_for_ping(&self, id: &NodeId, ip: IpAddr, timeout: Duration)
        -> DiscoveryResult<()>;

    /// Ask a node for up to `max` nodes of `role` closest to `target`.
    async fn find_node(
        &self,
        id: &NodeId,
        address: SocketAddr,
        target: &Hash,
        role: NodeRole,
        max: usize,
    ) -> DiscoveryResult<Vec<Node>>;
}
