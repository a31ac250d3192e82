//! Mutual liveness handshake ("bonding") with remote nodes.
//!
//! A node must be bonded before it is trusted enough to be queried or
//! stored: we ping it and wait for the pong, and unless the remote pinged
//! us first we also wait for its own ping so a remote that already
//! considers itself bonded is not forced through a redundant exchange.
//!
//! Two throttles apply. A global semaphore bounds how many exchanges run
//! at once, and a per-identity flight map deduplicates concurrent attempts:
//! the second caller parks on the first one's outcome instead of issuing a
//! duplicate exchange.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace};
use metrics::counter;

use meridian_common::tokio::sync::{oneshot, Mutex, Semaphore};

use super::error::{DiscoveryError, DiscoveryResult};
use super::node::{Node, NodeId};
use super::transport::Transport;

/// Maximum simultaneous bonding exchanges.
pub const MAX_CONCURRENT_BONDS: usize = 16;

/// How long to wait for the remote's own PING during a bond.
pub const BOND_PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Waiters parked on an in-flight bond, fed the bonded node on success.
type Waiters = Vec<oneshot::Sender<Option<Arc<Node>>>>;

/// Bonding state shared by every caller of the table.
pub(crate) struct Bonder {
    transport: Arc<dyn Transport>,
    /// In-flight exchanges by remote identity.
    flights: Mutex<HashMap<NodeId, Waiters>>,
    /// Bounds simultaneous exchanges to limit network load.
    slots: Semaphore,
}

impl Bonder {
    pub(crate) fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            flights: Mutex::new(HashMap::new()),
            slots: Semaphore::new(MAX_CONCURRENT_BONDS),
        }
    }

    /// Run the liveness handshake with `node`.
    ///
    /// `was_pinged` marks that the remote already pinged us, skipping the
    /// wait for its reverse PING. Concurrent calls for the same identity
    /// share a single exchange and observe the same outcome.
    pub(crate) async fn bond(
        &self,
        was_pinged: bool,
        node: Arc<Node>,
    ) -> DiscoveryResult<Arc<Node>> {
        let id = node.id().clone();

        // Join an existing flight if one is up for this identity
        let waiter = {
            let mut flights = self.flights.lock().await;
            match flights.entry(id.clone()) {
                Entry::Occupied(mut entry) => {
                    let (tx, rx) = oneshot::channel();
                    entry.get_mut().push(tx);
                    Some(rx)
                }
                Entry::Vacant(entry) => {
                    entry.insert(Vec::new());
                    None
                }
            }
        };

        if let Some(rx) = waiter {
            trace!("Joining in-flight bond for {}", node);
            return match rx.await {
                Ok(Some(bonded)) => Ok(bonded),
                _ => Err(DiscoveryError::BondFailed(id)),
            };
        }

        let result = self.exchange(was_pinged, &node).await;

        // Resolve the flight and wake every waiter with the shared outcome
        let outcome = result.as_ref().ok().map(|_| Arc::clone(&node));
        let waiters = self.flights.lock().await.remove(&id).unwrap_or_default();
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }

        match result {
            Ok(()) => Ok(node),
            Err(e) => {
                counter!("meridian_discovery_bond_failures").increment(1);
                debug!("Bonding with {} failed: {}", node, e);
                Err(e)
            }
        }
    }

    async fn exchange(&self, was_pinged: bool, node: &Node) -> DiscoveryResult<()> {
        let _permit = self
            .slots
            .acquire()
            .await
            .map_err(|e| DiscoveryError::ChannelError(e.to_string()))?;

        trace!("Bonding with {} (was_pinged: {})", node, was_pinged);
        self.transport.ping(node.id(), node.udp_addr()).await?;

        if !was_pinged {
            // The remote does not consider itself bonded with us yet: wait
            // for its own PING so both sides agree on liveness.
            self.transport
                .wait_for_ping(node.id(), node.ip(), BOND_PING_TIMEOUT)
                .await?;
        }

        Ok(())
    }
}
