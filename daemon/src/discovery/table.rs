//! Discovery table orchestration.
//!
//! The table owns one storage per role, the bonding state and the two
//! maintenance loops that keep the node set fresh:
//! - the refresh loop actively explores the network on a fixed interval
//!   (and on demand through [`DiscoveryTable::refresh`]);
//! - the revalidate loop pings the least-recently-bonded entries and
//!   evicts the ones that stopped answering.
//!
//! Lifecycle: a freshly constructed table is uninitialized; the first
//! refresh pass moves it to initialized, which is what gates inbound
//! bonding: an un-seeded table must not be polluted by strangers before
//! it holds a trustworthy node set.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use metrics::counter;

use meridian_common::crypto::Hash;
use meridian_common::tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use meridian_common::tokio::time::interval;
use meridian_common::tokio::{select, spawn_task, JoinHandle};

use super::bonding::Bonder;
use super::config::DiscoveryConfig;
use super::error::{DiscoveryError, DiscoveryResult};
use super::netutil::NetRestrict;
use super::node::{Node, NodeRole};
use super::storage::{FlatStorage, KadStorage, NodeStorage, TableRng};
use super::transport::Transport;
use super::url::MeriNodeUrl;

/// Interval between periodic refresh passes.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(300);

/// Interval between revalidation passes.
pub const REVALIDATE_INTERVAL: Duration = Duration::from_secs(10);

/// Random-target lookups run per refresh for the distance-bucketed role.
///
/// With a hashed keyspace we cannot aim a lookup at a chosen bucket, so
/// random targets cover what the self lookup does not.
pub const RANDOM_REFRESH_LOOKUPS: usize = 3;

/// Buffered on-demand refresh requests.
const REFRESH_QUEUE_SIZE: usize = 16;

/// Directory of known nodes, one storage per role.
pub struct DiscoveryTable {
    /// The local node.
    self_node: Arc<Node>,
    /// Packet transport collaborator.
    transport: Arc<dyn Transport>,
    /// Bonding state (flight dedup + concurrency cap).
    bonder: Bonder,
    /// Storage per role, indexed in `NodeRole::ALL` order.
    storages: Vec<RwLock<Box<dyn NodeStorage>>>,
    /// Configured bootstrap nodes, the seed set of last resort.
    bootstrap_nodes: Vec<Arc<Node>>,
    /// CIDR allow-list; an empty list allows everything.
    restrict: NetRestrict,
    /// Shared random source, reseeded by every refresh pass.
    rng: TableRng,
    config: DiscoveryConfig,
    /// Set once the first refresh pass completes.
    initialized: AtomicBool,
    /// Running flag.
    running: AtomicBool,
    /// On-demand refresh queue; callers park on the oneshot.
    refresh_tx: mpsc::Sender<oneshot::Sender<()>>,
    /// Receiver side, taken by the refresh loop at start.
    refresh_rx: Mutex<Option<mpsc::Receiver<oneshot::Sender<()>>>>,
    /// Shutdown signal observed by both loops.
    shutdown: watch::Sender<bool>,
    /// Handles of the spawned loops, awaited on close.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DiscoveryTable {
    /// Create a new table.
    ///
    /// Configuration problems (a malformed bootstrap URL, a bootstrap
    /// node outside the restriction list, a zero bucket size) are fatal
    /// here: no partial table is returned.
    pub fn new(
        config: DiscoveryConfig,
        transport: Arc<dyn Transport>,
    ) -> DiscoveryResult<Arc<Self>> {
        if config.bucket_size == 0 {
            return Err(DiscoveryError::ConfigError(
                "bucket size must be non-zero".to_string(),
            ));
        }

        let restrict = NetRestrict::parse(&config.net_restrict)?;

        let self_node = Arc::new(Node::new(
            config.node_id_or_generate(),
            config.announce_ip,
            config.discovery_port,
            config.p2p_port,
            config.node_role,
        ));

        let mut bootstrap_nodes = Vec::with_capacity(config.bootstrap_nodes.len());
        for url_str in &config.bootstrap_nodes {
            let url = MeriNodeUrl::parse(url_str)?;
            if !restrict.contains(&url.address.ip()) {
                return Err(DiscoveryError::RestrictedAddress(url.address.ip()));
            }
            if url.node_id == *self_node.id() {
                warn!("Ignoring bootstrap node with our own identity: {}", url);
                continue;
            }
            bootstrap_nodes.push(Arc::new(url.into_node()));
        }

        let rng = TableRng::new();
        let storages = NodeRole::ALL
            .iter()
            .map(|role| {
                let storage: Box<dyn NodeStorage> = if *role == config.kad_role {
                    Box::new(KadStorage::new(
                        self_node.dist_key().clone(),
                        config.bucket_size,
                        rng.clone(),
                    ))
                } else {
                    Box::new(FlatStorage::new(rng.clone()))
                };
                RwLock::new(storage)
            })
            .collect();

        let (refresh_tx, refresh_rx) = mpsc::channel(REFRESH_QUEUE_SIZE);
        let (shutdown, _) = watch::channel(false);

        info!("Discovery table created (local node: {})", self_node);

        Ok(Arc::new(Self {
            self_node,
            bonder: Bonder::new(Arc::clone(&transport)),
            transport,
            storages,
            bootstrap_nodes,
            restrict,
            rng,
            config,
            initialized: AtomicBool::new(false),
            running: AtomicBool::new(false),
            refresh_tx,
            refresh_rx: Mutex::new(Some(refresh_rx)),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Get the local node.
    pub fn self_node(&self) -> &Arc<Node> {
        &self.self_node
    }

    /// Get the configured bootstrap nodes.
    pub fn bootstrap_nodes(&self) -> &[Arc<Node>] {
        &self.bootstrap_nodes
    }

    /// Check whether the first refresh pass has completed.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Check whether the maintenance loops are running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    fn storage(&self, role: NodeRole) -> &RwLock<Box<dyn NodeStorage>> {
        &self.storages[role.index()]
    }

    /// Start the refresh and revalidate loops.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Discovery table already running");
            return;
        }
        let Some(refresh_rx) = self.refresh_rx.lock().await.take() else {
            warn!("Discovery table cannot be restarted after close");
            return;
        };

        info!("Starting discovery table");
        let mut tasks = self.tasks.lock().await;

        // Subscribe before spawning so a close() racing the spawned loops
        // cannot be missed
        let table = Arc::clone(self);
        let shutdown = self.shutdown.subscribe();
        tasks.push(spawn_task("discovery-refresh", async move {
            table.refresh_loop(refresh_rx, shutdown).await;
        }));

        let table = Arc::clone(self);
        let shutdown = self.shutdown.subscribe();
        tasks.push(spawn_task("discovery-revalidate", async move {
            table.revalidate_loop(shutdown).await;
        }));
    }

    /// Stop both loops and wait until they have exited.
    ///
    /// Subsequent operations on the table are no-ops or fail with
    /// [`DiscoveryError::TableClosed`].
    pub async fn close(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping discovery table");
        let _ = self.shutdown.send(true);

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if let Err(e) = task.await {
                debug!("Discovery task ended abnormally: {}", e);
            }
        }
    }

    /// Bond with a node and admit it into its role's storage.
    ///
    /// `was_pinged` marks an exchange initiated by the remote; such inbound
    /// bonds are rejected until the table has completed its first refresh.
    /// Bonding with our own identity is a local error, not a network
    /// operation.
    pub async fn bond(&self, was_pinged: bool, node: Arc<Node>) -> DiscoveryResult<Arc<Node>> {
        if node.id() == self.self_node.id() {
            return Err(DiscoveryError::SelfOperation);
        }
        if was_pinged && !self.is_initialized() {
            return Err(DiscoveryError::TableNotInitialized);
        }
        if !self.restrict.contains(&node.ip()) {
            return Err(DiscoveryError::RestrictedAddress(node.ip()));
        }

        // Already bonded: nothing to exchange
        if let Some(existing) = self.storage(node.role()).read().await.get(node.id()) {
            return Ok(existing);
        }

        let bonded = self.bonder.bond(was_pinged, node).await?;
        self.storage(bonded.role())
            .write()
            .await
            .add(Arc::clone(&bonded));
        Ok(bonded)
    }

    /// Sample up to `max` random nodes of a role.
    ///
    /// Snapshot-consistent per call; no promise holds across calls.
    pub async fn random_nodes(&self, role: NodeRole, max: usize) -> Vec<Arc<Node>> {
        self.storage(role).read().await.random(max)
    }

    /// Get up to `max` known nodes of a role closest to `target`.
    pub async fn closest_nodes(&self, target: &Hash, role: NodeRole, max: usize) -> Vec<Arc<Node>> {
        self.storage(role).read().await.closest(target, max)
    }

    /// Number of live entries stored for a role.
    pub async fn count(&self, role: NodeRole) -> usize {
        self.storage(role).read().await.len()
    }

    /// Remove a node from its role's storage.
    pub async fn remove(&self, node: &Node) -> bool {
        self.storage(node.role()).write().await.delete(node.id())
    }

    /// Request a refresh pass and wait for it to complete.
    pub async fn refresh(&self) -> DiscoveryResult<()> {
        let (tx, rx) = oneshot::channel();
        self.refresh_tx
            .send(tx)
            .await
            .map_err(|_| DiscoveryError::TableClosed)?;
        rx.await.map_err(|_| DiscoveryError::TableClosed)
    }

    async fn refresh_loop(
        self: Arc<Self>,
        mut requests: mpsc::Receiver<oneshot::Sender<()>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut timer = interval(REFRESH_INTERVAL);

        loop {
            let mut waiters: Vec<oneshot::Sender<()>> = Vec::new();
            select! {
                _ = shutdown.changed() => break,
                _ = timer.tick() => {}
                request = requests.recv() => {
                    match request {
                        Some(waiter) => {
                            waiters.push(waiter);
                            // Serve every queued request with one cycle
                            while let Ok(waiter) = requests.try_recv() {
                                waiters.push(waiter);
                            }
                        }
                        None => break,
                    }
                }
            }

            self.do_refresh().await;
            for waiter in waiters {
                let _ = waiter.send(());
            }
        }
    }

    /// One refresh pass: reseed the random source, then explore per role.
    async fn do_refresh(&self) {
        debug!("Refreshing discovery table");
        self.rng.reseed();

        for role in NodeRole::ALL {
            let target_count = self.config.discover_target(role);
            if target_count == 0 {
                // Accept-inbound-only role
                continue;
            }

            if role == self.config.kad_role {
                let self_key = self.self_node.dist_key().clone();
                self.lookup(&self_key, role, true, self.config.bucket_size)
                    .await;
                for _ in 0..RANDOM_REFRESH_LOOKUPS {
                    let target_key = self.rng.random_hash();
                    self.lookup(&target_key, role, true, self.config.bucket_size)
                        .await;
                }
            } else {
                let target_key = self.rng.random_hash();
                self.lookup(&target_key, role, false, target_count).await;
            }
        }

        if !self.initialized.swap(true, Ordering::SeqCst) {
            info!("Discovery table initialized");
        }
    }

    async fn revalidate_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut timer = interval(REVALIDATE_INTERVAL);

        loop {
            select! {
                _ = shutdown.changed() => break,
                _ = timer.tick() => {}
            }
            self.do_revalidate().await;
        }
    }

    /// One revalidation pass: ping the oldest entry of every storage.
    ///
    /// A plain PING suffices here, the node is already bonded; failure is
    /// the table's eviction path.
    pub(crate) async fn do_revalidate(&self) {
        for role in NodeRole::ALL {
            let oldest = { self.storage(role).read().await.oldest() };
            let Some(node) = oldest else {
                continue;
            };

            match self.transport.ping(node.id(), node.udp_addr()).await {
                Ok(()) => {
                    // Still alive: bump to the front of its container
                    self.storage(role).write().await.add(node);
                }
                Err(e) => {
                    debug!("Revalidation of {} failed, evicting: {}", node, e);
                    counter!("meridian_discovery_nodes_evicted", "role" => role.to_string())
                        .increment(1);
                    self.storage(role).write().await.delete(node.id());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::testing::{test_node, MemoryTransport};
    use meridian_common::crypto::Hash;

    fn config_with(bootstrap: Vec<String>) -> DiscoveryConfig {
        DiscoveryConfig {
            node_id: Some(Hash::new([0xEE; 32])),
            bootstrap_nodes: bootstrap,
            ..Default::default()
        }
    }

    fn boot_url(node: &Node) -> String {
        format!(
            "merinode://{}@{}?role={}",
            node.id().to_hex(),
            node.udp_addr(),
            node.role()
        )
    }

    #[tokio::test]
    async fn test_construction_rejects_malformed_bootstrap() {
        let transport = Arc::new(MemoryTransport::new());
        let config = config_with(vec!["merinode://nope".to_string()]);

        let result = DiscoveryTable::new(config, transport);
        assert!(matches!(result, Err(DiscoveryError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn test_construction_rejects_restricted_bootstrap() {
        let transport = Arc::new(MemoryTransport::new());
        let boot = test_node(1, NodeRole::Boot);
        let mut config = config_with(vec![boot_url(&boot)]);
        config.net_restrict = vec!["192.168.0.0/16".to_string()];

        let result = DiscoveryTable::new(config, transport);
        assert!(matches!(result, Err(DiscoveryError::RestrictedAddress(_))));
    }

    #[tokio::test]
    async fn test_construction_rejects_zero_bucket_size() {
        let transport = Arc::new(MemoryTransport::new());
        let mut config = config_with(Vec::new());
        config.bucket_size = 0;

        assert!(matches!(
            DiscoveryTable::new(config, transport),
            Err(DiscoveryError::ConfigError(_))
        ));
    }

    #[tokio::test]
    async fn test_self_bond_is_fatal() {
        let transport = Arc::new(MemoryTransport::new());
        let table = DiscoveryTable::new(config_with(Vec::new()), transport).unwrap();

        let this = Arc::clone(table.self_node());
        assert!(matches!(
            table.bond(false, this).await,
            Err(DiscoveryError::SelfOperation)
        ));
    }

    #[tokio::test]
    async fn test_inbound_bond_rejected_before_initialization() {
        let transport = Arc::new(MemoryTransport::new());
        let table = DiscoveryTable::new(config_with(Vec::new()), transport.clone()).unwrap();

        let node = test_node(1, NodeRole::Validator);
        transport.add_peer(Arc::clone(&node)).await;

        assert!(matches!(
            table.bond(true, Arc::clone(&node)).await,
            Err(DiscoveryError::TableNotInitialized)
        ));
        // Outbound bonding is allowed regardless
        assert!(table.bond(false, node).await.is_ok());
    }

    #[tokio::test]
    async fn test_bond_rejects_restricted_address() {
        let transport = Arc::new(MemoryTransport::new());
        let mut config = config_with(Vec::new());
        config.net_restrict = vec!["192.168.0.0/16".to_string()];
        let table = DiscoveryTable::new(config, transport.clone()).unwrap();

        let node = test_node(1, NodeRole::Validator);
        transport.add_peer(Arc::clone(&node)).await;

        assert!(matches!(
            table.bond(false, node).await,
            Err(DiscoveryError::RestrictedAddress(_))
        ));
    }

    #[tokio::test]
    async fn test_bond_inserts_into_role_storage() {
        let transport = Arc::new(MemoryTransport::new());
        let table = DiscoveryTable::new(config_with(Vec::new()), transport.clone()).unwrap();

        let proxy = test_node(1, NodeRole::Proxy);
        transport.add_peer(Arc::clone(&proxy)).await;

        table.bond(false, Arc::clone(&proxy)).await.unwrap();
        assert_eq!(table.count(NodeRole::Proxy).await, 1);
        assert_eq!(table.count(NodeRole::Validator).await, 0);

        // A failed bond inserts nothing
        let dead = test_node(2, NodeRole::Proxy);
        assert!(table.bond(false, dead).await.is_err());
        assert_eq!(table.count(NodeRole::Proxy).await, 1);
    }

    #[tokio::test]
    async fn test_refresh_seeds_from_bootstrap() {
        let transport = Arc::new(MemoryTransport::new());
        let boot = test_node(1, NodeRole::Validator);
        transport.add_peer(Arc::clone(&boot)).await;

        let table = DiscoveryTable::new(config_with(vec![boot_url(&boot)]), transport).unwrap();
        table.start().await;
        table.refresh().await.unwrap();

        assert!(table.is_initialized());
        assert_eq!(table.count(NodeRole::Validator).await, 1);
        let sampled = table.random_nodes(NodeRole::Validator, 8).await;
        assert_eq!(sampled.len(), 1);
        assert_eq!(sampled[0].id(), boot.id());

        table.close().await;
    }

    #[tokio::test]
    async fn test_revalidate_bumps_live_and_evicts_dead() {
        let transport = Arc::new(MemoryTransport::new());
        let table = DiscoveryTable::new(config_with(Vec::new()), transport.clone()).unwrap();

        let a = test_node(1, NodeRole::Proxy);
        let b = test_node(2, NodeRole::Proxy);
        transport.add_peer(Arc::clone(&a)).await;
        transport.add_peer(Arc::clone(&b)).await;
        table.bond(false, Arc::clone(&a)).await.unwrap();
        table.bond(false, Arc::clone(&b)).await.unwrap();

        // Both alive: the oldest entry is bumped, nothing is removed
        table.do_revalidate().await;
        assert_eq!(table.count(NodeRole::Proxy).await, 2);

        // Kill the oldest; the next passes evict it and keep the other
        transport.set_reachable(a.id().clone(), false).await;
        transport.set_reachable(b.id().clone(), false).await;
        table.do_revalidate().await;
        table.do_revalidate().await;
        assert_eq!(table.count(NodeRole::Proxy).await, 0);
        assert!(table.random_nodes(NodeRole::Proxy, 8).await.is_empty());
    }

    #[tokio::test]
    async fn test_close_stops_loops_and_refresh_fails() {
        let transport = Arc::new(MemoryTransport::new());
        let table = DiscoveryTable::new(config_with(Vec::new()), transport).unwrap();

        table.start().await;
        table.refresh().await.unwrap();
        table.close().await;
        // Closing twice is a no-op
        table.close().await;

        assert!(!table.is_running());
        assert!(matches!(
            table.refresh().await,
            Err(DiscoveryError::TableClosed)
        ));
    }
}
