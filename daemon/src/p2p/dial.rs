//! Outbound dial scheduler.
//!
//! One sub-scheduler per role keeps the outbound connection count at a
//! configured target: each cycle it computes how many links are missing,
//! builds an over-fetched candidate list (static nodes always first, then
//! random table samples), and launches that many concurrent dial attempts
//! through the [`Connector`] seam. Outcomes flow back into the dialing /
//! connected sets so the same identity is never dialed twice at once.
//!
//! Candidate shortfall is not an error: the loop simply dials fewer than
//! wanted and re-evaluates after an idle interval or the next completion.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use indexmap::IndexMap;
use log::{debug, info, trace, warn};
use lru::LruCache;
use metrics::counter;
use serde::{Deserialize, Serialize};

use meridian_common::tokio::sync::{watch, Mutex, Notify, RwLock};
use meridian_common::tokio::time::sleep;
use meridian_common::tokio::{select, spawn_task, JoinHandle};

use crate::discovery::node::{Node, NodeId, NodeRole};
use crate::discovery::table::DiscoveryTable;

/// How long a role loop idles when nothing is left to dial.
pub const DIAL_INTERVAL: Duration = Duration::from_secs(15);

/// How long a dialed identity is suppressed from being dialed again.
pub const DIAL_HISTORY_EXPIRY: Duration = Duration::from_secs(30);

/// Entries kept in the per-role dial history.
const DIAL_HISTORY_SIZE: NonZeroUsize = match NonZeroUsize::new(512) {
    Some(size) => size,
    None => panic!("dial history size must be non-zero"),
};

/// Default outbound target for validator-class nodes.
const fn default_validator_peers() -> usize {
    8
}

/// Default outbound target for proxy-class nodes.
const fn default_proxy_peers() -> usize {
    4
}

/// Default outbound target for endpoint-class nodes.
const fn default_endpoint_peers() -> usize {
    4
}

/// Default outbound target for boot nodes.
///
/// Boot nodes are queried over discovery, not dialed.
const fn default_boot_peers() -> usize {
    0
}

/// Connection establishment seam consumed by the scheduler.
///
/// The implementation owns session setup, the application handshake and
/// its own timeout; the scheduler only cares about the outcome.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open an outbound connection to a node.
    async fn connect(&self, node: Arc<Node>) -> anyhow::Result<()>;
}

/// Configuration of the dial scheduler.
#[derive(Debug, Clone, clap::Args, Serialize, Deserialize)]
pub struct DialConfig {
    /// Outbound connection target for validator-class nodes.
    #[clap(name = "validator-peers", long, default_value_t = default_validator_peers())]
    #[serde(default = "default_validator_peers")]
    pub validator_peers: usize,

    /// Outbound connection target for proxy-class nodes.
    #[clap(name = "proxy-peers", long, default_value_t = default_proxy_peers())]
    #[serde(default = "default_proxy_peers")]
    pub proxy_peers: usize,

    /// Outbound connection target for endpoint-class nodes.
    #[clap(name = "endpoint-peers", long, default_value_t = default_endpoint_peers())]
    #[serde(default = "default_endpoint_peers")]
    pub endpoint_peers: usize,

    /// Outbound connection target for boot nodes.
    ///
    /// Zero disables active dialing for the role (inbound-only).
    #[clap(name = "boot-peers", long, default_value_t = default_boot_peers())]
    #[serde(default = "default_boot_peers")]
    pub boot_peers: usize,
}

impl Default for DialConfig {
    fn default() -> Self {
        Self {
            validator_peers: default_validator_peers(),
            proxy_peers: default_proxy_peers(),
            endpoint_peers: default_endpoint_peers(),
            boot_peers: default_boot_peers(),
        }
    }
}

impl DialConfig {
    /// Get the outbound target configured for a role.
    pub fn target(&self, role: NodeRole) -> usize {
        match role {
            NodeRole::Validator => self.validator_peers,
            NodeRole::Proxy => self.proxy_peers,
            NodeRole::Endpoint => self.endpoint_peers,
            NodeRole::Boot => self.boot_peers,
        }
    }
}

/// Mutable dial bookkeeping of one role.
///
/// Invariant: an identity is in at most one of `dialing` / `connected`.
#[derive(Default)]
struct DialSets {
    /// Identities with a dial attempt in flight.
    dialing: HashSet<NodeId>,
    /// Identities with an established outbound connection.
    connected: HashSet<NodeId>,
    /// Consecutive dial failures per identity, reset on success.
    fails: HashMap<NodeId, u32>,
}

/// Dialer of a single role.
struct RoleDialer {
    role: NodeRole,
    /// Outbound connection target; zero means inbound-only.
    target: usize,
    table: Arc<DiscoveryTable>,
    connector: Arc<dyn Connector>,
    /// User-configured nodes, always preferred, in insertion order.
    statics: RwLock<IndexMap<NodeId, Arc<Node>>>,
    sets: RwLock<DialSets>,
    /// Recently dialed identities, suppressed from immediate re-dials.
    history: Mutex<LruCache<NodeId, Instant>>,
    /// Woken by dial completions and static-set changes.
    kick: Notify,
}

impl RoleDialer {
    fn new(
        role: NodeRole,
        target: usize,
        table: Arc<DiscoveryTable>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            role,
            target,
            table,
            connector,
            statics: RwLock::new(IndexMap::new()),
            sets: RwLock::new(DialSets::default()),
            history: Mutex::new(LruCache::new(DIAL_HISTORY_SIZE)),
            kick: Notify::new(),
        }
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            Arc::clone(&self).fill().await;
            select! {
                _ = shutdown.changed() => break,
                _ = self.kick.notified() => {}
                _ = sleep(DIAL_INTERVAL) => {}
            }
        }
    }

    /// Launch dial attempts until the missing link count is covered or the
    /// candidate pool runs dry.
    async fn fill(self: Arc<Self>) {
        let want = {
            let sets = self.sets.read().await;
            self.target
                .saturating_sub(sets.connected.len() + sets.dialing.len())
        };
        if want == 0 {
            return;
        }

        // Static nodes always come first, then an over-fetched table sample
        let mut candidates: Vec<Arc<Node>> = self.statics.read().await.values().cloned().collect();
        candidates.extend(self.table.random_nodes(self.role, want * 2).await);

        let mut launched = 0usize;
        for node in candidates {
            if launched >= want {
                break;
            }
            if node.id() == self.table.self_node().id() {
                continue;
            }
            {
                let history = self.history.lock().await;
                if let Some(last) = history.peek(node.id()) {
                    if last.elapsed() < DIAL_HISTORY_EXPIRY {
                        continue;
                    }
                }
            }
            {
                let mut sets = self.sets.write().await;
                if sets.connected.contains(node.id()) || sets.dialing.contains(node.id()) {
                    continue;
                }
                sets.dialing.insert(node.id().clone());
            }
            self.history
                .lock()
                .await
                .put(node.id().clone(), Instant::now());
            launched += 1;
            counter!("meridian_p2p_dial_attempts", "role" => self.role.to_string()).increment(1);

            let dialer = Arc::clone(&self);
            spawn_task(format!("p2p-dial-{}", self.role), async move {
                trace!("Dialing {}", node);
                match dialer.connector.connect(Arc::clone(&node)).await {
                    Ok(()) => {
                        let _ = dialer.on_success(node.id()).await;
                    }
                    Err(e) => {
                        debug!("Dial to {} failed: {}", node, e);
                        let _ = dialer.on_failure(node.id()).await;
                    }
                }
                dialer.kick.notify_one();
            });
        }

        if launched > 0 {
            debug!("Launched {} dial(s) for role {}", launched, self.role);
        }
    }

    /// A dial attempt succeeded. Returns whether the identity was dialing.
    async fn on_success(&self, id: &NodeId) -> bool {
        let mut sets = self.sets.write().await;
        if !sets.dialing.remove(id) {
            return false;
        }
        sets.connected.insert(id.clone());
        sets.fails.remove(id);
        counter!("meridian_p2p_dial_success", "role" => self.role.to_string()).increment(1);
        true
    }

    /// A dial attempt failed. Returns whether the identity was dialing.
    async fn on_failure(&self, id: &NodeId) -> bool {
        let mut sets = self.sets.write().await;
        if !sets.dialing.remove(id) {
            return false;
        }
        *sets.fails.entry(id.clone()).or_insert(0) += 1;
        counter!("meridian_p2p_dial_failures", "role" => self.role.to_string()).increment(1);
        true
    }

    /// An established connection closed. Returns whether it was tracked.
    async fn on_disconnected(&self, id: &NodeId) -> bool {
        let removed = {
            let mut sets = self.sets.write().await;
            sets.connected.remove(id)
        };
        if removed {
            self.kick.notify_one();
        }
        removed
    }
}

/// Per-role outbound dial scheduling over the discovery table.
pub struct DialScheduler {
    /// One dialer per role, indexed in `NodeRole::ALL` order.
    dialers: Vec<Arc<RoleDialer>>,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DialScheduler {
    /// Create a scheduler over the given table and connector.
    pub fn new(
        table: Arc<DiscoveryTable>,
        connector: Arc<dyn Connector>,
        config: DialConfig,
    ) -> Self {
        let dialers = NodeRole::ALL
            .iter()
            .map(|role| {
                Arc::new(RoleDialer::new(
                    *role,
                    config.target(*role),
                    Arc::clone(&table),
                    Arc::clone(&connector),
                ))
            })
            .collect();
        let (shutdown, _) = watch::channel(false);

        Self {
            dialers,
            running: AtomicBool::new(false),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn dialer(&self, role: NodeRole) -> &Arc<RoleDialer> {
        &self.dialers[role.index()]
    }

    /// Spawn the dial loop of every role with a non-zero target.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Dial scheduler already running");
            return;
        }
        info!("Starting dial scheduler");

        let mut tasks = self.tasks.lock().await;
        for dialer in &self.dialers {
            if dialer.target == 0 {
                // Inbound-only role
                continue;
            }
            let shutdown = self.shutdown.subscribe();
            let dialer = Arc::clone(dialer);
            tasks.push(spawn_task(
                format!("p2p-dial-loop-{}", dialer.role),
                dialer.run(shutdown),
            ));
        }
    }

    /// Stop every dial loop and wait until they have exited.
    ///
    /// In-flight dial attempts finish or time out on their own.
    pub async fn close(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping dial scheduler");
        let _ = self.shutdown.send(true);

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if let Err(e) = task.await {
                debug!("Dial loop ended abnormally: {}", e);
            }
        }
    }

    /// Add a static node; it is preferred over sampled candidates on every
    /// cycle. In-flight dials are unaffected.
    pub async fn add_static(&self, node: Arc<Node>) {
        let dialer = self.dialer(node.role());
        dialer
            .statics
            .write()
            .await
            .insert(node.id().clone(), node);
        dialer.kick.notify_one();
    }

    /// Remove a static node. In-flight dials are unaffected.
    pub async fn remove_static(&self, id: &NodeId) {
        for dialer in &self.dialers {
            if dialer.statics.write().await.shift_remove(id).is_some() {
                return;
            }
        }
    }

    /// Report a successful connection for a dialed identity.
    pub async fn on_success(&self, id: &NodeId) {
        for dialer in &self.dialers {
            if dialer.on_success(id).await {
                return;
            }
        }
    }

    /// Report a failed dial attempt for an identity.
    pub async fn on_failure(&self, id: &NodeId) {
        for dialer in &self.dialers {
            if dialer.on_failure(id).await {
                return;
            }
        }
    }

    /// Report that an established connection has closed; the identity
    /// becomes a dial candidate again.
    pub async fn on_disconnected(&self, id: &NodeId) {
        for dialer in &self.dialers {
            if dialer.on_disconnected(id).await {
                return;
            }
        }
    }

    /// Number of established outbound connections for a role.
    pub async fn connected_count(&self, role: NodeRole) -> usize {
        self.dialer(role).sets.read().await.connected.len()
    }

    /// Number of dial attempts in flight for a role.
    pub async fn dialing_count(&self, role: NodeRole) -> usize {
        self.dialer(role).sets.read().await.dialing.len()
    }

    /// Consecutive dial failures recorded for an identity.
    pub async fn fail_count(&self, id: &NodeId) -> u32 {
        for dialer in &self.dialers {
            if let Some(count) = dialer.sets.read().await.fails.get(id) {
                return *count;
            }
        }
        0
    }
}
