//! Node storage strategies for the discovery table.
//!
//! The table owns one storage per role, all behind the [`NodeStorage`]
//! capability trait:
//! - [`KadStorage`] keeps nodes in k-buckets indexed by the log2 XOR
//!   distance between the local distance key and theirs. It is used for
//!   the one role where closest-key lookups pay off.
//! - [`FlatStorage`] keeps a recency-ordered list with no distance concept,
//!   for roles where any live node is as good as another.
//!
//! Both are plain data structures: no I/O, no interior locking. The table
//! wraps each in a read/write lock and injects one shared random source.

use std::sync::{Arc, Mutex};

use log::trace;
use metrics::counter;
use rand::rngs::StdRng;
use rand::seq::{index, SliceRandom};
use rand::{Rng, RngCore, SeedableRng};

use meridian_common::crypto::random::secure_random_bytes;
use meridian_common::crypto::{self, Hash};

use super::netutil::SubnetSet;
use super::node::{compare_distance, log2_distance, Node, NodeId};

/// Number of k-buckets (one for each bit position).
pub const NUM_BUCKETS: usize = 256;

/// Default number of nodes per bucket (Kademlia k parameter).
pub const DEFAULT_BUCKET_SIZE: usize = 16;

/// Maximum replacement candidates kept per bucket.
pub const MAX_REPLACEMENTS: usize = 10;

/// Maximum addresses per subnet within one bucket.
pub const BUCKET_SUBNET_LIMIT: usize = 2;

/// Maximum addresses per subnet across the whole table.
pub const TABLE_SUBNET_LIMIT: usize = 10;

/// Shared, lock-guarded random source.
///
/// Owned by the table and injected into every storage so that refresh can
/// reseed one place; never a process-wide singleton.
#[derive(Clone)]
pub struct TableRng {
    inner: Arc<Mutex<StdRng>>,
}

impl TableRng {
    /// Create a new source seeded from the OS CSPRNG.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StdRng::from_seed(secure_random_bytes::<32>()))),
        }
    }

    /// Reseed the source from the OS CSPRNG.
    pub fn reseed(&self) {
        let mut rng = self.lock();
        *rng = StdRng::from_seed(secure_random_bytes::<32>());
    }

    /// Run a closure with exclusive access to the generator.
    pub fn with<R>(&self, f: impl FnOnce(&mut StdRng) -> R) -> R {
        f(&mut self.lock())
    }

    /// Draw a uniformly random distance key.
    pub fn random_hash(&self) -> Hash {
        self.with(|rng| {
            let mut bytes = [0u8; 32];
            rng.fill_bytes(&mut bytes);
            Hash::new(bytes)
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StdRng> {
        // A poisoned lock only means another thread panicked mid-draw;
        // the generator state is still usable.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for TableRng {
    fn default() -> Self {
        Self::new()
    }
}

/// Capability interface shared by all storage strategies.
pub trait NodeStorage: Send + Sync {
    /// Insert a node, or bump it to the front if already present.
    ///
    /// Returns `true` when the node is (or already was) a live entry,
    /// `false` when it was not admitted (full bucket, diversity cap).
    fn add(&mut self, node: Arc<Node>) -> bool;

    /// Remove a node. Idempotent: removing an absent node is a no-op
    /// returning `false`.
    fn delete(&mut self, id: &NodeId) -> bool;

    /// Sample up to `max` live nodes.
    fn random(&self, max: usize) -> Vec<Arc<Node>>;

    /// Get up to `max` nodes ordered by distance to `target`.
    ///
    /// Strategies without distance semantics degrade to a random sample.
    fn closest(&self, target: &Hash, max: usize) -> Vec<Arc<Node>>;

    /// Get the least-recently-bonded node, if any.
    fn oldest(&self) -> Option<Arc<Node>>;

    /// Look up a live entry by ID.
    fn get(&self, id: &NodeId) -> Option<Arc<Node>>;

    /// Check if a live entry exists for the ID.
    fn contains(&self, id: &NodeId) -> bool {
        self.get(id).is_some()
    }

    /// Number of live entries.
    fn len(&self) -> usize;

    /// Check if the storage holds no live entries.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A single k-bucket: live entries plus bounded replacement candidates.
struct Bucket {
    /// Live entries, most-recently-bonded first.
    entries: Vec<Arc<Node>>,
    /// Replacement candidates, most recently offered first.
    replacements: Vec<Arc<Node>>,
    /// Subnet counter spanning entries and replacements.
    ips: SubnetSet,
}

impl Bucket {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            replacements: Vec::new(),
            ips: SubnetSet::new(BUCKET_SUBNET_LIMIT),
        }
    }
}

/// Distance-bucketed storage.
pub struct KadStorage {
    /// Distance key of the local node.
    local_key: Hash,
    /// Bucket capacity (k parameter).
    bucket_size: usize,
    /// K-buckets indexed by log2 distance.
    buckets: Vec<Bucket>,
    /// Table-wide subnet counter.
    ips: SubnetSet,
    /// Shared random source, injected by the table.
    rng: TableRng,
    /// Live entry count across all buckets.
    len: usize,
}

impl KadStorage {
    /// Create a new storage centered on the local distance key.
    pub fn new(local_key: Hash, bucket_size: usize, rng: TableRng) -> Self {
        let buckets = (0..NUM_BUCKETS).map(|_| Bucket::new()).collect();
        Self {
            local_key,
            bucket_size,
            buckets,
            ips: SubnetSet::new(TABLE_SUBNET_LIMIT),
            rng,
            len: 0,
        }
    }

    /// Count an address against both the table-wide and the bucket cap.
    ///
    /// Either cap failing leaves both counters untouched.
    fn count_ip(table_ips: &mut SubnetSet, bucket: &mut Bucket, node: &Node) -> bool {
        let ip = node.ip();
        if !table_ips.try_add(&ip) {
            trace!("Table subnet cap rejects {}", node);
            return false;
        }
        if !bucket.ips.try_add(&ip) {
            table_ips.remove(&ip);
            trace!("Bucket subnet cap rejects {}", node);
            return false;
        }
        true
    }

    fn uncount_ip(table_ips: &mut SubnetSet, bucket: &mut Bucket, node: &Node) {
        let ip = node.ip();
        table_ips.remove(&ip);
        bucket.ips.remove(&ip);
    }

    /// Per-bucket occupancy of the non-empty buckets.
    pub fn bucket_stats(&self) -> Vec<(usize, usize)> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.entries.is_empty())
            .map(|(i, b)| (i, b.entries.len()))
            .collect()
    }

    fn bucket_index(&self, key: &Hash) -> Option<usize> {
        log2_distance(&self.local_key, key).map(|d| d as usize)
    }
}

impl NodeStorage for KadStorage {
    fn add(&mut self, node: Arc<Node>) -> bool {
        let Some(idx) = self.bucket_index(node.dist_key()) else {
            // Identical distance keys: this is us
            return false;
        };
        let bucket = &mut self.buckets[idx];

        // Bump an already known node to the front
        if let Some(pos) = bucket.entries.iter().position(|e| e.id() == node.id()) {
            let entry = bucket.entries.remove(pos);
            bucket.entries.insert(0, entry);
            return true;
        }

        if bucket.entries.len() < self.bucket_size {
            if !Self::count_ip(&mut self.ips, bucket, &node) {
                return false;
            }
            node.mark_added();
            counter!("meridian_discovery_nodes_added", "role" => node.role().to_string())
                .increment(1);
            bucket.entries.insert(0, node);
            self.len += 1;
            return true;
        }

        // Live entries are never crowded out on add: offer the node to the
        // bounded replacement list instead.
        if let Some(pos) = bucket.replacements.iter().position(|e| e.id() == node.id()) {
            let entry = bucket.replacements.remove(pos);
            bucket.replacements.insert(0, entry);
            return false;
        }
        if !Self::count_ip(&mut self.ips, bucket, &node) {
            return false;
        }
        node.mark_added();
        bucket.replacements.insert(0, node);
        if bucket.replacements.len() > MAX_REPLACEMENTS {
            if let Some(dropped) = bucket.replacements.pop() {
                Self::uncount_ip(&mut self.ips, bucket, &dropped);
            }
        }
        false
    }

    fn delete(&mut self, id: &NodeId) -> bool {
        let key = crypto::hash(id.as_bytes());
        let Some(idx) = self.bucket_index(&key) else {
            return false;
        };
        let bucket = &mut self.buckets[idx];

        if let Some(pos) = bucket.entries.iter().position(|e| e.id() == id) {
            let removed = bucket.entries.remove(pos);
            Self::uncount_ip(&mut self.ips, bucket, &removed);
            self.len -= 1;

            // Promote a uniformly random replacement into the freed slot.
            // It has not proven recent liveness, so it joins at the tail.
            if !bucket.replacements.is_empty() {
                let i = self
                    .rng
                    .with(|rng| rng.gen_range(0..bucket.replacements.len()));
                let promoted = bucket.replacements.remove(i);
                bucket.entries.push(promoted);
                self.len += 1;
            }
            return true;
        }

        if let Some(pos) = bucket.replacements.iter().position(|e| e.id() == id) {
            let removed = bucket.replacements.remove(pos);
            Self::uncount_ip(&mut self.ips, bucket, &removed);
            return true;
        }

        false
    }

    fn random(&self, max: usize) -> Vec<Arc<Node>> {
        if max == 0 || self.len == 0 {
            return Vec::new();
        }

        // Shuffle the non-empty buckets, then take one entry per bucket per
        // round so no single large bucket dominates the sample.
        let mut order: Vec<usize> = (0..NUM_BUCKETS)
            .filter(|i| !self.buckets[*i].entries.is_empty())
            .collect();
        self.rng.with(|rng| order.shuffle(rng));

        let mut out = Vec::with_capacity(max.min(self.len));
        let mut round = 0;
        loop {
            let mut progressed = false;
            for &i in &order {
                let entries = &self.buckets[i].entries;
                if round < entries.len() {
                    out.push(Arc::clone(&entries[round]));
                    progressed = true;
                    if out.len() == max {
                        return out;
                    }
                }
            }
            if !progressed {
                break;
            }
            round += 1;
        }
        out
    }

    fn closest(&self, target: &Hash, max: usize) -> Vec<Arc<Node>> {
        let mut candidates: Vec<Arc<Node>> = self
            .buckets
            .iter()
            .flat_map(|b| b.entries.iter().cloned())
            .collect();

        // Stable sort: ties at equal distance keep insertion order
        candidates.sort_by(|a, b| compare_distance(target, a.dist_key(), b.dist_key()));
        candidates.truncate(max);
        candidates
    }

    fn oldest(&self) -> Option<Arc<Node>> {
        let non_empty: Vec<usize> = (0..NUM_BUCKETS)
            .filter(|i| !self.buckets[*i].entries.is_empty())
            .collect();
        if non_empty.is_empty() {
            return None;
        }
        // Pick a random non-empty bucket so revalidation load spreads over
        // all distance classes.
        let i = self.rng.with(|rng| rng.gen_range(0..non_empty.len()));
        self.buckets[non_empty[i]].entries.last().cloned()
    }

    fn get(&self, id: &NodeId) -> Option<Arc<Node>> {
        let key = crypto::hash(id.as_bytes());
        let idx = self.bucket_index(&key)?;
        self.buckets[idx]
            .entries
            .iter()
            .find(|e| e.id() == id)
            .cloned()
    }

    fn len(&self) -> usize {
        self.len
    }
}

/// Flat recency storage.
pub struct FlatStorage {
    /// Live entries, most-recently-bonded first.
    entries: Vec<Arc<Node>>,
    /// Shared random source, injected by the table.
    rng: TableRng,
}

impl FlatStorage {
    /// Create a new empty storage.
    pub fn new(rng: TableRng) -> Self {
        Self {
            entries: Vec::new(),
            rng,
        }
    }
}

impl NodeStorage for FlatStorage {
    fn add(&mut self, node: Arc<Node>) -> bool {
        if let Some(pos) = self.entries.iter().position(|e| e.id() == node.id()) {
            let entry = self.entries.remove(pos);
            self.entries.insert(0, entry);
            return true;
        }
        node.mark_added();
        counter!("meridian_discovery_nodes_added", "role" => node.role().to_string()).increment(1);
        self.entries.insert(0, node);
        true
    }

    fn delete(&mut self, id: &NodeId) -> bool {
        if let Some(pos) = self.entries.iter().position(|e| e.id() == id) {
            self.entries.remove(pos);
            return true;
        }
        false
    }

    fn random(&self, max: usize) -> Vec<Arc<Node>> {
        let amount = max.min(self.entries.len());
        if amount == 0 {
            return Vec::new();
        }
        let picks = self
            .rng
            .with(|rng| index::sample(rng, self.entries.len(), amount).into_vec());
        picks
            .into_iter()
            .map(|i| Arc::clone(&self.entries[i]))
            .collect()
    }

    fn closest(&self, _target: &Hash, max: usize) -> Vec<Arc<Node>> {
        // No distance semantics: any live node is dial-equivalent
        self.random(max)
    }

    fn oldest(&self) -> Option<Arc<Node>> {
        self.entries.last().cloned()
    }

    fn get(&self, id: &NodeId) -> Option<Arc<Node>> {
        self.entries.iter().find(|e| e.id() == id).cloned()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}
