//! Iterative FINDNODE lookup.
//!
//! A lookup walks the network towards a target key: it seeds a candidate
//! pool from the closest known nodes (or the bootstrap set), queries the
//! nearest unasked candidates with a bounded fan-out and merges every
//! response back into the pool until no query is outstanding. An explicit
//! worklist, not recursion: the fan-out bound and the termination
//! condition stay testable with a scripted transport.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use log::debug;

use meridian_common::crypto::Hash;

use super::node::{compare_distance, Node, NodeId, NodeRole};
use super::table::DiscoveryTable;

/// Fan-out bound on concurrent FINDNODE queries.
pub const LOOKUP_ALPHA: usize = 3;

impl DiscoveryTable {
    /// Find up to `max` nodes of `role` nearest to `target`.
    ///
    /// With `recurse` set, every completed query funds one follow-up query
    /// until the non-bootstrap pool reaches `max` or no unasked candidate
    /// remains; without it only the initial fan-out runs. A `max` of zero
    /// returns nothing and sends nothing.
    pub async fn lookup(
        &self,
        target: &Hash,
        role: NodeRole,
        recurse: bool,
        max: usize,
    ) -> Vec<Arc<Node>> {
        if max == 0 {
            return Vec::new();
        }

        // Seed from the closest known nodes of the role, or fall back to
        // the bootstrap set when the table knows nothing about it yet.
        let mut seeds = self.closest_nodes(target, role, max).await;
        if seeds.is_empty() {
            seeds = self.bootstrap_nodes().to_vec();
        }

        let mut pool: Vec<Arc<Node>> = Vec::new();
        let mut seen: HashSet<NodeId> = HashSet::new();
        let mut asked: HashSet<NodeId> = HashSet::new();
        seen.insert(self.self_node().id().clone());

        // Seeds are bonded before use; already known nodes resolve without
        // any traffic.
        for result in join_all(seeds.into_iter().map(|seed| self.bond(false, seed))).await {
            if let Ok(node) = result {
                if seen.insert(node.id().clone()) {
                    pool.push(node);
                }
            }
        }

        let mut queries = FuturesUnordered::new();
        for _ in 0..LOOKUP_ALPHA {
            let Some(next) = next_unasked(&pool, &asked, target) else {
                break;
            };
            asked.insert(next.id().clone());
            queries.push(self.query(next, target, role, max));
        }

        // The lookup ends when no query is outstanding
        while let Some(found) = queries.next().await {
            for node in found {
                if seen.insert(node.id().clone()) {
                    pool.push(node);
                }
            }
            if recurse && !satisfied(&pool, role, max) {
                if let Some(next) = next_unasked(&pool, &asked, target) {
                    asked.insert(next.id().clone());
                    queries.push(self.query(next, target, role, max));
                }
            }
        }

        // Rank by distance; bootstrap nodes only count when asked for
        if role != NodeRole::Boot {
            pool.retain(|node| node.role() != NodeRole::Boot);
        }
        pool.sort_by(|a, b| compare_distance(target, a.dist_key(), b.dist_key()));
        pool.truncate(max);
        pool
    }

    /// Query one node and bond whatever it reports back.
    async fn query(
        &self,
        node: Arc<Node>,
        target: &Hash,
        role: NodeRole,
        max: usize,
    ) -> Vec<Arc<Node>> {
        let found = match self
            .transport()
            .find_node(node.id(), node.udp_addr(), target, role, max)
            .await
        {
            Ok(found) => found,
            Err(e) => {
                debug!("FINDNODE to {} failed: {}", node, e);
                return Vec::new();
            }
        };

        let mut out = Vec::with_capacity(found.len());
        for candidate in found {
            if candidate.id() == self.self_node().id() {
                continue;
            }
            match self.bond(false, Arc::new(candidate)).await {
                Ok(bonded) => out.push(bonded),
                Err(e) => debug!("Skipping unbondable neighbor: {}", e),
            }
        }
        out
    }
}

/// Check whether the pool already satisfies the lookup.
///
/// Bootstrap nodes do not count towards a non-bootstrap target.
fn satisfied(pool: &[Arc<Node>], role: NodeRole, max: usize) -> bool {
    let count = if role == NodeRole::Boot {
        pool.len()
    } else {
        pool.iter()
            .filter(|node| node.role() != NodeRole::Boot)
            .count()
    };
    count >= max
}

/// Pick the unasked pool member closest to the target.
fn next_unasked(
    pool: &[Arc<Node>],
    asked: &HashSet<NodeId>,
    target: &Hash,
) -> Option<Arc<Node>> {
    pool.iter()
        .filter(|node| !asked.contains(node.id()))
        .min_by(|a, b| compare_distance(target, a.dist_key(), b.dist_key()))
        .cloned()
}
