//! # K-Bucket Routing Table
//!
//! The routing table holds [`BIT_LENGTH`] buckets. Bucket `i` stores nodes whose
//! XOR distance from the table owner has rank `i + 1`, so every node has
//! exactly one home bucket.
//!
//! ## Buckets
//!
//! Each bucket is an LRU-ordered map capped at `k` entries. Seeing a known node
//! moves it to the most-recently-seen end; seeing a new node when the bucket is
//! full evicts the least-recently-seen entry outright. There is no liveness ping
//! before eviction.
//!
//! ## Locking
//!
//! Buckets sit behind their own mutex. Inbound handlers and outbound lookups
//! touch the table concurrently, and unrelated buckets never contend. No lock
//! is held across an `.await`.
//!
//! ## Closest-Node Search
//!
//! [`RoutingTable::closest_nodes`] starts at the target's home bucket and walks
//! outward in the ring order `0, +1, -1, +2, -2, …` until it has `limit` nodes
//! or has run off both ends of the table.

use std::collections::HashSet;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Result, bail};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::key::{BIT_LENGTH, Key};
use crate::node::Node;

pub struct Bucket<A> {
    /// Distance rank served by this bucket; `None` accepts any rank.
    rank: Option<usize>,
    nodes: LruCache<Key, Node<A>>,
    last_update: Option<Instant>,
}

impl<A: Clone> Bucket<A> {
    pub fn new(rank: usize, capacity: usize) -> Self {
        Self::with_rank(Some(rank), capacity)
    }

    /// A bucket not tied to a distance rank.
    pub fn unranked(capacity: usize) -> Self {
        Self::with_rank(None, capacity)
    }

    fn with_rank(rank: Option<usize>, capacity: usize) -> Self {
        Self {
            rank,
            nodes: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
            last_update: None,
        }
    }

    /// Append a restored node as most recently seen without marking the
    /// bucket as updated.
    fn restore_node(&mut self, node: Node<A>) -> Option<Node<A>> {
        self.nodes
            .push(node.key, node)
            .filter(|(key, _)| !self.nodes.contains(key))
            .map(|(_, evicted)| evicted)
    }

    pub fn rank(&self) -> Option<usize> {
        self.rank
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.nodes.cap().get()
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.nodes.contains(key)
    }

    pub fn last_update(&self) -> Option<Instant> {
        self.last_update
    }

    /// Record contact with `node`. Returns the evicted node when a full bucket
    /// had to make room.
    pub fn seen_node(&mut self, node: Node<A>) -> Option<Node<A>> {
        let key = node.key;
        let evicted = match self.nodes.push(key, node) {
            Some((old_key, old)) if old_key != key => Some(old),
            _ => None,
        };
        self.last_update = Some(Instant::now());
        evicted
    }

    /// Up to `limit` resident nodes ordered by XOR distance to `target`,
    /// skipping keys in `filter`.
    pub fn closest_nodes(&self, target: &Key, limit: usize, filter: &HashSet<Key>) -> Vec<Node<A>> {
        let mut by_distance: Vec<(Key, &Node<A>)> = self
            .nodes
            .iter()
            .filter(|(key, _)| !filter.contains(*key))
            .map(|(key, node)| (target.dist(key), node))
            .collect();
        by_distance.sort_by(|a, b| a.0.cmp(&b.0));
        by_distance
            .into_iter()
            .take(limit)
            .map(|(_, node)| node.clone())
            .collect()
    }

    /// Resident nodes, least-recently-seen first.
    pub fn nodes(&self) -> Vec<Node<A>> {
        self.nodes.iter().rev().map(|(_, node)| node.clone()).collect()
    }

    pub fn least_recently_seen(&self) -> Option<&Node<A>> {
        self.nodes.peek_lru().map(|(_, node)| node)
    }

    /// A bucket that has never been touched is stale.
    pub fn is_stale(&self, refresh: Duration) -> bool {
        match self.last_update {
            Some(at) => at.elapsed() > refresh,
            None => true,
        }
    }

    /// A random key of this bucket's rank, or any key for an unranked bucket.
    pub fn random_key(&self) -> Key {
        match self.rank {
            Some(rank) => Key::random_with_rank(rank),
            None => Key::random(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BucketSnapshot<A> {
    pub rank: Option<usize>,
    /// Least-recently-seen first.
    pub nodes: Vec<Node<A>>,
}

/// Serializable image of a routing table, for an external persistence layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoutingTableSnapshot<A> {
    pub own: Key,
    pub buckets: Vec<BucketSnapshot<A>>,
}

pub struct RoutingTable<A> {
    own: Key,
    capacity: usize,
    buckets: Vec<Mutex<Bucket<A>>>,
}

impl<A: Clone + fmt::Debug> RoutingTable<A> {
    pub fn new(own: Key, capacity: usize) -> Self {
        let buckets = (0..BIT_LENGTH)
            .map(|i| Mutex::new(Bucket::new(i + 1, capacity)))
            .collect();
        Self {
            own,
            capacity,
            buckets,
        }
    }

    pub fn own_key(&self) -> Key {
        self.own
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Index of the bucket `offset` steps away from the home bucket of `key`,
    /// or `None` when that falls outside the table.
    ///
    /// # Panics
    ///
    /// Panics if the distance rank itself is out of range, which means the
    /// distance arithmetic is broken.
    pub fn bucket_index(&self, key: &Key, offset: isize) -> Option<usize> {
        let rank = self.own.dist(key).rank() as isize - 1;
        assert!(
            (-1..BIT_LENGTH as isize).contains(&rank),
            "incorrect bucket index requested: {rank}"
        );
        let index = rank + offset;
        (0..BIT_LENGTH as isize)
            .contains(&index)
            .then_some(index as usize)
    }

    /// Lock the bucket `offset` steps away from the home bucket of `key`.
    pub fn bucket(&self, key: &Key, offset: isize) -> Option<MutexGuard<'_, Bucket<A>>> {
        self.bucket_index(key, offset).map(|index| self.bucket_at(index))
    }

    /// Lock bucket `index`. Panics if `index >= BIT_LENGTH`.
    pub fn bucket_at(&self, index: usize) -> MutexGuard<'_, Bucket<A>> {
        self.buckets[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Record contact with `node` in its home bucket. The owner's own key has
    /// no home bucket and is ignored.
    pub fn seen_node(&self, node: Node<A>) {
        let key = node.key;
        let Some(mut bucket) = self.bucket(&key, 0) else {
            trace!(key = ?key, "ignoring own key in routing table");
            return;
        };
        if let Some(evicted) = bucket.seen_node(node) {
            debug!(
                rank = ?bucket.rank(),
                evicted = ?evicted.key,
                inserted = ?key,
                "bucket full, evicted least recently seen node"
            );
        }
    }

    /// Expanding-ring search for up to `limit` nodes near `target`.
    pub fn closest_nodes(&self, target: &Key, limit: usize, filter: &HashSet<Key>) -> Vec<Node<A>> {
        let mut result = Vec::new();
        let mut offset: isize = 0;
        let mut lower_exhausted = false;
        let mut upper_exhausted = false;

        while result.len() < limit && !(lower_exhausted && upper_exhausted) {
            match self.bucket(target, offset) {
                Some(bucket) => {
                    let wanted = limit - result.len();
                    result.extend(bucket.closest_nodes(target, wanted, filter));
                }
                None if offset <= 0 => lower_exhausted = true,
                None => upper_exhausted = true,
            }
            offset = if offset <= 0 { -offset + 1 } else { -offset };
        }
        result
    }

    pub fn closest(&self, target: &Key, limit: usize) -> Vec<Node<A>> {
        self.closest_nodes(target, limit, &HashSet::new())
    }

    /// Indices of buckets not updated within `refresh`.
    pub fn stale_buckets(&self, refresh: Duration) -> Vec<usize> {
        (0..self.buckets.len())
            .filter(|&index| self.bucket_at(index).is_stale(refresh))
            .collect()
    }

    /// Indices of buckets holding at least one node.
    pub fn filled_buckets(&self) -> Vec<usize> {
        (0..self.buckets.len())
            .filter(|&index| !self.bucket_at(index).is_empty())
            .collect()
    }

    /// A random key whose distance from the owner lands in bucket `index`.
    pub fn refresh_target(&self, index: usize) -> Key {
        let offset = self.bucket_at(index).random_key();
        self.own.dist(&offset)
    }

    pub fn len(&self) -> usize {
        (0..self.buckets.len())
            .map(|index| self.bucket_at(index).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> RoutingTableSnapshot<A> {
        let buckets = (0..self.buckets.len())
            .map(|index| {
                let bucket = self.bucket_at(index);
                BucketSnapshot {
                    rank: bucket.rank(),
                    nodes: bucket.nodes(),
                }
            })
            .collect();
        RoutingTableSnapshot {
            own: self.own,
            buckets,
        }
    }

    /// Rebuild a table from a snapshot. Restored buckets count as stale.
    ///
    /// Every node is placed by its distance from the owner, whatever bucket
    /// the snapshot listed it under. The owner's own key is dropped and a node
    /// listed twice keeps a single entry.
    pub fn from_snapshot(snapshot: RoutingTableSnapshot<A>, capacity: usize) -> Result<Self> {
        if snapshot.buckets.len() != BIT_LENGTH {
            bail!(
                "routing table snapshot has {} buckets, expected {}",
                snapshot.buckets.len(),
                BIT_LENGTH
            );
        }
        let own = snapshot.own;
        let mut buckets: Vec<Bucket<A>> = (0..BIT_LENGTH).map(|i| Bucket::new(i + 1, capacity)).collect();
        for (listed, bucket) in snapshot.buckets.into_iter().enumerate() {
            for node in bucket.nodes {
                let rank = own.dist(&node.key).rank();
                if rank == 0 {
                    warn!(bucket = listed, "dropping own key from routing snapshot");
                    continue;
                }
                let index = rank - 1;
                if index != listed {
                    warn!(node = %node.key, listed, index, "re-homing misplaced snapshot node");
                }
                if let Some(evicted) = buckets[index].restore_node(node) {
                    debug!(evicted = %evicted.key, index, "restored bucket over capacity");
                }
            }
        }
        Ok(Self {
            own,
            capacity,
            buckets: buckets.into_iter().map(Mutex::new).collect(),
        })
    }
}

impl<A: Clone + fmt::Debug> fmt::Display for RoutingTable<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "key:{} : {} buckets filled.",
            self.own,
            self.filled_buckets().len()
        )
    }
}
