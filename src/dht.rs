//! # Kademlia DHT Node
//!
//! [`DhtNode`] ties a [`RoutingTable`], a local value store and an injected
//! [`DhtRpc`] caller together. It answers inbound requests from local state
//! and drives the outbound iterative algorithms.
//!
//! ## Inbound
//!
//! Every request that names a sender marks that sender as seen in the routing
//! table before it is answered. `find_value` purges expired values for the
//! requested key on read; there is no background sweep.
//!
//! ## Iterative Lookups
//!
//! A lookup owns a private shortlist of at most `k` nodes ordered by distance
//! to the target, seeded with the `alpha` closest nodes from the routing table.
//! Each round sends up to `alpha` requests to untried shortlist entries and
//! waits for all of them to resolve:
//!
//! - a reply merges the returned nodes into the shortlist and marks the
//!   responder as seen;
//! - a failure drops the candidate from the shortlist;
//! - for value lookups, the first reply that carries a value ends the lookup.
//!
//! The lookup converges when a round finds no untried candidates. Each lookup
//! runs on its own task and ends early on node shutdown (error) or when the
//! configured lookup deadline passes (partial result).
//!
//! ## Maintenance
//!
//! [`DhtNode::refresh`] looks up a random key in every stale bucket.
//! [`DhtNode::spawn_maintenance`] runs it periodically until shutdown.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::DhtConfig;
use crate::key::{BIT_LENGTH, Key};
use crate::messages::{self, DhtRequest, DhtResponse, FindValueReply, MAX_VALUE_SIZE};
use crate::node::{Address, Node};
use crate::protocols::DhtRpc;
use crate::routing::{RoutingTable, RoutingTableSnapshot};
use crate::timed_value::{TimedValue, now_millis};

/// Per-key value sets. Content-equal values replace each other.
#[derive(Debug, Default)]
pub struct LocalStore {
    values: HashMap<Key, HashSet<TimedValue>>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `value`, replacing a content-equal entry and its timestamp.
    pub fn store(&mut self, key: Key, value: TimedValue) {
        self.values.entry(key).or_default().replace(value);
    }

    /// Remove the entry equal to `value`. Returns whether one was removed.
    pub fn delete(&mut self, key: &Key, value: &[u8]) -> bool {
        let Some(set) = self.values.get_mut(key) else {
            return false;
        };
        let probe = TimedValue::with_stored_time(value.to_vec(), 0, Duration::ZERO);
        let removed = set.remove(&probe);
        if set.is_empty() {
            self.values.remove(key);
        }
        removed
    }

    pub fn delete_all(&mut self, key: &Key) -> bool {
        self.values.remove(key).is_some()
    }

    /// Live values under `key` at time `now`, newest first. Expired values are
    /// dropped from the store as a side effect.
    pub fn find_at(&mut self, key: &Key, now: u64) -> Vec<TimedValue> {
        let Some(set) = self.values.get_mut(key) else {
            return Vec::new();
        };
        let before = set.len();
        set.retain(|value| !value.is_expired_at(now));
        if set.len() < before {
            trace!(key = ?key, expired = before - set.len(), "purged expired values");
        }
        let mut live: Vec<TimedValue> = set.iter().cloned().collect();
        if set.is_empty() {
            self.values.remove(key);
        }
        live.sort_by(TimedValue::cmp_recency);
        live
    }

    pub fn find(&mut self, key: &Key) -> Vec<TimedValue> {
        self.find_at(key, now_millis())
    }

    /// Number of keys with at least one stored value.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// All values live at `now`, for export. Does not purge.
    fn live_entries(&self, now: u64) -> Vec<(Key, Vec<TimedValue>)> {
        self.values
            .iter()
            .map(|(key, set)| {
                let mut live: Vec<TimedValue> = set
                    .iter()
                    .filter(|value| !value.is_expired_at(now))
                    .cloned()
                    .collect();
                live.sort_by(TimedValue::cmp_recency);
                (*key, live)
            })
            .filter(|(_, live)| !live.is_empty())
            .collect()
    }
}

/// Result of [`DhtNode::iterative_find_value`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValueLookup {
    Value(Vec<u8>),
    Values(Vec<Vec<u8>>),
    /// No reachable peer holds a value for the key.
    NotFound,
}

impl ValueLookup {
    pub fn is_found(&self) -> bool {
        !matches!(self, ValueLookup::NotFound)
    }

    /// Found payloads; empty for [`ValueLookup::NotFound`].
    pub fn into_values(self) -> Vec<Vec<u8>> {
        match self {
            ValueLookup::Value(value) => vec![value],
            ValueLookup::Values(values) => values,
            ValueLookup::NotFound => Vec::new(),
        }
    }
}

/// Routing table and value store of one node, for an external persistence layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DhtState<A> {
    pub routing: RoutingTableSnapshot<A>,
    pub values: Vec<(Key, Vec<TimedValue>)>,
}

impl<A: Address> DhtState<A> {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        messages::encode(self).context("failed to encode DHT state")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        messages::decode_bounded(bytes).context("failed to decode DHT state")
    }
}

/// Working set of one iterative lookup.
struct Shortlist<A> {
    target: Key,
    limit: usize,
    nodes: BTreeMap<Key, Node<A>>,
    tried: HashSet<Key>,
    failed: HashSet<Key>,
}

impl<A: Clone> Shortlist<A> {
    fn new(target: Key, limit: usize) -> Self {
        Self {
            target,
            limit,
            nodes: BTreeMap::new(),
            tried: HashSet::new(),
            failed: HashSet::new(),
        }
    }

    fn insert(&mut self, node: Node<A>) {
        if self.failed.contains(&node.key) {
            return;
        }
        self.nodes.insert(self.target.dist(&node.key), node);
        while self.nodes.len() > self.limit {
            self.nodes.pop_last();
        }
    }

    /// Up to `alpha` closest untried nodes, marked as tried.
    fn next_round(&mut self, alpha: usize) -> Vec<Node<A>> {
        let round: Vec<Node<A>> = self
            .nodes
            .values()
            .filter(|node| !self.tried.contains(&node.key))
            .take(alpha)
            .cloned()
            .collect();
        for node in &round {
            self.tried.insert(node.key);
        }
        round
    }

    fn drop_failed(&mut self, key: &Key) {
        self.failed.insert(*key);
        self.nodes.remove(&self.target.dist(key));
    }

    fn into_nodes(self) -> Vec<Node<A>> {
        self.nodes.into_values().collect()
    }
}

#[derive(Clone, Copy, Debug)]
enum Probe {
    Nodes,
    Value { multiple: bool },
}

enum ProbeReply<A> {
    Nodes(Vec<Node<A>>),
    Found(FindValueReply<A>),
}

enum LookupOutcome<A> {
    Closest(Vec<Node<A>>),
    Found(FindValueReply<A>),
}

struct Inner<N: DhtRpc> {
    me: Node<N::Address>,
    routing: RoutingTable<N::Address>,
    store: Mutex<LocalStore>,
    network: Arc<N>,
    config: DhtConfig,
    shutdown: watch::Sender<bool>,
}

pub struct DhtNode<N: DhtRpc> {
    inner: Arc<Inner<N>>,
}

impl<N: DhtRpc> Clone for DhtNode<N> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<N: DhtRpc> DhtNode<N> {
    /// A node with a fresh random key.
    pub fn new(address: N::Address, network: N, config: DhtConfig) -> Self {
        Self::with_key(Key::random(), address, network, config)
    }

    pub fn with_key(key: Key, address: N::Address, network: N, config: DhtConfig) -> Self {
        let routing = RoutingTable::new(key, config.k);
        Self::from_parts(Node::new(key, address), routing, LocalStore::new(), network, config)
    }

    /// Rebuild a node from exported state. The node keeps its old key.
    pub fn restore(
        state: DhtState<N::Address>,
        address: N::Address,
        network: N,
        config: DhtConfig,
    ) -> Result<Self> {
        let routing = RoutingTable::from_snapshot(state.routing, config.k)
            .context("failed to restore routing table")?;
        let mut store = LocalStore::new();
        for (key, values) in state.values {
            for value in values {
                store.store(key, value);
            }
        }
        let me = Node::new(routing.own_key(), address);
        info!(key = %me.key, nodes = routing.len(), keys = store.len(), "restored DHT node");
        Ok(Self::from_parts(me, routing, store, network, config))
    }

    fn from_parts(
        me: Node<N::Address>,
        routing: RoutingTable<N::Address>,
        store: LocalStore,
        network: N,
        config: DhtConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                me,
                routing,
                store: Mutex::new(store),
                network: Arc::new(network),
                config,
                shutdown,
            }),
        }
    }

    pub fn key(&self) -> Key {
        self.inner.me.key
    }

    /// This node as peers see it.
    pub fn contact(&self) -> Node<N::Address> {
        self.inner.me.clone()
    }

    pub fn routing_table(&self) -> &RoutingTable<N::Address> {
        &self.inner.routing
    }

    pub fn config(&self) -> &DhtConfig {
        &self.inner.config
    }

    pub fn network(&self) -> &N {
        &self.inner.network
    }

    pub fn has_values(&self) -> bool {
        !self.local_store().is_empty()
    }

    /// Live values held locally for `key`, newest first.
    pub fn local_values(&self, key: &Key) -> Vec<Vec<u8>> {
        self.local_store()
            .find(key)
            .into_iter()
            .map(TimedValue::into_value)
            .collect()
    }

    pub fn is_shut_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    fn local_store(&self) -> MutexGuard<'_, LocalStore> {
        self.inner
            .store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn seen(&self, from: Node<N::Address>) {
        self.inner.routing.seen_node(from);
    }

    pub fn ping(&self) -> bool {
        true
    }

    pub fn handle_store(&self, key: Key, value: Vec<u8>, from: Node<N::Address>) -> Result<()> {
        self.seen(from);
        if value.len() > MAX_VALUE_SIZE {
            bail!("value of {} bytes exceeds limit of {}", value.len(), MAX_VALUE_SIZE);
        }
        let value = TimedValue::new(value, self.inner.config.value_expiration);
        self.local_store().store(key, value);
        Ok(())
    }

    pub fn handle_delete(&self, key: Key, value: &[u8], from: Node<N::Address>) {
        self.seen(from);
        self.local_store().delete(&key, value);
    }

    pub fn handle_delete_all(&self, key: Key, from: Node<N::Address>) {
        self.seen(from);
        self.local_store().delete_all(&key);
    }

    /// Up to `k` known nodes closest to `near`, ascending by distance.
    pub fn handle_find_close_nodes(&self, near: Key, from: Node<N::Address>) -> Vec<Node<N::Address>> {
        self.seen(from);
        let mut nodes = self.inner.routing.closest(&near, self.inner.config.k);
        nodes.sort_by_key(|node| near.dist(&node.key));
        nodes
    }

    pub fn handle_find_value(
        &self,
        key: Key,
        multiple: bool,
        from: Node<N::Address>,
    ) -> FindValueReply<N::Address> {
        let live = self.local_store().find(&key);
        if live.is_empty() {
            return FindValueReply::Nodes(self.handle_find_close_nodes(key, from));
        }
        self.seen(from);
        if multiple {
            FindValueReply::Values(live.into_iter().map(TimedValue::into_value).collect())
        } else {
            let newest = live.into_iter().next().map(TimedValue::into_value);
            FindValueReply::Value(newest.unwrap_or_default())
        }
    }

    /// Dispatch an inbound wire request to its handler.
    pub fn handle_request(&self, request: DhtRequest<N::Address>) -> DhtResponse<N::Address> {
        trace!(
            method = request.method(),
            from = ?request.sender().map(|node| node.key),
            "handling DHT request"
        );
        match request {
            DhtRequest::Ping => DhtResponse::Pong(self.ping()),
            DhtRequest::Store { key, value, from } => match self.handle_store(key, value, from) {
                Ok(()) => DhtResponse::Ack,
                Err(e) => DhtResponse::Error {
                    message: e.to_string(),
                },
            },
            DhtRequest::Delete { key, value, from } => {
                self.handle_delete(key, &value, from);
                DhtResponse::Ack
            }
            DhtRequest::DeleteAll { key, from } => {
                self.handle_delete_all(key, from);
                DhtResponse::Ack
            }
            DhtRequest::FindCloseNodes { near, from } => {
                DhtResponse::Nodes(self.handle_find_close_nodes(near, from))
            }
            DhtRequest::FindValue { key, multiple, from } => {
                DhtResponse::Value(self.handle_find_value(key, multiple, from))
            }
        }
    }

    /// The `k` closest reachable nodes to `target`, ascending by distance.
    pub async fn iterative_node_lookup(&self, target: Key) -> Result<Vec<Node<N::Address>>> {
        match self.spawn_lookup(target, Probe::Nodes).await? {
            LookupOutcome::Closest(nodes) => Ok(nodes),
            LookupOutcome::Found(_) => bail!("node lookup for {target} produced a value"),
        }
    }

    /// First value (or value set) any peer returns for `key`.
    pub async fn iterative_find_value(&self, key: Key, multiple: bool) -> Result<ValueLookup> {
        let outcome = self.spawn_lookup(key, Probe::Value { multiple }).await?;
        Ok(match outcome {
            LookupOutcome::Found(FindValueReply::Value(value)) => ValueLookup::Value(value),
            LookupOutcome::Found(FindValueReply::Values(values)) => ValueLookup::Values(values),
            LookupOutcome::Found(FindValueReply::Nodes(_)) | LookupOutcome::Closest(_) => {
                ValueLookup::NotFound
            }
        })
    }

    /// Store `value` on the nodes closest to `key`. Returns how many acknowledged.
    pub async fn iterative_store_value(&self, key: Key, value: Vec<u8>) -> Result<usize> {
        if value.len() > MAX_VALUE_SIZE {
            bail!("value of {} bytes exceeds limit of {}", value.len(), MAX_VALUE_SIZE);
        }
        let nodes = self.iterative_node_lookup(key).await?;
        let targets = nodes.len();
        let acked = self
            .broadcast(nodes, "store", move |network, peer, me| {
                let value = value.clone();
                async move { network.store(&peer, key, value, &me).await }
            })
            .await;
        debug!(key = %key, targets, acked, "iterative store completed");
        Ok(acked)
    }

    /// Remove `value` from the nodes closest to `key`.
    pub async fn iterative_delete_value(&self, key: Key, value: Vec<u8>) -> Result<usize> {
        let nodes = self.iterative_node_lookup(key).await?;
        let acked = self
            .broadcast(nodes, "delete", move |network, peer, me| {
                let value = value.clone();
                async move { network.delete(&peer, key, value, &me).await }
            })
            .await;
        debug!(key = %key, acked, "iterative delete completed");
        Ok(acked)
    }

    /// Remove every value under `key` from the nodes closest to it.
    pub async fn iterative_delete_all(&self, key: Key) -> Result<usize> {
        let nodes = self.iterative_node_lookup(key).await?;
        let acked = self
            .broadcast(nodes, "deleteAll", move |network, peer, me| async move {
                network.delete_all(&peer, key, &me).await
            })
            .await;
        debug!(key = %key, acked, "iterative delete-all completed");
        Ok(acked)
    }

    /// Enter the network through `bootstrap`: look up our own key, then refresh
    /// every bucket from the closest populated one outward.
    pub async fn join(&self, bootstrap: Node<N::Address>) -> Result<()> {
        let own = self.key();
        if bootstrap.key == own {
            bail!("cannot join through own key");
        }
        info!(key = %own, bootstrap = %bootstrap, "joining DHT");
        self.seen(bootstrap);

        let neighbours = self.iterative_node_lookup(own).await?;
        debug!(found = neighbours.len(), "own-key lookup completed");

        let Some(&first) = self.inner.routing.filled_buckets().first() else {
            warn!("no peers reachable after join");
            return Ok(());
        };
        for index in first..BIT_LENGTH {
            let target = self.inner.routing.refresh_target(index);
            self.iterative_node_lookup(target).await?;
        }
        info!(routing = %self.inner.routing, "joined DHT");
        Ok(())
    }

    /// Look up a random key in every stale bucket. Returns the number refreshed.
    pub async fn refresh(&self) -> Result<usize> {
        let stale = self
            .inner
            .routing
            .stale_buckets(self.inner.config.bucket_refresh);
        if stale.is_empty() {
            return Ok(0);
        }
        debug!(count = stale.len(), "refreshing stale routing buckets");
        for &index in &stale {
            let target = self.inner.routing.refresh_target(index);
            self.iterative_node_lookup(target).await?;
        }
        Ok(stale.len())
    }

    /// Run [`refresh`](Self::refresh) every `refresh_interval` until shutdown
    /// or until every handle to this node has been dropped.
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let key = self.key();
        let period = self.inner.config.refresh_interval;
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = interval.tick() => {}
                }
                if *shutdown.borrow() {
                    break;
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let node = DhtNode { inner };
                match node.refresh().await {
                    Ok(count) => trace!(count, "bucket refresh pass completed"),
                    Err(e) => debug!(error = %e, "bucket refresh failed"),
                }
            }
            debug!(key = %key, "maintenance task stopped");
        })
    }

    /// Abort in-flight lookups and stop maintenance.
    pub fn shutdown(&self) {
        if !self.inner.shutdown.send_replace(true) {
            info!(key = %self.key(), "DHT node shutting down");
        }
    }

    /// Routing snapshot plus all live values.
    pub fn export_state(&self) -> DhtState<N::Address> {
        DhtState {
            routing: self.inner.routing.snapshot(),
            values: self.local_store().live_entries(now_millis()),
        }
    }

    async fn spawn_lookup(&self, target: Key, probe: Probe) -> Result<LookupOutcome<N::Address>> {
        let node = self.clone();
        tokio::spawn(async move { node.run_lookup(target, probe).await })
            .await
            .context("lookup task failed")?
    }

    async fn run_lookup(&self, target: Key, probe: Probe) -> Result<LookupOutcome<N::Address>> {
        let config = &self.inner.config;
        let mut shutdown = self.inner.shutdown.subscribe();
        if *shutdown.borrow() {
            bail!("node is shut down");
        }
        let deadline = Instant::now() + config.lookup_timeout;
        let own = self.key();

        let mut shortlist = Shortlist::new(target, config.k);
        for node in self.inner.routing.closest(&target, config.alpha) {
            shortlist.insert(node);
        }

        let mut rounds = 0usize;
        loop {
            let candidates = shortlist.next_round(config.alpha);
            if candidates.is_empty() {
                break;
            }
            rounds += 1;

            let mut join_set = JoinSet::new();
            for peer in candidates {
                let network = self.inner.network.clone();
                let me = self.inner.me.clone();
                join_set.spawn(async move {
                    let result = Self::probe(network.as_ref(), &peer, target, probe, &me).await;
                    (peer, result)
                });
            }

            loop {
                let joined = tokio::select! {
                    _ = shutdown.changed() => {
                        join_set.abort_all();
                        bail!("lookup for {target} aborted: node shutting down");
                    }
                    _ = tokio::time::sleep_until(deadline) => {
                        join_set.abort_all();
                        debug!(
                            target = ?target,
                            rounds,
                            found = shortlist.nodes.len(),
                            "iterative lookup deadline reached, returning current results"
                        );
                        return Ok(LookupOutcome::Closest(shortlist.into_nodes()));
                    }
                    joined = join_set.join_next() => joined,
                };
                let Some(joined) = joined else {
                    break;
                };
                let (peer, result) = match joined {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "lookup probe task failed");
                        continue;
                    }
                };
                match result {
                    Ok(ProbeReply::Found(reply)) => {
                        join_set.abort_all();
                        debug!(target = ?target, from = ?peer.key, rounds, "value found");
                        self.seen(peer);
                        return Ok(LookupOutcome::Found(reply));
                    }
                    Ok(ProbeReply::Nodes(nodes)) => {
                        self.seen(peer);
                        for node in nodes.into_iter().filter(|node| node.key != own) {
                            shortlist.insert(node);
                        }
                    }
                    Err(e) => {
                        debug!(peer = ?peer.key, error = %e, "dropping unresponsive lookup candidate");
                        shortlist.drop_failed(&peer.key);
                    }
                }
            }
        }

        let nodes = shortlist.into_nodes();
        debug!(
            target = ?target,
            rounds,
            found = nodes.len(),
            "iterative lookup completed"
        );
        Ok(LookupOutcome::Closest(nodes))
    }

    async fn probe(
        network: &N,
        peer: &Node<N::Address>,
        target: Key,
        probe: Probe,
        me: &Node<N::Address>,
    ) -> Result<ProbeReply<N::Address>> {
        match probe {
            Probe::Nodes => network
                .find_close_nodes(peer, target, me)
                .await
                .map(ProbeReply::Nodes),
            Probe::Value { multiple } => match network.find_value(peer, target, multiple, me).await? {
                FindValueReply::Nodes(nodes) => Ok(ProbeReply::Nodes(nodes)),
                found => Ok(ProbeReply::Found(found)),
            },
        }
    }

    /// Issue one call per node concurrently; returns the number that succeeded.
    async fn broadcast<F, Fut>(&self, nodes: Vec<Node<N::Address>>, method: &'static str, call: F) -> usize
    where
        F: Fn(Arc<N>, Node<N::Address>, Node<N::Address>) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let mut join_set = JoinSet::new();
        for peer in nodes {
            let key = peer.key;
            let pending = call(self.inner.network.clone(), peer, self.inner.me.clone());
            join_set.spawn(async move { (key, pending.await) });
        }

        let mut acked = 0;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((_, Ok(()))) => acked += 1,
                Ok((peer, Err(e))) => {
                    debug!(peer = ?peer, method, error = %e, "best-effort request failed");
                }
                Err(e) => warn!(method, error = %e, "request task failed"),
            }
        }
        acked
    }
}

impl<N: DhtRpc> fmt::Display for DhtNode<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.routing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::anyhow;
    use async_trait::async_trait;
    use tokio::sync::RwLock;
    use tokio::time::sleep;

    /// Direct in-process calls keyed by `u32` addresses, with failure and
    /// latency injection and an in-flight counter.
    #[derive(Default)]
    struct NetworkRegistry {
        peers: RwLock<HashMap<u32, DhtNode<TestNetwork>>>,
        failures: RwLock<HashSet<u32>>,
        latency: RwLock<Option<Duration>>,
        peer_latency: RwLock<HashMap<u32, Duration>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        calls: AtomicUsize,
    }

    impl NetworkRegistry {
        async fn register(&self, node: &DhtNode<TestNetwork>) {
            self.peers
                .write()
                .await
                .insert(node.contact().address, node.clone());
        }

        async fn set_failure(&self, address: u32, fail: bool) {
            let mut failures = self.failures.write().await;
            if fail {
                failures.insert(address);
            } else {
                failures.remove(&address);
            }
        }

        async fn set_latency(&self, latency: Duration) {
            *self.latency.write().await = Some(latency);
        }

        /// Overrides the shared latency for calls to `address`.
        async fn set_peer_latency(&self, address: u32, latency: Duration) {
            self.peer_latency.write().await.insert(address, latency);
        }

        fn reset_counters(&self) {
            self.in_flight.store(0, Ordering::SeqCst);
            self.max_in_flight.store(0, Ordering::SeqCst);
            self.calls.store(0, Ordering::SeqCst);
        }
    }

    struct TestNetwork {
        registry: Arc<NetworkRegistry>,
    }

    impl TestNetwork {
        async fn peer(&self, to: &Node<u32>) -> Result<DhtNode<TestNetwork>> {
            let registry = &self.registry;
            registry.calls.fetch_add(1, Ordering::SeqCst);
            let now = registry.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            registry.max_in_flight.fetch_max(now, Ordering::SeqCst);

            let per_peer = registry.peer_latency.read().await.get(&to.address).copied();
            let latency = match per_peer {
                Some(delay) => Some(delay),
                None => *registry.latency.read().await,
            };
            if let Some(delay) = latency {
                sleep(delay).await;
            }
            registry.in_flight.fetch_sub(1, Ordering::SeqCst);

            if registry.failures.read().await.contains(&to.address) {
                return Err(anyhow!("injected network failure"));
            }
            registry
                .peers
                .read()
                .await
                .get(&to.address)
                .cloned()
                .ok_or_else(|| anyhow!("unknown peer {}", to.address))
        }
    }

    #[async_trait]
    impl DhtRpc for TestNetwork {
        type Address = u32;

        async fn ping(&self, to: &Node<u32>) -> Result<bool> {
            Ok(self.peer(to).await?.ping())
        }

        async fn find_close_nodes(&self, to: &Node<u32>, near: Key, from: &Node<u32>) -> Result<Vec<Node<u32>>> {
            Ok(self.peer(to).await?.handle_find_close_nodes(near, from.clone()))
        }

        async fn find_value(
            &self,
            to: &Node<u32>,
            key: Key,
            multiple: bool,
            from: &Node<u32>,
        ) -> Result<FindValueReply<u32>> {
            Ok(self.peer(to).await?.handle_find_value(key, multiple, from.clone()))
        }

        async fn store(&self, to: &Node<u32>, key: Key, value: Vec<u8>, from: &Node<u32>) -> Result<()> {
            self.peer(to).await?.handle_store(key, value, from.clone())
        }

        async fn delete(&self, to: &Node<u32>, key: Key, value: Vec<u8>, from: &Node<u32>) -> Result<()> {
            self.peer(to).await?.handle_delete(key, &value, from.clone());
            Ok(())
        }

        async fn delete_all(&self, to: &Node<u32>, key: Key, from: &Node<u32>) -> Result<()> {
            self.peer(to).await?.handle_delete_all(key, from.clone());
            Ok(())
        }
    }

    fn test_config() -> DhtConfig {
        DhtConfig {
            lookup_timeout: Duration::from_secs(30),
            ..DhtConfig::default()
        }
    }

    async fn make_node(registry: &Arc<NetworkRegistry>, address: u32, config: DhtConfig) -> DhtNode<TestNetwork> {
        let network = TestNetwork {
            registry: registry.clone(),
        };
        let node = DhtNode::new(address, network, config);
        registry.register(&node).await;
        node
    }

    async fn make_chain(count: u32, config: DhtConfig) -> (Arc<NetworkRegistry>, Vec<DhtNode<TestNetwork>>) {
        let registry = Arc::new(NetworkRegistry::default());
        let mut nodes: Vec<DhtNode<TestNetwork>> = Vec::new();
        for address in 0..count {
            let node = make_node(&registry, address, config.clone()).await;
            if let Some(previous) = nodes.last() {
                node.join(previous.contact()).await.expect("join succeeds");
            }
            nodes.push(node);
        }
        (registry, nodes)
    }

    fn tv(payload: &[u8], stored_time: u64, ttl_ms: u64) -> TimedValue {
        TimedValue::with_stored_time(payload.to_vec(), stored_time, Duration::from_millis(ttl_ms))
    }

    #[test]
    fn local_store_replaces_content_equal_values() {
        let mut store = LocalStore::new();
        let key = Key::digest("k");
        store.store(key, tv(b"a", 1_000, 10_000));
        store.store(key, tv(b"b", 2_000, 10_000));
        store.store(key, tv(b"a", 3_000, 10_000));

        let live = store.find_at(&key, 3_500);
        assert_eq!(live.len(), 2);
        assert_eq!(live[0].value(), b"a");
        assert_eq!(live[0].stored_time(), 3_000);
        assert_eq!(live[1].value(), b"b");
    }

    #[test]
    fn local_store_purges_expired_values_on_read() {
        let mut store = LocalStore::new();
        let key = Key::digest("k");
        store.store(key, tv(b"short", 1_000, 500));
        store.store(key, tv(b"long", 1_000, 5_000));

        assert_eq!(store.find_at(&key, 1_200).len(), 2);
        let live = store.find_at(&key, 1_600);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].value(), b"long");

        assert!(store.find_at(&key, 7_000).is_empty());
        assert!(store.is_empty(), "emptied key is removed");
    }

    #[test]
    fn local_store_delete_drops_empty_keys() {
        let mut store = LocalStore::new();
        let key = Key::digest("k");
        store.store(key, tv(b"a", 0, u64::MAX / 4));
        store.store(key, tv(b"b", 0, u64::MAX / 4));

        assert!(store.delete(&key, b"a"));
        assert!(!store.delete(&key, b"a"));
        assert_eq!(store.len(), 1);
        assert!(store.delete(&key, b"b"));
        assert!(store.is_empty());

        store.store(key, tv(b"c", 0, u64::MAX / 4));
        assert!(store.delete_all(&key));
        assert!(!store.delete_all(&key));
    }

    #[test]
    fn shortlist_keeps_closest_and_skips_failed() {
        let target = Key::ZERO;
        let mut shortlist = Shortlist::new(target, 3);
        for i in 1..=5u8 {
            let mut bytes = [0u8; 20];
            bytes[0] = i;
            shortlist.insert(Node::new(Key::from_bytes(bytes), i as u32));
        }
        let round = shortlist.next_round(2);
        assert_eq!(round.iter().map(|n| n.address).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(shortlist.next_round(5).len(), 1);
        assert!(shortlist.next_round(5).is_empty());

        let failed = round[0].key;
        shortlist.drop_failed(&failed);
        shortlist.insert(round[0].clone());
        let remaining: Vec<u32> = shortlist.into_nodes().iter().map(|n| n.address).collect();
        assert_eq!(remaining, vec![2, 3]);
    }

    #[tokio::test]
    async fn inbound_requests_mark_sender_seen() {
        let registry = Arc::new(NetworkRegistry::default());
        let node = make_node(&registry, 0, test_config()).await;
        let sender = Node::new(Key::random(), 99u32);

        assert!(matches!(node.handle_request(DhtRequest::Ping), DhtResponse::Pong(true)));
        assert!(node.routing_table().is_empty());

        node.handle_find_close_nodes(Key::random(), sender.clone());
        assert_eq!(node.routing_table().len(), 1);
        assert_eq!(node.routing_table().closest(&sender.key, 1), vec![sender]);
    }

    #[tokio::test]
    async fn find_value_falls_back_to_nodes() {
        let registry = Arc::new(NetworkRegistry::default());
        let node = make_node(&registry, 0, test_config()).await;
        let sender = Node::new(Key::random(), 7u32);
        let key = Key::digest("missing");

        match node.handle_find_value(key, false, sender.clone()) {
            FindValueReply::Nodes(nodes) => assert_eq!(nodes, vec![sender.clone()]),
            other => panic!("unexpected reply: {other:?}"),
        }

        node.handle_store(key, b"one".to_vec(), sender.clone()).expect("store");
        node.handle_store(key, b"two".to_vec(), sender.clone()).expect("store");
        assert!(matches!(node.handle_find_value(key, false, sender.clone()), FindValueReply::Value(_)));
        match node.handle_find_value(key, true, sender) {
            FindValueReply::Values(mut values) => {
                values.sort();
                assert_eq!(values, vec![b"one".to_vec(), b"two".to_vec()]);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn find_close_nodes_answers_sorted_by_distance() {
        let registry = Arc::new(NetworkRegistry::default());
        let node = make_node(&registry, 0, test_config()).await;
        for i in 0..60 {
            node.routing_table().seen_node(Node::new(Key::random(), 100 + i));
        }
        let near = Key::random();
        let answer = node.handle_find_close_nodes(near, Node::new(Key::random(), 1));
        assert_eq!(answer.len(), 20);
        for pair in answer.windows(2) {
            assert!(near.dist(&pair[0].key) < near.dist(&pair[1].key));
        }
    }

    #[tokio::test]
    async fn oversized_values_are_rejected() {
        let registry = Arc::new(NetworkRegistry::default());
        let node = make_node(&registry, 0, test_config()).await;
        let response = node.handle_request(DhtRequest::Store {
            key: Key::random(),
            value: vec![0; MAX_VALUE_SIZE + 1],
            from: Node::new(Key::random(), 1),
        });
        assert!(matches!(response, DhtResponse::Error { .. }));
        assert!(!node.has_values());
        assert!(node.iterative_store_value(Key::random(), vec![0; MAX_VALUE_SIZE + 1]).await.is_err());
    }

    #[tokio::test]
    async fn lookup_finds_closest_nodes_in_chain() {
        let (_registry, nodes) = make_chain(12, test_config()).await;
        let target = nodes[7].key();
        let found = nodes[0].iterative_node_lookup(target).await.expect("lookup");
        assert_eq!(found.first().map(|n| n.key), Some(target));
        for pair in found.windows(2) {
            assert!(target.dist(&pair[0].key) < target.dist(&pair[1].key));
        }
        assert!(found.iter().all(|n| n.key != nodes[0].key()));
    }

    #[tokio::test]
    async fn store_then_find_from_other_nodes() {
        let (_registry, nodes) = make_chain(10, test_config()).await;
        let key = Key::digest("greeting");

        let acked = nodes[0]
            .iterative_store_value(key, b"hello".to_vec())
            .await
            .expect("store");
        assert!(acked > 0);

        for node in &nodes[1..] {
            let found = node.iterative_find_value(key, false).await.expect("find");
            assert_eq!(found, ValueLookup::Value(b"hello".to_vec()));
        }

        let missing = nodes[3]
            .iterative_find_value(Key::digest("never stored"), false)
            .await
            .expect("find");
        assert_eq!(missing, ValueLookup::NotFound);
    }

    #[tokio::test]
    async fn delete_operations_remove_values() {
        let (_registry, nodes) = make_chain(8, test_config()).await;
        let key = Key::digest("doomed");
        nodes[0].iterative_store_value(key, b"a".to_vec()).await.expect("store");
        nodes[0].iterative_store_value(key, b"b".to_vec()).await.expect("store");

        let found = nodes[5].iterative_find_value(key, true).await.expect("find");
        let mut values = found.into_values();
        values.sort();
        assert_eq!(values, vec![b"a".to_vec(), b"b".to_vec()]);

        // The storing node holds no copy itself, so it can clear every replica.
        nodes[0].iterative_delete_value(key, b"a".to_vec()).await.expect("delete");
        let found = nodes[5].iterative_find_value(key, true).await.expect("find");
        assert_eq!(found, ValueLookup::Values(vec![b"b".to_vec()]));

        nodes[0].iterative_delete_all(key).await.expect("delete all");
        let found = nodes[6].iterative_find_value(key, false).await.expect("find");
        assert_eq!(found, ValueLookup::NotFound);
        assert!(nodes.iter().all(|n| n.local_values(&key).is_empty()));
    }

    #[tokio::test(start_paused = true)]
    async fn lookups_respect_alpha_concurrency() {
        let config = DhtConfig {
            alpha: 3,
            ..test_config()
        };
        let (registry, nodes) = make_chain(16, config).await;
        registry.set_latency(Duration::from_millis(10)).await;
        registry.reset_counters();

        nodes[15].iterative_node_lookup(Key::random()).await.expect("lookup");

        assert!(registry.calls.load(Ordering::SeqCst) > 0);
        assert!(registry.max_in_flight.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn first_value_returns_while_slow_peer_is_pending() {
        let registry = Arc::new(NetworkRegistry::default());
        let querier = make_node(&registry, 0, test_config()).await;
        let slow = make_node(&registry, 1, test_config()).await;
        let holder = make_node(&registry, 2, test_config()).await;
        registry.set_peer_latency(1, Duration::from_secs(10)).await;

        let key = Key::digest("fast answer");
        holder
            .handle_store(key, b"here".to_vec(), querier.contact())
            .expect("store");
        querier.routing_table().seen_node(slow.contact());
        querier.routing_table().seen_node(holder.contact());

        let started = Instant::now();
        let found = querier.iterative_find_value(key, false).await.expect("find");
        assert_eq!(found, ValueLookup::Value(b"here".to_vec()));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(registry.calls.load(Ordering::SeqCst), 2);
        assert!(slow.routing_table().is_empty(), "slow call was cut short");
    }

    #[tokio::test]
    async fn failing_peers_are_dropped_from_results() {
        let (registry, nodes) = make_chain(10, test_config()).await;
        let dead = nodes[4].contact();
        registry.set_failure(dead.address, true).await;

        let found = nodes[0].iterative_node_lookup(dead.key).await.expect("lookup");
        assert!(!found.contains(&dead));
        assert!(!found.is_empty());
    }

    #[tokio::test]
    async fn lookup_without_peers_returns_empty() {
        let registry = Arc::new(NetworkRegistry::default());
        let node = make_node(&registry, 0, test_config()).await;
        assert!(node.iterative_node_lookup(Key::random()).await.expect("lookup").is_empty());
        assert_eq!(
            node.iterative_find_value(Key::random(), false).await.expect("find"),
            ValueLookup::NotFound
        );
    }

    #[tokio::test(start_paused = true)]
    async fn lookup_deadline_returns_partial_results() {
        let config = DhtConfig {
            lookup_timeout: Duration::from_millis(50),
            ..test_config()
        };
        let (registry, nodes) = make_chain(6, config).await;
        registry.set_latency(Duration::from_secs(10)).await;

        let started = Instant::now();
        let found = nodes[5].iterative_node_lookup(Key::random()).await.expect("lookup");
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!found.is_empty(), "seeded candidates are returned");

        let value = nodes[5].iterative_find_value(Key::random(), false).await.expect("find");
        assert_eq!(value, ValueLookup::NotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_aborts_lookups() {
        let (registry, nodes) = make_chain(6, test_config()).await;
        registry.set_latency(Duration::from_secs(5)).await;

        let node = nodes[5].clone();
        let lookup = tokio::spawn(async move { node.iterative_node_lookup(Key::random()).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        nodes[5].shutdown();

        let result = lookup.await.expect("task joins");
        assert!(result.is_err());
        assert!(nodes[5].is_shut_down());
        assert!(nodes[5].iterative_node_lookup(Key::random()).await.is_err());
    }

    #[tokio::test]
    async fn join_through_self_is_rejected() {
        let registry = Arc::new(NetworkRegistry::default());
        let node = make_node(&registry, 0, test_config()).await;
        assert!(node.join(node.contact()).await.is_err());
    }

    #[tokio::test]
    async fn join_populates_routing_tables() {
        let (_registry, nodes) = make_chain(8, test_config()).await;
        for node in &nodes {
            assert!(node.routing_table().len() >= 1, "{node}");
        }
        assert!(nodes[7].routing_table().len() >= 5);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_visits_stale_buckets_only() {
        let (_registry, nodes) = make_chain(5, test_config()).await;
        let node = &nodes[4];
        let refresh = node.config().bucket_refresh;

        let stale_before = node.routing_table().stale_buckets(refresh).len();
        assert_eq!(node.refresh().await.expect("refresh"), stale_before);

        tokio::time::advance(refresh + Duration::from_secs(1)).await;
        assert_eq!(node.refresh().await.expect("refresh"), BIT_LENGTH);
    }

    #[tokio::test(start_paused = true)]
    async fn maintenance_stops_on_shutdown() {
        let config = DhtConfig {
            refresh_interval: Duration::from_secs(60),
            ..test_config()
        };
        let (_registry, nodes) = make_chain(3, config).await;
        let handle = nodes[2].spawn_maintenance();

        tokio::time::sleep(Duration::from_secs(130)).await;
        assert!(!handle.is_finished());

        nodes[2].shutdown();
        handle.await.expect("maintenance exits cleanly");
    }

    #[tokio::test(start_paused = true)]
    async fn maintenance_ends_once_node_is_dropped() {
        let config = DhtConfig {
            refresh_interval: Duration::from_secs(60),
            ..test_config()
        };
        let network = TestNetwork {
            registry: Arc::new(NetworkRegistry::default()),
        };
        let node = DhtNode::new(9, network, config);
        let handle = node.spawn_maintenance();

        tokio::time::sleep(Duration::from_secs(130)).await;
        assert!(!handle.is_finished());

        drop(node);
        tokio::time::timeout(Duration::from_secs(120), handle)
            .await
            .expect("maintenance exits without shutdown")
            .expect("maintenance task did not panic");
    }

    #[tokio::test]
    async fn exported_state_restores_node() {
        let (registry, nodes) = make_chain(6, test_config()).await;
        let original = &nodes[3];
        let key = Key::digest("persisted");
        original
            .handle_store(key, b"kept".to_vec(), nodes[0].contact())
            .expect("store");

        let bytes = original.export_state().to_bytes().expect("encode");
        let state = DhtState::<u32>::from_bytes(&bytes).expect("decode");
        let network = TestNetwork {
            registry: registry.clone(),
        };
        let restored = DhtNode::restore(state, 3, network, test_config()).expect("restore");

        assert_eq!(restored.key(), original.key());
        assert_eq!(restored.routing_table().len(), original.routing_table().len());
        assert_eq!(restored.local_values(&key), vec![b"kept".to_vec()]);
        let probe = Key::random();
        assert_eq!(
            restored.routing_table().closest(&probe, 20),
            original.routing_table().closest(&probe, 20)
        );
    }
}
