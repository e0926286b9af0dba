//! # Loopback Transport
//!
//! An in-process [`DhtRpc`] implementation. Nodes register with a shared
//! [`LoopbackRegistry`] under `loop://N` addresses; calls are encoded with
//! the wire codec, delivered to the target's
//! [`handle_request`](DhtNode::handle_request) and decoded again, so the
//! whole request/response path is exercised without sockets.
//!
//! The caller owns the call timeout. Fault injection:
//!
//! | Fault | Effect |
//! |-------|--------|
//! | unreachable | the call never answers and hits the timeout |
//! | latency | the call is delayed before delivery |
//! | unknown address | the call fails immediately |

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{trace, warn};

use crate::config::DhtConfig;
use crate::dht::{DhtNode, DhtState};
use crate::key::Key;
use crate::messages::{DhtRequest, DhtResponse, FindValueReply, decode_bounded, encode};
use crate::node::Node;
use crate::protocols::DhtRpc;

/// Default per-call timeout for loopback calls.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

pub type LoopbackNode = DhtNode<LoopbackNetwork>;

pub struct LoopbackRegistry {
    peers: RwLock<HashMap<String, LoopbackNode>>,
    unreachable: RwLock<HashSet<String>>,
    latency: RwLock<HashMap<String, Duration>>,
    next_id: AtomicUsize,
    call_timeout: Duration,
}

impl LoopbackRegistry {
    pub fn new(call_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            peers: RwLock::new(HashMap::new()),
            unreachable: RwLock::new(HashSet::new()),
            latency: RwLock::new(HashMap::new()),
            next_id: AtomicUsize::new(0),
            call_timeout,
        })
    }

    fn next_address(&self) -> String {
        format!("loop://{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn network(self: &Arc<Self>, max_nodes: usize) -> LoopbackNetwork {
        LoopbackNetwork {
            registry: Arc::downgrade(self),
            call_timeout: self.call_timeout,
            max_nodes,
        }
    }

    /// Create and register a node with a random key.
    pub async fn spawn_node(self: &Arc<Self>, config: DhtConfig) -> LoopbackNode {
        self.spawn_node_with_key(Key::random(), config).await
    }

    pub async fn spawn_node_with_key(self: &Arc<Self>, key: Key, config: DhtConfig) -> LoopbackNode {
        let address = self.next_address();
        let network = self.network(config.k);
        let node = DhtNode::with_key(key, address, network, config);
        self.register(node.clone()).await;
        node
    }

    /// Rebuild a node from exported state and register it under `address`,
    /// replacing whatever was registered there.
    pub async fn restore_node(
        self: &Arc<Self>,
        address: String,
        state: DhtState<String>,
        config: DhtConfig,
    ) -> Result<LoopbackNode> {
        let network = self.network(config.k);
        let node = DhtNode::restore(state, address, network, config)?;
        self.register(node.clone()).await;
        Ok(node)
    }

    pub async fn register(&self, node: LoopbackNode) {
        let address = node.contact().address;
        trace!(address = %address, key = %node.key(), "registering loopback node");
        self.peers.write().await.insert(address, node);
    }

    pub async fn remove(&self, address: &str) -> Option<LoopbackNode> {
        self.peers.write().await.remove(address)
    }

    pub async fn node(&self, address: &str) -> Option<LoopbackNode> {
        self.peers.read().await.get(address).cloned()
    }

    pub async fn nodes(&self) -> Vec<LoopbackNode> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    pub async fn set_unreachable(&self, address: &str, unreachable: bool) {
        let mut set = self.unreachable.write().await;
        if unreachable {
            set.insert(address.to_string());
        } else {
            set.remove(address);
        }
    }

    pub async fn set_latency(&self, address: &str, latency: Duration) {
        self.latency.write().await.insert(address.to_string(), latency);
    }

    /// Shut down every registered node.
    pub async fn shutdown_all(&self) {
        for node in self.peers.read().await.values() {
            node.shutdown();
        }
    }

    async fn deliver(&self, to: &str, request: Vec<u8>) -> Result<Vec<u8>> {
        if self.unreachable.read().await.contains(to) {
            trace!(to, "dropping request to unreachable peer");
            std::future::pending::<()>().await;
        }
        let delay = self.latency.read().await.get(to).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let node = self
            .node(to)
            .await
            .ok_or_else(|| anyhow!("no peer at {to}"))?;
        let request: DhtRequest<String> =
            decode_bounded(&request).context("failed to decode request")?;
        let response = node.handle_request(request);
        encode(&response).context("failed to encode response")
    }
}

/// Per-node handle onto a [`LoopbackRegistry`].
pub struct LoopbackNetwork {
    registry: Weak<LoopbackRegistry>,
    call_timeout: Duration,
    max_nodes: usize,
}

impl LoopbackNetwork {
    async fn call(&self, to: &Node<String>, request: DhtRequest<String>) -> Result<DhtResponse<String>> {
        let registry = self
            .registry
            .upgrade()
            .ok_or_else(|| anyhow!("loopback registry dropped"))?;
        let method = request.method();
        let bytes = encode(&request).context("failed to encode request")?;

        let reply = tokio::time::timeout(self.call_timeout, registry.deliver(&to.address, bytes))
            .await
            .map_err(|_| anyhow!("{method} to {} timed out", to.address))??;

        match decode_bounded(&reply).context("failed to decode response")? {
            DhtResponse::Error { message } => bail!("{} rejected {method}: {message}", to.address),
            response => Ok(response),
        }
    }

    fn truncate(&self, to: &Node<String>, mut nodes: Vec<Node<String>>) -> Vec<Node<String>> {
        if nodes.len() > self.max_nodes {
            warn!(
                from = %to.address,
                returned = nodes.len(),
                max = self.max_nodes,
                "peer returned too many nodes, truncating"
            );
            nodes.truncate(self.max_nodes);
        }
        nodes
    }

    async fn expect_ack(&self, to: &Node<String>, request: DhtRequest<String>) -> Result<()> {
        let method = request.method();
        match self.call(to, request).await? {
            DhtResponse::Ack => Ok(()),
            other => bail!("unexpected {method} response from {}: {other:?}", to.address),
        }
    }
}

#[async_trait]
impl DhtRpc for LoopbackNetwork {
    type Address = String;

    async fn ping(&self, to: &Node<String>) -> Result<bool> {
        match self.call(to, DhtRequest::Ping).await? {
            DhtResponse::Pong(alive) => Ok(alive),
            other => bail!("unexpected ping response from {}: {other:?}", to.address),
        }
    }

    async fn find_close_nodes(
        &self,
        to: &Node<String>,
        near: Key,
        from: &Node<String>,
    ) -> Result<Vec<Node<String>>> {
        let request = DhtRequest::FindCloseNodes {
            near,
            from: from.clone(),
        };
        match self.call(to, request).await? {
            DhtResponse::Nodes(nodes) => Ok(self.truncate(to, nodes)),
            other => bail!("unexpected find_close_nodes response from {}: {other:?}", to.address),
        }
    }

    async fn find_value(
        &self,
        to: &Node<String>,
        key: Key,
        multiple: bool,
        from: &Node<String>,
    ) -> Result<FindValueReply<String>> {
        let request = DhtRequest::FindValue {
            key,
            multiple,
            from: from.clone(),
        };
        match self.call(to, request).await? {
            DhtResponse::Value(FindValueReply::Nodes(nodes)) => {
                Ok(FindValueReply::Nodes(self.truncate(to, nodes)))
            }
            DhtResponse::Value(reply) => Ok(reply),
            other => bail!("unexpected find_value response from {}: {other:?}", to.address),
        }
    }

    async fn store(&self, to: &Node<String>, key: Key, value: Vec<u8>, from: &Node<String>) -> Result<()> {
        let request = DhtRequest::Store {
            key,
            value,
            from: from.clone(),
        };
        self.expect_ack(to, request).await
    }

    async fn delete(&self, to: &Node<String>, key: Key, value: Vec<u8>, from: &Node<String>) -> Result<()> {
        let request = DhtRequest::Delete {
            key,
            value,
            from: from.clone(),
        };
        self.expect_ack(to, request).await
    }

    async fn delete_all(&self, to: &Node<String>, key: Key, from: &Node<String>) -> Result<()> {
        let request = DhtRequest::DeleteAll {
            key,
            from: from.clone(),
        };
        self.expect_ack(to, request).await
    }
}
