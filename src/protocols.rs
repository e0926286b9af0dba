//! The outbound RPC capability the DHT core is built on.
//!
//! The core never opens sockets. It is handed a [`DhtRpc`] implementation
//! and calls peers through it. Implementations own transport, encoding and
//! call timeouts: every call must eventually resolve to `Ok` or `Err`, so a
//! peer that never answers has to surface as an error rather than a hang.

use anyhow::Result;
use async_trait::async_trait;

use crate::key::Key;
use crate::messages::FindValueReply;
use crate::node::{Address, Node};

/// DHT operations issued to a remote peer.
#[async_trait]
pub trait DhtRpc: Send + Sync + 'static {
    /// Locator type understood by this transport.
    type Address: Address;

    /// Liveness check. Returns the peer's `ping` answer.
    async fn ping(&self, to: &Node<Self::Address>) -> Result<bool>;

    /// Ask `to` for the nodes it knows closest to `near`.
    async fn find_close_nodes(
        &self,
        to: &Node<Self::Address>,
        near: Key,
        from: &Node<Self::Address>,
    ) -> Result<Vec<Node<Self::Address>>>;

    /// Ask `to` for the value(s) stored under `key`, or closer nodes.
    async fn find_value(
        &self,
        to: &Node<Self::Address>,
        key: Key,
        multiple: bool,
        from: &Node<Self::Address>,
    ) -> Result<FindValueReply<Self::Address>>;

    async fn store(
        &self,
        to: &Node<Self::Address>,
        key: Key,
        value: Vec<u8>,
        from: &Node<Self::Address>,
    ) -> Result<()>;

    async fn delete(
        &self,
        to: &Node<Self::Address>,
        key: Key,
        value: Vec<u8>,
        from: &Node<Self::Address>,
    ) -> Result<()>;

    async fn delete_all(&self, to: &Node<Self::Address>, key: Key, from: &Node<Self::Address>) -> Result<()>;
}
