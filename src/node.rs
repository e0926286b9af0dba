//! Routing entries: a [`Key`] paired with an opaque network locator.
//!
//! The DHT never looks inside an address. Anything that can be cloned,
//! compared, hashed, logged and put on the wire qualifies; the concrete type
//! is chosen by the [`DhtRpc`](crate::DhtRpc) implementation.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::key::Key;

/// Opaque locator for a peer.
pub trait Address:
    Clone + Eq + Hash + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

impl<T> Address for T where
    T: Clone + Eq + Hash + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

/// A peer as seen by the routing table. Identity is the key alone; two nodes
/// with the same key but different addresses are the same node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node<A> {
    pub key: Key,
    pub address: A,
}

impl<A> Node<A> {
    pub fn new(key: Key, address: A) -> Self {
        Self { key, address }
    }
}

impl<A> PartialEq for Node<A> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<A> Eq for Node<A> {}

impl<A> Hash for Node<A> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl<A: fmt::Debug> fmt::Display for Node<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:?}", self.key, self.address)
    }
}
