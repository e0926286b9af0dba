//! # Wire Protocol Messages
//!
//! Serializable request and response types for the DHT protocol, plus the
//! bincode codec used to move them between peers.
//!
//! | Request | Response |
//! |---------|----------|
//! | `Ping` | `Pong(true)` |
//! | `Store` / `Delete` / `DeleteAll` | `Ack` |
//! | `FindCloseNodes` | `Nodes` |
//! | `FindValue` | `Value(FindValueReply)` |
//!
//! Every request except `Ping` carries the sender's [`Node`] so the receiver
//! can mark it as seen.
//!
//! ## Security Limits
//!
//! - `MAX_VALUE_SIZE`: maximum size of a stored value (1 MiB)
//! - `MAX_DESERIALIZE_SIZE`: maximum deserialization buffer
//! - all decoding goes through [`decode_bounded`]

use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::key::Key;
use crate::node::Node;

/// Maximum size of a stored value (1 MiB).
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;

/// Maximum buffer size for deserialization, leaving room for framing.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_VALUE_SIZE as u64) * 4;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

/// Deserialize with size bounds enforced.
pub fn decode_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    // `with_limit` does not cap slice decodes.
    if bytes.len() as u64 > MAX_DESERIALIZE_SIZE {
        return Err(Box::new(bincode::ErrorKind::SizeLimit));
    }
    bincode_options().deserialize(bytes)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DhtRequest<A> {
    Ping,
    Store {
        key: Key,
        value: Vec<u8>,
        from: Node<A>,
    },
    Delete {
        key: Key,
        value: Vec<u8>,
        from: Node<A>,
    },
    DeleteAll {
        key: Key,
        from: Node<A>,
    },
    FindCloseNodes {
        near: Key,
        from: Node<A>,
    },
    FindValue {
        key: Key,
        multiple: bool,
        from: Node<A>,
    },
}

impl<A> DhtRequest<A> {
    pub fn sender(&self) -> Option<&Node<A>> {
        match self {
            DhtRequest::Ping => None,
            DhtRequest::Store { from, .. }
            | DhtRequest::Delete { from, .. }
            | DhtRequest::DeleteAll { from, .. }
            | DhtRequest::FindCloseNodes { from, .. }
            | DhtRequest::FindValue { from, .. } => Some(from),
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            DhtRequest::Ping => "ping",
            DhtRequest::Store { .. } => "store",
            DhtRequest::Delete { .. } => "delete",
            DhtRequest::DeleteAll { .. } => "deleteAll",
            DhtRequest::FindCloseNodes { .. } => "find_close_nodes",
            DhtRequest::FindValue { .. } => "find_value",
        }
    }
}

/// Answer to a `find_value` request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FindValueReply<A> {
    /// One stored value (`multiple == false`).
    Value(Vec<u8>),
    /// Every live value, newest first (`multiple == true`).
    Values(Vec<Vec<u8>>),
    /// No live value here; the closest nodes this peer knows instead.
    Nodes(Vec<Node<A>>),
}

impl<A> FindValueReply<A> {
    pub fn has_value(&self) -> bool {
        !matches!(self, FindValueReply::Nodes(_))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DhtResponse<A> {
    Pong(bool),
    Ack,
    Nodes(Vec<Node<A>>),
    Value(FindValueReply<A>),
    Error { message: String },
}
