//! # xorkad - Kademlia Distributed Hash Table
//!
//! xorkad implements the core of a Kademlia-style DHT: the XOR key metric,
//! the k-bucket routing table and the iterative lookup, store and refresh
//! algorithms. Transport is injected through the [`DhtRpc`] trait, so the
//! same node logic runs over any network that can carry its messages.
//!
//! ## Architecture
//!
//! - [`DhtNode`] is a cheap-to-clone handle; clones share one routing table
//!   and value store.
//! - Each routing bucket has its own lock, so inbound handlers and outbound
//!   lookups only contend when they touch the same bucket.
//! - Every iterative lookup runs on its own task with a private shortlist and
//!   at most `alpha` requests in flight.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `key` | 160-bit keys, XOR distance, rank and ordering |
//! | `node` | `(Key, address)` routing entries |
//! | `timed_value` | Stored values with insertion time and TTL |
//! | `config` | Protocol constants and `DhtConfig` |
//! | `routing` | K-buckets and the routing table |
//! | `protocols` | The `DhtRpc` trait implemented by transports |
//! | `messages` | Wire request/response types and codec |
//! | `dht` | `DhtNode`: request handlers and iterative algorithms |
//! | `rpc` | In-process loopback transport |

mod config;
mod dht;
mod key;
mod messages;
mod node;
mod protocols;
mod routing;
mod rpc;
mod timed_value;

pub use config::{ALPHA, BASE_EXPIRATION, BASE_REFRESH, DEFAULT_LOOKUP_TIMEOUT, DhtConfig, K, expiration, refresh};
pub use dht::{DhtNode, DhtState, LocalStore, ValueLookup};
pub use key::{BIT_LENGTH, KEY_BYTES, Key};
pub use messages::{
    DhtRequest, DhtResponse, FindValueReply, MAX_DESERIALIZE_SIZE, MAX_VALUE_SIZE, decode_bounded, encode,
};
pub use node::{Address, Node};
pub use protocols::DhtRpc;
pub use routing::{Bucket, BucketSnapshot, RoutingTable, RoutingTableSnapshot};
pub use rpc::{DEFAULT_CALL_TIMEOUT, LoopbackNetwork, LoopbackNode, LoopbackRegistry};
pub use timed_value::{TimedValue, now_millis};
