//! Protocol constants and tunables.
//!
//! Value expiry and bucket staleness carry a small random jitter drawn once
//! per process, so nodes started together do not expire values or refresh
//! buckets in lockstep.

use std::sync::OnceLock;
use std::time::Duration;

use rand::Rng;

/// Bucket capacity and replication factor.
pub const K: usize = 20;

/// Maximum outstanding requests per lookup round.
pub const ALPHA: usize = 5;

/// Base lifetime of a stored value (24 hours).
pub const BASE_EXPIRATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Base age after which a bucket counts as stale (1 hour).
pub const BASE_REFRESH: Duration = Duration::from_secs(60 * 60);

/// Default bound on the duration of a single iterative lookup.
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound (exclusive) of the per-process jitter.
const MAX_JITTER_MS: u64 = 1_000;

fn jitter(cell: &'static OnceLock<Duration>) -> Duration {
    *cell.get_or_init(|| Duration::from_millis(rand::thread_rng().gen_range(0..MAX_JITTER_MS)))
}

/// Value lifetime for this process: 24h plus up to a second.
pub fn expiration() -> Duration {
    static JITTER: OnceLock<Duration> = OnceLock::new();
    BASE_EXPIRATION + jitter(&JITTER)
}

/// Bucket staleness threshold for this process: 1h minus up to a second.
pub fn refresh() -> Duration {
    static JITTER: OnceLock<Duration> = OnceLock::new();
    BASE_REFRESH - jitter(&JITTER)
}

#[derive(Clone, Debug)]
pub struct DhtConfig {
    /// Bucket capacity; also the shortlist and `find_close_nodes` size.
    pub k: usize,
    /// Concurrent requests per lookup round.
    pub alpha: usize,
    /// Lifetime of values accepted through `store`.
    pub value_expiration: Duration,
    /// Age after which a bucket is refreshed.
    pub bucket_refresh: Duration,
    /// Deadline for one iterative lookup. The lookup returns what it has so far.
    pub lookup_timeout: Duration,
    /// Period of the background refresh task started by `spawn_maintenance`.
    pub refresh_interval: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: K,
            alpha: ALPHA,
            value_expiration: expiration(),
            bucket_refresh: refresh(),
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
            refresh_interval: BASE_REFRESH,
        }
    }
}
