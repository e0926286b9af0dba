//! Stored values with an insertion time and an expiration duration.
//!
//! A [`TimedValue`] carries two contracts at once:
//!
//! - equality and hashing look at the payload only, so re-storing identical
//!   content replaces the earlier entry in a value set;
//! - [`TimedValue::cmp_recency`] orders by stored time, newest first.
//!
//! Times are milliseconds since the UNIX epoch. Explicit timestamps are
//! accepted everywhere so simulated clocks can drive expiry.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Current wall-clock time in milliseconds since the UNIX epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimedValue {
    value: Vec<u8>,
    stored_time: u64,
    expiration: u64,
}

impl TimedValue {
    /// A value stored now.
    pub fn new(value: Vec<u8>, expiration: Duration) -> Self {
        Self::with_stored_time(value, now_millis(), expiration)
    }

    pub fn with_stored_time(value: Vec<u8>, stored_time: u64, expiration: Duration) -> Self {
        Self {
            value,
            stored_time,
            expiration: expiration.as_millis() as u64,
        }
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn into_value(self) -> Vec<u8> {
        self.value
    }

    pub fn stored_time(&self) -> u64 {
        self.stored_time
    }

    pub fn expiration_duration(&self) -> Duration {
        Duration::from_millis(self.expiration)
    }

    /// Replace the payload and reset the stored time to now.
    pub fn store(&mut self, value: Vec<u8>) {
        self.store_at(value, now_millis());
    }

    pub fn store_at(&mut self, value: Vec<u8>, stored_time: u64) {
        self.value = value;
        self.stored_time = stored_time;
    }

    /// Milliseconds until expiry; zero or negative once expired.
    pub fn ttl(&self) -> i64 {
        self.ttl_at(now_millis())
    }

    pub fn ttl_at(&self, now: u64) -> i64 {
        (self.stored_time as i64)
            .saturating_add(self.expiration as i64)
            .saturating_sub(now as i64)
    }

    pub fn is_expired_at(&self, now: u64) -> bool {
        self.ttl_at(now) <= 0
    }

    /// Newest first.
    pub fn cmp_recency(&self, other: &Self) -> Ordering {
        other.stored_time.cmp(&self.stored_time)
    }
}

impl PartialEq for TimedValue {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for TimedValue {}

impl Hash for TimedValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}
