//! # Keys and the XOR Metric
//!
//! A [`Key`] is a 160-bit identifier shared by nodes and stored values. Keys
//! are compared under the Kademlia XOR metric: the distance between two keys is
//! their bitwise exclusive-or, itself a key.
//!
//! ## Bit Layout
//!
//! Bit `i` lives in bit `i % 8` of byte `i / 8`, so byte 0 holds the least
//! significant bits. A SHA-1 digest is stored in digest order, which keeps the
//! hex form of [`Key::digest`] identical to the usual digest hex.
//!
//! ## Rank
//!
//! The rank of a key is the 1-based index of its highest set bit (0 for the
//! zero key). The rank of `dist(self, other)` selects the routing bucket for
//! `other`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Number of bits in a key.
pub const BIT_LENGTH: usize = 160;

/// Number of bytes in a key.
pub const KEY_BYTES: usize = BIT_LENGTH / 8;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Key([u8; KEY_BYTES]);

impl Key {
    /// The all-zero key: distance from any key to itself.
    pub const ZERO: Key = Key([0u8; KEY_BYTES]);

    #[inline]
    pub fn from_bytes(bytes: [u8; KEY_BYTES]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; KEY_BYTES] {
        &self.0
    }

    /// Parse a hex string of 1 to 20 bytes. Short strings fill the low bytes.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.is_empty() || bytes.len() > KEY_BYTES {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; KEY_BYTES];
        arr[..bytes.len()].copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Upper-case hex of all 20 bytes.
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }

    /// SHA-1 of the UTF-8 bytes of `s`.
    pub fn digest(s: &str) -> Self {
        Self(sha1_smol::Sha1::from(s).digest().bytes())
    }

    /// Keys named by strings are their digest.
    pub fn from_string(s: &str) -> Self {
        Self::digest(s)
    }

    /// A uniformly random key.
    pub fn random() -> Self {
        let mut bytes = [0u8; KEY_BYTES];
        rand::thread_rng().fill(&mut bytes);
        Self(bytes)
    }

    /// A random key whose rank is exactly `rank`.
    ///
    /// Ranks above [`BIT_LENGTH`] are clamped; rank 0 yields [`Key::ZERO`].
    pub fn random_with_rank(rank: usize) -> Self {
        let rank = if rank > BIT_LENGTH {
            warn!(rank, max = BIT_LENGTH, "requested key rank too high, clamping");
            BIT_LENGTH
        } else {
            rank
        };
        if rank == 0 {
            return Self::ZERO;
        }

        let top = rank - 1;
        let byte_idx = top / 8;
        let bit_pos = top % 8;

        let mut bytes = Self::random().0;
        bytes[byte_idx] &= 0xFFu8 >> (7 - bit_pos);
        bytes[byte_idx] |= 1u8 << bit_pos;
        for byte in bytes.iter_mut().skip(byte_idx + 1) {
            *byte = 0;
        }
        Self(bytes)
    }

    /// XOR distance to `other`.
    #[inline]
    pub fn dist(&self, other: &Key) -> Key {
        let mut out = [0u8; KEY_BYTES];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Key(out)
    }

    /// 1-based index of the highest set bit, 0 for the zero key.
    pub fn rank(&self) -> usize {
        for (idx, byte) in self.0.iter().enumerate().rev() {
            if *byte != 0 {
                return idx * 8 + (8 - byte.leading_zeros() as usize);
            }
        }
        0
    }

    /// Whether bit `index` (0 = least significant) is set.
    #[inline]
    pub fn bit(&self, index: usize) -> bool {
        index < BIT_LENGTH && self.0[index / 8] & (1u8 << (index % 8)) != 0
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

/// Rank first; between equal ranks, the key holding the highest differing bit
/// is the greater one. Shortlists and distance maps are ordered by this.
impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        if self == other {
            return Ordering::Equal;
        }
        match self.rank().cmp(&other.rank()) {
            Ordering::Equal => {}
            unequal => return unequal,
        }
        let index = self.dist(other).rank() - 1;
        if self.bit(index) {
            Ordering::Greater
        } else {
            Ordering::Less
        }
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", &self.to_hex()[..16])
    }
}

impl FromStr for Key {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}
