#![forbid(unsafe_code)]

//! Identifier space of the Lattice DHT.
//!
//! Node identities and data keys share one 20-byte address space. Closeness
//! between addresses is the Kademlia XOR metric: `distance(a, b) = a ^ b`,
//! compared as an unsigned big-endian integer.

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Length of a DHT address in bytes.
pub const DHT_ADDRESS_LENGTH: usize = 20;

/// A fixed-length identifier for a node or a stored entry's primary key.
///
/// Immutable once created; freely copyable value type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct DhtAddress([u8; DHT_ADDRESS_LENGTH]);

impl DhtAddress {
    pub const fn new(raw: [u8; DHT_ADDRESS_LENGTH]) -> Self {
        Self(raw)
    }

    /// Generate a uniformly random address.
    pub fn random() -> Self {
        let mut raw = [0u8; DHT_ADDRESS_LENGTH];
        rand::thread_rng().fill_bytes(&mut raw);
        Self(raw)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; DHT_ADDRESS_LENGTH] {
        &self.0
    }

    /// XOR distance between `self` and `other`.
    #[must_use]
    pub fn distance_to(&self, other: &DhtAddress) -> Distance {
        let mut raw = [0u8; DHT_ADDRESS_LENGTH];
        for (i, byte) in raw.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(raw)
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse an address from its hex form. The input must encode exactly
    /// [`DHT_ADDRESS_LENGTH`] bytes.
    pub fn from_hex(s: &str) -> Result<Self, crate::DhtError> {
        let bytes = hex::decode(s)
            .map_err(|e| crate::DhtError::InvalidAddress(format!("bad hex: {e}")))?;
        let raw: [u8; DHT_ADDRESS_LENGTH] = bytes.try_into().map_err(|v: Vec<u8>| {
            crate::DhtError::InvalidAddress(format!("expected {DHT_ADDRESS_LENGTH} bytes, got {}", v.len()))
        })?;
        Ok(Self(raw))
    }
}

impl fmt::Debug for DhtAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Display for DhtAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; DHT_ADDRESS_LENGTH]> for DhtAddress {
    fn from(raw: [u8; DHT_ADDRESS_LENGTH]) -> Self {
        Self(raw)
    }
}

/// XOR distance between two addresses.
///
/// Ordering is numeric on the big-endian value, which is exactly the derived
/// lexicographic byte order. For a fixed reference address the mapping from
/// peer address to distance is a bijection, so distances of distinct peers
/// never tie.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Distance([u8; DHT_ADDRESS_LENGTH]);

impl Distance {
    pub const ZERO: Distance = Distance([0u8; DHT_ADDRESS_LENGTH]);
    pub const MAX: Distance = Distance([0xff; DHT_ADDRESS_LENGTH]);

    /// Number of leading zero bits; the shared-prefix length used to select
    /// a routing-table bucket.
    #[must_use]
    pub fn leading_zeros(&self) -> usize {
        let mut ret = 0;
        for byte in &self.0 {
            if *byte == 0 {
                ret += 8;
            } else {
                return ret + byte.leading_zeros() as usize;
            }
        }
        ret
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}
