//! Object Bloom filter (BFOID)
//!
//! Fixed-size probabilistic set of object identifiers, exchanged between
//! devices to advertise "objects I may have".
//!
//! INVARIANTS:
//! - No false negatives: once added, `contains()` returns true
//! - A finalized filter is never mutated in place; callers take
//!   `to_mutable()` first (copy-on-union)

use bitvec::prelude::*;
use serde::{Deserialize, Serialize};
use shared_types::Oid;

use super::hash_functions::compute_hash_positions;
use crate::error::CollectorError;

/// Filter size in bits. Identical on every device so filters can be unioned.
pub const FILTER_BITS: usize = 8 * 1024;

/// Number of hash functions.
pub const HASH_COUNT: usize = 4;

/// Bloom filter over object identifiers
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BloomFilter {
    /// Bit array storing the filter state
    #[serde(with = "bitvec_serde")]
    bits: BitVec<u8, Lsb0>,
    /// Set once the filter is shared; mutation afterwards is a bug
    #[serde(skip)]
    finalized: bool,
}

/// Serde support for BitVec
mod bitvec_serde {
    use bitvec::prelude::*;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bits: &BitVec<u8, Lsb0>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let bytes: Vec<u8> = bits.as_raw_slice().to_vec();
        (bytes, bits.len()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BitVec<u8, Lsb0>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let (bytes, len): (Vec<u8>, usize) = Deserialize::deserialize(deserializer)?;
        let mut bits = BitVec::<u8, Lsb0>::from_vec(bytes);
        bits.truncate(len);
        Ok(bits)
    }
}

impl Default for BloomFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for BloomFilter {
    fn eq(&self, other: &Self) -> bool {
        self.bits == other.bits
    }
}

impl Eq for BloomFilter {}

impl BloomFilter {
    /// Create an empty filter
    pub fn new() -> Self {
        Self {
            bits: bitvec![u8, Lsb0; 0; FILTER_BITS],
            finalized: false,
        }
    }

    /// Build a filter holding the given objects
    pub fn from_oids<'a>(oids: impl IntoIterator<Item = &'a Oid>) -> Self {
        let mut filter = Self::new();
        for oid in oids {
            filter.add(oid);
        }
        filter
    }

    /// Insert an object.
    ///
    /// Returns whether any bit changed.
    ///
    /// # Panics
    /// Panics if the filter is finalized.
    pub fn add(&mut self, oid: &Oid) -> bool {
        assert!(!self.finalized, "Cannot add to a finalized filter");

        let mut changed = false;
        for pos in compute_hash_positions(oid, HASH_COUNT, FILTER_BITS) {
            if !self.bits[pos] {
                self.bits.set(pos, true);
                changed = true;
            }
        }
        changed
    }

    /// Test if an object might be in the filter
    ///
    /// Returns:
    /// - `true` if the object might be in the set (could be false positive)
    /// - `false` if the object is definitely NOT in the set
    pub fn contains(&self, oid: &Oid) -> bool {
        compute_hash_positions(oid, HASH_COUNT, FILTER_BITS)
            .iter()
            .all(|&pos| self.bits[pos])
    }

    /// Merge another filter into this one (OR operation)
    ///
    /// Returns true iff this filter's bit-set actually changed.
    ///
    /// # Panics
    /// Panics if this filter is finalized.
    pub fn union(&mut self, other: &BloomFilter) -> bool {
        assert!(!self.finalized, "Cannot union into a finalized filter");

        let mut changed = false;
        let self_raw = self.bits.as_raw_mut_slice();
        let other_raw = other.bits.as_raw_slice();
        for (s, o) in self_raw.iter_mut().zip(other_raw.iter()) {
            let merged = *s | *o;
            if merged != *s {
                *s = merged;
                changed = true;
            }
        }
        changed
    }

    /// True if no bit is set
    pub fn is_empty(&self) -> bool {
        self.bits.not_any()
    }

    /// Number of bits set
    pub fn bits_set(&self) -> usize {
        self.bits.count_ones()
    }

    /// Freeze the filter. Further `add`/`union` calls panic.
    pub fn finalize(&mut self) {
        self.finalized = true;
    }

    /// Consume and return the finalized filter
    pub fn into_finalized(mut self) -> Self {
        self.finalize();
        self
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Mutable copy of this filter, regardless of its finalized state
    pub fn to_mutable(&self) -> Self {
        Self {
            bits: self.bits.clone(),
            finalized: false,
        }
    }

    /// Serialize the filter to bytes (wire and persisted form)
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    /// Deserialize a filter from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CollectorError> {
        let filter: BloomFilter =
            bincode::deserialize(bytes).map_err(|e| CollectorError::InvalidFilter(e.to_string()))?;
        if filter.bits.len() != FILTER_BITS {
            return Err(CollectorError::InvalidFilter(format!(
                "expected {} bits, got {}",
                FILTER_BITS,
                filter.bits.len()
            )));
        }
        Ok(filter)
    }
}
