//! Hash functions for object Bloom filters
//!
//! Uses MurmurHash3 with two seeds and double hashing to derive the bit
//! positions of an object identifier.

use std::io::Cursor;

use shared_types::Oid;

/// Hash bytes with MurmurHash3 (x64, 128-bit) and keep the lower 64 bits.
pub fn murmur_hash(element: &[u8], seed: u32) -> u64 {
    let mut cursor = Cursor::new(element);
    // Reading from an in-memory cursor cannot fail
    let hash = murmur3::murmur3_x64_128(&mut cursor, seed).unwrap_or(0);
    hash as u64
}

/// Compute `k` bit positions in a filter of `m` bits for an object.
///
/// Double hashing: h(i) = h1 + i * h2. Positions depend only on the OID, so
/// filters built on different devices agree bit for bit.
pub fn compute_hash_positions(oid: &Oid, k: usize, m: usize) -> Vec<usize> {
    let h1 = murmur_hash(oid.as_bytes(), 0);
    let h2 = murmur_hash(oid.as_bytes(), 1);

    (0..k)
        .map(|i| {
            let hash = h1.wrapping_add((i as u64).wrapping_mul(h2));
            (hash % m as u64) as usize
        })
        .collect()
}
