//! Sequence numbers
//!
//! - `CollectorSeq`: position of an item in a store's fetch queue
//! - `SenderFilterIndex`: position in the chain of filters sent to peers

use serde::{Deserialize, Serialize};
use std::fmt;

/// Monotonic position marker in the local fetch queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectorSeq(pub u64);

impl CollectorSeq {
    pub fn next(self) -> Self {
        CollectorSeq(self.0 + 1)
    }
}

impl fmt::Display for CollectorSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cs{}", self.0)
    }
}

/// Index into the chain of sender filters of a store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SenderFilterIndex(pub u64);

impl SenderFilterIndex {
    /// The first segment. Never merged away.
    pub const BASE: SenderFilterIndex = SenderFilterIndex(0);

    pub fn next(self) -> Self {
        SenderFilterIndex(self.0 + 1)
    }

    pub fn is_base(self) -> bool {
        self == Self::BASE
    }

    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn from_be_bytes(bytes: [u8; 8]) -> Self {
        SenderFilterIndex(u64::from_be_bytes(bytes))
    }
}

impl fmt::Display for SenderFilterIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sf{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_seq_ordering() {
        assert!(CollectorSeq(1) < CollectorSeq(2));
        assert_eq!(CollectorSeq(1).next(), CollectorSeq(2));
    }

    #[test]
    fn test_base_is_smallest_index() {
        assert!(SenderFilterIndex::BASE.is_base());
        assert!(SenderFilterIndex::BASE < SenderFilterIndex::BASE.next());
        let idx = SenderFilterIndex(258);
        assert_eq!(SenderFilterIndex::from_be_bytes(idx.to_be_bytes()), idx);
    }
}
