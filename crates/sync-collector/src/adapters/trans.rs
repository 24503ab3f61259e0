//! Transactions
//!
//! A `Trans` buffers row writes and the in-memory cache changes that must
//! follow them. `FilterDb::commit` applies the writes as one atomic batch
//! and hands back the cache effects; the owners apply them only then.
//! Dropping (or aborting) a `Trans` discards both, so caches never observe
//! an aborted mutation and no undo step is needed.

use std::collections::BTreeMap;

use shared_types::{Did, Sindex};
use tracing::debug;

use crate::domain::{BloomFilter, SenderFilterIndex};
use crate::ports::BatchOperation;

/// In-memory cache change to apply once the owning transaction commits.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEffect {
    /// Persisted filter of a loaded device changed (`None`: row deleted).
    CollectorDbFilter {
        sidx: Sindex,
        did: Did,
        filter: Option<BloomFilter>,
    },
    /// A dirty device survived cleanup; its dirty flag is cleared.
    CollectorDirtyCleared { sidx: Sindex, did: Did },
    /// A device announced a filter. The fetcher attaches it or starts an
    /// iteration once the merge is durable.
    FilterAdded {
        sidx: Sindex,
        did: Did,
        filter: BloomFilter,
        device_loaded: bool,
    },
    /// New tail of the sender-filter chain.
    SenderTail {
        sidx: Sindex,
        index: SenderFilterIndex,
        filter: BloomFilter,
    },
}

impl CacheEffect {
    pub fn sidx(&self) -> Sindex {
        match self {
            CacheEffect::CollectorDbFilter { sidx, .. }
            | CacheEffect::CollectorDirtyCleared { sidx, .. }
            | CacheEffect::FilterAdded { sidx, .. }
            | CacheEffect::SenderTail { sidx, .. } => *sidx,
        }
    }
}

/// Pending writes and cache effects of one transaction
#[derive(Debug, Default)]
pub struct Trans {
    /// `None` marks a deletion
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    effects: Vec<CacheEffect>,
}

impl Trans {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.writes.insert(key, Some(value));
    }

    pub(crate) fn delete(&mut self, key: Vec<u8>) {
        self.writes.insert(key, None);
    }

    /// `Some(None)` if the key is staged for deletion, `None` if untouched.
    pub(crate) fn staged(&self, key: &[u8]) -> Option<Option<&[u8]>> {
        self.writes.get(key).map(|v| v.as_deref())
    }

    pub(crate) fn staged_with_prefix<'a>(
        &'a self,
        prefix: &'a [u8],
    ) -> impl Iterator<Item = (&'a Vec<u8>, &'a Option<Vec<u8>>)> + 'a {
        self.writes
            .range(prefix.to_vec()..)
            .take_while(move |(k, _)| k.starts_with(prefix))
    }

    /// Queue a cache change for after commit.
    pub fn stage_effect(&mut self, effect: CacheEffect) {
        self.effects.push(effect);
    }

    /// Number of staged row writes (puts and deletes)
    pub fn write_count(&self) -> usize {
        self.writes.len()
    }

    pub fn effects(&self) -> &[CacheEffect] {
        &self.effects
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.effects.is_empty()
    }

    /// Discard all writes and effects.
    pub fn abort(self) {
        debug!(
            writes = self.writes.len(),
            effects = self.effects.len(),
            "Transaction aborted"
        );
    }

    pub(crate) fn into_parts(self) -> (Vec<BatchOperation>, Vec<CacheEffect>) {
        let ops = self
            .writes
            .into_iter()
            .map(|(key, value)| match value {
                Some(value) => BatchOperation::Put { key, value },
                None => BatchOperation::Delete { key },
            })
            .collect();
        (ops, self.effects)
    }
}
