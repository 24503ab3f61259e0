//! Sender filters
//!
//! Tracks what this device has advertised to each peer so that only the
//! delta is resent. Updated objects land in the tail segment of a persisted
//! chain `BASE, ..., tail`. A device's recorded index is the first segment
//! it has not acknowledged; the filter to send it is the union of that
//! segment and everything after it.
//!
//! `update_seq` counts object updates. An acknowledgement carries the
//! counter value its filter was computed under and is ignored if the
//! counter moved since. `get` sets `barrier`, which makes the next update
//! bump the counter even if it leaves the tail's bits unchanged: a version
//! change that happened after the filter was computed must not be
//! acknowledged away.
//!
//! The counter is not persisted. Each load seeds it from the wall clock,
//! at least `SESSION_SPAN` above any earlier seed in this process, so an
//! ack computed before a restart does not match a value issued after it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use shared_types::{Did, Oid, Sindex};
use tracing::{debug, warn};

use crate::adapters::{CacheEffect, FilterDb, Trans};
use crate::domain::{BloomFilter, SenderFilterIndex};
use crate::error::StorageError;

/// Room left for the updates of one session below the next seed
const SESSION_SPAN: u64 = 1 << 32;

/// First `update_seq` of a freshly loaded store.
fn session_seed() -> u64 {
    static LAST_SEED: AtomicU64 = AtomicU64::new(0);

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64);
    let mut seed = now;
    let _ = LAST_SEED.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |last| {
        seed = now.max(last.saturating_add(SESSION_SPAN));
        Some(seed)
    });
    seed
}

/// Filter computed for one peer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutgoingFilter {
    pub filter: BloomFilter,
    /// Tail index when the filter was computed
    pub index: SenderFilterIndex,
    pub update_seq: u64,
}

pub struct SenderFilters {
    sidx: Sindex,
    db: FilterDb,
    /// Cache of the highest-indexed segment
    last_index: SenderFilterIndex,
    last_filter: BloomFilter,
    update_seq: u64,
    barrier: bool,
}

impl SenderFilters {
    /// Load the tail segment of the store's chain.
    pub fn load(sidx: Sindex, db: FilterDb) -> Result<Self, StorageError> {
        let (last_index, last_filter) = db
            .last_sender_filter(None, sidx)?
            .unwrap_or((SenderFilterIndex::BASE, BloomFilter::new()));

        Ok(Self {
            sidx,
            db,
            last_index,
            last_filter,
            update_seq: session_seed(),
            barrier: false,
        })
    }

    pub fn last_index(&self) -> SenderFilterIndex {
        self.last_index
    }

    pub fn update_seq(&self) -> u64 {
        self.update_seq
    }

    /// Record that the version of `oid` changed.
    pub fn object_updated(&mut self, oid: &Oid, t: &mut Trans) -> Result<(), StorageError> {
        let (sidx, last) = (self.sidx, self.last_index);
        let mut tail = if self.db.is_sender_filter_staged(t, sidx, last) {
            self.db
                .sender_filter(Some(&*t), sidx, last)?
                .unwrap_or_default()
        } else {
            self.last_filter.clone()
        };

        let changed = tail.add(oid);
        if changed {
            self.db.set_sender_filter(t, sidx, last, &tail);
            t.stage_effect(CacheEffect::SenderTail {
                sidx,
                index: last,
                filter: tail,
            });
        }

        if changed || self.barrier {
            self.update_seq += 1;
            self.barrier = false;
        }
        Ok(())
    }

    /// Filter to send to `did`, or `None` if it would be empty.
    ///
    /// Sets the barrier for the next `object_updated`.
    pub fn get(
        &mut self,
        did: Did,
        from_base: bool,
    ) -> Result<Option<OutgoingFilter>, StorageError> {
        let filter = self.compute(did, from_base)?;
        self.barrier = true;

        Ok(filter.map(|filter| OutgoingFilter {
            filter,
            index: self.last_index,
            update_seq: self.update_seq,
        }))
    }

    fn compute(&self, did: Did, from_base: bool) -> Result<Option<BloomFilter>, StorageError> {
        let from = if from_base {
            SenderFilterIndex::BASE
        } else {
            self.db
                .sender_device_index(None, self.sidx, did)?
                .unwrap_or(SenderFilterIndex::BASE)
        };

        let mut filter = self.last_filter.to_mutable();
        if from < self.last_index {
            for (_, segment) in self
                .db
                .sender_filters_between(None, self.sidx, from, self.last_index)?
            {
                filter.union(&segment);
            }
        }

        Ok((!filter.is_empty()).then(|| filter.into_finalized()))
    }

    /// Apply an acknowledgement from `did`.
    ///
    /// Returns `false` if it was ignored as stale.
    pub fn update(
        &mut self,
        did: Did,
        acked: SenderFilterIndex,
        acked_seq: u64,
        t: &mut Trans,
    ) -> Result<bool, StorageError> {
        if acked_seq != self.update_seq {
            debug!(sidx = %self.sidx, %did, acked_seq, current = self.update_seq, "Stale filter ack ignored");
            return Ok(false);
        }
        if acked > self.last_index {
            warn!(sidx = %self.sidx, %did, %acked, last = %self.last_index, "Ack beyond tail ignored");
            return Ok(false);
        }

        let mut tail = self.last_index;
        let mut device_index = acked.next();
        if acked == self.last_index {
            if self.last_filter.is_empty() {
                device_index = acked;
            } else {
                // Later updates go into a segment nobody has been sent yet
                tail = self.last_index.next();
                let empty = BloomFilter::new();
                self.db.set_sender_filter(t, self.sidx, tail, &empty);
                t.stage_effect(CacheEffect::SenderTail {
                    sidx: self.sidx,
                    index: tail,
                    filter: empty,
                });
            }
        }

        let old_index = self
            .db
            .sender_device_index(Some(&*t), self.sidx, did)?
            .unwrap_or(SenderFilterIndex::BASE);
        let device_index = device_index.max(old_index);
        self.db
            .set_sender_device_index(t, self.sidx, did, device_index);

        let mut candidates = vec![acked, old_index];
        candidates.sort();
        candidates.dedup();
        for segment in candidates.into_iter().rev() {
            self.collapse(segment, tail, t)?;
        }

        debug!(sidx = %self.sidx, %did, %acked, %device_index, "Filter ack applied");
        Ok(true)
    }

    /// Merge `segment` into its predecessor if no device would lose it.
    fn collapse(
        &self,
        segment: SenderFilterIndex,
        tail: SenderFilterIndex,
        t: &mut Trans,
    ) -> Result<(), StorageError> {
        if segment.is_base() || segment >= tail {
            return Ok(());
        }
        let Some(content) = self.db.sender_filter(Some(&*t), self.sidx, segment)? else {
            return Ok(());
        };
        let Some((pred, mut merged)) = self.db.sender_filter_before(Some(&*t), self.sidx, segment)?
        else {
            return Ok(());
        };

        // A device positioned in (pred, segment] would skip `pred` and miss
        // the merged content.
        let blocked = self
            .db
            .sender_device_indices(Some(&*t), self.sidx)?
            .into_iter()
            .any(|(_, index)| index > pred && index <= segment);
        if blocked {
            return Ok(());
        }

        merged.union(&content);
        self.db.set_sender_filter(t, self.sidx, pred, &merged);
        self.db.delete_sender_filter(t, self.sidx, segment);
        debug!(sidx = %self.sidx, %segment, %pred, "Sender filter segment collapsed");
        Ok(())
    }

    /// Apply a committed cache change.
    pub fn apply(&mut self, effect: &CacheEffect) {
        if let CacheEffect::SenderTail { index, filter, .. } = effect {
            if *index >= self.last_index {
                self.last_index = *index;
                self.last_filter = filter.to_mutable();
            }
        }
    }
}
