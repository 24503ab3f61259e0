//! Collector filters
//!
//! Per-store registry of the filters remote devices announced to us. Each
//! loaded (online) device has a `DeviceEntry` holding a cache of its
//! persisted filter and the set of queue positions it has a filter attached
//! at. The position map `cs -> (did -> filter)` mirrors those sets exactly.
//!
//! Filters in the position map and the device cache are finalized and
//! shared through `Rc`; merging into one always replaces it with a fresh
//! copy (copy-on-union).

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::Bound;
use std::rc::Rc;

use shared_types::{Did, Oid, Sindex};
use tracing::{debug, warn};

use crate::adapters::{CacheEffect, FilterDb, Trans};
use crate::domain::{BloomFilter, CollectorSeq};
use crate::error::StorageError;

#[derive(Debug, Default)]
struct DeviceEntry {
    /// Cache of the persisted filter row
    db_filter: Option<Rc<BloomFilter>>,
    /// Queue positions with a filter of this device attached
    css: BTreeSet<CollectorSeq>,
    /// Keep the persisted filter through the next cleanup
    dirty: bool,
}

pub struct CollectorFilters {
    sidx: Sindex,
    db: FilterDb,
    did2dev: HashMap<Did, DeviceEntry>,
    cs2filters: BTreeMap<CollectorSeq, HashMap<Did, Rc<BloomFilter>>>,
}

impl CollectorFilters {
    pub fn new(sidx: Sindex, db: FilterDb) -> Self {
        Self {
            sidx,
            db,
            did2dev: HashMap::new(),
            cs2filters: BTreeMap::new(),
        }
    }

    pub fn sidx(&self) -> Sindex {
        self.sidx
    }

    /// Merge `filter` into the device's persisted filter.
    ///
    /// Returns whether the device is loaded. Nothing is written if the merge
    /// does not change the persisted filter. The cache of a loaded device
    /// follows through a `CollectorDbFilter` effect.
    pub fn add_db_filter(
        &self,
        did: Did,
        filter: &BloomFilter,
        t: &mut Trans,
    ) -> Result<bool, StorageError> {
        let loaded = self.did2dev.contains_key(&did);

        let (merged, changed) = match self.db.collector_filter(Some(&*t), self.sidx, did)? {
            Some(mut existing) => {
                let changed = existing.union(filter);
                (existing, changed)
            }
            None => (filter.to_mutable(), !filter.is_empty()),
        };

        if changed {
            self.db.set_collector_filter(t, self.sidx, did, &merged);
            if loaded {
                t.stage_effect(CacheEffect::CollectorDbFilter {
                    sidx: self.sidx,
                    did,
                    filter: Some(merged),
                });
            }
            debug!(sidx = %self.sidx, %did, loaded, "Collector filter merged");
        }

        Ok(loaded)
    }

    /// Create the entry of a device that came online.
    ///
    /// Returns whether its persisted filter is non-empty.
    ///
    /// # Panics
    /// Panics if the device is already loaded.
    pub fn load_db_filter(&mut self, did: Did) -> Result<bool, StorageError> {
        assert!(
            !self.did2dev.contains_key(&did),
            "device {did} loaded twice in {}",
            self.sidx
        );

        let db_filter = self
            .db
            .collector_filter(None, self.sidx, did)?
            .filter(|f| !f.is_empty())
            .map(|f| Rc::new(f.into_finalized()));
        let non_empty = db_filter.is_some();

        self.did2dev.insert(
            did,
            DeviceEntry {
                db_filter,
                ..DeviceEntry::default()
            }
        );
        Ok(non_empty)
    }

    /// Drop a device and every filter it has attached.
    pub fn unload_all_filters(&mut self, did: Did) {
        let Some(dev) = self.did2dev.remove(&did) else {
            return;
        };
        for cs in dev.css {
            self.detach(cs, did);
        }
    }

    fn detach(&mut self, cs: CollectorSeq, did: Did) {
        if let Some(filters) = self.cs2filters.get_mut(&cs) {
            filters.remove(&did);
            if filters.is_empty() {
                self.cs2filters.remove(&cs);
            }
        }
    }

    pub fn is_loaded(&self, did: Did) -> bool {
        self.did2dev.contains_key(&did)
    }

    /// Attach `filter` to the device at `cs`, merging with any filter
    /// already attached there.
    ///
    /// # Panics
    /// Panics if the device is not loaded.
    pub fn add_cs_filter(&mut self, did: Did, cs: CollectorSeq, filter: &BloomFilter) {
        assert!(self.did2dev.contains_key(&did), "device {did} not loaded");
        self.attach(did, cs, Rc::new(filter.to_mutable().into_finalized()));
    }

    /// Attach the device's whole persisted filter at `cs`.
    ///
    /// Only valid for a freshly loaded device with a non-empty filter and at
    /// the current queue position.
    ///
    /// # Panics
    /// Panics if the device is not loaded, has no persisted filter, or
    /// already has a filter attached.
    pub fn set_cs_filter_from_db(&mut self, did: Did, cs: CollectorSeq) {
        let dev = self
            .did2dev
            .get(&did)
            .unwrap_or_else(|| panic!("device {did} not loaded"));
        assert!(
            dev.css.is_empty(),
            "device {did} already has filters attached"
        );
        let db_filter = dev
            .db_filter
            .clone()
            .unwrap_or_else(|| panic!("device {did} has no persisted filter"));

        self.attach(did, cs, db_filter);
    }

    /// Attach every loaded device's persisted filter at `cs`.
    pub fn set_all_cs_filters_from_db(&mut self, cs: CollectorSeq) {
        let sources: Vec<(Did, Rc<BloomFilter>)> = self
            .did2dev
            .iter()
            .filter_map(|(did, dev)| dev.db_filter.clone().map(|f| (*did, f)))
            .collect();
        for (did, filter) in sources {
            self.attach(did, cs, filter);
        }
    }

    fn attach(&mut self, did: Did, cs: CollectorSeq, filter: Rc<BloomFilter>) {
        debug_assert!(filter.is_finalized());

        let filters = self.cs2filters.entry(cs).or_default();
        match filters.get_mut(&did) {
            Some(existing) if Rc::ptr_eq(existing, &filter) => {}
            Some(existing) => {
                let mut merged = existing.to_mutable();
                if merged.union(&filter) {
                    *existing = Rc::new(merged.into_finalized());
                }
            }
            None => {
                filters.insert(did, filter);
            }
        }

        if let Some(dev) = self.did2dev.get_mut(&did) {
            dev.css.insert(cs);
        }
    }

    /// Remove attachments in `[start, end]`; `None` leaves that side open.
    ///
    /// Returns whether any attachment remains anywhere.
    ///
    /// # Panics
    /// Panics if both bounds are open.
    pub fn delete_cs_filters(
        &mut self,
        start: Option<CollectorSeq>,
        end: Option<CollectorSeq>,
    ) -> bool {
        assert!(
            start.is_some() || end.is_some(),
            "at least one bound required"
        );
        let lower = start.map_or(Bound::Unbounded, Bound::Included);
        let upper = end.map_or(Bound::Unbounded, Bound::Included);

        let doomed: Vec<CollectorSeq> = self
            .cs2filters
            .range((lower, upper))
            .map(|(cs, _)| *cs)
            .collect();
        for cs in doomed {
            if let Some(filters) = self.cs2filters.remove(&cs) {
                for did in filters.keys() {
                    if let Some(dev) = self.did2dev.get_mut(did) {
                        dev.css.remove(&cs);
                    }
                }
            }
        }

        !self.cs2filters.is_empty()
    }

    /// Remove every attachment, keeping the devices loaded.
    pub fn delete_all_cs_filters(&mut self) {
        self.cs2filters.clear();
        for dev in self.did2dev.values_mut() {
            dev.css.clear();
        }
    }

    pub fn has_cs_filters(&self) -> bool {
        !self.cs2filters.is_empty()
    }

    /// Loaded devices that may have `oid`.
    pub fn get_devices_having_component(&self, oid: &Oid) -> HashSet<Did> {
        let mut dids = HashSet::new();
        for (did, dev) in &self.did2dev {
            // With several positions it is cheaper to rule the device out
            // against its persisted filter first.
            if dev.css.len() >= 2 {
                if let Some(db_filter) = &dev.db_filter {
                    if !db_filter.contains(oid) {
                        continue;
                    }
                }
            }

            let hit = dev.css.iter().any(|cs| {
                self.cs2filters
                    .get(cs)
                    .and_then(|filters| filters.get(did))
                    .is_some_and(|f| f.contains(oid))
            });
            if hit {
                dids.insert(*did);
            }
        }
        dids
    }

    /// Keep the device's persisted filter through the next cleanup.
    pub fn set_dirty_bit(&mut self, did: Did) {
        match self.did2dev.get_mut(&did) {
            Some(dev) => dev.dirty = true,
            None => debug!(sidx = %self.sidx, %did, "Dirty bit for unloaded device ignored"),
        }
    }

    pub fn is_dirty(&self, did: Did) -> bool {
        self.did2dev.get(&did).is_some_and(|dev| dev.dirty)
    }

    /// Delete the persisted filter of every device not marked dirty.
    ///
    /// Dirty devices keep theirs and have the flag cleared once `t`
    /// commits. A storage error aborts the cleanup with a warning; the next
    /// idle period retries it. Returns the number of rows staged for
    /// deletion.
    pub fn clean_up_db_filters(&self, t: &mut Trans) -> usize {
        let dids = match self.db.collector_filter_devices(Some(&*t), self.sidx) {
            Ok(dids) => dids,
            Err(e) => {
                warn!(sidx = %self.sidx, error = %e, "Collector filter cleanup skipped");
                return 0;
            }
        };

        let mut deleted = 0;
        for did in dids {
            let dev = self.did2dev.get(&did);
            if dev.is_some_and(|dev| dev.dirty) {
                t.stage_effect(CacheEffect::CollectorDirtyCleared {
                    sidx: self.sidx,
                    did,
                });
                continue;
            }

            self.db.delete_collector_filter(t, self.sidx, did);
            if dev.is_some() {
                t.stage_effect(CacheEffect::CollectorDbFilter {
                    sidx: self.sidx,
                    did,
                    filter: None,
                });
            }
            deleted += 1;
        }

        debug!(sidx = %self.sidx, deleted, "Collector filters cleaned up");
        deleted
    }

    /// Apply a committed cache change.
    pub fn apply(&mut self, effect: &CacheEffect) {
        match effect {
            CacheEffect::CollectorDbFilter { did, filter, .. } => {
                if let Some(dev) = self.did2dev.get_mut(did) {
                    dev.db_filter = filter
                        .as_ref()
                        .filter(|f| !f.is_empty())
                        .map(|f| Rc::new(f.to_mutable().into_finalized()));
                }
            }
            CacheEffect::CollectorDirtyCleared { did, .. } => {
                if let Some(dev) = self.did2dev.get_mut(did) {
                    dev.dirty = false;
                }
            }
            _ => {}
        }
    }

    /// Cached persisted filter of a loaded device
    pub fn db_filter(&self, did: Did) -> Option<Rc<BloomFilter>> {
        self.did2dev.get(&did).and_then(|dev| dev.db_filter.clone())
    }

    /// Positions the device has filters attached at, ascending
    pub fn attached_positions(&self, did: Did) -> Vec<CollectorSeq> {
        self.did2dev
            .get(&did)
            .map(|dev| dev.css.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn loaded_devices(&self) -> Vec<Did> {
        self.did2dev.keys().copied().collect()
    }

    /// Whether the position map and the device position sets agree.
    pub fn check_invariant(&self) -> bool {
        let attached_at = |did: &Did, cs: &CollectorSeq| {
            self.did2dev
                .get(did)
                .is_some_and(|dev| dev.css.contains(cs))
        };
        let forward = self.cs2filters.iter().all(|(cs, filters)| {
            !filters.is_empty() && filters.keys().all(|did| attached_at(did, cs))
        });
        let backward = self.did2dev.iter().all(|(did, dev)| {
            dev.css.iter().all(|cs| {
                self.cs2filters
                    .get(cs)
                    .is_some_and(|filters| filters.contains_key(did))
            })
        });
        forward && backward
    }
}
