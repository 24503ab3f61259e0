//! Collector Service
//!
//! Owns the per-store fetchers and sender filters and implements
//! `CollectorApi` on top of them. Committed cache effects are routed back
//! to the store they belong to.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use shared_types::{Did, Oid, Sindex};
use tracing::{debug, info};

use super::content_fetcher::{ContentFetcher, FetcherDeps};
use super::sender_filters::SenderFilters;
use crate::adapters::{CacheEffect, FilterDb, Trans};
use crate::domain::{BloomFilter, CollectorConfig, SenderFilterIndex};
use crate::error::{CollectorError, CollectorResult};
use crate::metrics::CollectorMetrics;
use crate::ports::{
    CollectorApi, CollectorQueue, ContentDownloads, CoreScheduler, FilterAnnouncement,
};

/// Collector state of one store
pub struct StoreCollector {
    pub fetcher: ContentFetcher,
    pub sender: RefCell<SenderFilters>,
}

/// Collector Service implementation
///
/// Implements the `CollectorApi` port. Bound to the core thread.
pub struct CollectorService {
    deps: FetcherDeps,
    config: CollectorConfig,
    stores: RefCell<HashMap<Sindex, Rc<StoreCollector>>>,
}

impl CollectorService {
    /// Create a new service
    ///
    /// # Errors
    /// `InvalidConfig` if the configuration does not validate.
    pub fn new(
        db: FilterDb,
        queue: Rc<dyn CollectorQueue>,
        downloads: Rc<dyn ContentDownloads>,
        scheduler: Rc<dyn CoreScheduler>,
        config: CollectorConfig,
    ) -> CollectorResult<Self> {
        config.validate()?;
        Ok(Self {
            deps: FetcherDeps {
                db,
                queue,
                downloads,
                scheduler,
                metrics: Arc::new(CollectorMetrics::new()),
            },
            config,
            stores: RefCell::new(HashMap::new()),
        })
    }

    pub fn metrics(&self) -> Arc<CollectorMetrics> {
        self.deps.metrics.clone()
    }

    /// Register a store. Registering it again is a no-op.
    pub fn add_store(&self, sidx: Sindex) -> CollectorResult<()> {
        if self.stores.borrow().contains_key(&sidx) {
            return Ok(());
        }
        let sender = SenderFilters::load(sidx, self.deps.db.clone())?;
        let fetcher = ContentFetcher::new(sidx, self.deps.clone(), self.config.clone());
        self.stores.borrow_mut().insert(
            sidx,
            Rc::new(StoreCollector {
                fetcher,
                sender: RefCell::new(sender),
            }),
        );
        info!(%sidx, "Store registered with collector");
        Ok(())
    }

    /// Unregister a store and stop its fetcher.
    pub fn remove_store(&self, sidx: Sindex) {
        if let Some(store) = self.stores.borrow_mut().remove(&sidx) {
            store.fetcher.stop();
            info!(%sidx, "Store removed from collector");
        }
    }

    /// Stop every store's fetcher.
    pub fn stop(&self) {
        for store in self.stores.borrow().values() {
            store.fetcher.stop();
        }
    }

    pub fn store(&self, sidx: Sindex) -> CollectorResult<Rc<StoreCollector>> {
        self.stores
            .borrow()
            .get(&sidx)
            .cloned()
            .ok_or(CollectorError::UnknownStore(sidx))
    }

    /// Fetcher of a registered store
    pub fn fetcher(&self, sidx: Sindex) -> CollectorResult<ContentFetcher> {
        Ok(self.store(sidx)?.fetcher.clone())
    }

    /// Open a transaction for `*_in` operations.
    pub fn begin(&self) -> Trans {
        Trans::new()
    }

    /// Write `t` atomically, then update every affected store's caches.
    pub fn commit(&self, t: Trans) -> CollectorResult<()> {
        let effects = self.deps.db.commit(t)?;
        for effect in effects {
            self.dispatch(&effect);
        }
        Ok(())
    }

    fn dispatch(&self, effect: &CacheEffect) {
        let sidx = effect.sidx();
        let Some(store) = self.stores.borrow().get(&sidx).cloned() else {
            debug!(%sidx, "Effect for unregistered store dropped");
            return;
        };
        match effect {
            CacheEffect::SenderTail { .. } => store.sender.borrow_mut().apply(effect),
            _ => store.fetcher.apply(effect),
        }
    }

    /// Merge a filter announced by `did` as part of `t`.
    pub fn add_filter_in(
        &self,
        sidx: Sindex,
        did: Did,
        filter: &BloomFilter,
        t: &mut Trans,
    ) -> CollectorResult<()> {
        self.store(sidx)?.fetcher.add(did, filter, t)?;
        Ok(())
    }

    /// Record an object version change as part of `t`.
    pub fn object_updated_in(&self, sidx: Sindex, oid: &Oid, t: &mut Trans) -> CollectorResult<()> {
        let store = self.store(sidx)?;
        store.sender.borrow_mut().object_updated(oid, t)?;
        Ok(())
    }
}

impl CollectorApi for CollectorService {
    fn add_filter(&self, sidx: Sindex, did: Did, filter_bytes: &[u8]) -> CollectorResult<()> {
        let filter = BloomFilter::from_bytes(filter_bytes)?;
        let mut t = self.begin();
        self.add_filter_in(sidx, did, &filter, &mut t)?;
        self.commit(t)
    }

    fn device_online(&self, sidx: Sindex, did: Did) -> CollectorResult<()> {
        self.store(sidx)?.fetcher.online(did)?;
        Ok(())
    }

    fn device_offline(&self, sidx: Sindex, did: Did) -> CollectorResult<()> {
        self.store(sidx)?.fetcher.offline(did);
        Ok(())
    }

    fn acknowledge_filter(
        &self,
        sidx: Sindex,
        did: Did,
        index: SenderFilterIndex,
        update_seq: u64,
    ) -> CollectorResult<()> {
        let store = self.store(sidx)?;
        let mut t = self.begin();
        store
            .sender
            .borrow_mut()
            .update(did, index, update_seq, &mut t)?;
        self.commit(t)
    }

    fn compute_filter_to_send(
        &self,
        sidx: Sindex,
        did: Did,
        from_base: bool,
    ) -> CollectorResult<Option<FilterAnnouncement>> {
        let store = self.store(sidx)?;
        let outgoing = store.sender.borrow_mut().get(did, from_base)?;
        Ok(outgoing.map(|out| FilterAnnouncement {
            bytes: out.filter.to_bytes(),
            index: out.index,
            update_seq: out.update_seq,
        }))
    }

    fn object_updated(&self, sidx: Sindex, oid: Oid) -> CollectorResult<()> {
        let mut t = self.begin();
        self.object_updated_in(sidx, &oid, &mut t)?;
        self.commit(t)
    }
}
