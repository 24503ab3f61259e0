//! Content fetcher
//!
//! Drives collection for one store: walks the fetch queue in rounds, asks
//! `CollectorFilters` which devices may have each object and hands the
//! object to the download engine.
//!
//! Filters are attached at the cursor position and live until the cursor
//! comes back around to that position, so each filter is tried against the
//! whole queue once. An iteration ends when no attachment is left or the
//! queue is empty.
//!
//! Every callback (download completion, token reclaimed, backoff, retry)
//! is posted to the `CoreScheduler` and checks `stopped` before touching
//! any state.

use std::cell::{Ref, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;

use shared_types::{Did, Oid, Sindex, Soid};
use tracing::{debug, error, info, warn};

use super::collector_filters::CollectorFilters;
use crate::adapters::{CacheEffect, FilterDb, Trans};
use crate::domain::{BloomFilter, CollectorConfig, CollectorSeq, ExponentialBackoff};
use crate::error::{DownloadFailure, StorageError};
use crate::metrics::CollectorMetrics;
use crate::ports::{CollectorQueue, ContentDownloads, CoreScheduler, QueueEntry};

/// Collaborators of a fetcher
#[derive(Clone)]
pub struct FetcherDeps {
    pub db: FilterDb,
    pub queue: Rc<dyn CollectorQueue>,
    pub downloads: Rc<dyn ContentDownloads>,
    pub scheduler: Rc<dyn CoreScheduler>,
    pub metrics: Arc<CollectorMetrics>,
}

/// Outcome of advancing the cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rotation {
    Item(QueueEntry),
    /// Nothing queued
    QueueEmpty,
    /// Every attached filter has been tried against the whole queue
    Exhausted,
}

struct Fetcher {
    sidx: Sindex,
    this: Weak<RefCell<Fetcher>>,
    deps: FetcherDeps,
    config: CollectorConfig,
    cfs: CollectorFilters,

    cursor: Option<CollectorSeq>,
    iterating: bool,
    /// Item whose download was throttled; collected first on resume
    continuation: Option<QueueEntry>,
    in_flight: usize,
    start_seq: u64,
    backoff: ExponentialBackoff,
    backoff_scheduled: bool,
    /// Set when a pass drained the queue with nothing in flight
    cleanup_due: bool,
    /// Objects a device reported as permanently unavailable
    excluded: HashMap<Did, HashSet<Oid>>,
    stopped: bool,
}

/// Handle to the fetcher of one store.
#[derive(Clone)]
pub struct ContentFetcher {
    core: Rc<RefCell<Fetcher>>,
}

/// Run `f` on the fetcher after `delay`, unless it was dropped or stopped.
fn defer(
    scheduler: &Rc<dyn CoreScheduler>,
    this: &Weak<RefCell<Fetcher>>,
    delay: Duration,
    f: impl FnOnce(&mut Fetcher) + 'static,
) {
    let this = this.clone();
    scheduler.schedule(
        delay,
        Box::new(move || {
            if let Some(core) = this.upgrade() {
                let mut fetcher = core.borrow_mut();
                if !fetcher.stopped {
                    f(&mut fetcher);
                }
            }
        }),
    );
}

impl ContentFetcher {
    pub fn new(sidx: Sindex, deps: FetcherDeps, config: CollectorConfig) -> Self {
        let core = Rc::new_cyclic(|this| {
            RefCell::new(Fetcher {
                sidx,
                this: this.clone(),
                cfs: CollectorFilters::new(sidx, deps.db.clone()),
                backoff: ExponentialBackoff::new(config.backoff_min, config.backoff_max),
                deps,
                config,
                cursor: None,
                iterating: false,
                continuation: None,
                in_flight: 0,
                start_seq: 0,
                backoff_scheduled: false,
                cleanup_due: false,
                excluded: HashMap::new(),
                stopped: false,
            })
        });
        Self { core }
    }

    /// Merge a filter announced by `did` into `t`.
    ///
    /// Attaching it or starting an iteration happens when the committed
    /// `FilterAdded` effect is applied.
    pub fn add(&self, did: Did, filter: &BloomFilter, t: &mut Trans) -> Result<(), StorageError> {
        let fetcher = self.core.borrow();
        let device_loaded = fetcher.cfs.add_db_filter(did, filter, t)?;
        t.stage_effect(CacheEffect::FilterAdded {
            sidx: fetcher.sidx,
            did,
            filter: filter.clone(),
            device_loaded,
        });
        Ok(())
    }

    /// Apply a committed cache change of this store.
    pub fn apply(&self, effect: &CacheEffect) {
        let mut fetcher = self.core.borrow_mut();
        match effect {
            CacheEffect::FilterAdded {
                did,
                filter,
                device_loaded,
                ..
            } => fetcher.filter_added(*did, filter, *device_loaded),
            _ => fetcher.cfs.apply(effect),
        }
    }

    pub fn online(&self, did: Did) -> Result<(), StorageError> {
        self.core.borrow_mut().online(did)
    }

    pub fn offline(&self, did: Did) {
        self.core.borrow_mut().offline(did)
    }

    /// Begin an iteration unless one is running.
    pub fn start(&self) {
        self.core.borrow_mut().start()
    }

    /// Stop for good. Pending callbacks become no-ops.
    pub fn stop(&self) {
        let mut fetcher = self.core.borrow_mut();
        fetcher.stopped = true;
        fetcher.iterating = false;
        fetcher.continuation = None;
        info!(sidx = %fetcher.sidx, "Content fetcher stopped");
    }

    pub fn is_iterating(&self) -> bool {
        self.core.borrow().iterating
    }

    /// Position of the current item, if iterating
    pub fn cursor(&self) -> Option<CollectorSeq> {
        self.core.borrow().cursor
    }

    /// Whether the iteration waits for a download token
    pub fn is_suspended(&self) -> bool {
        self.core.borrow().continuation.is_some()
    }

    pub fn in_flight(&self) -> usize {
        self.core.borrow().in_flight
    }

    pub fn is_backoff_scheduled(&self) -> bool {
        self.core.borrow().backoff_scheduled
    }

    /// Delay the next backoff would use
    pub fn next_backoff(&self) -> Duration {
        self.core.borrow().backoff.peek()
    }

    pub fn is_excluded(&self, did: Did, oid: &Oid) -> bool {
        self.core.borrow().is_excluded(&did, oid)
    }

    /// Read access to the store's collector filters
    pub fn filters(&self) -> Ref<'_, CollectorFilters> {
        Ref::map(self.core.borrow(), |fetcher| &fetcher.cfs)
    }
}

impl Fetcher {
    fn is_excluded(&self, did: &Did, oid: &Oid) -> bool {
        self.excluded
            .get(did)
            .is_some_and(|oids| oids.contains(oid))
    }

    fn defer(&self, delay: Duration, f: impl FnOnce(&mut Fetcher) + 'static) {
        defer(&self.deps.scheduler, &self.this, delay, f);
    }

    fn filter_added(&mut self, did: Did, filter: &BloomFilter, device_loaded: bool) {
        CollectorMetrics::inc(&self.deps.metrics.filters_received);
        // A new filter is new information; permanent errors may no longer hold
        self.excluded.remove(&did);

        match (device_loaded && self.cfs.is_loaded(did), self.iterating, self.cursor) {
            (true, true, Some(cs)) => {
                debug!(sidx = %self.sidx, %did, %cs, "Filter attached to running iteration");
                self.cfs.add_cs_filter(did, cs, filter);
            }
            // The first rotation seeds every loaded device's filter
            (_, true, None) => {}
            _ => self.start(),
        }
    }

    fn online(&mut self, did: Did) -> Result<(), StorageError> {
        if self.cfs.is_loaded(did) {
            debug!(sidx = %self.sidx, %did, "Device already online, ignored");
            return Ok(());
        }
        let non_empty = self.cfs.load_db_filter(did)?;
        info!(sidx = %self.sidx, %did, has_filter = non_empty, "Device online");
        if !non_empty {
            return Ok(());
        }

        if self.iterating {
            if let Some(cs) = self.cursor {
                self.cfs.set_cs_filter_from_db(did, cs);
            }
        } else {
            self.start();
        }
        Ok(())
    }

    fn offline(&mut self, did: Did) {
        self.cfs.unload_all_filters(did);
        self.excluded.remove(&did);
        info!(sidx = %self.sidx, %did, "Device offline");
    }

    fn start(&mut self) {
        if self.stopped || self.iterating {
            return;
        }
        self.iterating = true;
        self.cursor = None;
        self.continuation = None;
        self.start_seq += 1;
        CollectorMetrics::inc(&self.deps.metrics.iterations_started);
        info!(sidx = %self.sidx, start_seq = self.start_seq, "Collection iteration started");

        let seq = self.start_seq;
        let retry = self.config.retry_min;
        self.defer(Duration::ZERO, move |f| f.run_collect(seq, retry));
    }

    /// Collect, retrying with growing delays while storage fails.
    ///
    /// A newer `start` makes pending retries of older ones no-ops.
    fn run_collect(&mut self, seq: u64, retry: Duration) {
        if seq != self.start_seq {
            debug!(sidx = %self.sidx, seq, current = self.start_seq, "Superseded collection attempt dropped");
            return;
        }
        if let Err(e) = self.collect() {
            error!(sidx = %self.sidx, error = %e, retry_ms = retry.as_millis() as u64, "Collection failed, retrying");
            let next = retry.saturating_mul(2).min(self.config.backoff_max);
            self.defer(retry, move |f| f.run_collect(seq, next));
        }
    }

    /// One pass of the main loop.
    ///
    /// Cleanup due at the end of the pass commits separately so that a
    /// failed cleanup never fails the pass.
    fn collect(&mut self) -> Result<(), StorageError> {
        if !self.iterating {
            return Ok(());
        }

        if let Err(e) = self.collect_items() {
            self.cleanup_due = false;
            self.restart_pending();
            return Err(e);
        }
        if std::mem::take(&mut self.cleanup_due) {
            self.clean_up();
        }
        Ok(())
    }

    /// After a failed pass the retry starts over from the head of the
    /// queue, reseeding attachments from persisted filters.
    fn restart_pending(&mut self) {
        self.cfs.delete_all_cs_filters();
        self.iterating = true;
        self.cursor = None;
        self.continuation = None;
    }

    fn collect_items(&mut self) -> Result<(), StorageError> {
        loop {
            let entry = match self.resume()? {
                Some(entry) => entry,
                None => match self.rotate()? {
                    Rotation::Item(entry) => entry,
                    Rotation::QueueEmpty | Rotation::Exhausted => return Ok(()),
                },
            };

            if !self.collect_one(entry) {
                debug!(sidx = %self.sidx, cs = %entry.cs, "Download throttled, suspending");
                self.continuation = Some(entry);
                return Ok(());
            }
        }
    }

    /// The suspended item, if it is still queued and still current.
    fn resume(&mut self) -> Result<Option<QueueEntry>, StorageError> {
        let Some(entry) = self.continuation.take() else {
            return Ok(None);
        };
        if self.cursor == Some(entry.cs) && self.deps.queue.contains(self.sidx, entry.cs)? {
            debug!(sidx = %self.sidx, cs = %entry.cs, "Resuming suspended item");
            Ok(Some(entry))
        } else {
            debug!(sidx = %self.sidx, cs = %entry.cs, "Suspended item no longer queued");
            Ok(None)
        }
    }

    fn rotate(&mut self) -> Result<Rotation, StorageError> {
        let rotation = match self.cursor {
            None => match self.deps.queue.first(self.sidx)? {
                None => Rotation::QueueEmpty,
                Some(entry) => {
                    self.cfs.set_all_cs_filters_from_db(entry.cs);
                    if self.cfs.has_cs_filters() {
                        Rotation::Item(entry)
                    } else {
                        Rotation::Exhausted
                    }
                }
            },
            Some(old) => match self.deps.queue.next_after(self.sidx, old)? {
                Some(entry) => {
                    if self.cfs.delete_cs_filters(Some(old.next()), Some(entry.cs)) {
                        Rotation::Item(entry)
                    } else {
                        Rotation::Exhausted
                    }
                }
                None => match self.deps.queue.first(self.sidx)? {
                    None => Rotation::QueueEmpty,
                    Some(entry) => {
                        // Wrap around to retry failed items and pick up new ones
                        self.cfs.delete_cs_filters(Some(old.next()), None);
                        if self.cfs.delete_cs_filters(None, Some(entry.cs)) {
                            Rotation::Item(entry)
                        } else {
                            Rotation::Exhausted
                        }
                    }
                },
            },
        };

        match rotation {
            Rotation::Item(entry) => self.cursor = Some(entry.cs),
            Rotation::QueueEmpty => {
                self.cfs.delete_all_cs_filters();
                self.finish("queue empty");
                self.cleanup_due = self.in_flight == 0;
            }
            Rotation::Exhausted => self.finish("filters exhausted"),
        }
        Ok(rotation)
    }

    fn finish(&mut self, reason: &'static str) {
        self.iterating = false;
        self.cursor = None;
        self.continuation = None;
        info!(sidx = %self.sidx, reason, "Collection iteration finished");
    }

    /// Drop stale persisted filters in a transaction of their own.
    ///
    /// A failed commit is only logged; the next idle point tries again.
    fn clean_up(&mut self) {
        let mut t = Trans::new();
        let deleted = self.cfs.clean_up_db_filters(&mut t);
        match self.deps.db.commit(t) {
            Ok(effects) => {
                for effect in effects {
                    self.cfs.apply(&effect);
                }
                CollectorMetrics::add(&self.deps.metrics.filters_cleaned, deleted as u64);
            }
            Err(e) => {
                warn!(sidx = %self.sidx, error = %e, "Collector filter cleanup not committed");
            }
        }
    }

    /// Hand one item to the download engine.
    ///
    /// Returns false if no download token was available.
    fn collect_one(&mut self, entry: QueueEntry) -> bool {
        let oid = entry.oid;
        let mut dids = self.cfs.get_devices_having_component(&oid);
        dids.retain(|did| !self.is_excluded(did, &oid));
        if dids.is_empty() {
            debug!(sidx = %self.sidx, cs = %entry.cs, %oid, "No device has the object");
            CollectorMetrics::inc(&self.deps.metrics.items_without_candidates);
            return true;
        }

        let scheduler = self.deps.scheduler.clone();
        let this = self.this.clone();
        let seq = self.start_seq;
        let retry = self.config.retry_min;
        let continuation = Box::new(move || {
            let resume = move |f: &mut Fetcher| f.run_collect(seq, retry);
            defer(&scheduler, &this, Duration::ZERO, resume);
        });

        let scheduler = self.deps.scheduler.clone();
        let this = self.this.clone();
        let candidates = dids.clone();
        let listener = Box::new(move |result: Result<(), DownloadFailure>| {
            defer(&scheduler, &this, Duration::ZERO, move |f| {
                f.download_completed(oid, candidates, result)
            });
        });

        let accepted = self.deps.downloads.download_async(
            Soid::new(self.sidx, oid),
            dids,
            continuation,
            listener,
        );
        if accepted {
            self.in_flight += 1;
            CollectorMetrics::inc(&self.deps.metrics.downloads_requested);
        } else {
            CollectorMetrics::inc(&self.deps.metrics.downloads_throttled);
        }
        accepted
    }

    fn download_completed(
        &mut self,
        oid: Oid,
        candidates: HashSet<Did>,
        result: Result<(), DownloadFailure>,
    ) {
        self.in_flight = self.in_flight.saturating_sub(1);

        match result {
            Ok(()) => {
                CollectorMetrics::inc(&self.deps.metrics.downloads_succeeded);
                self.backoff.reset();
                self.maybe_clean_up();
            }
            Err(DownloadFailure::General(e)) => {
                CollectorMetrics::inc(&self.deps.metrics.downloads_failed);
                warn!(sidx = %self.sidx, %oid, error = %e, "Download failed");
                for did in candidates {
                    self.cfs.set_dirty_bit(did);
                }
                self.schedule_backoff();
            }
            Err(DownloadFailure::PerDevice(errors)) => {
                CollectorMetrics::inc(&self.deps.metrics.downloads_failed);
                let mut retry = false;
                for (did, e) in errors {
                    if e.is_permanent() {
                        debug!(sidx = %self.sidx, %did, %oid, error = %e, "Device excluded for object");
                        self.excluded.entry(did).or_default().insert(oid);
                    } else {
                        debug!(sidx = %self.sidx, %did, %oid, error = %e, "Device will be retried");
                        self.cfs.set_dirty_bit(did);
                        retry = true;
                    }
                }
                if retry {
                    self.schedule_backoff();
                }
            }
        }
    }

    /// Drop stale persisted filters once nothing is queued or in flight.
    fn maybe_clean_up(&mut self) {
        if self.in_flight != 0 {
            return;
        }
        match self.deps.queue.is_empty(self.sidx) {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                warn!(sidx = %self.sidx, error = %e, "Queue check failed, cleanup skipped");
                return;
            }
        }

        self.clean_up();
    }

    fn schedule_backoff(&mut self) {
        if self.backoff_scheduled {
            return;
        }
        self.backoff_scheduled = true;
        let delay = self.backoff.next_delay();
        CollectorMetrics::inc(&self.deps.metrics.backoffs_scheduled);
        warn!(sidx = %self.sidx, delay_ms = delay.as_millis() as u64, "Collection backing off");

        self.defer(delay, |f| f.backoff_fired());
    }

    /// Retry with every persisted filter, not just the ones that failed.
    fn backoff_fired(&mut self) {
        self.backoff_scheduled = false;
        match (self.iterating, self.cursor) {
            (true, Some(cs)) => {
                debug!(sidx = %self.sidx, %cs, "Backoff over, reattaching persisted filters");
                self.cfs.set_all_cs_filters_from_db(cs);
            }
            (true, None) => {}
            (false, _) => self.start(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::ManualScheduler;
    use crate::error::DownloadError;
    use crate::test_utils::{InMemoryCollectorQueue, RecordingDownloads};

    const SIDX: Sindex = Sindex(1);

    fn oid(n: u8) -> Oid {
        Oid([n; 16])
    }

    fn did(n: u8) -> Did {
        Did([n; 16])
    }

    struct Harness {
        db: FilterDb,
        queue: Rc<InMemoryCollectorQueue>,
        downloads: Rc<RecordingDownloads>,
        sched: Rc<ManualScheduler>,
        metrics: Arc<CollectorMetrics>,
        fetcher: ContentFetcher,
    }

    impl Harness {
        fn new() -> Self {
            let db = FilterDb::in_memory();
            let queue = Rc::new(InMemoryCollectorQueue::new());
            let downloads = Rc::new(RecordingDownloads::new());
            let sched = Rc::new(ManualScheduler::new());
            let metrics = Arc::new(CollectorMetrics::new());
            let deps = FetcherDeps {
                db: db.clone(),
                queue: queue.clone(),
                downloads: downloads.clone(),
                scheduler: sched.clone(),
                metrics: metrics.clone(),
            };
            let fetcher = ContentFetcher::new(SIDX, deps, CollectorConfig::default());
            Self {
                db,
                queue,
                downloads,
                sched,
                metrics,
                fetcher,
            }
        }

        fn announce(&self, d: Did, oids: &[Oid]) {
            let mut t = Trans::new();
            let filter = BloomFilter::from_oids(oids);
            self.fetcher.add(d, &filter, &mut t).unwrap();
            for effect in self.db.commit(t).unwrap() {
                self.fetcher.apply(&effect);
            }
        }
    }

    #[test]
    fn test_iteration_downloads_every_reachable_item_once() {
        let h = Harness::new();
        h.queue.enqueue(SIDX, oid(1));
        h.queue.enqueue(SIDX, oid(2));
        h.queue.enqueue(SIDX, oid(3));

        h.fetcher.online(did(1)).unwrap();
        h.announce(did(1), &[oid(1), oid(3)]);
        h.sched.run_pending();

        let requested: Vec<Oid> = h.downloads.requests().iter().map(|r| r.soid.oid).collect();
        assert_eq!(requested, vec![oid(1), oid(3)]);
        assert!(
            !h.fetcher.is_iterating(),
            "Iteration ends once filters are exhausted"
        );
        assert!(h.fetcher.filters().check_invariant());
        assert_eq!(h.fetcher.in_flight(), 2);
    }

    #[test]
    fn test_throttled_download_suspends_and_resumes() {
        let h = Harness::new();
        let cs1 = h.queue.enqueue(SIDX, oid(1));
        h.queue.enqueue(SIDX, oid(2));
        h.downloads.set_tokens(0);

        h.fetcher.online(did(1)).unwrap();
        h.announce(did(1), &[oid(1), oid(2)]);
        h.sched.run_pending();

        assert!(h.fetcher.is_suspended());
        assert_eq!(h.fetcher.cursor(), Some(cs1));
        assert_eq!(h.downloads.waiting(), 1);
        assert!(h.downloads.requests().is_empty());

        h.downloads.set_tokens(1);
        h.downloads.release_token();
        h.sched.run_pending();

        // Two tokens: one for each item
        let requested: Vec<Oid> = h.downloads.requests().iter().map(|r| r.soid.oid).collect();
        assert_eq!(requested, vec![oid(1), oid(2)]);
        assert!(!h.fetcher.is_suspended());
    }

    #[test]
    fn test_suspended_item_dequeued_meanwhile_is_skipped() {
        let h = Harness::new();
        let cs1 = h.queue.enqueue(SIDX, oid(1));
        h.queue.enqueue(SIDX, oid(2));
        h.downloads.set_tokens(0);

        h.fetcher.online(did(1)).unwrap();
        h.announce(did(1), &[oid(1), oid(2)]);
        h.sched.run_pending();
        assert!(h.fetcher.is_suspended());

        h.queue.dequeue(SIDX, cs1);
        h.downloads.set_tokens(5);
        h.downloads.release_token();
        h.sched.run_pending();

        let requested: Vec<Oid> = h.downloads.requests().iter().map(|r| r.soid.oid).collect();
        assert_eq!(requested, vec![oid(2)]);
    }

    #[test]
    fn test_filter_added_during_suspension_is_used_on_resume() {
        let h = Harness::new();
        h.queue.enqueue(SIDX, oid(1));
        h.downloads.set_tokens(0);

        h.fetcher.online(did(1)).unwrap();
        h.fetcher.online(did(2)).unwrap();
        h.announce(did(1), &[oid(1)]);
        h.sched.run_pending();
        assert!(h.fetcher.is_suspended());

        h.announce(did(2), &[oid(1)]);
        assert!(h.fetcher.filters().check_invariant());

        h.downloads.set_tokens(1);
        h.downloads.release_token();
        h.sched.run_pending();

        let requests = h.downloads.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].dids, HashSet::from([did(1), did(2)]));
    }

    #[test]
    fn test_general_failure_marks_candidates_dirty_and_backs_off() {
        let h = Harness::new();
        h.queue.enqueue(SIDX, oid(1));
        h.fetcher.online(did(1)).unwrap();
        h.announce(did(1), &[oid(1)]);
        h.sched.run_pending();

        let timeout = DownloadError::transient("timeout");
        let failure = DownloadFailure::General(timeout);
        h.downloads.complete(oid(1), Err(failure));
        h.sched.run_pending();

        assert!(h.fetcher.filters().is_dirty(did(1)));
        assert!(h.fetcher.is_backoff_scheduled());
        assert_eq!(h.sched.pending_delays(), vec![Duration::from_secs(1)]);

        // Backoff restarts the iteration from persisted filters
        h.sched.advance(Duration::from_secs(1));
        assert_eq!(h.downloads.requests().len(), 2);
    }

    #[test]
    fn test_backoff_is_coalesced() {
        let h = Harness::new();
        h.queue.enqueue(SIDX, oid(1));
        h.queue.enqueue(SIDX, oid(2));
        h.fetcher.online(did(1)).unwrap();
        h.announce(did(1), &[oid(1), oid(2)]);
        h.sched.run_pending();

        let failure = || Err(DownloadFailure::General(DownloadError::transient("reset")));
        h.downloads.complete(oid(1), failure());
        h.downloads.complete(oid(2), failure());
        h.sched.run_pending();

        assert_eq!(h.sched.timers(), 1);
        assert_eq!(h.metrics.snapshot().backoffs_scheduled, 1);
    }

    #[test]
    fn test_permanent_device_error_excludes_device_for_object() {
        let h = Harness::new();
        h.queue.enqueue(SIDX, oid(9));
        h.fetcher.online(did(1)).unwrap();
        h.fetcher.online(did(2)).unwrap();
        h.announce(did(1), &[oid(9)]);
        h.announce(did(2), &[oid(9)]);
        h.sched.run_pending();

        let errors = HashMap::from([
            (did(1), DownloadError::permanent("gone").wrap("rpc")),
            (did(2), DownloadError::transient("busy")),
        ]);
        let failure = DownloadFailure::PerDevice(errors);
        h.downloads.complete(oid(9), Err(failure));
        h.sched.run_pending();

        assert!(h.fetcher.is_excluded(did(1), &oid(9)));
        assert!(!h.fetcher.filters().is_dirty(did(1)));
        assert!(h.fetcher.filters().is_dirty(did(2)));

        h.sched.advance(Duration::from_secs(1));
        let retry = h.downloads.requests().pop().unwrap();
        assert_eq!(retry.dids, HashSet::from([did(2)]));

        // A fresh announcement lifts the exclusion
        h.announce(did(1), &[oid(9)]);
        assert!(!h.fetcher.is_excluded(did(1), &oid(9)));
    }

    #[test]
    fn test_success_with_empty_queue_cleans_up_filters() {
        let h = Harness::new();
        let cs = h.queue.enqueue(SIDX, oid(1));
        h.fetcher.online(did(1)).unwrap();
        h.announce(did(1), &[oid(1)]);
        h.sched.run_pending();

        h.queue.dequeue(SIDX, cs);
        h.downloads.complete(oid(1), Ok(()));
        h.sched.run_pending();

        assert_eq!(h.fetcher.in_flight(), 0);
        assert!(h.db.collector_filter(None, SIDX, did(1)).unwrap().is_none());
        assert!(h.fetcher.filters().db_filter(did(1)).is_none());
        assert_eq!(h.metrics.snapshot().filters_cleaned, 1);
    }

    #[test]
    fn test_offline_device_is_no_longer_a_candidate() {
        let h = Harness::new();
        h.queue.enqueue(SIDX, oid(1));
        h.downloads.set_tokens(0);
        h.fetcher.online(did(1)).unwrap();
        h.announce(did(1), &[oid(1)]);
        h.sched.run_pending();
        assert!(h.fetcher.is_suspended());

        h.fetcher.offline(did(1));
        h.downloads.set_tokens(1);
        h.downloads.release_token();
        h.sched.run_pending();

        assert!(h.downloads.requests().is_empty());
        assert!(!h.fetcher.is_iterating());
        assert!(h.fetcher.filters().check_invariant());
    }

    #[test]
    fn test_repeated_online_is_ignored() {
        let h = Harness::new();
        let cs1 = h.queue.enqueue(SIDX, oid(1));
        h.downloads.set_tokens(0);
        h.fetcher.online(did(1)).unwrap();
        h.announce(did(1), &[oid(1)]);
        h.sched.run_pending();

        h.fetcher.online(did(1)).unwrap();
        assert_eq!(h.fetcher.filters().attached_positions(did(1)), vec![cs1]);
        assert!(h.fetcher.filters().check_invariant());
    }

    #[test]
    fn test_stopped_fetcher_ignores_callbacks() {
        let h = Harness::new();
        h.queue.enqueue(SIDX, oid(1));
        h.fetcher.online(did(1)).unwrap();
        h.announce(did(1), &[oid(1)]);
        h.fetcher.stop();
        h.sched.run_pending();

        assert!(h.downloads.requests().is_empty());
        h.fetcher.start();
        h.sched.run_pending();
        assert!(h.downloads.requests().is_empty());
    }

    #[test]
    fn test_storage_failure_is_retried_with_growing_delay() {
        let h = Harness::new();
        h.queue.enqueue(SIDX, oid(1));
        h.fetcher.online(did(1)).unwrap();
        h.queue.set_fail_reads(true);
        h.announce(did(1), &[oid(1)]);

        h.sched.run_pending();
        assert_eq!(h.sched.pending_delays(), vec![Duration::from_millis(500)]);
        assert!(
            h.fetcher.is_iterating(),
            "Failed pass keeps the iteration alive"
        );

        h.sched.advance(Duration::from_millis(500));
        assert_eq!(h.sched.pending_delays(), vec![Duration::from_secs(1)]);

        h.queue.set_fail_reads(false);
        h.sched.advance(Duration::from_secs(1));
        assert_eq!(h.sched.pending(), 0);
        assert_eq!(h.downloads.requests().len(), 1);
        assert!(!h.fetcher.is_iterating());
        assert!(h.fetcher.filters().check_invariant());
    }

    #[test]
    fn test_failed_cleanup_is_logged_and_dropped() {
        use crate::ports::InMemoryKVStore;

        let kv = Rc::new(RefCell::new(InMemoryKVStore::new()));
        let db = FilterDb::new(kv.clone());
        let sched = Rc::new(ManualScheduler::new());
        let metrics = Arc::new(CollectorMetrics::new());
        let fetcher = ContentFetcher::new(
            SIDX,
            FetcherDeps {
                db: db.clone(),
                queue: Rc::new(InMemoryCollectorQueue::new()),
                downloads: Rc::new(RecordingDownloads::new()),
                scheduler: sched.clone(),
                metrics: metrics.clone(),
            },
            CollectorConfig::default(),
        );

        // An empty queue makes the pass clean up, which must write
        let mut t = Trans::new();
        db.set_collector_filter(&mut t, SIDX, did(7), &BloomFilter::from_oids(&[oid(7)]));
        db.commit(t).unwrap();
        kv.borrow_mut().set_fail_writes(true);

        fetcher.start();
        sched.run_pending();
        assert!(!fetcher.is_iterating());
        assert_eq!(sched.pending(), 0, "No retry for a failed cleanup");
        assert_eq!(metrics.snapshot().filters_cleaned, 0);
        assert!(db.collector_filter(None, SIDX, did(7)).unwrap().is_some());

        // The next idle point tries again
        kv.borrow_mut().set_fail_writes(false);
        fetcher.start();
        sched.run_pending();
        assert!(db.collector_filter(None, SIDX, did(7)).unwrap().is_none());
        assert_eq!(metrics.snapshot().filters_cleaned, 1);
    }
}
