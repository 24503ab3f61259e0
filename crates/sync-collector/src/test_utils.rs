//! Test fakes for the collector's outbound ports
//!
//! - `InMemoryCollectorQueue`: a fetch queue the test fills and drains
//! - `RecordingDownloads`: a download engine with a token budget that
//!   records requests and completes them on demand

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet};

use shared_types::{Did, Oid, Sindex, Soid};

use crate::domain::CollectorSeq;
use crate::error::{DownloadFailure, StorageError};
use crate::ports::{CollectorQueue, ContentDownloads, Continuation, DownloadListener, QueueEntry};

/// Fetch queue kept in memory
#[derive(Default)]
pub struct InMemoryCollectorQueue {
    next_cs: Cell<u64>,
    fail_reads: Cell<bool>,
    stores: RefCell<HashMap<Sindex, BTreeMap<CollectorSeq, Oid>>>,
}

impl InMemoryCollectorQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an object; returns its sequence number.
    pub fn enqueue(&self, sidx: Sindex, oid: Oid) -> CollectorSeq {
        let cs = CollectorSeq(self.next_cs.get() + 1);
        self.next_cs.set(cs.0);
        self.stores
            .borrow_mut()
            .entry(sidx)
            .or_default()
            .insert(cs, oid);
        cs
    }

    pub fn dequeue(&self, sidx: Sindex, cs: CollectorSeq) {
        if let Some(items) = self.stores.borrow_mut().get_mut(&sidx) {
            items.remove(&cs);
        }
    }

    /// Make every read fail with an I/O error until reset.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.set(fail);
    }

    fn check_readable(&self) -> Result<(), StorageError> {
        if self.fail_reads.get() {
            return Err(StorageError::Io("injected queue read failure".to_string()));
        }
        Ok(())
    }

    pub fn len(&self, sidx: Sindex) -> usize {
        self.stores.borrow().get(&sidx).map_or(0, BTreeMap::len)
    }

    /// Lowest entry at or after `from`
    fn first_from(&self, sidx: Sindex, from: CollectorSeq) -> Option<QueueEntry> {
        let stores = self.stores.borrow();
        let (cs, oid) = stores.get(&sidx)?.range(from..).next()?;
        Some(QueueEntry { cs: *cs, oid: *oid })
    }
}

impl CollectorQueue for InMemoryCollectorQueue {
    fn first(&self, sidx: Sindex) -> Result<Option<QueueEntry>, StorageError> {
        self.check_readable()?;
        Ok(self.first_from(sidx, CollectorSeq(0)))
    }

    fn next_after(
        &self,
        sidx: Sindex,
        cs: CollectorSeq,
    ) -> Result<Option<QueueEntry>, StorageError> {
        self.check_readable()?;
        Ok(self.first_from(sidx, cs.next()))
    }

    fn contains(&self, sidx: Sindex, cs: CollectorSeq) -> Result<bool, StorageError> {
        self.check_readable()?;
        Ok(self
            .stores
            .borrow()
            .get(&sidx)
            .is_some_and(|items| items.contains_key(&cs)))
    }
}

/// One accepted download request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadRequest {
    pub soid: Soid,
    pub dids: HashSet<Did>,
}

/// Download engine that never downloads anything on its own.
///
/// Tokens are unlimited unless `set_tokens` is called. Accepted requests
/// wait until the test calls `complete`.
#[derive(Default)]
pub struct RecordingDownloads {
    tokens: Cell<Option<usize>>,
    requests: RefCell<Vec<DownloadRequest>>,
    pending: RefCell<Vec<(Soid, DownloadListener)>>,
    waiting: RefCell<Vec<Continuation>>,
}

impl RecordingDownloads {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit the number of requests that will be accepted.
    pub fn set_tokens(&self, tokens: usize) {
        self.tokens.set(Some(tokens));
    }

    /// Return one token and wake one throttled caller.
    pub fn release_token(&self) {
        if let Some(tokens) = self.tokens.get() {
            self.tokens.set(Some(tokens + 1));
        }
        let continuation = {
            let mut waiting = self.waiting.borrow_mut();
            (!waiting.is_empty()).then(|| waiting.remove(0))
        };
        if let Some(continuation) = continuation {
            continuation();
        }
    }

    /// Every accepted request so far, in order
    pub fn requests(&self) -> Vec<DownloadRequest> {
        self.requests.borrow().clone()
    }

    /// Requests not completed yet
    pub fn pending(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Throttled callers waiting for a token
    pub fn waiting(&self) -> usize {
        self.waiting.borrow().len()
    }

    /// Complete the oldest pending request for `oid`.
    ///
    /// Returns false if there is none.
    pub fn complete(&self, oid: Oid, result: Result<(), DownloadFailure>) -> bool {
        let listener = {
            let mut pending = self.pending.borrow_mut();
            pending
                .iter()
                .position(|(soid, _)| soid.oid == oid)
                .map(|i| pending.remove(i).1)
        };
        match listener {
            Some(listener) => {
                listener(result);
                true
            }
            None => false,
        }
    }
}

impl ContentDownloads for RecordingDownloads {
    fn download_async(
        &self,
        soid: Soid,
        dids: HashSet<Did>,
        continuation: Continuation,
        listener: DownloadListener,
    ) -> bool {
        if let Some(tokens) = self.tokens.get() {
            if tokens == 0 {
                self.waiting.borrow_mut().push(continuation);
                return false;
            }
            self.tokens.set(Some(tokens - 1));
        }
        let request = DownloadRequest { soid, dids };
        self.requests.borrow_mut().push(request);
        self.pending.borrow_mut().push((soid, listener));
        true
    }
}
