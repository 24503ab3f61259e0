//! # Sync Collector
//!
//! Content-replication scheduler of the sync daemon: decides, per store,
//! which missing objects to fetch and from which peers, using Bloom filters
//! the peers gossip about the objects they may have.
//!
//! ## Architecture
//!
//! This crate follows Hexagonal Architecture (Ports & Adapters):
//!
//! - **Domain Layer** (`domain/`): Pure data structures, no I/O
//!   - `BloomFilter`: object filter (BFOID), 8192 bits, 4 hashes
//!   - `CollectorSeq`, `SenderFilterIndex`: sequence numbers
//!   - `ExponentialBackoff`, `CollectorConfig`
//!
//! - **Ports Layer** (`ports/`): Trait definitions
//!   - `CollectorApi`: Driving port (inbound API)
//!   - `KeyValueStore`, `CollectorQueue`, `ContentDownloads`,
//!     `CoreScheduler`: Driven ports
//!
//! - **Service Layer** (`service/`): Collector logic
//!   - `CollectorFilters`: filters received from peers
//!   - `SenderFilters`: filters advertised to peers
//!   - `ContentFetcher`: the collection loop with backoff
//!   - `CollectorService`: implements `CollectorApi`
//!
//! - **Adapters Layer** (`adapters/`): Persistence, scheduling, actor
//!   - `FilterDb` + `Trans`: filter tables and transactions
//!   - `ManualScheduler`, `TokioLocalScheduler`
//!   - `CollectorActor` + `CollectorHandle`: mailbox in front of the service
//!
//! - **Events Layer** (`events/`): mailbox message types
//!
//! ## Threading
//!
//! The service and everything it owns is `!Send` and runs on one core
//! thread. Callbacks from the download engine and timers come back through
//! `CoreScheduler`. Other threads use `CollectorHandle`.
//!
//! ## Invariants
//!
//! - No false negatives: an object added to a filter is always reported
//! - A `(cs, did)` attachment exists iff `cs` is in the device's position set
//! - A stale filter acknowledgement never changes the sender-filter chain
//!
//! ## Wiring
//!
//! ```ignore
//! use std::rc::Rc;
//! use sync_collector::{CollectorActor, CollectorConfig, CollectorService, FilterDb,
//!     TokioLocalScheduler, DEFAULT_MAILBOX_CAPACITY};
//!
//! let service = CollectorService::new(
//!     FilterDb::new(kv),
//!     queue,
//!     downloads,
//!     Rc::new(TokioLocalScheduler::new()),
//!     CollectorConfig::from_env()?,
//! )?;
//! service.add_store(sidx)?;
//!
//! let (actor, handle) = CollectorActor::new(Rc::new(service), DEFAULT_MAILBOX_CAPACITY);
//! local_set.spawn_local(actor.run());
//! handle.device_online(sidx, did).await?;
//! ```

pub mod adapters;
pub mod domain;
pub mod error;
pub mod events;
pub mod metrics;
pub mod ports;
pub mod service;
pub mod test_utils;

// Re-exports for convenience
pub use adapters::{
    CacheEffect, CollectorActor, CollectorHandle, FilterDb, ManualScheduler, TokioLocalScheduler,
    Trans, DEFAULT_MAILBOX_CAPACITY,
};
pub use domain::{
    BloomFilter, CollectorConfig, CollectorConfigBuilder, CollectorSeq, ExponentialBackoff,
    SenderFilterIndex,
};
pub use error::{
    CollectorError, CollectorResult, DownloadError, DownloadFailure, Severity, StorageError,
};
pub use metrics::{CollectorMetrics, MetricsSnapshot};
pub use ports::{
    CollectorApi, CollectorQueue, ContentDownloads, CoreScheduler, FilterAnnouncement,
    InMemoryKVStore, KeyValueStore, QueueEntry,
};
pub use service::{
    CollectorFilters, CollectorService, ContentFetcher, FetcherDeps, OutgoingFilter, SenderFilters,
};
